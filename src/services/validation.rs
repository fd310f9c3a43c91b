use crate::config::{ScanFailurePolicy, SecurityConfig};
use crate::services::scanner::{ScanResult, VirusScanner};
use crate::services::storage::BlobReader;
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap};
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Markup and script extensions refused no matter what the entry declares
pub const DENYLISTED_EXTENSIONS: &[&str] = &["html", "htm", "js", "svg"];

/// Sniffed content types refused no matter what the entry declares
pub const DENYLISTED_MIME_TYPES: &[&str] = &[
    "image/svg+xml",
    "text/html",
    "application/javascript",
    "text/javascript",
];

pub const EMPTY_MIME: &str = "application/x-empty";
pub const GEOPACKAGE_MIME: &str = "application/geopackage+sqlite3";
/// SQLite `application_id` values written by GeoPackage 1.0 (`GP10`), 1.1 (`GP11`) and 1.2+ (`GPKG`)
const GEOPACKAGE_APPLICATION_IDS: [&[u8; 4]; 3] = [b"GPKG", b"GP10", b"GP11"];

/// Bytes inspected when sniffing the content type
pub const SNIFF_WINDOW: usize = 2048;

pub const MAX_BUNDLE_FILES: usize = 8;
pub const REQUIRED_SHAPEFILE_EXTENSIONS: &[&str] = &["dbf", "prj", "shp", "shx"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Files with extension '.{0}' are not allowed")]
    ExtensionDenylisted(String),

    #[error("Filename must end with '.{expected}' for this catalogue item")]
    ExtensionMismatch { expected: String },

    #[error("File appears to be empty")]
    EmptyContent,

    #[error("Content type '{0}' is not allowed")]
    MimeDenylisted(String),

    #[error("Content type '{detected}' is not valid for this catalogue item (expected '{expected}')")]
    MimeMismatch { detected: String, expected: String },

    #[error("File size {size} bytes exceeds maximum allowed {max} bytes")]
    TooLarge { size: usize, max: usize },

    #[error("File rejected: malware detected ({0})")]
    MalwareDetected(String),

    #[error("Virus scan could not be completed, try again")]
    ScanError(String),
}

/// Problems with the member list of a zipped multi-file bundle
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BundleViolation {
    #[error("Archive contains {0} files; maximum allowed is {max}", max = MAX_BUNDLE_FILES)]
    TooManyFiles(usize),

    #[error("Archive member '{0}' has a disallowed extension")]
    DenylistedMember(String),

    #[error("Duplicate extension '.{0}' in archive; each file must have a unique extension")]
    DuplicateExtension(String),

    #[error("Archive is missing required extension(s): {}", .0.join(", "))]
    MissingRequired(Vec<String>),

    #[error("Archive could not be read: {0}")]
    Unreadable(String),
}

impl BundleViolation {
    /// Violations that indicate a smuggling attempt rather than a data-quality problem
    pub fn is_security_violation(&self) -> bool {
        matches!(self, BundleViolation::DenylistedMember(_))
    }
}

/// Per-format upload rules, looked up by the dictionary entry's declared extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FormatPolicy {
    /// Extension the upload must arrive in when the format is multi-file
    pub container_extension: Option<&'static str>,
    /// Skip spatial extraction even when the entry is flagged `gis`
    pub spatial_exempt: bool,
}

#[derive(Debug, Clone)]
pub struct PolicyTable {
    policies: HashMap<String, FormatPolicy>,
}

impl Default for PolicyTable {
    fn default() -> Self {
        let mut table = Self {
            policies: HashMap::new(),
        };
        table.insert(
            "shp",
            FormatPolicy {
                container_extension: Some("zip"),
                spatial_exempt: false,
            },
        );
        // ESRI ASCII grids carry no CRS of their own
        table.insert(
            "asc",
            FormatPolicy {
                container_extension: None,
                spatial_exempt: true,
            },
        );
        table
    }
}

impl PolicyTable {
    pub fn insert(&mut self, extension: &str, policy: FormatPolicy) {
        self.policies.insert(normalize_extension(extension), policy);
    }

    pub fn policy_for(&self, extension: &str) -> FormatPolicy {
        self.policies
            .get(&normalize_extension(extension))
            .copied()
            .unwrap_or_default()
    }

    /// Extension the filename has to end with for uploads against `declared`
    pub fn upload_extension(&self, declared: &str) -> String {
        let declared = normalize_extension(declared);
        self.policy_for(&declared)
            .container_extension
            .map(str::to_string)
            .unwrap_or(declared)
    }
}

pub fn normalize_extension(extension: &str) -> String {
    extension.trim().trim_start_matches('.').to_lowercase()
}

fn normalize_mime(mime: &str) -> String {
    mime.split(';').next().unwrap_or("").trim().to_lowercase()
}

fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
}

pub fn is_denylisted_filename(filename: &str) -> bool {
    extension_of(filename).is_some_and(|ext| DENYLISTED_EXTENSIONS.contains(&ext.as_str()))
}

/// Outcome of the antivirus step, persisted with the object
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanVerdict {
    Clean,
    /// Scanning disabled by configuration
    Skipped,
    /// Scanner fault tolerated under `ScanFailurePolicy::FailOpen`
    Failed(String),
}

impl ScanVerdict {
    pub fn as_record(&self) -> String {
        match self {
            ScanVerdict::Clean => "clean".to_string(),
            ScanVerdict::Skipped => "skipped".to_string(),
            ScanVerdict::Failed(reason) => format!("scan_failed: {}", reason),
        }
    }

    pub fn is_warning(&self) -> bool {
        matches!(self, ScanVerdict::Failed(_))
    }
}

#[derive(Debug, Clone)]
pub struct AdmittedUpload {
    pub detected_mime: String,
    pub scan_verdict: ScanVerdict,
}

/// Sequential admission checks for one upload; the first failure wins.
pub struct ValidationGate {
    policies: PolicyTable,
    scanner: Arc<dyn VirusScanner>,
    scan_enabled: bool,
    failure_policy: ScanFailurePolicy,
    max_size: usize,
}

impl ValidationGate {
    pub fn new(scanner: Arc<dyn VirusScanner>, config: &SecurityConfig) -> Self {
        Self {
            policies: PolicyTable::default(),
            scanner,
            scan_enabled: config.enable_virus_scan,
            failure_policy: config.scan_failure_policy,
            max_size: config.max_file_size,
        }
    }

    pub fn with_policies(mut self, policies: PolicyTable) -> Self {
        self.policies = policies;
        self
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    pub async fn validate(
        &self,
        declared_extension: &str,
        filename: &str,
        allowed_mime: &str,
        content: &Bytes,
    ) -> Result<AdmittedUpload, ValidationError> {
        self.check_filename(declared_extension, filename)?;
        let detected_mime = check_content_type(content, allowed_mime)?;

        if content.len() > self.max_size {
            return Err(ValidationError::TooLarge {
                size: content.len(),
                max: self.max_size,
            });
        }

        let scan_verdict = self.scan(filename, content).await?;

        Ok(AdmittedUpload {
            detected_mime,
            scan_verdict,
        })
    }

    /// Extension rules: denylist first, then container format, then the declared extension.
    pub fn check_filename(
        &self,
        declared_extension: &str,
        filename: &str,
    ) -> Result<(), ValidationError> {
        let actual = extension_of(filename);
        if let Some(ext) = actual
            .as_deref()
            .filter(|ext| DENYLISTED_EXTENSIONS.contains(ext))
        {
            return Err(ValidationError::ExtensionDenylisted(ext.to_string()));
        }

        let expected = self.policies.upload_extension(declared_extension);
        if actual.as_deref() != Some(expected.as_str()) {
            return Err(ValidationError::ExtensionMismatch { expected });
        }

        Ok(())
    }

    async fn scan(&self, filename: &str, content: &Bytes) -> Result<ScanVerdict, ValidationError> {
        if !self.scan_enabled {
            return Ok(ScanVerdict::Skipped);
        }

        let reader: BlobReader = Box::pin(Cursor::new(content.clone()));
        let fault = match self.scanner.scan(reader).await {
            Ok(ScanResult::Clean) => {
                tracing::info!("🦠 {} passed virus scan", filename);
                return Ok(ScanVerdict::Clean);
            }
            Ok(ScanResult::Infected { threat_name }) => {
                tracing::error!("🚨 Malware detected in {}: {}", filename, threat_name);
                return Err(ValidationError::MalwareDetected(threat_name));
            }
            Ok(ScanResult::Error { reason }) => reason,
            Err(e) => e.to_string(),
        };

        match self.failure_policy {
            ScanFailurePolicy::FailOpen => {
                tracing::warn!(
                    "⚠️  Virus scan failed for {}, admitting under fail-open policy: {}",
                    filename,
                    fault
                );
                Ok(ScanVerdict::Failed(fault))
            }
            ScanFailurePolicy::FailClosed => {
                tracing::error!("Virus scan failed for {}: {}", filename, fault);
                Err(ValidationError::ScanError(fault))
            }
        }
    }
}

/// Sniffs `content` and compares it with the entry's allowed type. Returns the sniffed type.
pub fn check_content_type(content: &[u8], allowed_mime: &str) -> Result<String, ValidationError> {
    let detected = sniff_mime(content);

    if detected == EMPTY_MIME {
        return Err(ValidationError::EmptyContent);
    }
    if DENYLISTED_MIME_TYPES.contains(&detected) {
        return Err(ValidationError::MimeDenylisted(detected.to_string()));
    }

    let expected = normalize_mime(allowed_mime);
    if detected != expected {
        return Err(ValidationError::MimeMismatch {
            detected: detected.to_string(),
            expected,
        });
    }

    Ok(detected.to_string())
}

/// Content type of the first `SNIFF_WINDOW` bytes, ignoring any filename.
pub fn sniff_mime(content: &[u8]) -> &'static str {
    let window = &content[..content.len().min(SNIFF_WINDOW)];

    if window.is_empty() {
        return EMPTY_MIME;
    }

    // SQLite header plus a GeoPackage application_id at offset 68
    if window.starts_with(b"SQLite format 3\0")
        && window
            .get(68..72)
            .is_some_and(|id| GEOPACKAGE_APPLICATION_IDS.iter().any(|known| id == *known))
    {
        return GEOPACKAGE_MIME;
    }

    if let Some(text) = as_text(window) {
        if let Some(markup) = sniff_markup(text) {
            return markup;
        }
        if let Some(kind) = infer::get(window) {
            return kind.mime_type();
        }
        return if looks_like_csv(text, window.len() < content.len()) {
            "text/csv"
        } else {
            "text/plain"
        };
    }

    infer::get(window)
        .map(|kind| kind.mime_type())
        .unwrap_or("application/octet-stream")
}

fn as_text(window: &[u8]) -> Option<&str> {
    if window.contains(&0) {
        return None;
    }
    match std::str::from_utf8(window) {
        Ok(text) => Some(text),
        // A multi-byte character cut off at the end of the window
        Err(e) if e.error_len().is_none() => std::str::from_utf8(&window[..e.valid_up_to()]).ok(),
        Err(_) => None,
    }
}

fn sniff_markup(text: &str) -> Option<&'static str> {
    let head = text.trim_start_matches('\u{feff}').trim_start().to_lowercase();

    if head.starts_with('<') && head.contains("<svg") {
        return Some("image/svg+xml");
    }
    if head.starts_with("<!doctype html")
        || head.starts_with("<html")
        || head.starts_with("<script")
        || (head.starts_with('<') && (head.contains("<body") || head.contains("<head")))
    {
        return Some("text/html");
    }
    if head.starts_with("<?xml") {
        return Some("text/xml");
    }
    None
}

/// Field separators per record, honouring double-quoted fields that may hold
/// commas or line breaks. An escaped `""` toggles twice and cancels out.
fn csv_record_widths(text: &str) -> Vec<usize> {
    let mut widths = Vec::new();
    let mut in_quotes = false;
    let mut commas = 0;
    let mut blank = true;

    for c in text.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                blank = false;
            }
            ',' if !in_quotes => {
                commas += 1;
                blank = false;
            }
            '\n' if !in_quotes => {
                if !blank {
                    widths.push(commas);
                }
                commas = 0;
                blank = true;
            }
            c if !c.is_whitespace() => blank = false,
            _ => {}
        }
    }
    if !blank {
        widths.push(commas);
    }
    widths
}

fn looks_like_csv(text: &str, truncated: bool) -> bool {
    let mut records = csv_record_widths(text);
    if truncated && records.len() > 1 {
        records.pop();
    }
    if records.len() < 2 {
        return false;
    }

    let columns = records[0];
    columns > 0 && records.iter().all(|&w| w == columns)
}

/// Applies the bundle rules to the member names of a zipped multi-file dataset.
pub fn validate_bundle_members<'a, I>(names: I) -> Result<(), BundleViolation>
where
    I: IntoIterator<Item = &'a str>,
{
    let files: Vec<&str> = names
        .into_iter()
        .filter(|n| !n.ends_with('/'))
        .collect();

    if files.len() > MAX_BUNDLE_FILES {
        return Err(BundleViolation::TooManyFiles(files.len()));
    }

    if let Some(bad) = files.iter().find(|f| is_denylisted_filename(f)) {
        return Err(BundleViolation::DenylistedMember(bad.to_string()));
    }

    let mut seen = BTreeSet::new();
    for file in &files {
        let ext = extension_of(file).unwrap_or_default();
        if !seen.insert(ext.clone()) {
            return Err(BundleViolation::DuplicateExtension(ext));
        }
    }

    let missing: Vec<String> = REQUIRED_SHAPEFILE_EXTENSIONS
        .iter()
        .filter(|req| !seen.contains(**req))
        .map(|req| format!(".{}", req))
        .collect();
    if !missing.is_empty() {
        return Err(BundleViolation::MissingRequired(missing));
    }

    Ok(())
}

/// Opens a zip bundle in memory, validates its member list and returns the member names.
pub fn inspect_bundle(content: &[u8]) -> Result<Vec<String>, BundleViolation> {
    let archive = zip::ZipArchive::new(Cursor::new(content))
        .map_err(|e| BundleViolation::Unreadable(e.to_string()))?;
    let names = archive
        .file_names()
        .map(|name| name.map(|n| n.into_owned()))
        .collect::<Result<Vec<String>, _>>()
        .map_err(|e| BundleViolation::Unreadable(e.to_string()))?;
    validate_bundle_members(names.iter().map(String::as_str))?;
    Ok(names)
}

use std::env;

/// What to do when the antivirus oracle itself fails (as opposed to reporting a threat)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanFailurePolicy {
    /// Admit the upload and record the scanner fault as its verdict
    FailOpen,
    /// Reject the upload
    FailClosed,
}

impl ScanFailurePolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "open" | "fail-open" | "fail_open" => Some(Self::FailOpen),
            "closed" | "fail-closed" | "fail_closed" => Some(Self::FailClosed),
            _ => None,
        }
    }
}

/// Which preset the process starts from
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Profile {
    /// Secrets are mandatory and scanner faults reject uploads
    Production,
    /// Environment values with public fallback secrets
    Development,
}

/// Security and transfer configuration
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    /// Maximum upload size in bytes (default: 1 GB)
    pub max_file_size: usize,

    /// Enable virus scanning (default: true)
    pub enable_virus_scan: bool,

    /// Virus scanner type: "clamav" or "noop" (default: "clamav")
    pub virus_scanner_type: String,

    /// ClamAV host (default: "127.0.0.1")
    pub clamav_host: String,

    /// ClamAV port (default: 3310)
    pub clamav_port: u16,

    /// Scanner fault handling (default: fail-open)
    pub scan_failure_policy: ScanFailurePolicy,

    /// Secret used to verify bearer JWTs
    pub jwt_secret: String,

    /// Secret used to sign download tokens and anti-forgery tokens
    pub token_secret: String,

    /// Maximum age of a signed download token in seconds (default: 300)
    pub download_token_max_age_secs: i64,

    /// Maximum age of an anti-forgery token in seconds (default: 3600)
    pub csrf_max_age_secs: i64,

    /// Days between scheduling a deletion and the sweep being allowed to remove the blob (default: 7)
    pub deletion_retention_days: i64,

    /// Bucket that receives uploads
    pub upload_bucket: String,

    /// Chunk size for streamed downloads in bytes (default: 8 KiB)
    pub stream_chunk_size: usize,

    /// Allowed CORS Origins (comma separated)
    pub allowed_origins: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_file_size: 1024 * 1024 * 1024, // 1 GB
            enable_virus_scan: true,
            virus_scanner_type: "clamav".to_string(),
            clamav_host: "127.0.0.1".to_string(),
            clamav_port: 3310,
            scan_failure_policy: ScanFailurePolicy::FailOpen,
            jwt_secret: "secret".to_string(),
            token_secret: "token-secret".to_string(),
            download_token_max_age_secs: 300,
            csrf_max_age_secs: 3600,
            deletion_retention_days: 7,
            upload_bucket: "models".to_string(),
            stream_chunk_size: 8 * 1024,
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:8050".to_string(),
                "http://127.0.0.1:3000".to_string(),
            ],
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

impl SecurityConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            max_file_size: env_parse("MAX_FILE_SIZE", default.max_file_size),

            enable_virus_scan: env::var("ENABLE_VIRUS_SCAN")
                .map(|v| v.to_lowercase() != "false" && v != "0")
                .unwrap_or(default.enable_virus_scan),

            virus_scanner_type: env::var("VIRUS_SCANNER_TYPE")
                .unwrap_or(default.virus_scanner_type),

            clamav_host: env::var("CLAMAV_HOST").unwrap_or(default.clamav_host),

            clamav_port: env_parse("CLAMAV_PORT", default.clamav_port),

            scan_failure_policy: env::var("SCAN_FAILURE_POLICY")
                .ok()
                .and_then(|v| ScanFailurePolicy::parse(&v))
                .unwrap_or(default.scan_failure_policy),

            jwt_secret: env::var("JWT_SECRET").unwrap_or(default.jwt_secret), // Fallback for dev convenience, strictly enforced in production method

            token_secret: env::var("TOKEN_SECRET").unwrap_or(default.token_secret),

            download_token_max_age_secs: env_parse(
                "DOWNLOAD_TOKEN_MAX_AGE_SECS",
                default.download_token_max_age_secs,
            ),

            csrf_max_age_secs: env_parse("CSRF_MAX_AGE_SECS", default.csrf_max_age_secs),

            deletion_retention_days: env_parse(
                "DELETION_RETENTION_DAYS",
                default.deletion_retention_days,
            ),

            upload_bucket: env::var("MINIO_MODEL_BUCKET").unwrap_or(default.upload_bucket),

            stream_chunk_size: env_parse("STREAM_CHUNK_SIZE", default.stream_chunk_size),

            allowed_origins: env::var("ALLOWED_ORIGINS")
                .ok()
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or(default.allowed_origins),
        }
    }

    /// Create config for development (no virus scanning)
    pub fn development() -> Self {
        Self {
            enable_virus_scan: false,
            virus_scanner_type: "noop".to_string(),
            ..Self::default()
        }
    }

    /// Create config for production (strict security)
    ///
    /// Secrets must come from the environment and scanner faults reject uploads
    /// unless `SCAN_FAILURE_POLICY=open` is set explicitly.
    pub fn production() -> anyhow::Result<Self> {
        Self::production_from(Self::from_env(), |key| env::var(key).ok())
    }

    /// Config for the selected profile
    pub fn load(profile: Profile) -> anyhow::Result<Self> {
        match profile {
            Profile::Production => Self::production(),
            Profile::Development => Ok(Self::from_env()),
        }
    }

    fn production_from<F>(base: Self, var: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let secret = |key: &str| {
            var(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| anyhow::anyhow!("CRITICAL: {} must be set", key))
        };

        Ok(Self {
            jwt_secret: secret("JWT_SECRET")?,
            token_secret: secret("TOKEN_SECRET")?,
            scan_failure_policy: var("SCAN_FAILURE_POLICY")
                .and_then(|v| ScanFailurePolicy::parse(&v))
                .unwrap_or(ScanFailurePolicy::FailClosed),
            ..base
        })
    }
}

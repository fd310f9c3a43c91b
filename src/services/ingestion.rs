//! Upload admission and persistence.
//!
//! Every upload walks `Received → Validating → (ExtractingGeometry) →
//! Persisting → Committed`, or stops at `Rejected`. A rejection leaves no
//! trace except its audit record. A blob that was written but could not be
//! catalogued is reported as an integrity fault, not as a rejection.

use crate::entities::{dictionary_entries, stored_objects};
use crate::services::audit::{AuditEvent, AuditEventType, AuditService};
use crate::services::geo::{GeoError, GeoExtractor};
use crate::services::guard::Caller;
use crate::services::storage::{BlobLocation, BlobReader, BlobStore};
use crate::services::validation::{BundleViolation, ValidationError, ValidationGate};
use crate::utils::validation::sanitize_filename;
use bytes::Bytes;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use serde::Serialize;
use std::fmt;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestionStage {
    Received,
    Validating,
    ExtractingGeometry,
    Persisting,
    Committed,
    Rejected,
}

impl fmt::Display for IngestionStage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub content: Bytes,
    pub filename: String,
    pub entry_id: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionReceipt {
    pub object_id: String,
    pub bucket: String,
    pub key: String,
    pub detected_mime: String,
    /// WKT polygon in EPSG:4326
    pub extent: Option<String>,
    pub scan_verdict: String,
    pub warnings: Vec<String>,
}

/// User-correctable reasons an upload was refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("Filename is empty or invalid")]
    InvalidFilename,

    #[error("Unknown catalogue item '{0}'")]
    UnknownEntry(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Invalid archive: {0}")]
    ContainerViolation(BundleViolation),

    #[error("File could not be stored, try again")]
    StorageWrite(String),

    #[error("File could not be confirmed in storage, try again")]
    StorageUnconfirmed(String),
}

#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("{0}")]
    Rejected(Rejection),

    /// Blob written, catalogue record missing; needs an operator
    #[error("Object stored at {location} but not catalogued: {reason}")]
    IntegrityFault {
        location: BlobLocation,
        reason: String,
    },

    #[error("Catalogue unavailable: {0}")]
    Catalog(#[from] sea_orm::DbErr),
}

pub struct IngestionService {
    db: DatabaseConnection,
    storage: Arc<dyn BlobStore>,
    gate: ValidationGate,
    geo: GeoExtractor,
    audit: AuditService,
    bucket: String,
}

impl IngestionService {
    pub fn new(
        db: DatabaseConnection,
        storage: Arc<dyn BlobStore>,
        gate: ValidationGate,
        geo: GeoExtractor,
        bucket: String,
    ) -> Self {
        Self {
            audit: AuditService::new(db.clone()),
            db,
            storage,
            gate,
            geo,
            bucket,
        }
    }

    fn stage(&self, object_id: &str, stage: IngestionStage) {
        tracing::debug!(object_id = %object_id, stage = %stage, "ingestion stage");
    }

    async fn reject(
        &self,
        caller: &Caller,
        object_id: &str,
        filename: &str,
        rejection: Rejection,
    ) -> IngestionError {
        self.stage(object_id, IngestionStage::Rejected);
        tracing::warn!("⛔ Upload of {} rejected: {}", filename, rejection);

        self.audit
            .log(AuditEvent {
                event_type: AuditEventType::UploadRejected,
                user_id: Some(caller.identity()),
                resource_id: None,
                action: "upload",
                status: "rejected",
                details: Some(serde_json::json!({
                    "filename": filename,
                    "reason": rejection.to_string(),
                })),
            })
            .await;

        IngestionError::Rejected(rejection)
    }

    pub async fn ingest(
        &self,
        caller: &Caller,
        request: UploadRequest,
    ) -> Result<IngestionReceipt, IngestionError> {
        let object_id = Uuid::new_v4().to_string();
        self.stage(&object_id, IngestionStage::Received);

        let Some(filename) = sanitize_filename(&request.filename) else {
            return Err(self
                .reject(caller, &object_id, &request.filename, Rejection::InvalidFilename)
                .await);
        };

        let Some(entry) = dictionary_entries::Entity::find_by_id(request.entry_id.clone())
            .one(&self.db)
            .await?
        else {
            return Err(self
                .reject(
                    caller,
                    &object_id,
                    &filename,
                    Rejection::UnknownEntry(request.entry_id.clone()),
                )
                .await);
        };

        self.stage(&object_id, IngestionStage::Validating);
        let admitted = match self
            .gate
            .validate(
                &entry.filename_extension,
                &filename,
                &entry.mime_type,
                &request.content,
            )
            .await
        {
            Ok(admitted) => admitted,
            Err(e) => {
                return Err(self
                    .reject(caller, &object_id, &filename, Rejection::Validation(e))
                    .await);
            }
        };

        let mut warnings = Vec::new();
        if admitted.scan_verdict.is_warning() {
            warnings.push(format!(
                "Virus scan could not be completed ({})",
                admitted.scan_verdict.as_record()
            ));
        }

        let policy = self.gate.policies().policy_for(&entry.filename_extension);
        let mut extent = None;
        if entry.gis && !policy.spatial_exempt {
            self.stage(&object_id, IngestionStage::ExtractingGeometry);
            match self.geo.extract(&filename, &request.content).await {
                Ok(bbox) => extent = Some(bbox.to_wkt()),
                Err(GeoError::InvalidContainer(violation)) if violation.is_security_violation() => {
                    return Err(self
                        .reject(
                            caller,
                            &object_id,
                            &filename,
                            Rejection::ContainerViolation(violation),
                        )
                        .await);
                }
                Err(e) => {
                    tracing::warn!("⚠️  No spatial extent for {}: {}", filename, e);
                    warnings.push(format!("Spatial extent unavailable: {}", e));
                }
            }
        }

        self.stage(&object_id, IngestionStage::Persisting);
        let location = BlobLocation::new(
            self.bucket.clone(),
            format!("{}/{}/{}", entry.id, object_id, filename),
        );
        let size = request.content.len() as u64;
        let reader: BlobReader = Box::pin(Cursor::new(request.content.clone()));

        if let Err(e) = self
            .storage
            .put(&location, reader, size, &admitted.detected_mime)
            .await
        {
            return Err(self
                .reject(
                    caller,
                    &object_id,
                    &filename,
                    Rejection::StorageWrite(e.to_string()),
                )
                .await);
        }

        match self.storage.stat(&location).await {
            Ok(stat) if stat.size == size => {}
            Ok(stat) => {
                let reason = format!("stored {} bytes, expected {}", stat.size, size);
                return Err(self
                    .reject(
                        caller,
                        &object_id,
                        &filename,
                        Rejection::StorageUnconfirmed(reason),
                    )
                    .await);
            }
            Err(e) => {
                return Err(self
                    .reject(
                        caller,
                        &object_id,
                        &filename,
                        Rejection::StorageUnconfirmed(e.to_string()),
                    )
                    .await);
            }
        }

        let extension = Path::new(&filename)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_lowercase();

        let record = stored_objects::ActiveModel {
            id: Set(object_id.clone()),
            entry_id: Set(entry.id.clone()),
            model_domain: Set(entry.model_domain.clone()),
            filename: Set(filename.clone()),
            filename_extension: Set(extension),
            description: Set(request.description.clone()),
            owner: Set(caller.identity().to_string()),
            bucket: Set(location.bucket.clone()),
            object_key: Set(location.key.clone()),
            size: Set(size as i64),
            spatial_extent: Set(extent.clone()),
            gis: Set(extent.is_some()),
            tags: Set(Some(serde_json::json!(request.tags))),
            status: Set(stored_objects::STATUS_ACTIVE.to_string()),
            deletion_time: Set(None),
            scan_verdict: Set(admitted.scan_verdict.as_record()),
            mime_type: Set(admitted.detected_mime.clone()),
            created_at: Set(chrono::Utc::now()),
        };

        if let Err(e) = record.insert(&self.db).await {
            tracing::error!(
                bucket = %location.bucket,
                key = %location.key,
                "❌ Blob stored but catalogue insert failed, orphaned object needs cleanup: {}",
                e
            );
            self.audit
                .log(AuditEvent {
                    event_type: AuditEventType::SystemError,
                    user_id: Some(caller.identity()),
                    resource_id: Some(object_id.as_str()),
                    action: "upload",
                    status: "integrity_fault",
                    details: Some(serde_json::json!({
                        "location": location.to_string(),
                        "error": e.to_string(),
                    })),
                })
                .await;
            return Err(IngestionError::IntegrityFault {
                location,
                reason: e.to_string(),
            });
        }

        self.stage(&object_id, IngestionStage::Committed);
        tracing::info!(
            "✅ Stored {} ({} bytes, {}) at {}",
            filename,
            size,
            admitted.detected_mime,
            location
        );

        self.audit
            .log(AuditEvent {
                event_type: AuditEventType::FileUpload,
                user_id: Some(caller.identity()),
                resource_id: Some(object_id.as_str()),
                action: "upload",
                status: "success",
                details: Some(serde_json::json!({
                    "filename": filename,
                    "entry_id": entry.id,
                    "size": size,
                    "scan_verdict": admitted.scan_verdict.as_record(),
                    "warnings": warnings,
                })),
            })
            .await;

        Ok(IngestionReceipt {
            object_id,
            bucket: location.bucket,
            key: location.key,
            detected_mime: admitted.detected_mime,
            extent,
            scan_verdict: admitted.scan_verdict.as_record(),
            warnings,
        })
    }
}

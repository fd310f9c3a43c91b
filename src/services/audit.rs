use crate::entities::audit_logs;
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventType {
    FileUpload,
    UploadRejected,
    DownloadLinkIssued,
    FileDownload,
    DeletionScheduled,
    SystemError,
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One audit record before it is persisted
#[derive(Debug, Clone)]
pub struct AuditEvent<'a> {
    pub event_type: AuditEventType,
    pub user_id: Option<&'a str>,
    pub resource_id: Option<&'a str>,
    pub action: &'a str,
    pub status: &'a str,
    pub details: Option<Value>,
}

#[derive(Clone)]
pub struct AuditService {
    db: DatabaseConnection,
}

impl AuditService {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Emits the event on the `audit` tracing target and persists it.
    ///
    /// Persistence failures are logged and never fail the calling operation.
    pub async fn log(&self, event: AuditEvent<'_>) {
        let event_type = event.event_type.to_string();

        info!(
            target: "audit",
            event_type = %event_type,
            user_id = ?event.user_id,
            resource_id = ?event.resource_id,
            action = %event.action,
            status = %event.status,
            "Audit Event Occurred"
        );

        let log = audit_logs::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            timestamp: Set(chrono::Utc::now()),
            event_type: Set(event_type),
            user_id: Set(event.user_id.map(str::to_owned)),
            resource_id: Set(event.resource_id.map(str::to_owned)),
            action: Set(event.action.to_owned()),
            status: Set(event.status.to_owned()),
            details: Set(event.details.map(|v| v.to_string())),
        };

        if let Err(e) = log.insert(&self.db).await {
            error!("Failed to persist audit log: {}", e);
        }
    }
}

use crate::entities::{dictionary_entries, prelude::*, stored_objects};
use crate::services::audit::{AuditEvent, AuditEventType, AuditService};
use crate::services::guard::Caller;
use crate::services::storage::{BlobLocation, BlobStore, StorageError};
use crate::utils::clock::{Clock, SystemClock};
use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, QueryFilter,
    QueryOrder, Set,
};
use std::sync::Arc;
use thiserror::Error;

/// Tag the out-of-band sweep looks for
pub const DELETE_SCHEDULED_TAG: &str = "delete_scheduled";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Object not found")]
    NotFound,

    #[error("Only the owner can delete this object")]
    NotOwner,

    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Read side of the dictionary plus the deletion workflow for stored objects.
pub struct CatalogService {
    db: DatabaseConnection,
    storage: Arc<dyn BlobStore>,
    audit: AuditService,
    clock: Arc<dyn Clock>,
}

impl CatalogService {
    pub fn new(db: DatabaseConnection, storage: Arc<dyn BlobStore>) -> Self {
        Self {
            audit: AuditService::new(db.clone()),
            db,
            storage,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn entry(&self, id: &str) -> Result<Option<dictionary_entries::Model>, CatalogError> {
        Ok(DictionaryEntries::find_by_id(id.to_string())
            .one(&self.db)
            .await?)
    }

    pub async fn list_entries(&self) -> Result<Vec<dictionary_entries::Model>, CatalogError> {
        Ok(DictionaryEntries::find()
            .order_by_asc(dictionary_entries::Column::ModelDomain)
            .order_by_asc(dictionary_entries::Column::Name)
            .all(&self.db)
            .await?)
    }

    /// Active objects stored against an entry, newest first
    pub async fn list_objects(
        &self,
        entry_id: &str,
    ) -> Result<Vec<stored_objects::Model>, CatalogError> {
        Ok(StoredObjects::find()
            .filter(stored_objects::Column::EntryId.eq(entry_id))
            .filter(stored_objects::Column::Status.eq(stored_objects::STATUS_ACTIVE))
            .order_by_desc(stored_objects::Column::CreatedAt)
            .all(&self.db)
            .await?)
    }

    /// Active object stored at `location`, if any
    pub async fn find_active(
        &self,
        location: &BlobLocation,
    ) -> Result<Option<stored_objects::Model>, CatalogError> {
        Ok(StoredObjects::find()
            .filter(stored_objects::Column::Bucket.eq(location.bucket.as_str()))
            .filter(stored_objects::Column::ObjectKey.eq(location.key.as_str()))
            .filter(stored_objects::Column::Status.eq(stored_objects::STATUS_ACTIVE))
            .one(&self.db)
            .await?)
    }

    /// Tags the blob for the sweep and marks the record `deletion_scheduled`.
    ///
    /// Nothing is removed here; the blob stays until the retention window has passed.
    pub async fn schedule_deletion(
        &self,
        caller: &Caller,
        object_id: &str,
        retention: Duration,
    ) -> Result<DateTime<Utc>, CatalogError> {
        let object = StoredObjects::find_by_id(object_id.to_string())
            .filter(stored_objects::Column::Status.eq(stored_objects::STATUS_ACTIVE))
            .one(&self.db)
            .await?
            .ok_or(CatalogError::NotFound)?;

        if object.owner != caller.identity() {
            tracing::warn!(
                "{} attempted to delete {} owned by {}",
                caller.identity(),
                object.id,
                object.owner
            );
            return Err(CatalogError::NotOwner);
        }

        let location = BlobLocation::new(object.bucket.clone(), object.object_key.clone());
        self.storage
            .tag(&location, DELETE_SCHEDULED_TAG, "true")
            .await?;

        let deletion_time = self.clock.now() + retention;
        let mut active = object.into_active_model();
        active.status = Set(stored_objects::STATUS_DELETION_SCHEDULED.to_string());
        active.deletion_time = Set(Some(deletion_time));
        let updated = active.update(&self.db).await?;

        tracing::info!(
            "🗑️  Scheduled deletion of {} at {}",
            location,
            deletion_time
        );

        self.audit
            .log(AuditEvent {
                event_type: AuditEventType::DeletionScheduled,
                user_id: Some(caller.identity()),
                resource_id: Some(updated.id.as_str()),
                action: "schedule_deletion",
                status: "success",
                details: Some(serde_json::json!({
                    "location": location.to_string(),
                    "deletion_time": deletion_time.to_rfc3339(),
                })),
            })
            .await;

        Ok(deletion_time)
    }
}

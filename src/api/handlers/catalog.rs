use crate::AppState;
use crate::api::error::AppError;
use crate::entities::{dictionary_entries, stored_objects};
use crate::services::guard::Caller;
use axum::{
    Extension, Json,
    extract::{Path, State},
};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Serialize, ToSchema)]
pub struct EntryResponse {
    pub id: String,
    pub name: String,
    pub model_domain: String,
    pub description: Option<String>,
    pub filename_extension: String,
    pub mime_type: String,
    pub gis: bool,
}

impl From<dictionary_entries::Model> for EntryResponse {
    fn from(entry: dictionary_entries::Model) -> Self {
        Self {
            id: entry.id,
            name: entry.name,
            model_domain: entry.model_domain,
            description: entry.description,
            filename_extension: entry.filename_extension,
            mime_type: entry.mime_type,
            gis: entry.gis,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct ObjectResponse {
    pub id: String,
    pub entry_id: String,
    pub filename: String,
    pub description: Option<String>,
    pub owner: String,
    /// `bucket/key`, the value download links are requested for
    pub location: String,
    pub size: i64,
    pub mime_type: String,
    /// WKT polygon in EPSG:4326
    pub spatial_extent: Option<String>,
    pub tags: Vec<String>,
    pub scan_verdict: String,
    pub created_at: DateTime<Utc>,
}

impl From<stored_objects::Model> for ObjectResponse {
    fn from(object: stored_objects::Model) -> Self {
        let tags = object
            .tags
            .and_then(|t| serde_json::from_value(t).ok())
            .unwrap_or_default();

        Self {
            location: format!("{}/{}", object.bucket, object.object_key),
            id: object.id,
            entry_id: object.entry_id,
            filename: object.filename,
            description: object.description,
            owner: object.owner,
            size: object.size,
            mime_type: object.mime_type,
            spatial_extent: object.spatial_extent,
            tags,
            scan_verdict: object.scan_verdict,
            created_at: object.created_at,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct DeletionResponse {
    pub id: String,
    pub status: String,
    pub deletion_time: DateTime<Utc>,
}

#[utoipa::path(
    get,
    path = "/entries",
    responses(
        (status = 200, description = "Dictionary entries", body = Vec<EntryResponse>),
        (status = 401, description = "Unauthorized")
    ),
    security(
        ("jwt" = [])
    ),
    tag = "catalog"
)]
pub async fn list_entries(
    State(state): State<AppState>,
) -> Result<Json<Vec<EntryResponse>>, AppError> {
    let entries = state.catalog.list_entries().await?;
    Ok(Json(entries.into_iter().map(EntryResponse::from).collect()))
}

#[utoipa::path(
    get,
    path = "/entries/{id}/objects",
    params(
        ("id" = String, Path, description = "Dictionary entry ID")
    ),
    responses(
        (status = 200, description = "Active objects stored against the entry", body = Vec<ObjectResponse>),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Entry not found")
    ),
    security(
        ("jwt" = [])
    ),
    tag = "catalog"
)]
pub async fn list_objects(
    State(state): State<AppState>,
    Path(entry_id): Path<String>,
) -> Result<Json<Vec<ObjectResponse>>, AppError> {
    if state.catalog.entry(&entry_id).await?.is_none() {
        return Err(AppError::NotFound("Catalogue item not found".to_string()));
    }

    let objects = state.catalog.list_objects(&entry_id).await?;
    Ok(Json(objects.into_iter().map(ObjectResponse::from).collect()))
}

#[utoipa::path(
    delete,
    path = "/objects/{id}",
    params(
        ("id" = String, Path, description = "Stored object ID")
    ),
    responses(
        (status = 200, description = "Deletion scheduled", body = DeletionResponse),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Not the owner or missing anti-forgery token"),
        (status = 404, description = "Object not found")
    ),
    security(
        ("jwt" = [])
    ),
    tag = "catalog"
)]
pub async fn delete_object(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(object_id): Path<String>,
) -> Result<Json<DeletionResponse>, AppError> {
    let retention = Duration::days(state.config.deletion_retention_days);
    let deletion_time = state
        .catalog
        .schedule_deletion(&caller, &object_id, retention)
        .await?;

    Ok(Json(DeletionResponse {
        id: object_id,
        status: stored_objects::STATUS_DELETION_SCHEDULED.to_string(),
        deletion_time,
    }))
}

use crate::AppState;
use crate::api::error::AppError;
use crate::services::guard::Caller;
use crate::services::ingestion::UploadRequest;
use axum::{
    Extension, Json,
    extract::{Multipart, State},
};
use bytes::Bytes;
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Serialize, ToSchema)]
pub struct UploadResponse {
    pub object_id: String,
    pub filename: String,
    /// `bucket/key` of the stored blob
    pub location: String,
    pub mime_type: String,
    pub spatial_extent: Option<String>,
    pub scan_verdict: String,
    pub warnings: Vec<String>,
}

/// Tags arrive either as a JSON array or as a comma separated list
fn parse_tags(raw: &str) -> Vec<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Vec::new();
    }
    serde_json::from_str::<Vec<String>>(raw)
        .unwrap_or_else(|_| raw.split(',').map(str::to_string).collect())
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

#[utoipa::path(
    post,
    path = "/upload",
    request_body(content = Multipart, description = "Multipart form with `file`, `entry_id`, optional `description` and `tags`"),
    responses(
        (status = 200, description = "File stored and catalogued", body = UploadResponse),
        (status = 400, description = "Upload rejected"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Missing or invalid anti-forgery token"),
        (status = 413, description = "File too large"),
        (status = 500, description = "Stored but not catalogued")
    ),
    security(
        ("jwt" = [])
    ),
    tag = "files"
)]
pub async fn upload_file(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let mut file: Option<(String, Bytes)> = None;
    let mut entry_id: Option<String> = None;
    let mut description: Option<String> = None;
    let mut tags = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        let err_msg = e.to_string();
        if err_msg.contains("length limit exceeded") {
            AppError::PayloadTooLarge("Request body exceeds the maximum allowed limit".to_string())
        } else {
            AppError::BadRequest(err_msg)
        }
    })? {
        let name = field.name().unwrap_or_default().to_string();

        match name.as_str() {
            "file" => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let content = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::BadRequest(e.to_string()))?;
                file = Some((filename, content));
            }
            "entry_id" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::BadRequest(e.to_string()))?;
                entry_id = Some(text.trim().to_string()).filter(|t| !t.is_empty());
            }
            "description" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::BadRequest(e.to_string()))?;
                description = Some(text.trim().to_string()).filter(|t| !t.is_empty());
            }
            "tags" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::BadRequest(e.to_string()))?;
                tags = parse_tags(&text);
            }
            other => tracing::debug!("Ignoring multipart field '{}'", other),
        }
    }

    let (filename, content) =
        file.ok_or_else(|| AppError::BadRequest("No file provided".to_string()))?;
    let entry_id =
        entry_id.ok_or_else(|| AppError::BadRequest("No catalogue item selected".to_string()))?;

    let receipt = state
        .ingestion
        .ingest(
            &caller,
            UploadRequest {
                content,
                filename,
                entry_id,
                description,
                tags,
            },
        )
        .await?;

    let filename = receipt
        .key
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string();

    Ok(Json(UploadResponse {
        object_id: receipt.object_id,
        filename,
        location: format!("{}/{}", receipt.bucket, receipt.key),
        mime_type: receipt.detected_mime,
        spatial_extent: receipt.extent,
        scan_verdict: receipt.scan_verdict,
        warnings: receipt.warnings,
    }))
}

use crate::AppState;
use crate::api::error::AppError;
use crate::services::audit::{AuditEvent, AuditEventType};
use crate::services::guard::Caller;
use crate::services::storage::BlobLocation;
use crate::services::token_service::TokenPurpose;
use crate::services::transfer::ArchiveMember;
use crate::utils::auth::Claims;
use axum::{
    Extension, Json,
    body::Body,
    extract::{Query, State},
    http::{StatusCode, header},
    response::Response,
};
use chrono::Duration;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use validator::Validate;

#[derive(Deserialize, ToSchema, Validate)]
pub struct DownloadLinkRequest {
    /// `bucket/key` descriptors as listed by `/entries/{id}/objects`
    #[validate(length(min = 1, max = 500, message = "Select between 1 and 500 files"))]
    pub locations: Vec<String>,
}

#[derive(Serialize, ToSchema)]
pub struct DownloadLinkResponse {
    pub url: String,
    pub purpose: String,
    pub expires_in: i64,
}

#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct DownloadFileQuery {
    pub bucket: Option<String>,
    pub object: Option<String>,
    pub token: Option<String>,
}

#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct DownloadZipQuery {
    /// Comma separated `bucket/key` list, exactly as issued
    pub files: Option<String>,
    pub token: Option<String>,
}

fn attachment_disposition(filename: &str) -> String {
    let ascii_filename = filename
        .chars()
        .filter(|c| c.is_ascii() && !c.is_control() && *c != '"' && *c != '\\' && *c != ';')
        .take(64)
        .collect::<String>();
    let fallback_filename = if ascii_filename.is_empty() {
        "file"
    } else {
        &ascii_filename
    };

    let encoded_filename = utf8_percent_encode(filename, NON_ALPHANUMERIC).to_string();

    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback_filename, encoded_filename
    )
}

fn stream_response(body: Body, content_type: &str, filename: &str) -> Result<Response, AppError> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_DISPOSITION, attachment_disposition(filename))
        .header(header::CACHE_CONTROL, "no-store")
        .body(body)
        .map_err(|e| AppError::Internal(format!("Failed to build download response: {}", e)))
}

#[utoipa::path(
    post,
    path = "/download-links",
    request_body = DownloadLinkRequest,
    responses(
        (status = 200, description = "One-time download link", body = DownloadLinkResponse),
        (status = 400, description = "Malformed location"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Missing or invalid anti-forgery token"),
        (status = 404, description = "Object not found")
    ),
    security(
        ("jwt" = [])
    ),
    tag = "downloads"
)]
pub async fn create_download_link(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<DownloadLinkRequest>,
) -> Result<Json<DownloadLinkResponse>, AppError> {
    req.validate()
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    let mut locations = Vec::with_capacity(req.locations.len());
    for descriptor in &req.locations {
        let location = BlobLocation::parse(descriptor)
            .ok_or_else(|| AppError::BadRequest(format!("Invalid location '{}'", descriptor)))?;
        if state.catalog.find_active(&location).await?.is_none() {
            return Err(AppError::NotFound(format!("File not found: {}", descriptor)));
        }
        locations.push(location);
    }

    let max_age = state.config.download_token_max_age_secs;
    let ttl = Duration::seconds(max_age);

    let (purpose, resource, url) = match locations.as_slice() {
        [single] => {
            let resource = single.to_string();
            let issued = state
                .tokens
                .issue(&caller, TokenPurpose::DownloadFile, &resource, ttl)
                .await?;
            let query = serde_urlencoded::to_string([
                ("bucket", single.bucket.as_str()),
                ("object", single.key.as_str()),
                ("token", issued.token.as_str()),
            ])
            .map_err(|e| AppError::Internal(e.to_string()))?;
            (
                TokenPurpose::DownloadFile,
                resource,
                format!("/download_file?{}", query),
            )
        }
        many => {
            let resource = many
                .iter()
                .map(|l| l.to_string())
                .collect::<Vec<_>>()
                .join(",");
            let issued = state
                .tokens
                .issue(&caller, TokenPurpose::DownloadZip, &resource, ttl)
                .await?;
            let query = serde_urlencoded::to_string([
                ("files", resource.as_str()),
                ("token", issued.token.as_str()),
            ])
            .map_err(|e| AppError::Internal(e.to_string()))?;
            (
                TokenPurpose::DownloadZip,
                resource,
                format!("/download_zip?{}", query),
            )
        }
    };

    state
        .audit
        .log(AuditEvent {
            event_type: AuditEventType::DownloadLinkIssued,
            user_id: Some(caller.identity()),
            resource_id: Some(resource.as_str()),
            action: purpose.as_str(),
            status: "success",
            details: None,
        })
        .await;

    Ok(Json(DownloadLinkResponse {
        url,
        purpose: purpose.to_string(),
        expires_in: max_age,
    }))
}

#[utoipa::path(
    get,
    path = "/download_file",
    params(DownloadFileQuery),
    responses(
        (status = 200, description = "File stream"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Download token rejected"),
        (status = 404, description = "File not found")
    ),
    security(
        ("jwt" = [])
    ),
    tag = "downloads"
)]
pub async fn download_file(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<DownloadFileQuery>,
) -> Result<Response, AppError> {
    let (Some(bucket), Some(object), Some(token)) = (query.bucket, query.object, query.token)
    else {
        tracing::info!("download_file: bucket, object or token missing");
        return Err(AppError::NotFound("File not found".to_string()));
    };

    let location = BlobLocation::new(bucket, object);
    let max_age = Duration::seconds(state.config.download_token_max_age_secs);
    state
        .tokens
        .verify(
            &token,
            TokenPurpose::DownloadFile,
            &location.to_string(),
            max_age,
        )
        .await?;

    let stream = state.transfer.stream_one(&location).await?;

    state
        .audit
        .log(AuditEvent {
            event_type: AuditEventType::FileDownload,
            user_id: Some(claims.sub.as_str()),
            resource_id: Some(location.key.as_str()),
            action: TokenPurpose::DownloadFile.as_str(),
            status: "started",
            details: None,
        })
        .await;

    stream_response(
        Body::from_stream(stream),
        mime::APPLICATION_OCTET_STREAM.as_ref(),
        location.file_name(),
    )
}

#[utoipa::path(
    get,
    path = "/download_zip",
    params(DownloadZipQuery),
    responses(
        (status = 200, description = "Zip archive stream"),
        (status = 400, description = "No files specified"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Download token rejected"),
        (status = 404, description = "One of the files was not found")
    ),
    security(
        ("jwt" = [])
    ),
    tag = "downloads"
)]
pub async fn download_zip(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<DownloadZipQuery>,
) -> Result<Response, AppError> {
    let files = query.files.unwrap_or_default();
    if files.is_empty() {
        return Err(AppError::BadRequest("No files specified".to_string()));
    }
    let token = query.token.unwrap_or_default();

    let max_age = Duration::seconds(state.config.download_token_max_age_secs);
    state
        .tokens
        .verify(&token, TokenPurpose::DownloadZip, &files, max_age)
        .await?;

    let members = files
        .split(',')
        .map(|descriptor| {
            BlobLocation::parse(descriptor)
                .map(ArchiveMember::from_location)
                .ok_or_else(|| AppError::BadRequest(format!("Invalid location '{}'", descriptor)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let stream = state.transfer.stream_zip(members).await?;

    state
        .audit
        .log(AuditEvent {
            event_type: AuditEventType::FileDownload,
            user_id: Some(claims.sub.as_str()),
            resource_id: Some(files.as_str()),
            action: TokenPurpose::DownloadZip.as_str(),
            status: "started",
            details: None,
        })
        .await;

    stream_response(Body::from_stream(stream), "application/zip", "files.zip")
}

use crate::services::catalog::CatalogError;
use crate::services::guard::GuardError;
use crate::services::ingestion::{IngestionError, Rejection};
use crate::services::token_service::TokenError;
use crate::services::transfer::TransferError;
use crate::services::validation::ValidationError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Always rendered with the same generic message
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Not Found: {0}")]
    NotFound(String),

    #[error("Payload Too Large: {0}")]
    PayloadTooLarge(String),

    #[error("Integrity fault: {0}")]
    IntegrityFault(String),

    #[error("Internal Server Error: {0}")]
    Internal(String),

    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".to_string(),
                )
            }
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::Forbidden(detail) => {
                tracing::warn!("Access denied: {}", detail);
                (StatusCode::FORBIDDEN, "Access denied".to_string())
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg),
            AppError::IntegrityFault(detail) => {
                tracing::error!("Integrity fault: {}", detail);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "The file was stored but could not be catalogued. An operator has been notified; do not retry."
                        .to_string(),
                )
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".to_string(),
                )
            }
            AppError::Anyhow(e) => {
                tracing::error!("Anyhow error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<IngestionError> for AppError {
    fn from(e: IngestionError) -> Self {
        match e {
            IngestionError::Rejected(Rejection::Validation(v @ ValidationError::TooLarge { .. })) => {
                AppError::PayloadTooLarge(v.to_string())
            }
            IngestionError::Rejected(rejection) => AppError::BadRequest(rejection.to_string()),
            IngestionError::IntegrityFault { location, reason } => {
                AppError::IntegrityFault(format!("{}: {}", location, reason))
            }
            IngestionError::Catalog(e) => AppError::Database(e),
        }
    }
}

impl From<TokenError> for AppError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::Store(msg) => AppError::Internal(format!("Token store: {}", msg)),
            kind => AppError::Forbidden(format!("download token rejected ({:?})", kind)),
        }
    }
}

impl From<GuardError> for AppError {
    fn from(e: GuardError) -> Self {
        match e {
            GuardError::Unauthenticated => AppError::Unauthorized(e.to_string()),
            GuardError::Forgery => AppError::Forbidden(e.to_string()),
        }
    }
}

impl From<CatalogError> for AppError {
    fn from(e: CatalogError) -> Self {
        match e {
            CatalogError::NotFound => AppError::NotFound("Object not found".to_string()),
            CatalogError::NotOwner => AppError::Forbidden(e.to_string()),
            CatalogError::Database(e) => AppError::Database(e),
            CatalogError::Storage(e) => AppError::Internal(e.to_string()),
        }
    }
}

impl From<TransferError> for AppError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::NotFound(location) => {
                tracing::info!("Download of missing object {}", location);
                AppError::NotFound("File not found".to_string())
            }
            TransferError::PartialNotFound { location } => {
                AppError::NotFound(format!("Error retrieving {}", location.key))
            }
            TransferError::Storage(e) => AppError::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::storage::BlobLocation;

    #[test]
    fn test_token_failures_are_generic_403() {
        for kind in [
            TokenError::Expired,
            TokenError::Invalid,
            TokenError::PurposeMismatch,
            TokenError::ResourceMismatch,
            TokenError::AlreadyUsed,
        ] {
            let response = AppError::from(kind).into_response();
            assert_eq!(response.status(), StatusCode::FORBIDDEN);
        }
        let response = AppError::from(TokenError::Store("down".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_ingestion_error_mapping() {
        let too_large = IngestionError::Rejected(Rejection::Validation(ValidationError::TooLarge {
            size: 10,
            max: 5,
        }));
        assert_eq!(
            AppError::from(too_large).into_response().status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );

        let rejected = IngestionError::Rejected(Rejection::Validation(
            ValidationError::EmptyContent,
        ));
        assert_eq!(
            AppError::from(rejected).into_response().status(),
            StatusCode::BAD_REQUEST
        );

        let fault = IngestionError::IntegrityFault {
            location: BlobLocation::new("models", "e/o/f.csv"),
            reason: "insert failed".to_string(),
        };
        assert!(matches!(AppError::from(fault), AppError::IntegrityFault(_)));
    }
}

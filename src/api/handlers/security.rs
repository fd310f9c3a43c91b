use crate::AppState;
use crate::api::error::AppError;
use crate::utils::auth::Claims;
use axum::{Extension, Json, extract::State};
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Serialize, ToSchema)]
pub struct CsrfTokenResponse {
    pub token: String,
}

#[utoipa::path(
    get,
    path = "/csrf-token",
    responses(
        (status = 200, description = "Anti-forgery token bound to the session identity", body = CsrfTokenResponse),
        (status = 401, description = "Unauthorized")
    ),
    security(
        ("jwt" = [])
    ),
    tag = "security"
)]
pub async fn get_csrf_token(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<CsrfTokenResponse>, AppError> {
    let token = state
        .guard
        .issue_csrf_token(&claims.sub)
        .ok_or_else(|| AppError::Internal("Failed to sign anti-forgery token".to_string()))?;

    Ok(Json(CsrfTokenResponse { token }))
}

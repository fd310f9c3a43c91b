use crate::AppState;
use crate::utils::auth::validate_jwt;
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use serde::Deserialize;

/// `token` is taken by download links, so the session JWT travels as `access_token`
#[derive(Deserialize)]
struct AuthQuery {
    access_token: Option<String>,
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let auth_header = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|s| s.to_string());

    let token = if let Some(t) = auth_header {
        Some(t)
    } else {
        // Try query parameter
        let query = req.uri().query().unwrap_or_default();
        serde_urlencoded::from_str::<AuthQuery>(query)
            .ok()
            .and_then(|q| q.access_token)
    };

    if let Some(token) = token {
        match validate_jwt(&token, &state.config.jwt_secret) {
            Ok(claims) => {
                req.extensions_mut().insert(claims);
                return Ok(next.run(req).await);
            }
            Err(e) => tracing::debug!("Rejected bearer token: {}", e),
        }
    }

    Err(StatusCode::UNAUTHORIZED)
}

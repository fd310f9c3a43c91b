use crate::AppState;
use crate::api::error::AppError;
use crate::utils::auth::Claims;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

pub const CSRF_HEADER: &str = "X-CSRF-Token";

/// Runs after `auth_middleware`. Turns the session claims plus the
/// anti-forgery header into a `Caller` for the handler.
pub async fn csrf_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let identity = req.extensions().get::<Claims>().map(|c| c.sub.clone());
    let csrf_token = req
        .headers()
        .get(CSRF_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string());

    let caller = state
        .guard
        .admit(identity.as_deref(), csrf_token.as_deref())?;

    req.extensions_mut().insert(caller);
    Ok(next.run(req).await)
}

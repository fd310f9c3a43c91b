use crate::AppState;
use axum::{Json, extract::State, response::IntoResponse};
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub database: String,
    pub storage: String,
    pub scanner: String,
    pub version: String,
}

fn connection_status(ok: bool) -> String {
    if ok { "connected" } else { "disconnected" }.to_string()
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "System health status", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = state.db.ping().await.is_ok();
    let storage = state.storage.health_check().await;

    let scanner = if state.config.enable_virus_scan {
        connection_status(state.scanner.health_check().await)
    } else {
        "disabled".to_string()
    };

    Json(HealthResponse {
        status: if database && storage { "ok" } else { "degraded" }.to_string(),
        database: connection_status(database),
        storage: connection_status(storage),
        scanner,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub mod api;
pub mod config;
pub mod entities;
pub mod infrastructure;
pub mod services;
pub mod utils;

use crate::config::SecurityConfig;
use crate::services::audit::AuditService;
use crate::services::catalog::CatalogService;
use crate::services::geo::GeoExtractor;
use crate::services::guard::ActionGuard;
use crate::services::ingestion::IngestionService;
use crate::services::scanner::VirusScanner;
use crate::services::storage::BlobStore;
use crate::services::token_service::TokenService;
use crate::services::transfer::TransferStreamer;
use crate::services::validation::ValidationGate;
use axum::{
    Router,
    http::HeaderValue,
    middleware::{from_fn, from_fn_with_state},
    routing::{delete, get, post},
};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::health::health_check,
        api::handlers::security::get_csrf_token,
        api::handlers::catalog::list_entries,
        api::handlers::catalog::list_objects,
        api::handlers::catalog::delete_object,
        api::handlers::upload::upload_file,
        api::handlers::download::create_download_link,
        api::handlers::download::download_file,
        api::handlers::download::download_zip,
    ),
    components(
        schemas(
            api::handlers::health::HealthResponse,
            api::handlers::security::CsrfTokenResponse,
            api::handlers::catalog::EntryResponse,
            api::handlers::catalog::ObjectResponse,
            api::handlers::catalog::DeletionResponse,
            api::handlers::upload::UploadResponse,
            api::handlers::download::DownloadLinkRequest,
            api::handlers::download::DownloadLinkResponse,
        )
    ),
    tags(
        (name = "system", description = "Health endpoints"),
        (name = "security", description = "Anti-forgery tokens"),
        (name = "catalog", description = "Dictionary and stored objects"),
        (name = "files", description = "Uploads"),
        (name = "downloads", description = "One-time download links and streams")
    )
)]
pub struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub storage: Arc<dyn BlobStore>,
    pub scanner: Arc<dyn VirusScanner>,
    pub config: SecurityConfig,
    pub guard: Arc<ActionGuard>,
    pub tokens: Arc<TokenService>,
    pub ingestion: Arc<IngestionService>,
    pub catalog: Arc<CatalogService>,
    pub transfer: Arc<TransferStreamer>,
    pub audit: AuditService,
}

impl AppState {
    /// Builds every service once from the shared collaborators
    pub fn new(
        db: DatabaseConnection,
        storage: Arc<dyn BlobStore>,
        scanner: Arc<dyn VirusScanner>,
        config: SecurityConfig,
    ) -> Self {
        let gate = ValidationGate::new(scanner.clone(), &config);
        let ingestion = IngestionService::new(
            db.clone(),
            storage.clone(),
            gate,
            GeoExtractor::new(),
            config.upload_bucket.clone(),
        );

        Self {
            guard: Arc::new(ActionGuard::new(
                &config.token_secret,
                config.csrf_max_age_secs,
            )),
            tokens: Arc::new(TokenService::new(db.clone(), &config.token_secret)),
            ingestion: Arc::new(ingestion),
            catalog: Arc::new(CatalogService::new(db.clone(), storage.clone())),
            transfer: Arc::new(TransferStreamer::new(
                storage.clone(),
                config.stream_chunk_size,
            )),
            audit: AuditService::new(db.clone()),
            db,
            storage,
            scanner,
            config,
        }
    }
}

fn cors_layer(config: &SecurityConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any)
}

pub fn create_app(state: AppState) -> Router {
    let authenticated = from_fn_with_state(state.clone(), api::middleware::auth::auth_middleware);
    let csrf = from_fn_with_state(state.clone(), api::middleware::csrf::csrf_middleware);

    // Layers run bottom-up: auth inserts the claims csrf turns into a Caller
    let guarded = Router::new()
        .route("/upload", post(api::handlers::upload::upload_file))
        .route(
            "/download-links",
            post(api::handlers::download::create_download_link),
        )
        .route(
            "/objects/:id",
            delete(api::handlers::catalog::delete_object),
        )
        .layer(csrf)
        .layer(authenticated.clone());

    let authenticated_only = Router::new()
        .route(
            "/csrf-token",
            get(api::handlers::security::get_csrf_token),
        )
        .route("/entries", get(api::handlers::catalog::list_entries))
        .route(
            "/entries/:id/objects",
            get(api::handlers::catalog::list_objects),
        )
        .route(
            "/download_file",
            get(api::handlers::download::download_file),
        )
        .route("/download_zip", get(api::handlers::download::download_zip))
        .layer(authenticated);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(api::handlers::health::health_check))
        .merge(guarded)
        .merge(authenticated_only)
        .layer(from_fn(api::middleware::request_id::request_id_middleware))
        .layer(cors_layer(&state.config))
        .layer(axum::extract::DefaultBodyLimit::max(
            state.config.max_file_size + 10 * 1024 * 1024, // Add 10MB buffer for multipart overhead
        ))
        .with_state(state)
}

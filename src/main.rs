use clap::Parser;
use dotenvy::dotenv;
use object_catalog::config::{Profile, SecurityConfig};
use object_catalog::infrastructure::{database, scanner, seed, storage};
use object_catalog::{AppState, create_app};
use std::net::SocketAddr;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(version, about = "Catalogued object storage front end")]
struct Args {
    /// Address to bind
    #[arg(long, env = "BIND_ADDRESS", default_value = "127.0.0.1")]
    host: std::net::IpAddr,

    #[arg(long, env = "PORT", default_value_t = 3000)]
    port: u16,

    /// Production refuses to start without JWT_SECRET and TOKEN_SECRET
    #[arg(long, env = "APP_PROFILE", value_enum, default_value_t = Profile::Production)]
    profile: Profile,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    // Initialize tracing with EnvFilter
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "object_catalog=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!("🚀 Starting Object Catalog...");

    let security_config = SecurityConfig::load(args.profile)?;
    if args.profile == Profile::Development {
        warn!("⚠️  Development profile: missing secrets fall back to public defaults");
    }

    // Setup Infrastructure
    let db = database::setup_database().await?;

    info!(
        "🛡️  Security Config: Max Size={}MB, Virus Scan={}, Scanner={}, On scan failure={:?}",
        security_config.max_file_size / 1024 / 1024,
        security_config.enable_virus_scan,
        security_config.virus_scanner_type,
        security_config.scan_failure_policy
    );

    let storage_service = storage::setup_storage(&security_config.upload_bucket).await?;
    let scanner_service = scanner::setup_scanner(&security_config).await;

    match std::env::var("DICTIONARY_SEED_FILE") {
        Ok(path) => seed::seed_dictionary_from_file(&db, path).await?,
        Err(_) => warn!("⚠️  DICTIONARY_SEED_FILE not set, dictionary left as is"),
    }

    let state = AppState::new(
        db.clone(),
        storage_service,
        scanner_service,
        security_config,
    );

    let app = create_app(state).layer(
        TraceLayer::new_for_http()
            .make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("unknown");
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    path = %request.uri().path(),
                    request_id = %request_id,
                )
            })
            .on_request(|request: &axum::http::Request<_>, _span: &tracing::Span| {
                // Query strings carry download tokens, keep them out of the logs
                info!("📥 {} {}", request.method(), request.uri().path());
            })
            .on_response(
                |response: &axum::http::Response<_>,
                 latency: std::time::Duration,
                 _span: &tracing::Span| {
                    info!(
                        "📤 Finished in {:?} with status {}",
                        latency,
                        response.status()
                    );
                },
            ),
    );

    let addr = SocketAddr::from((args.host, args.port));
    info!("✅ Server ready at http://{}", addr);
    info!("📖 Swagger UI: http://{}/swagger-ui", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    database::shutdown_database(db).await;
    info!("🛑 Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("⌨️  Ctrl+C received, starting graceful shutdown...");
        },
        _ = terminate => {
            info!("💤 SIGTERM received, starting graceful shutdown...");
        },
    }
}

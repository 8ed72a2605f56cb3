use clap::Parser;
use dotenvy::dotenv;
use sharevault::config::{AppConfig, PolicySettings};
use sharevault::infrastructure::database;
use sharevault::services::file_service::FileService;
use sharevault::services::forensic::ForensicService;
use sharevault::services::notify::{build_notifier, NotifyOptions};
use sharevault::services::share_service::ShareService;
use sharevault::services::storage::{LocalStorage, StorageService};
use sharevault::services::sweeper;
use sharevault::{create_app, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port for the API server
    #[arg(short, long, default_value_t = 3000)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sharevault=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🚀 Starting ShareVault...");

    let config = AppConfig::from_env();

    let db = database::setup_database().await?;

    let policy = PolicySettings::load(&db).await?;
    info!(
        "🛡️  Policy: max size={}MB, share lifetime={}d, extensions={:?}",
        policy.max_file_size_bytes / 1024 / 1024,
        policy.default_max_share_days,
        policy.allowed_extensions
    );

    let local = LocalStorage::new(config.storage_root.clone(), config.public_dir.clone());
    local.init().await?;
    let storage: Arc<dyn StorageService> = Arc::new(local);

    let forensic = ForensicService::new(db.clone());
    let notifier = build_notifier(config.notify_webhook_url.as_deref());
    let notify_opts = NotifyOptions {
        from_email: config.notify_from_email.clone(),
        from_name: config.notify_from_name.clone(),
    };

    let file_service = Arc::new(FileService::new(
        db.clone(),
        storage.clone(),
        forensic.clone(),
        policy.clone(),
    ));

    let share_service = Arc::new(ShareService::new(
        db.clone(),
        storage.clone(),
        forensic.clone(),
        notifier,
        notify_opts,
        config.base_url.clone(),
        policy.clone(),
    ));

    sweeper::spawn(share_service.clone(), config.sweep_interval_secs);

    let state = AppState {
        db,
        storage,
        forensic,
        file_service,
        share_service,
        config,
        policy,
    };

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &axum::http::Request<_>| {
            tracing::info_span!(
                "http_request",
                method = %request.method(),
                uri = %request.uri(),
            )
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
        );

    let app = create_app(state).layer(trace_layer);
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("✅ API Server listening on: http://0.0.0.0:{}", args.port);
    info!(
        "📖 Swagger UI documentation: http://localhost:{}/swagger-ui",
        args.port
    );

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("❌ Server runtime error: {}", e);
    }

    info!("👋 ShareVault exited cleanly.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("⌨️  Ctrl+C received, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("🛑 SIGTERM received, initiating graceful shutdown...");
        },
    }
}

mod api;
mod config;
mod models;
mod providers;
mod reconcile;
mod sampler;
mod scheduler;
mod store;

use axum::http::{HeaderValue, Method, header};
use tokio::sync::watch;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Config;
use providers::luas::LuasClient;
use reconcile::Reconciler;
use sampler::Sampler;
use scheduler::Scheduler;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "luas_tracker=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string());
    let mut config = Config::load(&config_path)?;
    if let Ok(database_url) = std::env::var("DATABASE_URL") {
        config.database_url = database_url;
    }

    info!(
        config = %config_path,
        stops = ?config.stop_codes,
        poll_interval_secs = config.poll_interval_seconds,
        reconciliation_interval_secs = config.reconciliation_interval_seconds,
        "Starting Luas tracker"
    );

    let pool = store::connect(&config.database_url).await?;

    let client = LuasClient::new(&config.feed_base_url, config.fetch_timeout())?;
    let sampler = Sampler::new(
        pool.clone(),
        client,
        config.stop_codes.clone(),
        config.fetch_timeout(),
        config.max_concurrent_fetches,
    );
    let reconciler = Reconciler::new(pool.clone(), config.reconcile_policy());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (sampler_handle, reconciler_handle) = Scheduler::new(
        sampler,
        reconciler,
        config.poll_interval(),
        config.reconciliation_interval(),
    )
    .start(shutdown_rx);

    let app = api::router(pool.clone())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&config));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down background tasks");
    let _ = shutdown_tx.send(true);
    for (name, handle) in [("sampler", sampler_handle), ("reconciler", reconciler_handle)] {
        if let Err(e) = handle.await {
            error!(task = name, error = %e, "Background task panicked");
        }
    }

    pool.close().await;
    info!("Shutdown complete");

    Ok(())
}

fn cors_layer(config: &Config) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_headers([header::CONTENT_TYPE]);

    if config.cors_permissive {
        warn!("CORS is permissive, all origins are allowed");
        return cors.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    cors.allow_origin(AllowOrigin::list(origins))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown signal received");
}

use std::net::SocketAddr;
use std::sync::Arc;

use texpress::backend::ConvexBackend;
use texpress::config::Config;
use texpress::queue::QueueManager;
use texpress::server::{self, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // Load .env file if present (silently ignored if missing)
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    tracing::info!(bind = %config.bind_addr, "texpress starting");

    let queue = QueueManager::new(config.max_concurrent, config.max_queue_size);
    queue.start();

    let backend = config
        .convex
        .as_ref()
        .map(|convex| ConvexBackend::new(convex.url.clone(), convex.deploy_key.clone()));

    let state = Arc::new(AppState {
        config,
        queue: Arc::clone(&queue),
        backend,
    });

    let listener = tokio::net::TcpListener::bind(&state.config.bind_addr).await?;
    let app = server::router(Arc::clone(&state));
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    state.queue.stop().await;
    tracing::info!("texpress shutting down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {e}");
    }
}

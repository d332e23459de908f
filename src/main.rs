use std::sync::Arc;

use sparrow_dispatch::{
    handlers,
    state::{AppConfig, AppState},
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("sparrow_dispatch=info,tower_http=info")),
        )
        .init();

    let config = AppConfig::from_env()?;
    let bind_addr = config.bind_addr.clone();
    let retry_interval = config.publish_retry_interval;

    let app_state = Arc::new(AppState::new(config).await?);

    // Out-of-band publication retries
    let fanout = app_state.fanout.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(retry_interval);
        loop {
            ticker.tick().await;
            let remaining = fanout.retry_pending().await;
            if remaining > 0 {
                tracing::warn!("{} events still waiting to be published", remaining);
            }
        }
    });

    for worker in app_state.event_workers() {
        tokio::spawn(worker.run());
    }

    let app = handlers::router(app_state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("sparrow-dispatch listening on {}", bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutting down");
        })
        .await?;

    Ok(())
}

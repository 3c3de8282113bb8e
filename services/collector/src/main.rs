use std::sync::Arc;

use collector::config::Config;
use collector::lifecycle::SubscriptionManager;
use collector::router::create_router;
use collector::sink::{QuestDbSink, RowSink};
use collector::state::AppState;
use collector::tables;
use collector::transport::WsTransport;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    tracing::info!("Starting market data collector");

    let config = Config::from_env()?;

    // Sink first: every table must exist before any feed starts
    let sink = Arc::new(QuestDbSink::connect(&config.db).await?);
    for schema in tables::all_schemas() {
        sink.create_table(schema.ddl).await?;
    }

    let transport = Arc::new(WsTransport::new(
        config.ws_url.clone(),
        config.reconnect_delay,
    ));
    let subscriptions = Arc::new(SubscriptionManager::new(
        sink.clone(),
        transport,
        config.api_key.clone(),
    ));

    let app = create_router(AppState::new(subscriptions.clone()));

    let listener = TcpListener::bind(config.bind_addr).await?;
    tracing::info!("Listening on {}", config.bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain feeds before the process exits so no partial batch is lost
    subscriptions.shutdown().await;
    if let Err(err) = sink.flush().await {
        tracing::warn!(error = %err, "final flush failed");
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "shutdown signal unavailable");
        std::future::pending::<()>().await;
    }
}

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pulse_server::{
    config::{Args, ServerConfig},
    create_router, database,
    hub::Hub,
    listener::{Listener, PgChangeSource},
    state::AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before parsing so DB_* variables can come from it
    dotenv::dotenv().ok();

    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    let log_filter = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("pulse_server={},tower_http=info", log_filter).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Create configuration
    let config: ServerConfig = args.into_config()?;
    config.validate()?;
    let listen_addr = config.listen_addr();

    // Connect and install triggers
    let pool = database::connect(&config).await?;
    if config.skip_setup {
        tracing::info!("skipping trigger installation");
    } else {
        database::install_triggers(&pool, &config.schema, &config.channel).await?;
    }

    let shutdown = CancellationToken::new();

    // Start the hub and the change listener
    let (hub, handle, events) = Hub::new(config.hub_config());
    let hub_task = tokio::spawn(hub.run(shutdown.clone()));

    let listener = Listener::new(
        PgChangeSource::new(pool.clone()),
        events,
        config.listener_config(),
    );
    let listener_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let result = listener.run(shutdown.clone()).await;
            if let Err(e) = &result {
                tracing::error!(error = %e, "change listener failed, shutting down");
                shutdown.cancel();
            }
            result
        }
    });

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                return;
            }
            tracing::info!("shutdown requested");
            shutdown.cancel();
        }
    });

    // Create router
    let state = AppState::new(
        handle,
        pool.clone(),
        config.connection_config(),
        shutdown.clone(),
    );
    let app = create_router(state);

    // Bind to address
    let tcp = TcpListener::bind(&listen_addr).await?;

    tracing::info!(addr = %listen_addr, channel = %config.channel, "Pulse server listening");
    tracing::info!("Subscribe at ws://{}/ws/all", listen_addr);
    tracing::info!("Health check at http://{}/health", listen_addr);

    // Start server
    axum::serve(tcp, app)
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move { shutdown.cancelled().await }
        })
        .await?;

    shutdown.cancel();
    let listener_result = listener_task.await?;
    hub_task.await?;
    pool.close().await;

    tracing::info!("Pulse server stopped");
    listener_result?;
    Ok(())
}

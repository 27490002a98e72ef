//! SiteGate - Entry Point
//!
//! Starts the gateway and the status API with graceful shutdown support.

use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sitegate::api::ApiServer;
use sitegate::config::{Config, LogConfig};
use sitegate::{GatewayContext, GatewayServer};

#[tokio::main]
async fn main() -> sitegate::Result<()> {
    let config = Config::from_env();
    init_tracing(config.as_ref().map(|c| &c.log).unwrap_or(&LogConfig::default()));

    info!("Starting SiteGate");
    let config = config?;
    info!("Configuration loaded");

    let ctx = Arc::new(GatewayContext::from_config(&config)?);

    let (shutdown_tx, _) = watch::channel(false);

    let gateway_server = GatewayServer::new(ctx.clone());
    let api_server = ApiServer::new(config.api.clone(), ctx);

    let gateway_shutdown = shutdown_tx.subscribe();
    let api_shutdown = shutdown_tx.subscribe();

    let gateway_task = tokio::spawn(async move {
        if let Err(e) = gateway_server.run(gateway_shutdown).await {
            error!("Gateway error: {}", e);
        }
    });

    let api_task = tokio::spawn(async move {
        if let Err(e) = api_server.run(api_shutdown).await {
            error!("API server error: {}", e);
        }
    });

    info!(
        "Servers started - Gateway: {}, API: {}",
        config.gateway_addr(),
        config.api_addr()
    );

    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(gateway_task, api_task);

    info!("SiteGate stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("sitegate={},tower_http=debug", log.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if log.format.eq_ignore_ascii_case("json") {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

mod server;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use changefeed_cluster::{ChangeHub, DistributedRelay, HubConfig, PubSubMedium, RedisMedium};
use changefeed_core::{logging, Config, PgNotifySource};

use server::{create_router, AppState};

/// Real-time change event fan-out server
#[derive(Debug, Parser)]
#[command(name = "changefeed", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "CHANGEFEED_CONFIG_PATH")]
    config: Option<String>,
}

/// Generate a unique node ID for this server instance
fn generate_node_id() -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    format!("{hostname}-{}", nanoid::nanoid!(6))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration
    let config = Config::discover(cli.config.as_deref())?;

    // 2. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Changefeed server starting...");
    info!("HTTP address: {}", config.http_address());

    // 4. Build the hub
    let mut hub_config = HubConfig::from(&config.hub);
    if config.hub.node_id.is_empty() {
        hub_config.node_id = generate_node_id();
    }

    let (hub, medium) = if config.relay_enabled() {
        let medium = Arc::new(
            RedisMedium::connect(
                &config.redis.url,
                Duration::from_secs(config.redis.connect_timeout_seconds),
            )
            .await?,
        );
        let relay = Arc::new(DistributedRelay::new(
            medium.clone(),
            config.redis.channel.clone(),
            hub_config.node_id.clone(),
        ));
        info!(node_id = %hub_config.node_id, "Redis relay enabled");
        (Arc::new(ChangeHub::with_relay(hub_config, relay)), Some(medium))
    } else {
        info!("Redis not configured, running single-node hub");
        (Arc::new(ChangeHub::new(hub_config)), None)
    };

    let cancel = CancellationToken::new();

    // 5. Relay pump
    if hub.relay().is_some() {
        let hub = hub.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = hub.run_relay(cancel).await {
                error!("Relay pump failed: {}", e);
            }
        });
    }

    // 6. Postgres source pump
    if config.source_enabled() {
        let source =
            PgNotifySource::connect(&config.postgres.url, &config.postgres.notify_channel).await?;
        let hub = hub.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let exit = hub.run_source(source, cancel).await;
            warn!(exit = ?exit, "Postgres source pump exited");
        });
    } else {
        info!("Postgres not configured, no built-in change source");
    }

    // 7. Serve HTTP until a shutdown signal arrives
    let listener = tokio::net::TcpListener::bind(config.http_address()).await?;
    info!("HTTP server listening on {}", config.http_address());

    let router = create_router(AppState { hub: hub.clone() });
    let graceful = {
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            info!("Shutdown signal received, starting graceful shutdown...");
            cancel.cancel();
        }
    };

    // Open WebSocket sessions hold the server open until the hub ends them
    let server = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(graceful)
                .await;
            cancel.cancel();
            result
        })
    };

    cancel.cancelled().await;
    hub.shutdown().await;
    if let Some(medium) = medium {
        medium.close().await;
    }

    match server.await {
        Ok(Ok(())) => info!("HTTP server shut down gracefully"),
        Ok(Err(e)) => error!("HTTP server error: {}", e),
        Err(e) => error!("HTTP server task failed: {}", e),
    }

    info!("Changefeed server stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}

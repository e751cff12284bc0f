use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{error, info, warn};

use belfry::bridge::{Bridge, BridgeEvent};
use belfry::config::Config;
use belfry::session::{SessionConfig, SessionManager};
use belfry::skybell::SkyBell;
use belfry::webhook;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (development); in production, systemd
    // provides environment variables via EnvironmentFile.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "belfry=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env();

    let bridge = Arc::new(Bridge::new());

    // Downstream consumer seam: the accessory integration subscribes here.
    // Until one is wired in, surface every bridge event in the log.
    let mut rx = bridge.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(BridgeEvent::DeviceDiscovered { device }) => {
                    info!(
                        device_id = %device.external_id,
                        name = %device.display_name,
                        state = %device.state,
                        "doorbell discovered"
                    );
                }
                Ok(BridgeEvent::DeviceUpdate { event, state }) => {
                    info!(
                        device_id = %event.device_id,
                        kind = ?event.kind,
                        origin = ?event.origin,
                        %state,
                        "doorbell update"
                    );
                }
                Ok(BridgeEvent::DeviceReachability {
                    device_id,
                    reachable,
                }) => {
                    info!(%device_id, reachable, "doorbell reachability changed");
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("event consumer lagged, skipped {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let session = match &config.credentials {
        Some(credentials) => match SkyBell::new(
            config.api_url.clone(),
            credentials.user_agent_suffix.as_deref(),
        ) {
            Ok(client) => {
                let manager = SessionManager::new(
                    client,
                    credentials.clone(),
                    bridge.clone(),
                    SessionConfig {
                        poll_interval: config.poll_interval,
                        ..SessionConfig::default()
                    },
                );
                manager.start();
                Some(manager)
            }
            Err(e) => {
                error!("failed to build cloud client: {e:#} — cloud session disabled");
                None
            }
        },
        None => None,
    };

    let webhook_handle = match &config.webhook {
        Some(cfg) => match webhook::start(bridge.clone(), cfg.port, &cfg.secret).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                // The rest of the system keeps running on polling alone.
                error!("failed to start webhook service: {e} — continuing without it");
                None
            }
        },
        None => None,
    };

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    if let Some(session) = session {
        session.stop().await;
    }
    if let Some(handle) = webhook_handle {
        handle.stop().await;
    }

    Ok(())
}

//! certd: VPN Client Certificate Agent
//!
//! Main entry point. Initializes the global allocator, sets up logging,
//! makes sure client keys exist, and keeps the session certificate fresh
//! until interrupted.
//!
//! SIGHUP means the network just came up (send it from a network-manager
//! dispatcher hook); the certificate is checked right away so the tunnel
//! does not start on a stale one.

mod config;

use anyhow::{Context, Result};
use certd_api::{ApiIssuanceClient, CredentialsFile};
use certd_core::{
    CertificateRefreshManager, CertificateStore, FileStore, IssuanceClient, KeyPair,
};
use std::future::Future;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::AgentConfig;

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const DEFAULT_LOG_FILTER: &str = "certd=info,certd_core=info,certd_api=info";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false).compact())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()))
        .init();

    info!("certd {} starting...", env!("CARGO_PKG_VERSION"));

    let args: Vec<String> = std::env::args().collect();
    let config = match AgentConfig::locate(&args) {
        Some(path) => {
            info!("Loading config from {}", path.display());
            AgentConfig::from_file(&path)?
        }
        None => {
            info!("No config given; using defaults");
            AgentConfig::default()
        }
    };

    let store = FileStore::open(&config.store.dir)
        .with_context(|| format!("Failed to open store at {}", config.store.dir.display()))?;
    info!("Store initialized at: {}", store.dir().display());

    ensure_keys(&store)?;

    let client = ApiIssuanceClient::with_credentials_file(
        config.api.clone(),
        CredentialsFile::new(config.credentials_path()),
    )?;

    let manager = CertificateRefreshManager::new(store, client, config.refresh.clone());

    if let Err(e) = manager
        .check_refresh_certificate_now(config.features.clone(), false)
        .await
    {
        warn!("Initial certificate check failed: {}", e);
    }

    manager.start();

    let (events, network_events) = mpsc::channel(1);
    forward_hangups(events)?;

    serve_until(&manager, network_events, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
        }
    })
    .await;

    info!("certd shutting down");
    Ok(())
}

/// Run network-reachable checks as events arrive, then stop the manager
/// once `shutdown` resolves
async fn serve_until<S, C>(
    manager: &CertificateRefreshManager<S, C>,
    mut network_events: mpsc::Receiver<()>,
    shutdown: impl Future<Output = ()>,
) where
    S: CertificateStore,
    C: IssuanceClient,
{
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = network_events.recv() => match event {
                Some(()) => manager.on_network_reachable().await,
                None => {
                    debug!("Network event source closed");
                    (&mut shutdown).await;
                    break;
                }
            },
        }
    }
    manager.stop();
}

/// Turn SIGHUP into network-reachable events
#[cfg(unix)]
fn forward_hangups(events: mpsc::Sender<()>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangups = signal(SignalKind::hangup()).context("Failed to listen for SIGHUP")?;
    tokio::spawn(async move {
        while hangups.recv().await.is_some() {
            // A queued event already covers this one
            let _ = events.try_send(());
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn forward_hangups(_events: mpsc::Sender<()>) -> Result<()> {
    Ok(())
}

/// Load the client keys, generating and storing a pair on first run
fn ensure_keys<S: CertificateStore>(store: &S) -> Result<KeyPair> {
    if let Some(keys) = store.stored_keys() {
        info!("Using stored client key {}", keys.public.to_base64());
        return Ok(keys);
    }

    let keys = KeyPair::generate();
    store
        .store_keys(&keys)
        .context("Failed to store generated client keys")?;
    // Storing new keys invalidates any certificate bound to the old ones
    store
        .delete_certificate()
        .context("Failed to clear certificate for old keys")?;

    info!(
        "Generated client key {} (WireGuard public key {})",
        keys.public.to_base64(),
        keys.private.wireguard_key().public_base64()
    );
    Ok(keys)
}

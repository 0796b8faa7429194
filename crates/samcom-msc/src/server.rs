use crate::center::Center;
use crate::config::ServerConfig;
use crate::connection::handle_connection;
use crate::error::MscError;
use crate::keystore::KeyStore;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared state for the switching center.
#[derive(Debug)]
pub struct ServerState {
    /// Authentication and routing engine.
    pub center: Center,
    /// Runtime server configuration.
    pub config: ServerConfig,
    /// Open relay connections, registered or not.
    pub active_connections: AtomicUsize,
}

impl ServerState {
    /// Build server state from configuration and a loaded key store.
    #[must_use]
    pub fn new(config: ServerConfig, keys: KeyStore) -> Self {
        Self {
            center: Center::from_config(&config, keys),
            config,
            active_connections: AtomicUsize::new(0),
        }
    }
}

/// Releases a connection slot when the connection task ends.
struct ConnSlot(Arc<ServerState>);

impl Drop for ConnSlot {
    fn drop(&mut self) {
        self.0.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Run the accept loop until the process ends.
///
/// # Errors
///
/// Returns an error if the listener's local address cannot be read.
pub async fn run(listener: TcpListener, state: Arc<ServerState>) -> Result<(), MscError> {
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    run_with_shutdown(listener, state, shutdown_rx).await
}

/// Run the accept loop with an externally-controlled shutdown signal.
///
/// When `shutdown` changes (or its sender is dropped) the loop stops
/// accepting, tells every relay connection to close and waits a bounded time
/// for them to finish.
///
/// # Errors
///
/// Returns an error if the listener's local address cannot be read.
pub async fn run_with_shutdown(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), MscError> {
    let local_addr = listener.local_addr()?;
    info!("switching center listening on {}", local_addr);
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        if state.active_connections.load(Ordering::Relaxed) >= state.config.max_conns {
                            warn!("max connections reached, rejecting {}", addr);
                            drop(stream);
                            continue;
                        }
                        state.active_connections.fetch_add(1, Ordering::Relaxed);
                        let slot = ConnSlot(Arc::clone(&state));
                        let state = Arc::clone(&state);
                        let shutdown = shutdown.clone();
                        tasks.spawn(async move {
                            let _slot = slot;
                            if let Err(e) = handle_connection(stream, addr, state, shutdown).await {
                                tracing::debug!("connection from {} closed: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                    }
                }
            }
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            _ = shutdown.changed() => {
                info!("shutdown signal received, draining {} connections", tasks.len());
                break;
            }
        }
    }

    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            "drain timeout reached with {} connections still active",
            tasks.len()
        );
        tasks.abort_all();
    }

    info!("switching center shut down gracefully");
    Ok(())
}

use crate::config::RelayConfig;
use crate::downstream::handle_station;
use crate::error::BmsError;
use crate::sessions::SessionTable;
use crate::upstream;
use samcom_common::types::PacketIdGen;
use samcom_common::Packet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// A packet bound for the center, tagged with the upstream link generation
/// of the session that queued it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamPacket {
    /// Link generation at the time the session was opened.
    pub generation: u64,
    /// The packet, not yet stamped.
    pub packet: Packet,
}

/// State shared by the upstream link and every station connection.
#[derive(Debug)]
pub struct BmsState {
    /// Runtime configuration.
    pub config: RelayConfig,
    /// Local sessions keyed by user id.
    pub sessions: SessionTable,
    /// Queue of packets bound for the switching center.
    pub upstream_tx: mpsc::Sender<UpstreamPacket>,
    /// Packet ids for packets this relay originates.
    pub ids: PacketIdGen,
    /// Open station connections, authenticated or not.
    pub active_connections: AtomicUsize,
    upstream_ready: AtomicBool,
}

impl BmsState {
    /// Returns `true` while the relay is registered with the center.
    #[must_use]
    pub fn is_upstream_ready(&self) -> bool {
        self.upstream_ready.load(Ordering::Acquire)
    }

    pub(crate) fn set_upstream_ready(&self, ready: bool) -> bool {
        self.upstream_ready.swap(ready, Ordering::AcqRel)
    }
}

/// A relay node ready to run: shared state plus the receiving end of the
/// upstream queue.
#[derive(Debug)]
pub struct RelayNode {
    state: Arc<BmsState>,
    pub(crate) upstream_rx: mpsc::Receiver<UpstreamPacket>,
}

impl RelayNode {
    /// Builds the node from configuration.
    #[must_use]
    pub fn new(config: RelayConfig) -> Self {
        let (upstream_tx, upstream_rx) = mpsc::channel(config.upstream_queue_capacity);
        let state = Arc::new(BmsState {
            config,
            sessions: SessionTable::new(),
            upstream_tx,
            ids: PacketIdGen::new(),
            active_connections: AtomicUsize::new(0),
            upstream_ready: AtomicBool::new(false),
        });
        Self { state, upstream_rx }
    }

    /// Shared state handle, for inspection while the node runs.
    #[must_use]
    pub fn state(&self) -> Arc<BmsState> {
        Arc::clone(&self.state)
    }

    /// Runs the upstream link and the station accept loop until `shutdown`
    /// changes.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener's local address cannot be read.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), BmsError> {
        let Self { state, upstream_rx } = self;
        let local_addr = listener.local_addr()?;
        info!(
            relay_id = %state.config.relay_id,
            "relay node listening on {}", local_addr
        );

        let upstream = tokio::spawn(upstream::maintain(
            Arc::clone(&state),
            upstream_rx,
            shutdown.clone(),
        ));
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if state.active_connections.load(Ordering::Relaxed) >= state.config.max_sessions {
                                warn!("max sessions reached, rejecting {}", addr);
                                drop(stream);
                                continue;
                            }
                            state.active_connections.fetch_add(1, Ordering::Relaxed);
                            let slot = ConnSlot(Arc::clone(&state));
                            let state = Arc::clone(&state);
                            let shutdown = shutdown.clone();
                            tasks.spawn(async move {
                                let _slot = slot;
                                if let Err(e) = handle_station(stream, addr, state, shutdown).await {
                                    tracing::debug!("station {} closed: {}", addr, e);
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
                    info!("shutdown signal received, draining {} stations", tasks.len());
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
                "drain timeout reached with {} stations still connected",
                tasks.len()
            );
            tasks.abort_all();
        }
        if let Err(e) = upstream.await {
            error!("upstream task failed: {}", e);
        }

        info!("relay node shut down gracefully");
        Ok(())
    }
}

/// Releases a connection slot when the station task ends.
struct ConnSlot(Arc<BmsState>);

impl Drop for ConnSlot {
    fn drop(&mut self) {
        self.0.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

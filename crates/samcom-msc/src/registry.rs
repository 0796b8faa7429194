use dashmap::DashMap;
use samcom_common::{Outbound, RelayId};
use std::time::Instant;
use tokio::sync::mpsc;

/// Handle held in the relay registry, used to write to a relay connection.
#[derive(Clone, Debug)]
pub struct RelayHandle {
    /// Relay id the connection registered under.
    pub relay_id: RelayId,
    /// Bounded queue feeding this connection's writer.
    pub tx: mpsc::Sender<Outbound>,
    /// Instant the registration happened (eviction guard).
    pub registered_at: Instant,
}

/// Concurrent relay id → connection table. Last registration wins.
#[derive(Debug, Default)]
pub struct Registry {
    relays: DashMap<RelayId, RelayHandle>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a handle, returning the one it replaced.
    #[must_use]
    pub fn insert(&self, handle: RelayHandle) -> Option<RelayHandle> {
        self.relays.insert(handle.relay_id.clone(), handle)
    }

    /// Remove the entry only if it was registered at the given instant.
    ///
    /// Returns `true` if the entry was removed.
    pub fn remove_if(&self, relay_id: &str, registered_at: Instant) -> bool {
        self.relays
            .remove_if(relay_id, |_k, v| v.registered_at == registered_at)
            .is_some()
    }

    /// Look up a relay connection.
    #[must_use]
    pub fn get(&self, relay_id: &str) -> Option<RelayHandle> {
        self.relays.get(relay_id).map(|entry| entry.value().clone())
    }

    /// Number of registered relays.
    #[must_use]
    pub fn len(&self) -> usize {
        self.relays.len()
    }

    /// Returns `true` if no relay is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }
}

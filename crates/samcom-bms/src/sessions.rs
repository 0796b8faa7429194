//! Local session table: one entry per station authenticated (or
//! authenticating) through this relay.
//!
//! Each entry owns the sending half of that session's bounded delivery
//! queue. Removing an entry drops the sender, which is how the session worker
//! learns it has been evicted.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use samcom_common::types::reason;
use samcom_common::{Packet, UserId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::mpsc::{self, error::TrySendError};

#[derive(Debug)]
struct Session {
    tx: mpsc::Sender<Packet>,
    opened_at: Instant,
}

/// Identifies one session instance, so cleanup only ever removes its own
/// entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTicket {
    /// When the entry was created.
    pub opened_at: Instant,
    /// Upstream link generation the session was opened under.
    pub generation: u64,
}

/// Outcome of handing a packet to a session.
#[derive(Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Queued for the station.
    Queued,
    /// No session for that user on this relay.
    NoSession,
    /// The session's queue was full; the session was evicted.
    Evicted,
}

/// Concurrent `user_id → session` table with per-entry locking.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: DashMap<UserId, Session>,
    generation: AtomicU64,
}

impl SessionTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a session for `user_id` unless one already exists.
    ///
    /// Returns `None` for a duplicate; the existing session is untouched.
    pub fn try_insert(&self, user_id: &str, tx: mpsc::Sender<Packet>) -> Option<SessionTicket> {
        match self.sessions.entry(user_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let opened_at = Instant::now();
                slot.insert(Session { tx, opened_at });
                Some(SessionTicket {
                    opened_at,
                    generation: self.generation(),
                })
            }
        }
    }

    /// Removes `user_id` only if the entry is still the one opened at
    /// `opened_at`. Returns `true` if something was removed.
    pub fn remove_if(&self, user_id: &str, opened_at: Instant) -> bool {
        self.sessions
            .remove_if(user_id, |_, s| s.opened_at == opened_at)
            .is_some()
    }

    /// Queues `packet` for the station of `user_id` without waiting.
    ///
    /// A full queue evicts the session: its entry is removed and the worker
    /// sees its delivery queue close.
    pub fn deliver(&self, user_id: &str, packet: Packet) -> Delivery {
        let (result, opened_at) = match self.sessions.get(user_id) {
            Some(session) => (session.tx.try_send(packet), session.opened_at),
            None => return Delivery::NoSession,
        };
        match result {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => {
                self.remove_if(user_id, opened_at);
                tracing::warn!(user_id = %user_id, "session queue full, evicting");
                Delivery::Evicted
            }
            Err(TrySendError::Closed(_)) => {
                // Worker already gone; its guard removes the entry.
                Delivery::NoSession
            }
        }
    }

    /// Ends every session after the upstream link is lost.
    ///
    /// Each station is told the center is unavailable before its queue
    /// closes. Bumps the link generation so workers know their center-side
    /// state is already gone. Returns how many sessions were closed.
    pub fn close_all(&self) -> usize {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let users: Vec<UserId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let mut closed = 0;
        for user_id in users {
            if let Some((_, session)) = self.sessions.remove(&user_id) {
                let notice = Packet::user_error(&user_id, reason::CENTER_UNAVAILABLE);
                if session.tx.try_send(notice).is_err() {
                    tracing::debug!(user_id = %user_id, "could not queue center-unavailable notice");
                }
                closed += 1;
            }
        }
        closed
    }

    /// Current upstream link generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Returns `true` if `user_id` has a session here.
    #[must_use]
    pub fn contains(&self, user_id: &str) -> bool {
        self.sessions.contains_key(user_id)
    }

    /// Number of open sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns `true` if no sessions are open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

//! [`Center`] owns the global user table and the relay registry. Each relay
//! connection feeds its packets through [`Center::handle_packet`] one at a
//! time; the tables serialize concurrent access per entry, so different
//! connections may call in parallel.

use crate::config::ServerConfig;
use crate::keystore::KeyStore;
use crate::metrics::counters;
use crate::registry::{RelayHandle, Registry};
use crate::users::UserTable;
use samcom_common::types::reason;
use samcom_common::{AuthStatus, Body, LogoutStatus, Outbound, Packet};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Switching center state shared by all relay connections.
#[derive(Debug)]
pub struct Center {
    keys: KeyStore,
    users: UserTable,
    registry: Registry,
    challenge_ttl: Duration,
    max_text_len: usize,
}

impl Center {
    /// Create an engine with the given key store and limits.
    #[must_use]
    pub fn new(keys: KeyStore, challenge_ttl: Duration, max_text_len: usize) -> Self {
        Self {
            keys,
            users: UserTable::new(),
            registry: Registry::new(),
            challenge_ttl,
            max_text_len,
        }
    }

    /// Create an engine from server configuration, applying open provisioning.
    #[must_use]
    pub fn from_config(config: &ServerConfig, keys: KeyStore) -> Self {
        let keys = if config.open_provisioning {
            keys.with_default_secret(config.default_secret.clone())
        } else {
            keys
        };
        Self::new(
            keys,
            Duration::from_secs(config.challenge_ttl),
            config.max_text_len,
        )
    }

    /// Global user table.
    #[must_use]
    pub fn users(&self) -> &UserTable {
        &self.users
    }

    /// Relay registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Registers a relay connection, replacing any previous one with the same id.
    ///
    /// A relay registers with no sessions, so users pinned through a replaced
    /// connection are released here. The orphaned connection's own cleanup
    /// is a no-op once it has been replaced.
    pub fn register(&self, relay_id: &str, tx: mpsc::Sender<Outbound>) -> RelayHandle {
        let handle = RelayHandle {
            relay_id: relay_id.to_string(),
            tx,
            registered_at: Instant::now(),
        };
        if self.registry.insert(handle.clone()).is_some() {
            let released = self.users.release_relay(relay_id);
            counters::users_released_total(released as u64);
            tracing::warn!(relay_id, released, "relay re-registered, previous connection orphaned");
        } else {
            tracing::info!(relay_id, "relay registered");
        }
        handle
    }

    /// Cleans up after a relay connection closed.
    ///
    /// Returns the number of users released, or `None` if the registration
    /// had already been replaced and nothing was touched.
    pub fn relay_lost(&self, handle: &RelayHandle) -> Option<usize> {
        if !self
            .registry
            .remove_if(&handle.relay_id, handle.registered_at)
        {
            tracing::debug!(relay_id = %handle.relay_id, "orphaned relay connection closed");
            return None;
        }
        let released = self.users.release_relay(&handle.relay_id);
        counters::users_released_total(released as u64);
        tracing::info!(relay_id = %handle.relay_id, released, "relay lost");
        Some(released)
    }

    /// Handles one packet from the registered relay `relay_id`.
    ///
    /// Returns the reply for that relay, if any. Forwarded texts are queued
    /// directly on the target relay's connection.
    pub fn handle_packet(&self, relay_id: &str, packet: Packet) -> Option<Packet> {
        counters::packets_total(packet.kind());
        let packet_id = packet.packet_id;
        let reply = match packet.body {
            Body::RelayRegister {} => Some(Packet::relay_register_ack(relay_id)),
            Body::Auth { ref user_id } => Some(self.on_auth(user_id)),
            Body::AuthResponse {
                ref user_id,
                ref challenge,
                ref response,
            } => Some(self.on_auth_response(relay_id, user_id, challenge, response)),
            Body::AuthLogout { ref user_id } => Some(self.on_logout(relay_id, user_id)),
            Body::Text { .. } => self.on_text(relay_id, packet),
            Body::Error { ref error, .. } => {
                tracing::warn!(relay_id, error = %error, "relay reported error");
                None
            }
            Body::RelayRegisterAck { .. }
            | Body::Challenge { .. }
            | Body::AuthResult { .. }
            | Body::LogoutResult { .. }
            | Body::TextAck { .. } => {
                counters::protocol_errors_total();
                tracing::debug!(relay_id, kind = packet.kind(), "unexpected packet direction");
                Some(match packet.recipient() {
                    Some(user_id) => Packet::user_error(user_id, reason::UNSUPPORTED),
                    None => Packet::error(reason::UNSUPPORTED),
                })
            }
        };
        reply.map(|r| r.with_packet_id(packet_id))
    }

    fn on_auth(&self, user_id: &str) -> Packet {
        match self.users.issue_challenge(user_id, &self.keys) {
            Ok(challenge) => {
                tracing::debug!(user_id, "challenge issued");
                Packet::challenge(user_id, &challenge)
            }
            Err(why) => {
                counters::auth_results_total("failed");
                tracing::info!(user_id, reason = why, "auth refused");
                Packet::auth_result(user_id, AuthStatus::Failed, Some(why))
            }
        }
    }

    fn on_auth_response(
        &self,
        relay_id: &str,
        user_id: &str,
        challenge: &str,
        response: &str,
    ) -> Packet {
        match self
            .users
            .verify_response(user_id, relay_id, challenge, response, self.challenge_ttl)
        {
            Ok(()) => {
                counters::auth_results_total("authenticated");
                tracing::info!(user_id, relay_id, "user authenticated");
                Packet::auth_result(user_id, AuthStatus::Authenticated, None)
            }
            Err(why) => {
                counters::auth_results_total("failed");
                tracing::info!(user_id, relay_id, reason = why, "authentication failed");
                Packet::auth_result(user_id, AuthStatus::Failed, Some(why))
            }
        }
    }

    fn on_logout(&self, relay_id: &str, user_id: &str) -> Packet {
        match self.users.logout(user_id, relay_id) {
            Ok(()) => {
                tracing::info!(user_id, relay_id, "user logged out");
                Packet::logout_result(user_id, LogoutStatus::LoggedOut, None)
            }
            Err(why) => {
                tracing::debug!(user_id, relay_id, reason = why, "logout refused");
                Packet::logout_result(user_id, LogoutStatus::Failed, Some(why))
            }
        }
    }

    fn on_text(&self, relay_id: &str, packet: Packet) -> Option<Packet> {
        let Body::Text {
            ref source_user,
            ref target_user,
            ref message,
        } = packet.body
        else {
            return None;
        };
        let (source, target) = (source_user.clone(), target_user.clone());

        let fail = |why: &'static str| {
            counters::routing_failures_total(why);
            tracing::debug!(source = %source, target = %target, reason = why, "text not routed");
            Some(Packet::user_error(&source, why))
        };

        if message.len() > self.max_text_len {
            return fail(reason::MESSAGE_TOO_LARGE);
        }
        if !self.users.is_pinned_to(&source, relay_id) {
            return fail(reason::NOT_AUTHENTICATED_HERE);
        }
        let target_relay = match self.users.route(&target) {
            Ok(r) => r,
            Err(why) => return fail(why),
        };
        let Some(handle) = self.registry.get(&target_relay) else {
            return fail(reason::TARGET_NOT_CONNECTED);
        };

        match handle.tx.try_send(Outbound::Packet(packet)) {
            Ok(()) => {
                counters::texts_routed_total();
                tracing::debug!(source = %source, target = %target, via = %target_relay, "text forwarded");
                Some(Packet::text_ack(&source, &target))
            }
            Err(TrySendError::Full(_)) => fail(reason::TARGET_CONGESTED),
            Err(TrySendError::Closed(_)) => fail(reason::TARGET_NOT_CONNECTED),
        }
    }
}

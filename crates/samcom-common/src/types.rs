//! Core type definitions and protocol constants for samcom.

use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of a user station (MSISDN-like string).
pub type UserId = String;

/// Identifier of a relay node (base message station).
pub type RelayId = String;

/// Current WebSocket subprotocol identifier.
/// Bump this on breaking wire-format changes.
pub const PROTOCOL_VERSION: &str = "samcom.v1";

/// Maximum size of a single WebSocket message accepted by any node.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Status strings carried in `relay_register_ack` and `text_ack` packets.
pub mod status {
    /// The relay registration was accepted.
    pub const REGISTERED: &str = "registered";
    /// The text was handed to the target user's relay.
    pub const FORWARDED: &str = "forwarded";
}

/// Human-readable reasons carried in `error` packets and failed results.
pub mod reason {
    /// A packet other than `relay_register` arrived before registration.
    pub const RELAY_NOT_REGISTERED: &str = "relay not registered";
    /// A `relay_register` carried an empty relay id.
    pub const INVALID_RELAY_ID: &str = "invalid relay id";
    /// The packet's relay stamp does not match the registered relay.
    pub const RELAY_ID_MISMATCH: &str = "relay id mismatch";
    /// The user id is not in the key store and open provisioning is off.
    pub const UNKNOWN_USER: &str = "unknown user";
    /// An `auth_response` arrived with no outstanding challenge.
    pub const NO_PENDING_CHALLENGE: &str = "no pending challenge";
    /// The outstanding challenge is older than the configured lifetime.
    pub const CHALLENGE_EXPIRED: &str = "challenge expired";
    /// The echoed challenge differs from the one that was issued.
    pub const CHALLENGE_MISMATCH: &str = "challenge mismatch";
    /// The keyed response did not match the expected value.
    pub const BAD_RESPONSE: &str = "response mismatch";
    /// Logout for a user that is not authenticated through this relay.
    pub const NOT_AUTHENTICATED_HERE: &str = "user not authenticated through this relay";
    /// The target of a `text` is not authenticated.
    pub const TARGET_NOT_AUTHENTICATED: &str = "target not authenticated";
    /// The target's relay is not connected to the switching center.
    pub const TARGET_NOT_CONNECTED: &str = "target not connected";
    /// The target relay's outbound queue is full.
    pub const TARGET_CONGESTED: &str = "target relay congested";
    /// The text body exceeds the configured maximum.
    pub const MESSAGE_TOO_LARGE: &str = "message too large";
    /// A station sent something other than `auth` before authenticating.
    pub const AUTHENTICATE_FIRST: &str = "authenticate first";
    /// No authentication round trip completed in time.
    pub const AUTH_TIMEOUT: &str = "authentication timed out";
    /// The user already has a session on this relay.
    pub const ALREADY_CONNECTED: &str = "user already connected on this relay";
    /// A session tried to authenticate as a different user.
    pub const USER_MISMATCH: &str = "session belongs to a different user";
    /// The relay lost its switching center link.
    pub const CENTER_UNAVAILABLE: &str = "switching center unavailable";
    /// The peer did not offer the supported WebSocket subprotocol.
    pub const UNSUPPORTED_PROTOCOL: &str = "unsupported protocol version";
    /// The packet type is not accepted in this direction.
    pub const UNSUPPORTED: &str = "unsupported message type";
}

/// Monotonically increasing packet id source, scoped to one sender.
///
/// Ids start at 1 and are advisory: they correlate log lines, never replies.
#[derive(Debug, Default)]
pub struct PacketIdGen {
    next: AtomicU64,
}

impl PacketIdGen {
    /// Creates a generator whose first id is 1.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
        }
    }

    /// Returns the next id.
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_ids_start_at_one_and_increase() {
        let ids = PacketIdGen::new();
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
        assert_eq!(ids.next_id(), 3);
    }
}

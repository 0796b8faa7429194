use crate::keystore::KeyStore;
use dashmap::DashMap;
use samcom_common::crypto;
use samcom_common::types::reason;
use samcom_common::{RelayId, UserId};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct PendingChallenge {
    value: String,
    issued_at: Instant,
}

/// A user's authentication and routing state.
#[derive(Clone)]
pub struct UserRecord {
    secret: String,
    authenticated: bool,
    owning_relay: Option<RelayId>,
    pending: Option<PendingChallenge>,
}

impl std::fmt::Debug for UserRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserRecord")
            .field("authenticated", &self.authenticated)
            .field("owning_relay", &self.owning_relay)
            .field("pending", &self.pending.is_some())
            .finish_non_exhaustive()
    }
}

/// Global user table.
///
/// Every operation runs under the entry's shard lock, so read-modify-write
/// sequences on one user never interleave. Records are created on first
/// `auth` and never deleted, only marked unauthenticated.
#[derive(Debug, Default)]
pub struct UserTable {
    users: DashMap<UserId, UserRecord>,
}

impl UserTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a fresh challenge for `user_id`, replacing any pending one.
    ///
    /// Does not touch the user's authentication state.
    ///
    /// # Errors
    ///
    /// Returns [`reason::UNKNOWN_USER`] if the user has no record and the
    /// key store has no secret for it.
    pub fn issue_challenge(&self, user_id: &str, keys: &KeyStore) -> Result<String, &'static str> {
        let challenge = crypto::generate_challenge();
        let pending = PendingChallenge {
            value: challenge.clone(),
            issued_at: Instant::now(),
        };
        if let Some(mut record) = self.users.get_mut(user_id) {
            record.pending = Some(pending);
            return Ok(challenge);
        }
        let secret = keys.secret_for(user_id).ok_or(reason::UNKNOWN_USER)?;
        self.users
            .entry(user_id.to_string())
            .or_insert_with(|| UserRecord {
                secret,
                authenticated: false,
                owning_relay: None,
                pending: None,
            })
            .pending = Some(pending);
        Ok(challenge)
    }

    /// Checks an `auth_response` and, on success, pins the user to `relay_id`.
    ///
    /// The pending challenge is consumed whatever the outcome. A failed
    /// attempt leaves any existing authentication untouched.
    ///
    /// # Errors
    ///
    /// Returns the failure reason carried back in `auth_result`.
    pub fn verify_response(
        &self,
        user_id: &str,
        relay_id: &str,
        challenge: &str,
        response: &str,
        ttl: Duration,
    ) -> Result<(), &'static str> {
        let mut record = self
            .users
            .get_mut(user_id)
            .ok_or(reason::NO_PENDING_CHALLENGE)?;
        let pending = record.pending.take().ok_or(reason::NO_PENDING_CHALLENGE)?;
        if pending.issued_at.elapsed() >= ttl {
            return Err(reason::CHALLENGE_EXPIRED);
        }
        if !crypto::ct_str_eq(&pending.value, challenge) {
            return Err(reason::CHALLENGE_MISMATCH);
        }
        if !crypto::verify(user_id, &record.secret, &pending.value, response) {
            return Err(reason::BAD_RESPONSE);
        }
        record.authenticated = true;
        record.owning_relay = Some(relay_id.to_string());
        Ok(())
    }

    /// Clears the user's authentication if it is pinned to `relay_id`.
    ///
    /// # Errors
    ///
    /// Returns [`reason::NOT_AUTHENTICATED_HERE`] otherwise.
    pub fn logout(&self, user_id: &str, relay_id: &str) -> Result<(), &'static str> {
        let mut record = self
            .users
            .get_mut(user_id)
            .ok_or(reason::NOT_AUTHENTICATED_HERE)?;
        if !record.authenticated || record.owning_relay.as_deref() != Some(relay_id) {
            return Err(reason::NOT_AUTHENTICATED_HERE);
        }
        record.authenticated = false;
        record.owning_relay = None;
        Ok(())
    }

    /// Returns the relay currently serving `user_id`.
    ///
    /// # Errors
    ///
    /// Returns [`reason::TARGET_NOT_AUTHENTICATED`] if the user is unknown or
    /// not authenticated.
    pub fn route(&self, user_id: &str) -> Result<RelayId, &'static str> {
        self.users
            .get(user_id)
            .filter(|r| r.authenticated)
            .and_then(|r| r.owning_relay.clone())
            .ok_or(reason::TARGET_NOT_AUTHENTICATED)
    }

    /// Returns `true` if `user_id` is authenticated through `relay_id`.
    #[must_use]
    pub fn is_pinned_to(&self, user_id: &str, relay_id: &str) -> bool {
        self.users
            .get(user_id)
            .is_some_and(|r| r.authenticated && r.owning_relay.as_deref() == Some(relay_id))
    }

    /// Unauthenticates every user pinned to `relay_id`. Returns how many.
    pub fn release_relay(&self, relay_id: &str) -> usize {
        let mut released = 0;
        for mut entry in self.users.iter_mut() {
            if entry.owning_relay.as_deref() == Some(relay_id) {
                entry.authenticated = false;
                entry.owning_relay = None;
                released += 1;
            }
        }
        released
    }

    /// Returns `true` if `user_id` is currently authenticated.
    #[must_use]
    pub fn is_authenticated(&self, user_id: &str) -> bool {
        self.users.get(user_id).is_some_and(|r| r.authenticated)
    }

    /// Returns the relay `user_id` is pinned to, if any.
    #[must_use]
    pub fn owning_relay(&self, user_id: &str) -> Option<RelayId> {
        self.users.get(user_id).and_then(|r| r.owning_relay.clone())
    }

    /// Number of known users.
    #[must_use]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Returns `true` if no user has ever tried to authenticate.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

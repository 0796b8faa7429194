//! Out-of-band provisioned user secrets.
//!
//! The key store is a TOML file with a `[users]` table:
//!
//! ```toml
//! [users]
//! "1234567890" = "secretkey123"
//! "0987654321" = "anothersecret"
//! ```
//!
//! Entries can be added or overridden from the environment as
//! `SAMCOM_USERS__<user_id>=<secret>`.

use crate::error::MscError;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

const ENV_PREFIX: &str = "SAMCOM_USERS__";

#[derive(Debug, Default, Deserialize)]
struct KeyFile {
    #[serde(default)]
    users: HashMap<String, String>,
}

/// Read-only map of user id to shared secret, plus the open-provisioning default.
#[derive(Clone, Default)]
pub struct KeyStore {
    users: HashMap<String, String>,
    default_secret: Option<String>,
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("users", &self.users.len())
            .field("open_provisioning", &self.default_secret.is_some())
            .finish()
    }
}

impl KeyStore {
    /// Loads the key store from an optional TOML file and `SAMCOM_USERS__*`
    /// environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`MscError::KeyStore`] if the file is missing or malformed.
    pub fn load(path: Option<&Path>) -> Result<Self, MscError> {
        Self::load_with_env(path, std::env::vars())
    }

    /// As [`KeyStore::load`], with the environment given explicitly.
    ///
    /// User ids in environment keys keep their case; the `config` crate's
    /// environment source would lowercase them.
    ///
    /// # Errors
    ///
    /// Returns [`MscError::KeyStore`] if the file is missing or malformed.
    pub fn load_with_env<I>(path: Option<&Path>, vars: I) -> Result<Self, MscError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        let mut file: KeyFile = builder.build()?.try_deserialize()?;
        for (key, secret) in vars {
            match key.strip_prefix(ENV_PREFIX) {
                Some(user_id) if !user_id.is_empty() => {
                    file.users.insert(user_id.to_string(), secret);
                }
                _ => {}
            }
        }
        tracing::info!(users = file.users.len(), "loaded key store");
        Ok(Self {
            users: file.users,
            default_secret: None,
        })
    }

    /// Builds a key store from explicit pairs.
    #[must_use]
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            users: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            default_secret: None,
        }
    }

    /// Enables open provisioning: unknown users get `secret`.
    #[must_use]
    pub fn with_default_secret(mut self, secret: Option<String>) -> Self {
        self.default_secret = secret;
        self
    }

    /// Returns the secret for `user_id`, falling back to the provisioning default.
    #[must_use]
    pub fn secret_for(&self, user_id: &str) -> Option<String> {
        self.users
            .get(user_id)
            .or(self.default_secret.as_ref())
            .cloned()
    }

    /// Number of explicitly provisioned users.
    #[must_use]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Returns `true` if no user is explicitly provisioned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

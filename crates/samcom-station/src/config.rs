use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// CLI interface for the user station.
#[derive(Parser)]
#[command(name = "samcom-station", about = "samcom user station")]
#[command(version)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to a custom configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Relay node URL override.
    #[arg(long, global = true)]
    pub relay: Option<String>,

    /// Local API listen address override.
    #[arg(long, global = true)]
    pub listen: Option<String>,

    /// User id override.
    #[arg(long, global = true)]
    pub user: Option<String>,

    /// Increase log verbosity (repeat for more detail).
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Write logs to a file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Start the station daemon.
    Start,
    /// Show the daemon's station state.
    Status,
    /// Authenticate through the configured relay.
    Connect,
    /// Send a text message to another user.
    Send {
        /// Target user id.
        to: String,
        /// Message body.
        message: String,
    },
    /// Log out; the station accepts no further sends.
    Logout,
    /// Stream station events as JSON lines.
    Watch,
}

/// A user's shared secret, wiped from memory on drop.
#[derive(Clone, Default, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wraps a secret value.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The secret's text, for computing challenge responses.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Returns `true` if no secret is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Runtime configuration loaded from file, env, and defaults.
#[derive(Debug, Deserialize, Clone)]
pub struct StationConfig {
    /// WebSocket URL of the relay node.
    pub relay: String,
    /// Local API listen address (`tcp://host:port`).
    pub listen: String,
    /// The user this station authenticates as.
    pub user_id: String,
    /// Shared secret provisioned for `user_id`.
    pub secret: Secret,
    /// Seconds allowed for one authentication round trip.
    pub auth_timeout_s: u64,
    /// WebSocket keepalive ping settings.
    pub keepalive: KeepaliveConfig,
}

/// WebSocket keepalive settings.
#[derive(Debug, Deserialize, Clone)]
pub struct KeepaliveConfig {
    /// Interval between keepalive pings, in seconds.
    pub interval_s: u64,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self { interval_s: 30 }
    }
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            relay: "ws://127.0.0.1:6790".to_string(),
            listen: "tcp://127.0.0.1:7790".to_string(),
            user_id: String::new(),
            secret: Secret::default(),
            auth_timeout_s: 10,
            keepalive: KeepaliveConfig::default(),
        }
    }
}

impl StationConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.relay.starts_with("ws://") || self.relay.starts_with("wss://")) {
            return Err(format!(
                "relay URL must start with ws:// or wss://, got: {}",
                self.relay
            ));
        }
        if self.listen.strip_prefix("tcp://").map_or(true, str::is_empty) {
            return Err(format!(
                "listen address must start with tcp://, got: {}",
                self.listen
            ));
        }

        if self.user_id.trim().is_empty() {
            return Err("user_id must not be empty".to_string());
        }
        if self.secret.is_empty() {
            return Err("secret must not be empty".to_string());
        }

        if self.auth_timeout_s == 0 {
            return Err("auth_timeout_s must be greater than 0".to_string());
        }
        if self.auth_timeout_s > 3600 {
            return Err("auth_timeout_s exceeds reasonable limit (3600 seconds)".to_string());
        }
        if self.keepalive.interval_s == 0 {
            return Err("keepalive.interval_s must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Local API socket address without the scheme.
    #[must_use]
    pub fn listen_addr(&self) -> &str {
        self.listen.strip_prefix("tcp://").unwrap_or(&self.listen)
    }
}

/// Loads configuration: defaults, then the TOML file, then
/// `SAMCOM_STATION_*` environment variables.
///
/// Without an explicit path, `<config dir>/samcom/station.toml` is used if it
/// exists.
///
/// # Errors
///
/// Returns an error if the configuration file cannot be read or parsed.
#[allow(clippy::cast_possible_wrap)]
pub fn load_config(path: Option<&Path>) -> Result<StationConfig, config::ConfigError> {
    let defaults = StationConfig::default();
    let mut builder = config::Config::builder()
        .set_default("relay", defaults.relay.as_str())?
        .set_default("listen", defaults.listen.as_str())?
        .set_default("user_id", defaults.user_id.as_str())?
        .set_default("secret", "")?
        .set_default("auth_timeout_s", defaults.auth_timeout_s as i64)?
        .set_default("keepalive.interval_s", defaults.keepalive.interval_s as i64)?;

    let file = path
        .map(Path::to_path_buf)
        .or_else(|| dirs::config_dir().map(|d| d.join("samcom").join("station.toml")));
    if let Some(file) = file.filter(|p| p.exists()) {
        builder = builder.add_source(config::File::from(file));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("SAMCOM_STATION")
            .prefix_separator("_")
            .separator("__"),
    );

    builder.build()?.try_deserialize()
}

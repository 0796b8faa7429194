use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments for the relay node.
#[derive(Parser, Debug, Clone)]
#[command(name = "samcom-bms")]
#[command(about = "samcom base message station")]
#[command(version)]
pub struct Args {
    /// Socket address user stations connect to.
    #[arg(long, default_value = "127.0.0.1:6790", env = "SAMCOM_BMS_LISTEN")]
    pub listen: SocketAddr,
    /// WebSocket URL of the switching center.
    #[arg(long, default_value = "ws://127.0.0.1:6789", env = "SAMCOM_BMS_CENTER")]
    pub center_url: String,
    /// Identity this relay registers under.
    #[arg(long, default_value = "bms_001", env = "SAMCOM_BMS_RELAY_ID")]
    pub relay_id: String,
    /// Maximum concurrent station connections.
    #[arg(long, default_value = "1024", env = "SAMCOM_BMS_MAX_SESSIONS")]
    pub max_sessions: usize,
    /// Seconds a new station has to send `auth`.
    #[arg(long, default_value = "30", env = "SAMCOM_BMS_AUTH_TIMEOUT")]
    pub auth_timeout: u64,
    /// Seconds to wait for `relay_register_ack`.
    #[arg(long, default_value = "10", env = "SAMCOM_BMS_REGISTER_TIMEOUT")]
    pub register_timeout: u64,
    /// Seconds to wait for `logout_result` before closing a logged-out station.
    #[arg(long, default_value = "2", env = "SAMCOM_BMS_LOGOUT_GRACE")]
    pub logout_grace: u64,
    /// Delivery queue depth per station session.
    #[arg(long, default_value = "64", env = "SAMCOM_BMS_SESSION_QUEUE")]
    pub session_queue_capacity: usize,
    /// Depth of the shared queue towards the switching center.
    #[arg(long, default_value = "1024", env = "SAMCOM_BMS_UPSTREAM_QUEUE")]
    pub upstream_queue_capacity: usize,
    /// Interval between WebSocket pings in seconds.
    #[arg(long, default_value = "30", env = "SAMCOM_BMS_PING_INTERVAL")]
    pub ping_interval: u64,
    /// Idle timeout in seconds for both links.
    #[arg(long, default_value = "120", env = "SAMCOM_BMS_IDLE_TIMEOUT")]
    pub idle_timeout: u64,
    /// First reconnect delay in milliseconds.
    #[arg(long, default_value = "500", env = "SAMCOM_BMS_RECONNECT_INITIAL_MS")]
    pub reconnect_initial_ms: u64,
    /// Reconnect delay ceiling in milliseconds.
    #[arg(long, default_value = "30000", env = "SAMCOM_BMS_RECONNECT_MAX_MS")]
    pub reconnect_max_ms: u64,
    /// Reconnect delay multiplier.
    #[arg(long, default_value = "2.0", env = "SAMCOM_BMS_RECONNECT_FACTOR")]
    pub reconnect_factor: f64,
    /// Increase log verbosity (repeat for more detail).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
    /// Write logs to a file instead of stderr.
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// Reconnect schedule for the upstream link.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// First delay in milliseconds.
    pub initial_delay_ms: u64,
    /// Delay ceiling in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier applied after every failed attempt.
    pub backoff_factor: f64,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Socket address user stations connect to.
    pub listen: SocketAddr,
    /// WebSocket URL of the switching center.
    pub center_url: String,
    /// Identity this relay registers under.
    pub relay_id: String,
    /// Maximum concurrent station connections.
    pub max_sessions: usize,
    /// Seconds a new station has to send `auth`.
    pub auth_timeout: u64,
    /// Seconds to wait for `relay_register_ack`.
    pub register_timeout: u64,
    /// Seconds to wait for `logout_result` after forwarding a logout.
    pub logout_grace: u64,
    /// Delivery queue depth per station session.
    pub session_queue_capacity: usize,
    /// Depth of the shared queue towards the switching center.
    pub upstream_queue_capacity: usize,
    /// Interval between WebSocket pings in seconds.
    pub ping_interval: u64,
    /// Idle timeout in seconds for both links.
    pub idle_timeout: u64,
    /// Upstream reconnect schedule.
    pub reconnect: ReconnectConfig,
}

impl RelayConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.relay_id.trim().is_empty() {
            return Err("relay_id must not be empty".to_string());
        }
        if !(self.center_url.starts_with("ws://") || self.center_url.starts_with("wss://")) {
            return Err(format!(
                "center_url must be a ws:// or wss:// URL, got {:?}",
                self.center_url
            ));
        }

        if self.max_sessions == 0 {
            return Err("max_sessions must be greater than 0".to_string());
        }
        if self.max_sessions > 100_000 {
            return Err("max_sessions exceeds reasonable limit (100,000)".to_string());
        }

        for (name, secs) in [
            ("auth_timeout", self.auth_timeout),
            ("register_timeout", self.register_timeout),
            ("logout_grace", self.logout_grace),
        ] {
            if secs == 0 {
                return Err(format!("{name} must be greater than 0"));
            }
            if secs > 3600 {
                return Err(format!("{name} exceeds reasonable limit (3600 seconds)"));
            }
        }

        if self.session_queue_capacity == 0 {
            return Err("session_queue_capacity must be greater than 0".to_string());
        }
        if self.upstream_queue_capacity == 0 {
            return Err("upstream_queue_capacity must be greater than 0".to_string());
        }
        if self.upstream_queue_capacity > 1_000_000 || self.session_queue_capacity > 1_000_000 {
            return Err("queue capacity exceeds reasonable limit (1,000,000)".to_string());
        }

        if self.ping_interval == 0 {
            return Err("ping_interval must be greater than 0".to_string());
        }
        if self.idle_timeout <= self.ping_interval {
            return Err("idle_timeout must be greater than ping_interval".to_string());
        }
        if self.idle_timeout > 86_400 {
            return Err(
                "idle_timeout exceeds reasonable limit (86400 seconds / 1 day)".to_string(),
            );
        }

        let r = &self.reconnect;
        if r.initial_delay_ms == 0 || r.initial_delay_ms > r.max_delay_ms {
            return Err("reconnect delays must satisfy 0 < initial <= max".to_string());
        }
        if !(r.backoff_factor >= 1.0 && r.backoff_factor <= 10.0) {
            return Err("reconnect factor must be between 1.0 and 10.0".to_string());
        }
        Ok(())
    }

    /// Pre-auth window for new station connections.
    #[must_use]
    pub const fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout)
    }

    /// Deadline for the switching center's `relay_register_ack`.
    #[must_use]
    pub const fn register_timeout(&self) -> Duration {
        Duration::from_secs(self.register_timeout)
    }

    /// How long a logged-out session waits for `logout_result`.
    #[must_use]
    pub const fn logout_grace(&self) -> Duration {
        Duration::from_secs(self.logout_grace)
    }
}

impl From<Args> for RelayConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: args.listen,
            center_url: args.center_url,
            relay_id: args.relay_id,
            max_sessions: args.max_sessions,
            auth_timeout: args.auth_timeout,
            register_timeout: args.register_timeout,
            logout_grace: args.logout_grace,
            session_queue_capacity: args.session_queue_capacity,
            upstream_queue_capacity: args.upstream_queue_capacity,
            ping_interval: args.ping_interval,
            idle_timeout: args.idle_timeout,
            reconnect: ReconnectConfig {
                initial_delay_ms: args.reconnect_initial_ms,
                max_delay_ms: args.reconnect_max_ms,
                backoff_factor: args.reconnect_factor,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> RelayConfig {
        RelayConfig::from(Args::parse_from(["samcom-bms"]))
    }

    #[test]
    fn defaults_are_valid() {
        let config = valid();
        assert!(config.validate().is_ok());
        assert_eq!(config.relay_id, "bms_001");
        assert_eq!(config.center_url, "ws://127.0.0.1:6789");
        assert_eq!(config.listen.port(), 6790);
    }

    #[test]
    fn flags_override_defaults() {
        let args = Args::parse_from([
            "samcom-bms",
            "--relay-id",
            "bms_002",
            "--center-url",
            "ws://10.0.0.1:7000",
            "--logout-grace",
            "5",
            "-vv",
        ]);
        assert_eq!(args.verbose, 2);
        let config = RelayConfig::from(args);
        assert_eq!(config.relay_id, "bms_002");
        assert_eq!(config.logout_grace(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_relay_id_fails() {
        let mut config = valid();
        config.relay_id = "  ".to_string();
        assert!(config.validate().unwrap_err().contains("relay_id"));
    }

    #[test]
    fn non_websocket_center_url_fails() {
        let mut config = valid();
        config.center_url = "http://127.0.0.1:6789".to_string();
        assert!(config.validate().unwrap_err().contains("center_url"));
    }

    #[test]
    fn zero_timeouts_fail() {
        let mut config = valid();
        config.auth_timeout = 0;
        assert!(config.validate().unwrap_err().contains("auth_timeout"));

        let mut config = valid();
        config.logout_grace = 0;
        assert!(config.validate().unwrap_err().contains("logout_grace"));
    }

    #[test]
    fn zero_queues_fail() {
        let mut config = valid();
        config.session_queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.upstream_queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn idle_timeout_must_exceed_ping_interval() {
        let mut config = valid();
        config.idle_timeout = config.ping_interval;
        assert!(config.validate().unwrap_err().contains("idle_timeout"));
    }

    #[test]
    fn reconnect_bounds_are_checked() {
        let mut config = valid();
        config.reconnect.initial_delay_ms = 60_000;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.reconnect.backoff_factor = 0.5;
        assert!(config.validate().is_err());
    }
}

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// CLI arguments for the switching center.
#[derive(Parser, Debug, Clone)]
#[command(name = "samcom-msc")]
#[command(about = "samcom switching center")]
#[command(version)]
pub struct Args {
    /// Socket address relays connect to.
    #[arg(long, default_value = "127.0.0.1:6789", env = "SAMCOM_MSC_LISTEN")]
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    #[arg(long, default_value = "127.0.0.1:9090", env = "SAMCOM_MSC_METRICS")]
    pub metrics_addr: SocketAddr,
    /// Maximum concurrent relay connections.
    #[arg(long, default_value = "1024", env = "SAMCOM_MSC_MAX_CONNS")]
    pub max_conns: usize,
    /// Path to the TOML key store (`[users]` table of user id to secret).
    #[arg(long, env = "SAMCOM_MSC_KEYS")]
    pub keys: Option<PathBuf>,
    /// Provision unknown users with the default secret instead of rejecting them.
    #[arg(long, env = "SAMCOM_MSC_OPEN_PROVISIONING")]
    pub open_provisioning: bool,
    /// Secret given to auto-provisioned users.
    #[arg(long, env = "SAMCOM_MSC_DEFAULT_SECRET", hide_env_values = true)]
    pub default_secret: Option<String>,
    /// Seconds an issued challenge stays answerable.
    #[arg(long, default_value = "30", env = "SAMCOM_MSC_CHALLENGE_TTL")]
    pub challenge_ttl: u64,
    /// Outbound queue depth per relay connection.
    #[arg(long, default_value = "256", env = "SAMCOM_MSC_RELAY_QUEUE")]
    pub relay_queue_capacity: usize,
    /// Maximum `text` body length in bytes.
    #[arg(long, default_value = "4096", env = "SAMCOM_MSC_MAX_TEXT")]
    pub max_text_len: usize,
    /// Interval between WebSocket pings in seconds.
    #[arg(long, default_value = "30", env = "SAMCOM_MSC_PING_INTERVAL")]
    pub ping_interval: u64,
    /// Relay connection idle timeout in seconds.
    #[arg(long, default_value = "120", env = "SAMCOM_MSC_IDLE_TIMEOUT")]
    pub idle_timeout: u64,
    /// Increase log verbosity (repeat for more detail).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
    /// Write logs to a file instead of stderr.
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address relays connect to.
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    pub metrics_addr: SocketAddr,
    /// Maximum concurrent relay connections.
    pub max_conns: usize,
    /// Provision unknown users with `default_secret`.
    pub open_provisioning: bool,
    /// Secret given to auto-provisioned users.
    pub default_secret: Option<String>,
    /// Seconds an issued challenge stays answerable.
    pub challenge_ttl: u64,
    /// Outbound queue depth per relay connection.
    pub relay_queue_capacity: usize,
    /// Maximum `text` body length in bytes.
    pub max_text_len: usize,
    /// Interval between WebSocket pings in seconds.
    pub ping_interval: u64,
    /// Relay connection idle timeout in seconds.
    pub idle_timeout: u64,
}

impl ServerConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_conns == 0 {
            return Err("max_conns must be greater than 0".to_string());
        }
        if self.max_conns > 100_000 {
            return Err("max_conns exceeds reasonable limit (100,000)".to_string());
        }

        if self.open_provisioning {
            match self.default_secret.as_deref() {
                None | Some("") => {
                    return Err("open_provisioning requires a non-empty default_secret".to_string())
                }
                Some(_) => {}
            }
        }

        if self.challenge_ttl == 0 {
            return Err("challenge_ttl must be greater than 0".to_string());
        }
        if self.challenge_ttl > 3600 {
            return Err("challenge_ttl exceeds reasonable limit (3600 seconds)".to_string());
        }

        if self.relay_queue_capacity == 0 {
            return Err("relay_queue_capacity must be greater than 0".to_string());
        }
        if self.relay_queue_capacity > 1_000_000 {
            return Err("relay_queue_capacity exceeds reasonable limit (1,000,000)".to_string());
        }

        // Leave headroom for the envelope inside one WebSocket message.
        const MAX_ALLOWED_TEXT: usize = samcom_common::types::MAX_MESSAGE_SIZE / 2;
        if self.max_text_len == 0 {
            return Err("max_text_len must be greater than 0".to_string());
        }
        if self.max_text_len > MAX_ALLOWED_TEXT {
            return Err(format!(
                "max_text_len exceeds maximum allowed ({MAX_ALLOWED_TEXT} bytes)"
            ));
        }

        if self.ping_interval == 0 {
            return Err("ping_interval must be greater than 0".to_string());
        }
        if self.ping_interval > 3600 {
            return Err("ping_interval exceeds reasonable limit (3600 seconds)".to_string());
        }

        if self.idle_timeout <= self.ping_interval {
            return Err("idle_timeout must be greater than ping_interval".to_string());
        }
        if self.idle_timeout > 86_400 {
            return Err(
                "idle_timeout exceeds reasonable limit (86400 seconds / 1 day)".to_string(),
            );
        }
        Ok(())
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: args.listen,
            metrics_addr: args.metrics_addr,
            max_conns: args.max_conns,
            open_provisioning: args.open_provisioning,
            default_secret: args.default_secret,
            challenge_ttl: args.challenge_ttl,
            relay_queue_capacity: args.relay_queue_capacity,
            max_text_len: args.max_text_len,
            ping_interval: args.ping_interval,
            idle_timeout: args.idle_timeout,
        }
    }
}

#![allow(dead_code)]

use samcom_bms::config::{ReconnectConfig, RelayConfig};
use samcom_bms::RelayNode;
use samcom_msc::config::ServerConfig;
use samcom_msc::keystore::KeyStore;
use samcom_msc::server::ServerState;
use samcom_station::config::{Secret, StationConfig};
use samcom_station::{StationEvent, StationHandle};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

pub struct TestNetwork {
    pub center: Arc<ServerState>,
    pub center_shutdown: watch::Sender<bool>,
    relays: Vec<(SocketAddr, watch::Sender<bool>)>,
}

impl TestNetwork {
    /// A center with users A, B and C plus one relay per id in `relay_ids`.
    pub async fn start(relay_ids: &[&str]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = ServerConfig {
            listen: addr,
            metrics_addr: "127.0.0.1:0".parse().unwrap(),
            max_conns: 64,
            open_provisioning: false,
            default_secret: None,
            challenge_ttl: 30,
            relay_queue_capacity: 64,
            max_text_len: 4096,
            ping_interval: 30,
            idle_timeout: 120,
        };
        let keys = KeyStore::from_pairs([("A", "k1"), ("B", "k2"), ("C", "k3")]);
        let center = Arc::new(ServerState::new(config, keys));
        let (center_shutdown, shutdown_rx) = watch::channel(false);
        let server_state = center.clone();
        tokio::spawn(async move {
            if let Err(e) = samcom_msc::run_with_shutdown(listener, server_state, shutdown_rx).await
            {
                eprintln!("center error in test: {e}");
            }
        });

        let mut relays = Vec::new();
        for relay_id in relay_ids {
            relays.push(start_relay(&format!("ws://{addr}"), relay_id).await);
        }
        Self {
            center,
            center_shutdown,
            relays,
        }
    }

    pub fn relay_url(&self, index: usize) -> String {
        format!("ws://{}", self.relays[index].0)
    }

    pub fn stop_relay(&self, index: usize) {
        self.relays[index].1.send(true).unwrap();
    }
}

async fn start_relay(center_url: &str, relay_id: &str) -> (SocketAddr, watch::Sender<bool>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = RelayConfig {
        listen: addr,
        center_url: center_url.to_string(),
        relay_id: relay_id.to_string(),
        max_sessions: 64,
        auth_timeout: 10,
        register_timeout: 5,
        logout_grace: 2,
        session_queue_capacity: 64,
        upstream_queue_capacity: 256,
        ping_interval: 30,
        idle_timeout: 120,
        reconnect: ReconnectConfig {
            initial_delay_ms: 50,
            max_delay_ms: 200,
            backoff_factor: 2.0,
        },
    };

    let node = RelayNode::new(config);
    let state = node.state();
    let (shutdown, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = node.run(listener, shutdown_rx).await {
            eprintln!("relay error in test: {e}");
        }
    });
    assert!(
        wait_until(|| state.is_upstream_ready()).await,
        "relay {relay_id} never registered"
    );
    (addr, shutdown)
}

pub fn station_config(relay_url: &str, user_id: &str, secret: &str) -> StationConfig {
    StationConfig {
        relay: relay_url.to_string(),
        user_id: user_id.to_string(),
        secret: Secret::new(secret),
        auth_timeout_s: 5,
        ..StationConfig::default()
    }
}

/// Next event, failing the test if none arrives within a few seconds.
pub async fn next_event(station: &mut StationHandle) -> StationEvent {
    tokio::time::timeout(Duration::from_secs(5), station.next_event())
        .await
        .expect("timeout waiting for station event")
        .expect("station task stopped")
}

/// Polls `cond` until it holds or a few seconds pass.
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..250 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

#![allow(dead_code)]

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use samcom_bms::config::{ReconnectConfig, RelayConfig};
use samcom_bms::{BmsState, RelayNode};
use samcom_common::crypto;
use samcom_common::transport::{self, ClientStream};
use samcom_common::{Body, Packet};
use samcom_msc::config::ServerConfig;
use samcom_msc::keystore::KeyStore;
use samcom_msc::server::ServerState;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;

pub struct TestCenter {
    pub addr: SocketAddr,
    pub state: Arc<ServerState>,
    pub shutdown: watch::Sender<bool>,
}

impl TestCenter {
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }
}

pub async fn start_center() -> TestCenter {
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
    let state = Arc::new(ServerState::new(config, keys));
    let (shutdown, shutdown_rx) = watch::channel(false);

    let server_state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = samcom_msc::run_with_shutdown(listener, server_state, shutdown_rx).await {
            eprintln!("center error in test: {e}");
        }
    });

    TestCenter {
        addr,
        state,
        shutdown,
    }
}

pub fn relay_config(center_url: &str, relay_id: &str) -> RelayConfig {
    RelayConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
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
    }
}

pub struct TestRelay {
    pub addr: SocketAddr,
    pub state: Arc<BmsState>,
    pub shutdown: watch::Sender<bool>,
}

pub async fn start_relay_with(
    center: &TestCenter,
    relay_id: &str,
    config_fn: impl FnOnce(&mut RelayConfig),
) -> TestRelay {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = relay_config(&center.url(), relay_id);
    config.listen = addr;
    config_fn(&mut config);

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
    TestRelay {
        addr,
        state,
        shutdown,
    }
}

pub async fn start_relay(center: &TestCenter, relay_id: &str) -> TestRelay {
    start_relay_with(center, relay_id, |_| {}).await
}

/// A bare station speaking the station side of the protocol.
pub struct TestStation {
    pub ws_tx: SplitSink<ClientStream, Message>,
    pub ws_rx: SplitStream<ClientStream>,
}

impl TestStation {
    pub async fn connect(relay: &TestRelay) -> Self {
        let ws = transport::connect(&format!("ws://{}", relay.addr))
            .await
            .unwrap();
        let (ws_tx, ws_rx) = ws.split();
        Self { ws_tx, ws_rx }
    }

    pub async fn send(&mut self, packet: Packet) {
        let json = packet.encode().unwrap();
        self.ws_tx.send(Message::Text(json)).await.unwrap();
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws_tx
            .send(Message::Text(text.to_string()))
            .await
            .unwrap();
    }

    pub async fn recv(&mut self) -> Packet {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.ws_rx.next())
                .await
                .expect("timeout waiting for packet")
                .unwrap()
                .unwrap();
            match msg {
                Message::Text(text) => return Packet::parse(&text).unwrap(),
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("expected text packet, got {other:?}"),
            }
        }
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Packet> {
        tokio::time::timeout(timeout, self.recv()).await.ok()
    }

    /// Waits for the relay to close the connection, skipping control frames.
    pub async fn expect_closed(&mut self) {
        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match self.ws_rx.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(other)) => panic!("expected close, got {other:?}"),
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "connection was not closed");
    }

    /// Runs the challenge-response exchange and returns the `auth_result`
    /// (or whatever the relay answered instead of a challenge).
    pub async fn authenticate(&mut self, user_id: &str, secret: &str) -> Packet {
        self.send(Packet::auth(user_id)).await;
        let reply = self.recv().await;
        let Body::Challenge { challenge, .. } = reply.body else {
            return reply;
        };
        let response = crypto::respond(user_id, secret, &challenge);
        self.send(Packet::auth_response(user_id, &challenge, &response))
            .await;
        self.recv().await
    }

    pub async fn close(mut self) {
        let _ = self.ws_tx.send(Message::Close(None)).await;
        let _ = self.ws_tx.close().await;
    }
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

#![allow(dead_code)]

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
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

pub fn test_config(listen: SocketAddr) -> ServerConfig {
    ServerConfig {
        listen,
        metrics_addr: "127.0.0.1:0".parse().unwrap(),
        max_conns: 64,
        open_provisioning: false,
        default_secret: None,
        challenge_ttl: 30,
        relay_queue_capacity: 64,
        max_text_len: 4096,
        ping_interval: 30,
        idle_timeout: 120,
    }
}

pub fn test_keys() -> KeyStore {
    KeyStore::from_pairs([
        ("A", "k1"),
        ("B", "k2"),
        ("1234567890", "secretkey123"),
        ("0987654321", "anothersecret"),
    ])
}

/// A fake relay speaking the relay side of the protocol.
pub struct TestRelay {
    pub relay_id: String,
    pub ws_tx: SplitSink<ClientStream, Message>,
    pub ws_rx: SplitStream<ClientStream>,
}

impl TestRelay {
    /// Connects without registering.
    pub async fn connect_raw(addr: &SocketAddr, relay_id: &str) -> Self {
        let ws = transport::connect(&format!("ws://{addr}")).await.unwrap();
        let (ws_tx, ws_rx) = ws.split();
        Self {
            relay_id: relay_id.to_string(),
            ws_tx,
            ws_rx,
        }
    }

    /// Connects and completes `relay_register`.
    pub async fn connect(addr: &SocketAddr, relay_id: &str) -> Self {
        let mut relay = Self::connect_raw(addr, relay_id).await;
        relay.send_raw(Packet::relay_register(relay_id)).await;
        let ack = relay.recv().await;
        assert_eq!(ack, Packet::relay_register_ack(relay_id), "registration failed");
        relay
    }

    /// Sends a packet exactly as given.
    pub async fn send_raw(&mut self, packet: Packet) {
        let json = packet.encode().unwrap();
        self.ws_tx.send(Message::Text(json)).await.unwrap();
    }

    /// Sends a packet stamped with this relay's id.
    pub async fn send(&mut self, packet: Packet) {
        let stamped = packet.stamped(&self.relay_id);
        self.send_raw(stamped).await;
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

    /// Runs the full challenge-response exchange for `user_id` and returns
    /// the `auth_result`.
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

pub async fn start_server_with(config_fn: impl FnOnce(&mut ServerConfig)) -> (SocketAddr, Arc<ServerState>, watch::Sender<bool>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = test_config(addr);
    config_fn(&mut config);
    let state = Arc::new(ServerState::new(config, test_keys()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let state_clone = state.clone();
    tokio::spawn(async move {
        if let Err(e) = samcom_msc::run_with_shutdown(listener, state_clone, shutdown_rx).await {
            eprintln!("server error in test: {e}");
        }
    });

    (addr, state, shutdown_tx)
}

pub async fn start_server() -> (SocketAddr, Arc<ServerState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(ServerState::new(test_config(addr), test_keys()));

    let state_clone = state.clone();
    tokio::spawn(async move {
        if let Err(e) = samcom_msc::run(listener, state_clone).await {
            eprintln!("server error in test: {e}");
        }
    });

    (addr, state)
}

/// Polls `cond` until it holds or a few seconds pass.
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

use crate::error::MscError;
use crate::metrics::{counters, gauges, histograms};
use crate::registry::RelayHandle;
use crate::server::ServerState;
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use samcom_common::transport::{self, Inbound, Outbound};
use samcom_common::types::reason;
use samcom_common::{Body, Packet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration};
use tokio_tungstenite::WebSocketStream;

type WsRecv = SplitStream<WebSocketStream<TcpStream>>;

/// One relay connection: the registration gate and the link to the engine.
struct RelayLink<'a> {
    state: &'a ServerState,
    out_tx: mpsc::Sender<Outbound>,
    registered: Option<RelayHandle>,
    peer_addr: SocketAddr,
}

impl RelayLink<'_> {
    async fn send(&self, item: impl Into<Outbound>) -> Result<(), MscError> {
        self.out_tx
            .send(item.into())
            .await
            .map_err(|_| MscError::ConnectionClosed)
    }

    /// Returns the reply for one decoded packet, registering the relay if
    /// this is its first `relay_register`.
    fn dispatch(&mut self, packet: Packet) -> Option<Packet> {
        let Some(handle) = &self.registered else {
            return Some(self.register(packet));
        };
        if packet.relay_id.as_deref() != Some(handle.relay_id.as_str()) {
            counters::protocol_errors_total();
            tracing::debug!(
                relay_id = %handle.relay_id,
                stamp = ?packet.relay_id,
                "relay stamp mismatch"
            );
            return Some(reject(&packet, reason::RELAY_ID_MISMATCH));
        }

        let start = Instant::now();
        let reply = self.state.center.handle_packet(&handle.relay_id, packet);
        histograms::packet_handling_seconds(start.elapsed().as_secs_f64());
        reply
    }

    fn register(&mut self, packet: Packet) -> Packet {
        let relay_id = match (&packet.body, packet.relay_id.as_deref()) {
            (Body::RelayRegister {}, Some(id)) if !id.is_empty() => id.to_string(),
            (Body::RelayRegister {}, _) => {
                counters::protocol_errors_total();
                return Packet::error(reason::INVALID_RELAY_ID).with_packet_id(packet.packet_id);
            }
            _ => {
                counters::protocol_errors_total();
                tracing::debug!(peer = %self.peer_addr, kind = packet.kind(), "packet before registration");
                return reject(&packet, reason::RELAY_NOT_REGISTERED);
            }
        };
        counters::packets_total(packet.kind());
        let handle = self.state.center.register(&relay_id, self.out_tx.clone());
        gauges::inc_relays_active();
        self.registered = Some(handle);
        Packet::relay_register_ack(&relay_id).with_packet_id(packet.packet_id)
    }

    async fn run(
        &mut self,
        ws_rx: &mut WsRecv,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), MscError> {
        let config = &self.state.config;
        let mut ping_interval = interval(Duration::from_secs(config.ping_interval));
        let idle_timeout = Duration::from_secs(config.idle_timeout);
        let mut last_activity = Instant::now();

        loop {
            tokio::select! {
                msg = ws_rx.next() => {
                    last_activity = Instant::now();
                    let msg = match msg {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => return Err(MscError::WebSocket(e)),
                        None => return Ok(()),
                    };
                    match transport::classify(msg) {
                        Inbound::Packet(packet) => {
                            if let Some(reply) = self.dispatch(packet) {
                                self.send(reply).await?;
                            }
                        }
                        Inbound::Invalid(e) => {
                            counters::protocol_errors_total();
                            tracing::debug!(peer = %self.peer_addr, error = %e, "invalid packet");
                            self.send(Packet::error(&e.to_string())).await?;
                        }
                        Inbound::Ping(data) => self.send(Outbound::Pong(data)).await?,
                        Inbound::Control => {}
                        Inbound::Close => return Ok(()),
                    }
                }
                _ = ping_interval.tick() => {
                    if last_activity.elapsed() >= idle_timeout {
                        tracing::debug!(peer = %self.peer_addr, "idle timeout reached, closing connection");
                        let _ = self.out_tx.send(Outbound::Close).await;
                        return Err(MscError::IdleTimeout);
                    }
                    self.send(Outbound::Ping).await?;
                }
                _ = shutdown.changed() => {
                    let _ = self.out_tx.send(Outbound::Close).await;
                    return Ok(());
                }
            }
        }
    }
}

/// Error reply for a rejected packet, addressed to the user it speaks for.
fn reject(packet: &Packet, why: &str) -> Packet {
    match packet.originator() {
        Some(user_id) => Packet::user_error(user_id, why),
        None => Packet::error(why),
    }
    .with_packet_id(packet.packet_id)
}

/// Serve one relay connection until it closes.
///
/// # Errors
///
/// Returns the reason the connection ended abnormally.
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), MscError> {
    let (ws_stream, negotiated) = transport::accept(stream).await?;
    let (ws_tx, mut ws_rx) = ws_stream.split();
    let (out_tx, out_rx) = mpsc::channel(state.config.relay_queue_capacity);
    tokio::spawn(transport::write_pump(ws_tx, out_rx));

    if !negotiated {
        tracing::debug!(peer = %peer_addr, "rejecting relay without samcom subprotocol");
        let _ = out_tx
            .send(Packet::error(reason::UNSUPPORTED_PROTOCOL).into())
            .await;
        return Err(MscError::UnsupportedProtocol(
            samcom_common::types::PROTOCOL_VERSION.to_string(),
        ));
    }

    let mut link = RelayLink {
        state: &state,
        out_tx,
        registered: None,
        peer_addr,
    };
    let result = link.run(&mut ws_rx, &mut shutdown).await;

    if let Some(handle) = link.registered.take() {
        state.center.relay_lost(&handle);
        gauges::dec_relays_active();
    }

    result
}

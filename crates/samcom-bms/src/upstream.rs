//! The relay's single link to the switching center.
//!
//! [`maintain`] dials the center, registers, then runs two pumps until the
//! link fails: one stamps and writes packets from the shared upstream queue,
//! the other hands inbound packets to the local session they address. On loss
//! every local session is closed and the link is re-dialed after a jittered,
//! geometrically growing delay.

use crate::config::ReconnectConfig;
use crate::error::BmsError;
use crate::node::{BmsState, UpstreamPacket};
use crate::sessions::Delivery;
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use rand::Rng;
use samcom_common::transport::{self, ClientStream, Inbound, Outbound};
use samcom_common::{Body, Packet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

type WsRecv = SplitStream<ClientStream>;

/// Keeps the upstream link alive until `shutdown` changes.
pub async fn maintain(
    state: Arc<BmsState>,
    mut upstream_rx: mpsc::Receiver<UpstreamPacket>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;

    loop {
        let result = tokio::select! {
            r = connect_and_run(&state, &mut upstream_rx) => r,
            _ = shutdown.changed() => break,
        };

        let was_ready = state.set_upstream_ready(false);
        match result {
            Ok(()) => info!("upstream link closed"),
            Err(e) => warn!(error = %e, center = %state.config.center_url, "upstream link lost"),
        }
        let closed = state.sessions.close_all();
        if closed > 0 {
            info!(sessions = closed, "closed local sessions after upstream loss");
        }
        if was_ready {
            attempt = 0;
        }

        let delay = reconnect_delay(&state.config.reconnect, attempt);
        attempt = attempt.saturating_add(1);
        info!(
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "reconnecting to switching center"
        );
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    state.set_upstream_ready(false);
    state.sessions.close_all();
}

/// Delay before reconnect `attempt` (0-based): `initial * factor^attempt`,
/// capped at the ceiling, then jittered by ±25%.
fn reconnect_delay(config: &ReconnectConfig, attempt: u32) -> Duration {
    // 2^64 ms already exceeds any ceiling; keeps the product finite.
    let exponent = i32::try_from(attempt.min(64)).unwrap_or(64);
    #[allow(clippy::cast_precision_loss)]
    let (initial, ceiling) = (config.initial_delay_ms as f64, config.max_delay_ms as f64);
    let base = (initial * config.backoff_factor.powi(exponent)).min(ceiling);
    let jitter = rand::thread_rng().gen_range(0.75..=1.25);
    Duration::from_secs_f64((base * jitter).max(0.0) / 1000.0)
}

async fn connect_and_run(
    state: &BmsState,
    upstream_rx: &mut mpsc::Receiver<UpstreamPacket>,
) -> Result<(), BmsError> {
    let ws = transport::connect(&state.config.center_url).await?;
    let (ws_tx, mut ws_rx) = ws.split();
    let (out_tx, out_rx) = mpsc::channel(state.config.upstream_queue_capacity);
    tokio::spawn(transport::write_pump(ws_tx, out_rx));

    let link = UpstreamLink { state, out_tx };
    link.register(&mut ws_rx).await?;
    state.set_upstream_ready(true);
    info!(
        relay_id = %state.config.relay_id,
        center = %state.config.center_url,
        "registered with switching center"
    );

    tokio::select! {
        r = link.pump_outbound(upstream_rx) => r,
        r = link.pump_inbound(&mut ws_rx) => r,
    }
}

struct UpstreamLink<'a> {
    state: &'a BmsState,
    out_tx: mpsc::Sender<Outbound>,
}

impl UpstreamLink<'_> {
    async fn send(&self, item: impl Into<Outbound>) -> Result<(), BmsError> {
        self.out_tx
            .send(item.into())
            .await
            .map_err(|_| BmsError::ConnectionClosed)
    }

    async fn register(&self, ws_rx: &mut WsRecv) -> Result<(), BmsError> {
        let relay_id = self.state.config.relay_id.as_str();
        let register =
            Packet::relay_register(relay_id).with_packet_id(Some(self.state.ids.next_id()));
        self.send(register).await?;

        let wait_for_ack = async {
            loop {
                let msg = match ws_rx.next().await {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => return Err(BmsError::WebSocket(e)),
                    None => return Err(BmsError::UpstreamClosed),
                };
                match transport::classify(msg) {
                    Inbound::Packet(packet) => {
                        let kind = packet.kind();
                        match packet.body {
                            Body::RelayRegisterAck { .. }
                                if packet.relay_id.as_deref() == Some(relay_id) =>
                            {
                                return Ok(());
                            }
                            Body::Error { error, .. } => {
                                return Err(BmsError::RegisterRejected(error));
                            }
                            _ => debug!(kind, "ignoring packet before registration ack"),
                        }
                    }
                    Inbound::Invalid(e) => debug!(error = %e, "invalid packet before registration ack"),
                    Inbound::Ping(data) => self.send(Outbound::Pong(data)).await?,
                    Inbound::Control => {}
                    Inbound::Close => return Err(BmsError::UpstreamClosed),
                }
            }
        };

        tokio::time::timeout(self.state.config.register_timeout(), wait_for_ack)
            .await
            .map_err(|_| BmsError::RegisterTimeout)?
    }

    /// Stamps and writes everything queued for the center, dropping packets
    /// from sessions an earlier link loss already tore down.
    async fn pump_outbound(
        &self,
        upstream_rx: &mut mpsc::Receiver<UpstreamPacket>,
    ) -> Result<(), BmsError> {
        let relay_id = self.state.config.relay_id.as_str();
        while let Some(UpstreamPacket { generation, packet }) = upstream_rx.recv().await {
            if generation != self.state.sessions.generation() {
                debug!(kind = packet.kind(), user_id = ?packet.originator(), "dropping packet from a lost link");
                continue;
            }
            debug!(kind = packet.kind(), user_id = ?packet.originator(), "forwarding upstream");
            self.send(packet.stamped(relay_id)).await?;
        }
        Ok(())
    }

    async fn pump_inbound(&self, ws_rx: &mut WsRecv) -> Result<(), BmsError> {
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
                        Some(Err(e)) => return Err(BmsError::WebSocket(e)),
                        None => return Err(BmsError::UpstreamClosed),
                    };
                    match transport::classify(msg) {
                        Inbound::Packet(packet) => self.route(packet),
                        Inbound::Invalid(e) => warn!(error = %e, "invalid packet from switching center"),
                        Inbound::Ping(data) => self.send(Outbound::Pong(data)).await?,
                        Inbound::Control => {}
                        Inbound::Close => return Err(BmsError::UpstreamClosed),
                    }
                }
                _ = ping_interval.tick() => {
                    if last_activity.elapsed() >= idle_timeout {
                        debug!("upstream idle timeout reached");
                        let _ = self.out_tx.send(Outbound::Close).await;
                        return Err(BmsError::IdleTimeout);
                    }
                    self.send(Outbound::Ping).await?;
                }
            }
        }
    }

    /// Hands one center packet to the session it addresses.
    fn route(&self, mut packet: Packet) {
        match &packet.body {
            Body::RelayRegisterAck { .. } => {
                debug!("duplicate registration ack");
                return;
            }
            Body::Error {
                error,
                user_id: None,
            } => {
                warn!(error = %error, "switching center reported an error");
                return;
            }
            _ => {}
        }
        let Some(user_id) = packet.recipient().map(str::to_string) else {
            debug!(kind = packet.kind(), "packet has no recipient, discarding");
            return;
        };

        packet.relay_id = None;
        let kind = packet.kind();
        match self.state.sessions.deliver(&user_id, packet) {
            Delivery::Queued => debug!(user_id = %user_id, kind, "delivered to session"),
            Delivery::NoSession => {
                debug!(user_id = %user_id, kind, "no local session, discarding");
            }
            Delivery::Evicted => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Args, RelayConfig};
    use crate::node::RelayNode;
    use clap::Parser;

    fn schedule(initial_delay_ms: u64, max_delay_ms: u64, backoff_factor: f64) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay_ms,
            max_delay_ms,
            backoff_factor,
        }
    }

    #[test]
    fn first_attempt_is_jittered_initial_delay() {
        let config = schedule(100, 5000, 2.0);
        for _ in 0..20 {
            let delay = reconnect_delay(&config, 0);
            assert!(delay >= Duration::from_millis(75) && delay <= Duration::from_millis(125));
        }
    }

    #[test]
    fn delays_grow_until_the_ceiling() {
        let config = schedule(100, 800, 2.0);
        let third = reconnect_delay(&config, 2);
        assert!(third >= Duration::from_millis(300) && third <= Duration::from_millis(500));
        for attempt in [3, 10, 1000, u32::MAX] {
            let delay = reconnect_delay(&config, attempt);
            assert!(
                delay >= Duration::from_millis(600) && delay <= Duration::from_millis(1000),
                "attempt {attempt}: {delay:?}"
            );
        }
    }

    #[test]
    fn zero_initial_delay_stays_zero() {
        let config = schedule(0, 800, 2.0);
        assert_eq!(reconnect_delay(&config, u32::MAX), Duration::ZERO);
    }

    #[tokio::test]
    async fn packets_from_a_lost_link_are_not_flushed() {
        let node = RelayNode::new(RelayConfig::from(Args::parse_from([
            "samcom-bms",
            "--relay-id",
            "r1",
        ])));
        let state = node.state();
        let stale = state.sessions.generation();
        state.sessions.close_all();
        let current = state.sessions.generation();

        let (queue_tx, mut queue_rx) = mpsc::channel(4);
        queue_tx
            .send(UpstreamPacket {
                generation: stale,
                packet: Packet::text("A", "B", "from the old link"),
            })
            .await
            .unwrap();
        queue_tx
            .send(UpstreamPacket {
                generation: current,
                packet: Packet::auth("C"),
            })
            .await
            .unwrap();
        drop(queue_tx);

        let (out_tx, mut out_rx) = mpsc::channel(4);
        let link = UpstreamLink {
            state: &state,
            out_tx,
        };
        link.pump_outbound(&mut queue_rx).await.unwrap();
        drop(link);

        match out_rx.recv().await {
            Some(Outbound::Packet(packet)) => assert_eq!(packet, Packet::auth("C").stamped("r1")),
            other => panic!("expected the current packet, got {other:?}"),
        }
        assert!(out_rx.recv().await.is_none());
    }
}

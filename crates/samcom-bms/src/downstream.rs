//! Station-facing side of the relay.
//!
//! A new connection sits in a pre-auth phase until it sends `auth`; that
//! opens a local session and forwards the `auth` upstream. From then on the
//! session worker owns the connection: it writes whatever the upstream link
//! queues for this user and forwards the station's own packets, rewritten to
//! speak for the session's user only.

use crate::error::BmsError;
use crate::node::{BmsState, UpstreamPacket};
use crate::sessions::SessionTicket;
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use samcom_common::packet::{PacketError, TYPE_AUTH};
use samcom_common::transport::{self, Inbound, Outbound};
use samcom_common::types::{reason, PROTOCOL_VERSION};
use samcom_common::{Body, Packet, UserId};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info};

type WsRecv = SplitStream<WebSocketStream<TcpStream>>;

/// Serve one station connection until it closes.
///
/// # Errors
///
/// Returns the reason the connection ended abnormally.
pub async fn handle_station(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<BmsState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), BmsError> {
    let (ws_stream, negotiated) = transport::accept(stream).await?;
    let (ws_tx, mut ws_rx) = ws_stream.split();
    let (out_tx, out_rx) = mpsc::channel(state.config.session_queue_capacity);
    tokio::spawn(transport::write_pump(ws_tx, out_rx));

    let conn = StationConn {
        state: &state,
        out_tx,
        peer_addr,
    };
    if !negotiated {
        debug!(peer = %peer_addr, "rejecting station without samcom subprotocol");
        let _ = conn.send(Packet::error(reason::UNSUPPORTED_PROTOCOL)).await;
        return Err(BmsError::UnsupportedProtocol(PROTOCOL_VERSION.to_string()));
    }

    let opened = tokio::select! {
        r = tokio::time::timeout(state.config.auth_timeout(), conn.await_auth(&mut ws_rx)) => match r {
            Ok(r) => r?,
            Err(_) => {
                debug!(peer = %peer_addr, "no auth before timeout");
                let _ = conn.send(Packet::error(reason::AUTH_TIMEOUT)).await;
                conn.close().await;
                return Err(BmsError::AuthTimeout);
            }
        },
        _ = shutdown.changed() => {
            conn.close().await;
            return Ok(());
        }
    };
    let Some(session) = opened else {
        return Ok(());
    };
    conn.serve(session, &mut ws_rx, &mut shutdown).await
}

/// A session that has passed the pre-auth phase.
struct OpenSession {
    guard: SessionGuard,
    delivery_rx: mpsc::Receiver<Packet>,
}

/// Exactly-once session cleanup.
///
/// Dropping the guard removes its own table entry and, unless the station's
/// logout was already forwarded or the upstream link has since been replaced,
/// tells the center the user is gone.
struct SessionGuard {
    state: Arc<BmsState>,
    user_id: UserId,
    ticket: SessionTicket,
    logout_forwarded: bool,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let removed = self
            .state
            .sessions
            .remove_if(&self.user_id, self.ticket.opened_at);
        debug!(user_id = %self.user_id, removed, "session closed");

        if self.logout_forwarded || self.state.sessions.generation() != self.ticket.generation {
            return;
        }
        let logout = UpstreamPacket {
            generation: self.ticket.generation,
            packet: Packet::auth_logout(&self.user_id)
                .with_packet_id(Some(self.state.ids.next_id())),
        };
        match self.state.upstream_tx.try_send(logout) {
            Ok(()) => {}
            Err(TrySendError::Full(logout)) => {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let tx = self.state.upstream_tx.clone();
                    handle.spawn(async move {
                        let _ = tx.send(logout).await;
                    });
                }
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

struct StationConn<'a> {
    state: &'a Arc<BmsState>,
    out_tx: mpsc::Sender<Outbound>,
    peer_addr: SocketAddr,
}

impl StationConn<'_> {
    async fn send(&self, item: impl Into<Outbound>) -> Result<(), BmsError> {
        self.out_tx
            .send(item.into())
            .await
            .map_err(|_| BmsError::ConnectionClosed)
    }

    async fn close(&self) {
        let _ = self.out_tx.send(Outbound::Close).await;
    }

    async fn forward(&self, ticket: SessionTicket, packet: Packet) -> Result<(), BmsError> {
        let generation = ticket.generation;
        self.state
            .upstream_tx
            .send(UpstreamPacket { generation, packet })
            .await
            .map_err(|_| BmsError::ConnectionClosed)
    }

    /// Reads until the station sends a usable `auth`. Returns `None` if the
    /// station leaves first.
    async fn await_auth(&self, ws_rx: &mut WsRecv) -> Result<Option<OpenSession>, BmsError> {
        loop {
            let msg = match ws_rx.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return Err(BmsError::WebSocket(e)),
                None => return Ok(None),
            };
            let packet = match transport::classify(msg) {
                Inbound::Packet(packet) => packet,
                Inbound::Invalid(e) => {
                    debug!(peer = %self.peer_addr, error = %e, "invalid packet");
                    self.send(Packet::error(&e.to_string())).await?;
                    continue;
                }
                Inbound::Ping(data) => {
                    self.send(Outbound::Pong(data)).await?;
                    continue;
                }
                Inbound::Control => continue,
                Inbound::Close => return Ok(None),
            };

            let user_id = match &packet.body {
                Body::Auth { user_id } if !user_id.trim().is_empty() => user_id.clone(),
                Body::Auth { .. } => {
                    let e = PacketError::MissingField {
                        kind: TYPE_AUTH,
                        field: "user_id",
                    };
                    self.send(Packet::error(&e.to_string()).with_packet_id(packet.packet_id))
                        .await?;
                    continue;
                }
                _ => {
                    debug!(peer = %self.peer_addr, kind = packet.kind(), "packet before auth");
                    self.send(
                        Packet::error(reason::AUTHENTICATE_FIRST).with_packet_id(packet.packet_id),
                    )
                    .await?;
                    continue;
                }
            };

            if !self.state.is_upstream_ready() {
                self.send(
                    Packet::user_error(&user_id, reason::CENTER_UNAVAILABLE)
                        .with_packet_id(packet.packet_id),
                )
                .await?;
                continue;
            }

            let (delivery_tx, delivery_rx) =
                mpsc::channel(self.state.config.session_queue_capacity);
            let Some(ticket) = self.state.sessions.try_insert(&user_id, delivery_tx) else {
                debug!(user_id = %user_id, peer = %self.peer_addr, "duplicate session refused");
                self.send(
                    Packet::user_error(&user_id, reason::ALREADY_CONNECTED)
                        .with_packet_id(packet.packet_id),
                )
                .await?;
                continue;
            };
            let guard = SessionGuard {
                state: Arc::clone(self.state),
                user_id: user_id.clone(),
                ticket,
                logout_forwarded: false,
            };
            info!(user_id = %user_id, peer = %self.peer_addr, "session opened");

            let mut auth = packet;
            auth.relay_id = None;
            self.forward(ticket, auth).await?;
            return Ok(Some(OpenSession { guard, delivery_rx }));
        }
    }

    /// The per-session worker.
    async fn serve(
        &self,
        session: OpenSession,
        ws_rx: &mut WsRecv,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), BmsError> {
        let OpenSession {
            mut guard,
            mut delivery_rx,
        } = session;
        let config = &self.state.config;
        let mut ping_interval = interval(Duration::from_secs(config.ping_interval));
        let idle_timeout = Duration::from_secs(config.idle_timeout);
        let mut last_activity = Instant::now();
        let mut logout_deadline: Option<tokio::time::Instant> = None;

        loop {
            tokio::select! {
                delivered = delivery_rx.recv() => {
                    let Some(packet) = delivered else {
                        debug!(user_id = %guard.user_id, "session closed by relay");
                        self.close().await;
                        return Ok(());
                    };
                    let finished = logout_deadline.is_some()
                        && matches!(packet.body, Body::LogoutResult { .. });
                    self.send(packet).await?;
                    if finished {
                        info!(user_id = %guard.user_id, "station logged out");
                        self.close().await;
                        return Ok(());
                    }
                }
                msg = ws_rx.next() => {
                    last_activity = Instant::now();
                    let msg = match msg {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => return Err(BmsError::WebSocket(e)),
                        None => return Ok(()),
                    };
                    match transport::classify(msg) {
                        Inbound::Packet(packet) => {
                            if self.on_station_packet(&mut guard, packet).await? {
                                logout_deadline =
                                    Some(tokio::time::Instant::now() + config.logout_grace());
                            }
                        }
                        Inbound::Invalid(e) => {
                            debug!(user_id = %guard.user_id, error = %e, "invalid packet");
                            self.send(Packet::error(&e.to_string())).await?;
                        }
                        Inbound::Ping(data) => self.send(Outbound::Pong(data)).await?,
                        Inbound::Control => {}
                        Inbound::Close => return Ok(()),
                    }
                }
                () = tokio::time::sleep_until(logout_deadline.unwrap_or_else(tokio::time::Instant::now)),
                    if logout_deadline.is_some() =>
                {
                    debug!(user_id = %guard.user_id, "no logout_result within grace period");
                    self.close().await;
                    return Ok(());
                }
                _ = ping_interval.tick() => {
                    if last_activity.elapsed() >= idle_timeout {
                        debug!(user_id = %guard.user_id, "idle timeout reached, closing session");
                        self.close().await;
                        return Err(BmsError::IdleTimeout);
                    }
                    self.send(Outbound::Ping).await?;
                }
                _ = shutdown.changed() => {
                    self.close().await;
                    return Ok(());
                }
            }
        }
    }

    /// Rewrites one station packet to speak for the session's user and
    /// forwards it. Returns `true` if it was the station's logout.
    async fn on_station_packet(
        &self,
        guard: &mut SessionGuard,
        mut packet: Packet,
    ) -> Result<bool, BmsError> {
        if guard.logout_forwarded {
            debug!(user_id = %guard.user_id, kind = packet.kind(), "ignoring packet after logout");
            return Ok(false);
        }
        let user = guard.user_id.clone();

        match &mut packet.body {
            Body::Auth { user_id } => {
                if *user_id != user {
                    self.send(
                        Packet::user_error(&user, reason::USER_MISMATCH)
                            .with_packet_id(packet.packet_id),
                    )
                    .await?;
                    return Ok(false);
                }
            }
            Body::AuthResponse { user_id, .. } | Body::AuthLogout { user_id } => {
                user_id.clone_from(&user);
            }
            Body::Text { source_user, .. } => source_user.clone_from(&user),
            _ => {
                self.send(
                    Packet::user_error(&user, reason::UNSUPPORTED).with_packet_id(packet.packet_id),
                )
                .await?;
                return Ok(false);
            }
        }

        let logout = matches!(packet.body, Body::AuthLogout { .. });
        packet.relay_id = None;
        self.forward(guard.ticket, packet).await?;
        if logout {
            guard.logout_forwarded = true;
        }
        Ok(logout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Args, RelayConfig};
    use crate::node::RelayNode;
    use clap::Parser;

    fn node() -> RelayNode {
        RelayNode::new(RelayConfig::from(Args::parse_from(["samcom-bms"])))
    }

    fn guard(state: &Arc<BmsState>, user_id: &str) -> (SessionGuard, mpsc::Receiver<Packet>) {
        let (tx, rx) = mpsc::channel(4);
        let ticket = state.sessions.try_insert(user_id, tx).unwrap();
        let guard = SessionGuard {
            state: Arc::clone(state),
            user_id: user_id.to_string(),
            ticket,
            logout_forwarded: false,
        };
        (guard, rx)
    }

    #[tokio::test]
    async fn dropped_session_synthesizes_one_logout() {
        let mut node = node();
        let state = node.state();
        let (guard, _rx) = guard(&state, "A");

        drop(guard);
        assert!(!state.sessions.contains("A"));
        let logout = node.upstream_rx.try_recv().unwrap();
        assert_eq!(logout.packet, Packet::auth_logout("A").with_packet_id(Some(1)));
        assert_eq!(logout.generation, state.sessions.generation());
        assert!(node.upstream_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn forwarded_logout_is_not_repeated() {
        let mut node = node();
        let state = node.state();
        let (mut guard, _rx) = guard(&state, "A");
        guard.logout_forwarded = true;

        drop(guard);
        assert!(!state.sessions.contains("A"));
        assert!(node.upstream_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn sessions_from_a_lost_link_stay_quiet() {
        let mut node = node();
        let state = node.state();
        let (guard, _rx) = guard(&state, "A");

        state.sessions.close_all();
        drop(guard);
        assert!(node.upstream_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn evicted_session_still_logs_out() {
        let mut node = node();
        let state = node.state();
        let (tx, _rx) = mpsc::channel(1);
        let ticket = state.sessions.try_insert("A", tx).unwrap();
        let guard = SessionGuard {
            state: Arc::clone(&state),
            user_id: "A".to_string(),
            ticket,
            logout_forwarded: false,
        };

        state.sessions.deliver("A", Packet::auth("A"));
        state.sessions.deliver("A", Packet::auth("A"));
        assert!(!state.sessions.contains("A"));

        drop(guard);
        let logout = node.upstream_rx.try_recv().unwrap().packet;
        assert!(matches!(logout.body, Body::AuthLogout { ref user_id } if user_id == "A"));
    }
}

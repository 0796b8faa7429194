//! WebSocket plumbing shared by every node.
//!
//! Each connection's write half is owned by a [`write_pump`] task fed through
//! an mpsc channel, so the read loop, timers and other connections never wait
//! on a slow socket. [`classify`] turns raw messages into protocol events.

use crate::packet::{Packet, PacketError};
use crate::types::{MAX_MESSAGE_SIZE, PROTOCOL_VERSION};
use futures_util::{Sink, SinkExt};
use std::fmt::Display;
use std::sync::{Arc, OnceLock};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

const SUBPROTOCOL_HEADER: &str = "sec-websocket-protocol";

/// A dialed connection.
pub type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Items a connection task can hand to its writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A packet, written as one JSON text message.
    Packet(Packet),
    /// A liveness probe.
    Ping,
    /// Reply to a peer's ping.
    Pong(Vec<u8>),
    /// Send a close frame and stop writing.
    Close,
}

impl From<Packet> for Outbound {
    fn from(packet: Packet) -> Self {
        Self::Packet(packet)
    }
}

/// What a single inbound WebSocket message means to the protocol layer.
#[derive(Debug)]
pub enum Inbound {
    /// A well-formed packet.
    Packet(Packet),
    /// A text or binary message that is not a valid packet.
    Invalid(PacketError),
    /// Peer ping carrying its payload, to be answered with a pong.
    Ping(Vec<u8>),
    /// Pongs and raw frames; only count as activity.
    Control,
    /// Peer closed the connection.
    Close,
}

/// Classifies one inbound WebSocket message.
#[must_use]
pub fn classify(msg: Message) -> Inbound {
    match msg {
        Message::Text(text) => match Packet::parse(&text) {
            Ok(packet) => Inbound::Packet(packet),
            Err(e) => Inbound::Invalid(e),
        },
        Message::Binary(_) => Inbound::Invalid(PacketError::Malformed(
            "binary messages are not accepted".to_string(),
        )),
        Message::Ping(data) => Inbound::Ping(data),
        Message::Pong(_) | Message::Frame(_) => Inbound::Control,
        Message::Close(_) => Inbound::Close,
    }
}

/// WebSocket limits applied to every accepted or dialed connection.
#[must_use]
pub fn ws_config() -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(MAX_MESSAGE_SIZE),
        max_frame_size: Some(MAX_MESSAGE_SIZE),
        ..WebSocketConfig::default()
    }
}

/// Accepts a WebSocket handshake, negotiating the samcom subprotocol.
///
/// Returns the stream and whether the peer offered [`PROTOCOL_VERSION`].
/// Callers decide what to do with peers that did not.
///
/// # Errors
///
/// Returns the handshake error if the upgrade fails.
pub async fn accept(
    stream: TcpStream,
) -> Result<(WebSocketStream<TcpStream>, bool), tokio_tungstenite::tungstenite::Error> {
    let negotiated = Arc::new(OnceLock::new());
    let cell = negotiated.clone();
    let ws = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        move |req: &Request, mut resp: Response| {
            let offered = req
                .headers()
                .get(SUBPROTOCOL_HEADER)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|list| list.split(',').map(str::trim).any(|p| p == PROTOCOL_VERSION));
            if offered {
                resp.headers_mut().insert(
                    SUBPROTOCOL_HEADER,
                    HeaderValue::from_static(PROTOCOL_VERSION),
                );
            }
            let _ = cell.set(offered);
            Ok(resp)
        },
        Some(ws_config()),
    )
    .await?;
    Ok((ws, negotiated.get().copied().unwrap_or(false)))
}

/// Dials `url`, offering the samcom subprotocol.
///
/// # Errors
///
/// Returns the connect or handshake error.
pub async fn connect(url: &str) -> Result<ClientStream, tokio_tungstenite::tungstenite::Error> {
    let mut req = url.into_client_request()?;
    req.headers_mut().insert(
        SUBPROTOCOL_HEADER,
        HeaderValue::from_static(PROTOCOL_VERSION),
    );
    let (ws, _) =
        tokio_tungstenite::connect_async_with_config(req, Some(ws_config()), false).await?;
    Ok(ws)
}

/// Drains `rx` into `sink` until the channel closes, a write fails or an
/// [`Outbound::Close`] is written.
///
/// A closed channel also sends a close frame, so dropping every sender is a
/// clean way to hang up.
pub async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<Outbound>)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    while let Some(item) = rx.recv().await {
        let msg = match item {
            Outbound::Packet(packet) => match packet.encode() {
                Ok(json) => Message::Text(json),
                Err(e) => {
                    tracing::warn!(kind = packet.kind(), error = %e, "dropping unencodable packet");
                    continue;
                }
            },
            Outbound::Ping => Message::Ping(Vec::new()),
            Outbound::Pong(data) => Message::Pong(data),
            Outbound::Close => break,
        };
        if let Err(e) = sink.send(msg).await {
            tracing::debug!(error = %e, "websocket write failed");
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}

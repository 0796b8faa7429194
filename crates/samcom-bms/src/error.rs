use thiserror::Error;

/// Errors that can occur during relay node operation.
#[derive(Error, Debug)]
pub enum BmsError {
    /// The peer did not offer the supported WebSocket subprotocol.
    #[error("unsupported protocol version: {0:?}")]
    UnsupportedProtocol(String),
    /// The switching center did not acknowledge `relay_register` in time.
    #[error("registration timed out")]
    RegisterTimeout,
    /// The switching center refused `relay_register`.
    #[error("registration rejected: {0}")]
    RegisterRejected(String),
    /// The switching center closed the upstream link.
    #[error("upstream closed")]
    UpstreamClosed,
    /// A station did not authenticate within the pre-auth window.
    #[error("authentication timed out")]
    AuthTimeout,
    /// The peer sent nothing within the idle timeout.
    #[error("idle timeout")]
    IdleTimeout,
    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The connection's writer has gone away.
    #[error("connection closed")]
    ConnectionClosed,
}

use thiserror::Error;

/// Errors that can occur during switching center operation.
#[derive(Error, Debug)]
pub enum MscError {
    /// The relay did not offer the supported WebSocket subprotocol.
    #[error("unsupported protocol version: {0:?}")]
    UnsupportedProtocol(String),
    /// The relay sent nothing within the idle timeout.
    #[error("idle timeout")]
    IdleTimeout,
    /// The key store could not be loaded.
    #[error("key store error: {0}")]
    KeyStore(#[from] config::ConfigError),
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

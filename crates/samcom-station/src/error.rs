use thiserror::Error;

/// Errors surfaced by the user station and its local API.
#[derive(Error, Debug)]
pub enum StationError {
    /// The station task has stopped.
    #[error("station is not running")]
    Stopped,
    /// The station answered an action with a failure reason.
    #[error("{0}")]
    Rejected(String),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A local API line could not be encoded or decoded.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

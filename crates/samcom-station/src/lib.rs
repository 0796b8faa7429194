//! samcom user station: an authentication state machine driven by an action
//! queue, with a line-delimited JSON API for local tools.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// CLI parsing and TOML configuration.
pub mod config;
/// Station error type.
pub mod error;
/// Line-delimited JSON API over TCP.
pub mod local_api;
pub mod station;

pub use error::StationError;
pub use station::{StationClient, StationEvent, StationHandle, StationState, UserStation};

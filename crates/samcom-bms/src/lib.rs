//! samcom base message station: multiplexes many user station sessions onto
//! a single link to the switching center.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// CLI argument parsing and relay configuration.
pub mod config;
mod downstream;
/// Error types for relay node operations.
pub mod error;
/// Shared state and the station accept loop.
pub mod node;
pub mod sessions;
pub mod upstream;

pub use node::{BmsState, RelayNode};

//! samcom switching center: relay registry, challenge-response
//! authentication and user-to-relay message routing.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod center;
/// CLI argument parsing and server configuration.
pub mod config;
mod connection;
/// Error types for switching center operations.
pub mod error;
pub mod keystore;
pub mod metrics;
/// Relay id to connection table.
pub mod registry;
/// Accept loop and shared server state.
pub mod server;
/// Global user authentication and routing table.
pub mod users;

pub use server::{run, run_with_shutdown, ServerState};

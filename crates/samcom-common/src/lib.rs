//! Common types and utilities shared by every samcom node.
//!
//! This crate provides:
//! - JSON wire packets and their decoder ([`packet`])
//! - The challenge-response primitive ([`crypto`])
//! - WebSocket writer pump and message classification ([`transport`])
//! - Protocol constants and packet ids ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod crypto;
pub mod packet;
pub mod transport;
pub mod types;

pub use packet::{AuthStatus, Body, LogoutStatus, Packet, PacketError};
pub use transport::{Inbound, Outbound};
pub use types::{PacketIdGen, RelayId, UserId};

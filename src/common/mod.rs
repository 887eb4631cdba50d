//! Common types and abstractions
//!
//! This module defines the core types used throughout the application:
//! - Packet: parsed view over a raw IP packet
//! - TunnelPacket: the (payload, protocol) pair the device moves
//! - Endpoint: destination address representation
//! - Error: unified error types

mod endpoint;
mod packet;

pub use endpoint::Endpoint;
pub use packet::{Packet, TunnelPacket};

// Re-export error types from crate root
pub use crate::error::{Error, Result};

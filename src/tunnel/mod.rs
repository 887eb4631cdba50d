//! Tunnel layer: device abstraction and the orchestrating engine

mod device;
mod engine;
#[cfg(unix)]
mod fd;

pub use crate::common::TunnelPacket;
pub use device::{ChannelDevice, ChannelHost, TunnelDevice};
pub use engine::{TunnelEngine, TunnelState};
#[cfg(unix)]
pub use fd::FdDevice;

//! Tunium - tunnel-side traffic interceptor
//!
//! # Architecture (Layered Pipeline)
//!
//! ```text
//! Tunnel device (host-owned fd or in-memory channel)
//! → Packet Parser
//! → Classifier (DNS override, then rule engine)
//! → Direct write-back | SOCKS5 Proxy Forwarder | Reject
//! → Reply pump (relay bytes back into the tunnel)
//! ```
//!
//! ## Core Principles
//!
//! - The packet loop never waits on network IO
//! - Rule matching is pure: no IO, immutable snapshots
//! - One connection per destination, queued while handshaking
//! - All traffic counters flow through a single ledger task
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Core types: Packet, TunnelPacket, Endpoint
//! ├── router/          # Rule engine: ordered substring rules
//! ├── dns/             # Resolver: parallel fan-out, TTL cache
//! ├── proxy/           # SOCKS5 forwarder and connection table
//! ├── stats/           # Traffic accountant and formatting
//! └── tunnel/          # Device abstraction and the engine
//! ```

// Core types
pub mod common;
pub mod error;

// Layered architecture
pub mod dns;
pub mod proxy;
pub mod router;
pub mod stats;
pub mod tunnel;

// Supporting modules
pub mod config;

// Re-exports for convenience
pub use common::{Endpoint, Packet, TunnelPacket};
pub use config::Config;
pub use error::{Error, Result};

// Architecture re-exports
pub use dns::Resolver;
pub use proxy::ProxyForwarder;
pub use router::{Rule, RuleAction, RuleEngine};
pub use stats::{TrafficAccountant, TrafficStats};
pub use tunnel::{ChannelDevice, ChannelHost, TunnelDevice, TunnelEngine, TunnelState};

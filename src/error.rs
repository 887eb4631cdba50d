//! Error types for Tunium

use thiserror::Error;

/// Main error type for Tunium
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Packet error: {0}")]
    Packet(String),

    #[error("DNS error: {0}")]
    Dns(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Tunnel error: {0}")]
    Tunnel(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Timeout")]
    Timeout,
}

/// Result type alias for Tunium
pub type Result<T> = std::result::Result<T, Error>;

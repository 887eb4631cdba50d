//! IP packet parsing
//!
//! Pure header decode over the raw bytes read from the tunnel device.
//! No IO, no side effects; malformed input is an error, never a panic.

use std::net::Ipv4Addr;

use bytes::Bytes;

use crate::error::{Error, Result};

/// Minimum IPv4 header length
const MIN_HEADER_LEN: usize = 20;

/// Minimum length of an IPv4 + UDP datagram carrying a port
const MIN_UDP_LEN: usize = 28;

/// IP protocol number for UDP
const PROTOCOL_UDP: u8 = 17;

/// Well-known DNS port
const DNS_PORT: u16 = 53;

/// The unit the tunnel device reads and writes
///
/// Pairs the raw packet bytes with the protocol number the host
/// associates with them. The direct path writes the pair back
/// untouched; relayed upstream bytes are wrapped with the protocol
/// number of the flow that opened the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelPacket {
    /// Raw packet bytes
    pub payload: Bytes,
    /// Protocol number associated with the payload
    pub protocol: u8,
}

impl TunnelPacket {
    pub fn new(payload: Bytes, protocol: u8) -> Self {
        Self { payload, protocol }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Parsed view over a raw IP packet
///
/// Immutable after construction. Addresses are only extracted for
/// IPv4; an IPv6 packet parses successfully but carries no addresses
/// and is treated as unclassifiable downstream.
#[derive(Debug, Clone)]
pub struct Packet {
    data: Bytes,
    version: u8,
    protocol: u8,
    source: Option<Ipv4Addr>,
    destination: Option<Ipv4Addr>,
    udp_destination_port: Option<u16>,
}

impl Packet {
    /// Parse a raw packet buffer
    pub fn parse(data: Bytes) -> Result<Self> {
        if data.len() < MIN_HEADER_LEN {
            return Err(Error::Packet(format!(
                "buffer too short: {} bytes",
                data.len()
            )));
        }

        let version = data[0] >> 4;
        // Protocol is read from byte 9 regardless of version; for IPv6
        // this is not the next-header field, which matches the address
        // extraction never being attempted for IPv6 either.
        let protocol = data[9];

        let (source, destination) = match version {
            4 => (
                Some(Ipv4Addr::new(data[12], data[13], data[14], data[15])),
                Some(Ipv4Addr::new(data[16], data[17], data[18], data[19])),
            ),
            6 => (None, None),
            v => {
                return Err(Error::Packet(format!("unsupported IP version: {}", v)));
            }
        };

        let udp_destination_port = if protocol == PROTOCOL_UDP && data.len() >= MIN_UDP_LEN {
            Some(u16::from_be_bytes([data[22], data[23]]))
        } else {
            None
        };

        Ok(Self {
            data,
            version,
            protocol,
            source,
            destination,
            udp_destination_port,
        })
    }

    /// IP version (4 or 6)
    pub fn version(&self) -> u8 {
        self.version
    }

    /// IP protocol number (byte 9)
    pub fn protocol(&self) -> u8 {
        self.protocol
    }

    /// Source address (IPv4 only)
    pub fn source(&self) -> Option<Ipv4Addr> {
        self.source
    }

    /// Destination address (IPv4 only)
    pub fn destination(&self) -> Option<Ipv4Addr> {
        self.destination
    }

    /// UDP destination port, when the packet is UDP and long enough
    pub fn udp_destination_port(&self) -> Option<u16> {
        self.udp_destination_port
    }

    /// Whether this is a UDP datagram addressed to port 53
    pub fn is_dns_query(&self) -> bool {
        self.udp_destination_port == Some(DNS_PORT)
    }

    /// Destination rendered as the URL string rules match against
    pub fn destination_url(&self) -> Option<String> {
        self.destination.map(|d| format!("http://{}", d))
    }

    /// Raw packet bytes
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Total packet length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when the buffer is empty (cannot happen for a parsed packet)
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

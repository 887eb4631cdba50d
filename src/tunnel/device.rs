//! Tunnel device abstraction
//!
//! The host owns the OS-level tunnel; the engine only sees this trait.
//! `ChannelDevice` is the in-memory implementation embedding hosts and
//! tests hand to the engine.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

use crate::common::TunnelPacket;
use crate::error::{Error, Result};

/// Packet transport between the engine and the tunnel host
#[async_trait]
pub trait TunnelDevice: Send + Sync {
    /// Read the next batch of packets entering the tunnel
    ///
    /// Suspends until at least one packet is available. Returning an
    /// error means the device is unusable.
    async fn read_packets(&self) -> Result<Vec<TunnelPacket>>;

    /// Write packets back out of the tunnel
    async fn write_packets(&self, packets: &[TunnelPacket]) -> Result<()>;
}

/// In-memory device backed by a pair of unbounded channels
pub struct ChannelDevice {
    inbound: Mutex<mpsc::UnboundedReceiver<TunnelPacket>>,
    outbound: mpsc::UnboundedSender<TunnelPacket>,
}

/// The host's end of a `ChannelDevice`
pub struct ChannelHost {
    tx: mpsc::UnboundedSender<TunnelPacket>,
    rx: mpsc::UnboundedReceiver<TunnelPacket>,
}

impl ChannelDevice {
    /// Create a connected device/host pair
    pub fn pair() -> (Self, ChannelHost) {
        let (host_tx, device_rx) = mpsc::unbounded_channel();
        let (device_tx, host_rx) = mpsc::unbounded_channel();
        (
            Self {
                inbound: Mutex::new(device_rx),
                outbound: device_tx,
            },
            ChannelHost {
                tx: host_tx,
                rx: host_rx,
            },
        )
    }
}

#[async_trait]
impl TunnelDevice for ChannelDevice {
    async fn read_packets(&self) -> Result<Vec<TunnelPacket>> {
        let mut inbound = self.inbound.lock().await;
        let first = inbound.recv().await.ok_or(Error::ConnectionClosed)?;
        let mut batch = vec![first];
        // Drain whatever else is already queued into the same batch.
        while let Ok(packet) = inbound.try_recv() {
            batch.push(packet);
        }
        Ok(batch)
    }

    async fn write_packets(&self, packets: &[TunnelPacket]) -> Result<()> {
        for packet in packets {
            self.outbound
                .send(packet.clone())
                .map_err(|_| Error::ConnectionClosed)?;
        }
        Ok(())
    }
}

impl ChannelHost {
    /// Push a packet into the tunnel as if the OS delivered it
    pub fn inject(&self, packet: TunnelPacket) -> Result<()> {
        self.tx.send(packet).map_err(|_| Error::ConnectionClosed)
    }

    /// Next packet the engine wrote back, if any
    pub async fn next_written(&mut self) -> Option<TunnelPacket> {
        self.rx.recv().await
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn packet(tag: u8) -> TunnelPacket {
        TunnelPacket::new(Bytes::copy_from_slice(&[tag; 4]), 2)
    }

    #[tokio::test]
    async fn test_injected_packets_come_back_in_one_batch() {
        let (device, host) = ChannelDevice::pair();

        host.inject(packet(1)).unwrap();
        host.inject(packet(2)).unwrap();
        host.inject(packet(3)).unwrap();

        let batch = device.read_packets().await.unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0], packet(1));
        assert_eq!(batch[2], packet(3));
    }

    #[tokio::test]
    async fn test_written_packets_reach_the_host() {
        let (device, mut host) = ChannelDevice::pair();

        device.write_packets(&[packet(7)]).await.unwrap();
        assert_eq!(host.next_written().await, Some(packet(7)));
    }

    #[tokio::test]
    async fn test_read_fails_when_host_is_gone() {
        let (device, host) = ChannelDevice::pair();
        drop(host);

        let err = device.read_packets().await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }
}

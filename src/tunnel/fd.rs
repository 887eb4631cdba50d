//! Tunnel device over a pre-opened file descriptor (Unix)
//!
//! Hosts that own the OS tunnel hand over its descriptor; the device
//! reads and writes one packet per syscall, as tun devices deliver
//! them. The protocol tag on read packets is the address family
//! derived from the IP version nibble.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::unix::AsyncFd;

use crate::common::TunnelPacket;
use crate::error::{Error, Result};

use super::device::TunnelDevice;

/// Largest packet a single read may return
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Tunnel device wrapping a descriptor the host already opened
pub struct FdDevice {
    fd: AsyncFd<OwnedFd>,
}

impl FdDevice {
    /// Take ownership of a tunnel descriptor
    ///
    /// The descriptor is switched to non-blocking mode and registered
    /// with the reactor; it stays owned by the device until drop.
    pub fn new(fd: OwnedFd) -> Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        let fd = AsyncFd::new(fd)?;
        Ok(Self { fd })
    }

    /// Wrap a raw descriptor number received from the host
    ///
    /// # Safety
    ///
    /// `fd` must be open and owned by the caller; ownership moves to
    /// the device and nothing else may close it.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Result<Self> {
        Self::new(OwnedFd::from_raw_fd(fd))
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    if flags & libc::O_NONBLOCK == 0 {
        let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if rc < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
    }
    Ok(())
}

fn family_for(payload: &[u8]) -> u8 {
    match payload.first().map(|b| b >> 4) {
        Some(6) => libc::AF_INET6 as u8,
        _ => libc::AF_INET as u8,
    }
}

#[async_trait]
impl TunnelDevice for FdDevice {
    async fn read_packets(&self) -> Result<Vec<TunnelPacket>> {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let mut guard = self.fd.readable().await?;
            let read = guard.try_io(|inner| {
                let n = unsafe {
                    libc::read(
                        inner.get_ref().as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                    )
                };
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match read {
                Ok(Ok(0)) => return Err(Error::ConnectionClosed),
                Ok(Ok(n)) => {
                    let payload = Bytes::copy_from_slice(&buf[..n]);
                    let protocol = family_for(&payload);
                    return Ok(vec![TunnelPacket::new(payload, protocol)]);
                }
                Ok(Err(e)) => return Err(e.into()),
                // Readiness was stale; wait again.
                Err(_would_block) => continue,
            }
        }
    }

    async fn write_packets(&self, packets: &[TunnelPacket]) -> Result<()> {
        for packet in packets {
            loop {
                let mut guard = self.fd.writable().await?;
                let written = guard.try_io(|inner| {
                    let n = unsafe {
                        libc::write(
                            inner.get_ref().as_raw_fd(),
                            packet.payload.as_ptr() as *const libc::c_void,
                            packet.payload.len(),
                        )
                    };
                    if n < 0 {
                        Err(std::io::Error::last_os_error())
                    } else {
                        Ok(n as usize)
                    }
                });
                match written {
                    Ok(Ok(_)) => break,
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_would_block) => continue,
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Datagram socketpair keeps packet boundaries the way a tun
    /// device does.
    fn socketpair() -> (OwnedFd, OwnedFd) {
        let mut fds = [0; 2];
        let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_DGRAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    #[tokio::test]
    async fn test_roundtrip_preserves_packet_boundaries() {
        let (left, right) = socketpair();
        let device = FdDevice::new(left).unwrap();
        let peer = FdDevice::new(right).unwrap();

        let first = TunnelPacket::new(Bytes::from_static(&[0x45, 0, 0, 20]), libc::AF_INET as u8);
        let second =
            TunnelPacket::new(Bytes::from_static(&[0x45, 1, 1, 1, 1]), libc::AF_INET as u8);
        peer.write_packets(&[first.clone(), second.clone()])
            .await
            .unwrap();

        let batch = device.read_packets().await.unwrap();
        assert_eq!(batch, vec![first]);
        let batch = device.read_packets().await.unwrap();
        assert_eq!(batch[0].payload, second.payload);
    }

    #[tokio::test]
    async fn test_read_tags_address_family_from_version_nibble() {
        let (left, right) = socketpair();
        let device = FdDevice::new(left).unwrap();
        let peer = FdDevice::new(right).unwrap();

        peer.write_packets(&[TunnelPacket::new(Bytes::from_static(&[0x60, 0, 0, 0]), 0)])
            .await
            .unwrap();

        let batch = device.read_packets().await.unwrap();
        assert_eq!(batch[0].protocol, libc::AF_INET6 as u8);
    }
}

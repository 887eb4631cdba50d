//! Per-destination proxy connection
//!
//! Drives the upstream handshake as an explicit state machine, then
//! relays queued payloads upstream and upstream bytes back to the
//! reply sink. Every transition is recorded so a failed connection
//! can be logged with its full history.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

use crate::common::{Endpoint, TunnelPacket};
use crate::error::{Error, Result};
use crate::stats::TrafficAccountant;

use super::socks5;
use super::ProxySettings;

/// Relay buffer size (32KB)
const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Lifecycle states of a proxy connection
///
/// The happy path walks the variants in declaration order up to
/// `Established`; any failure moves to `Failed` from whatever state
/// the connection was in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Connecting,
    Handshaking,
    AwaitingHandshakeReply,
    SendingConnectRequest,
    Established,
    Closed,
    Failed,
}

/// A single connection through the upstream proxy
pub struct ProxyConnection {
    destination: Endpoint,
    protocol: u8,
    state: ConnState,
    trace: Vec<ConnState>,
    stream: Option<TcpStream>,
}

impl ProxyConnection {
    pub fn new(destination: Endpoint, protocol: u8) -> Self {
        Self {
            destination,
            protocol,
            state: ConnState::Idle,
            trace: vec![ConnState::Idle],
            stream: None,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn trace(&self) -> &[ConnState] {
        &self.trace
    }

    pub fn destination(&self) -> &Endpoint {
        &self.destination
    }

    /// Render the transition history for diagnostics
    pub fn trace_summary(&self) -> String {
        self.trace
            .iter()
            .map(|s| format!("{:?}", s))
            .collect::<Vec<_>>()
            .join(" -> ")
    }

    fn set_state(&mut self, state: ConnState) {
        trace!("[{}] {:?} -> {:?}", self.destination, self.state, state);
        self.state = state;
        self.trace.push(state);
    }

    /// Drive the connection to `Established`
    ///
    /// Connects to the upstream, performs the SOCKS5 greeting and
    /// method selection, then writes the CONNECT line. The CONNECT
    /// bytes are counted as outbound traffic. On any error the state
    /// becomes `Failed` and the socket is dropped.
    pub async fn establish(
        &mut self,
        settings: &ProxySettings,
        accountant: &TrafficAccountant,
    ) -> Result<()> {
        match self.try_establish(settings, accountant).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.stream = None;
                self.set_state(ConnState::Failed);
                Err(e)
            }
        }
    }

    async fn try_establish(
        &mut self,
        settings: &ProxySettings,
        accountant: &TrafficAccountant,
    ) -> Result<()> {
        self.set_state(ConnState::Connecting);
        let addr = format!("{}:{}", settings.host, settings.port);
        let mut stream =
            match tokio::time::timeout(settings.connect_timeout, TcpStream::connect(&addr)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(Error::Timeout),
            };
        stream.set_nodelay(true).ok();

        self.set_state(ConnState::Handshaking);
        stream.write_all(&socks5::GREETING).await?;

        self.set_state(ConnState::AwaitingHandshakeReply);
        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await?;
        socks5::check_method_reply(&reply)?;

        self.set_state(ConnState::SendingConnectRequest);
        let request = socks5::connect_request(&self.destination);
        stream.write_all(request.as_bytes()).await?;
        accountant.add_outbound(request.len() as u64);

        // The upstream sends no reply to the CONNECT line.
        self.set_state(ConnState::Established);
        self.stream = Some(stream);
        Ok(())
    }

    /// Relay traffic until the connection winds down
    ///
    /// Payloads received on `payloads` are written upstream in queue
    /// order and counted as outbound; upstream bytes are counted as
    /// inbound and sent to `replies` tagged with this connection's
    /// protocol number. Returns when the queue is dropped, the peer
    /// closes, the idle timeout lapses with no traffic in either
    /// direction, or shutdown is signalled.
    pub async fn relay(
        &mut self,
        payloads: &mut mpsc::UnboundedReceiver<Bytes>,
        replies: &mpsc::UnboundedSender<TunnelPacket>,
        accountant: &TrafficAccountant,
        idle_timeout: Duration,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<()> {
        let stream = match self.stream.take() {
            Some(stream) => stream,
            None => {
                return Err(Error::Tunnel(
                    "relay started without an established stream".to_string(),
                ))
            }
        };
        let (mut reader, mut writer) = stream.into_split();

        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        let idle = tokio::time::sleep(idle_timeout);
        tokio::pin!(idle);

        let result = loop {
            tokio::select! {
                payload = payloads.recv() => match payload {
                    Some(payload) => {
                        if let Err(e) = writer.write_all(&payload).await {
                            break Err(Error::Io(e));
                        }
                        accountant.add_outbound(payload.len() as u64);
                        idle.as_mut().reset(tokio::time::Instant::now() + idle_timeout);
                    }
                    // Queue dropped: nothing can feed this connection anymore.
                    None => break Ok(()),
                },
                read = reader.read(&mut buf) => match read {
                    Ok(0) => break Ok(()),
                    Ok(n) => {
                        accountant.add_inbound(n as u64);
                        let packet =
                            TunnelPacket::new(Bytes::copy_from_slice(&buf[..n]), self.protocol);
                        if replies.send(packet).is_err() {
                            break Ok(());
                        }
                        idle.as_mut().reset(tokio::time::Instant::now() + idle_timeout);
                    }
                    Err(e) => break Err(Error::Io(e)),
                },
                _ = &mut idle => {
                    debug!("[{}] idle timeout, closing", self.destination);
                    break Ok(());
                }
                _ = shutdown.recv() => break Ok(()),
            }
        };

        let _ = writer.shutdown().await;
        match result {
            Ok(()) => {
                self.set_state(ConnState::Closed);
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnState::Failed);
                Err(e)
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

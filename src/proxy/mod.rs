//! Proxy Forwarder
//!
//! Keeps one upstream connection per destination endpoint. `forward`
//! never suspends: it hands the payload to the destination's
//! connection task, creating the task on first use. Payloads queued
//! while the handshake is still in flight are flushed in order once
//! the connection is established. A connection that fails or goes
//! idle removes itself from the table; the next packet for that
//! destination starts a fresh one.

mod connection;
mod socks5;

pub use connection::{ConnState, ProxyConnection};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::common::{Endpoint, TunnelPacket};
use crate::error::{Error, Result};
use crate::stats::TrafficAccountant;

/// Default timeout for connecting to the upstream proxy
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default idle timeout before a quiet connection is closed
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Upstream proxy settings
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}

impl ProxySettings {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

struct Entry {
    /// Creation id, so a finished task only removes its own entry
    id: u64,
    tx: mpsc::UnboundedSender<Bytes>,
    handle: JoinHandle<()>,
}

struct Inner {
    settings: ProxySettings,
    accountant: TrafficAccountant,
    replies: mpsc::UnboundedSender<TunnelPacket>,
    table: Mutex<HashMap<Endpoint, Entry>>,
    next_id: AtomicU64,
    closing: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

/// Routes packets to per-destination proxy connections
#[derive(Clone)]
pub struct ProxyForwarder {
    inner: Arc<Inner>,
}

impl ProxyForwarder {
    pub fn new(
        settings: ProxySettings,
        accountant: TrafficAccountant,
        replies: mpsc::UnboundedSender<TunnelPacket>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(Inner {
                settings,
                accountant,
                replies,
                table: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                closing: AtomicBool::new(false),
                shutdown_tx,
            }),
        }
    }

    /// Queue a packet for its destination's connection
    ///
    /// Succeeding here means the payload was queued, not that it was
    /// delivered; connection failures surface asynchronously in the
    /// connection task's log output. A packet that finds a dead entry
    /// replaces it with a fresh connection.
    pub fn forward(
        &self,
        packet: TunnelPacket,
        source: Endpoint,
        destination: Endpoint,
    ) -> Result<()> {
        if self.inner.closing.load(Ordering::SeqCst) {
            return Err(Error::Tunnel("forwarder is stopped".to_string()));
        }

        let TunnelPacket { payload, protocol } = packet;
        let mut table = self.inner.table.lock();

        let payload = match table.get(&destination) {
            Some(entry) => match entry.tx.send(payload) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    // The task behind this entry already finished; this
                    // packet replaces it with a fresh connection.
                    table.remove(&destination);
                    err.0
                }
            },
            None => payload,
        };

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        debug!("[#{}] opening proxy connection {} -> {}", id, source, destination);

        let (tx, rx) = mpsc::unbounded_channel();
        if tx.send(payload).is_err() {
            return Err(Error::ConnectionClosed);
        }

        let handle = tokio::spawn(run_connection(
            self.inner.clone(),
            id,
            destination.clone(),
            protocol,
            rx,
        ));
        table.insert(destination, Entry { id, tx, handle });
        Ok(())
    }

    /// Number of live connection entries
    pub fn active_connections(&self) -> usize {
        self.inner.table.lock().len()
    }

    /// Close every connection and wait for their tasks to finish
    pub async fn shutdown(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        let _ = self.inner.shutdown_tx.send(());

        let entries: Vec<Entry> = {
            let mut table = self.inner.table.lock();
            table.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            let _ = entry.handle.await;
        }
        debug!("proxy forwarder stopped");
    }
}

/// Lifecycle of one connection: establish, relay, remove own entry
async fn run_connection(
    inner: Arc<Inner>,
    id: u64,
    destination: Endpoint,
    protocol: u8,
    mut payloads: mpsc::UnboundedReceiver<Bytes>,
) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    let mut conn = ProxyConnection::new(destination.clone(), protocol);

    let established = tokio::select! {
        result = conn.establish(&inner.settings, &inner.accountant) => result,
        _ = shutdown.recv() => {
            remove_entry(&inner, id, &destination);
            return;
        }
    };

    match established {
        Ok(()) => {
            let relayed = conn
                .relay(
                    &mut payloads,
                    &inner.replies,
                    &inner.accountant,
                    inner.settings.idle_timeout,
                    &mut shutdown,
                )
                .await;
            match relayed {
                Ok(()) => debug!(
                    "[#{}] connection to {} closed (trace: {})",
                    id,
                    destination,
                    conn.trace_summary()
                ),
                Err(e) => warn!(
                    "[#{}] relay to {} failed: {} (trace: {})",
                    id,
                    destination,
                    e,
                    conn.trace_summary()
                ),
            }
        }
        Err(e) => warn!(
            "[#{}] handshake for {} failed: {} (trace: {})",
            id,
            destination,
            e,
            conn.trace_summary()
        ),
    }

    remove_entry(&inner, id, &destination);
}

fn remove_entry(inner: &Inner, id: u64, destination: &Endpoint) {
    let mut table = inner.table.lock();
    if let Some(entry) = table.get(destination) {
        if entry.id == id {
            table.remove(destination);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Traffic accounting
//!
//! All counter mutation is serialized through a single ledger task fed
//! by an mpsc queue. Snapshots and resets travel the same queue, so a
//! snapshot reflects every update enqueued before it and is always a
//! consistent point-in-time copy. Formatting helpers are pure.

use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::{Error, Result};

/// Point-in-time traffic counters
#[derive(Debug, Clone, Copy)]
pub struct TrafficStats {
    /// Bytes received from the tunnel or the upstream
    pub bytes_in: u64,
    /// Bytes written back or sent upstream
    pub bytes_out: u64,
    window_start: Instant,
    last_update: Instant,
}

impl TrafficStats {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            bytes_in: 0,
            bytes_out: 0,
            window_start: now,
            last_update: now,
        }
    }

    /// Total bytes in both directions
    pub fn total_bytes(&self) -> u64 {
        self.bytes_in + self.bytes_out
    }

    /// Time between the start of the window and the last update
    pub fn duration(&self) -> Duration {
        self.last_update.duration_since(self.window_start)
    }

    /// Average inbound rate over the window, bytes per second
    pub fn speed_in(&self) -> f64 {
        let secs = self.duration().as_secs_f64();
        if secs > 0.0 {
            self.bytes_in as f64 / secs
        } else {
            0.0
        }
    }

    /// Average outbound rate over the window, bytes per second
    pub fn speed_out(&self) -> f64 {
        let secs = self.duration().as_secs_f64();
        if secs > 0.0 {
            self.bytes_out as f64 / secs
        } else {
            0.0
        }
    }

    /// One-line human readable summary
    pub fn summary(&self) -> String {
        format!(
            "in {} ({}) out {} ({})",
            format_bytes(self.bytes_in),
            format_speed(self.speed_in()),
            format_bytes(self.bytes_out),
            format_speed(self.speed_out()),
        )
    }
}

enum Command {
    AddInbound(u64),
    AddOutbound(u64),
    Reset,
    Snapshot(oneshot::Sender<TrafficStats>),
}

/// Handle to the traffic ledger
///
/// Cheap to clone; every holder feeds the same ledger task. The task
/// exits when the last handle is dropped.
#[derive(Clone)]
pub struct TrafficAccountant {
    tx: mpsc::UnboundedSender<Command>,
}

impl TrafficAccountant {
    /// Spawn the ledger task and return a handle to it
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(ledger_loop(rx));
        Self { tx }
    }

    /// Record bytes received
    pub fn add_inbound(&self, bytes: u64) {
        let _ = self.tx.send(Command::AddInbound(bytes));
    }

    /// Record bytes sent
    pub fn add_outbound(&self, bytes: u64) {
        let _ = self.tx.send(Command::AddOutbound(bytes));
    }

    /// Zero the counters and restart the measurement window
    pub fn reset(&self) {
        let _ = self.tx.send(Command::Reset);
    }

    /// Consistent copy of the counters at this point in the queue
    pub async fn snapshot(&self) -> Result<TrafficStats> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot(reply_tx))
            .map_err(|_| Error::ConnectionClosed)?;
        reply_rx.await.map_err(|_| Error::ConnectionClosed)
    }
}

async fn ledger_loop(mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut stats = TrafficStats::new();

    while let Some(command) = rx.recv().await {
        match command {
            Command::AddInbound(bytes) => {
                stats.bytes_in += bytes;
                stats.last_update = Instant::now();
            }
            Command::AddOutbound(bytes) => {
                stats.bytes_out += bytes;
                stats.last_update = Instant::now();
            }
            Command::Reset => {
                stats = TrafficStats::new();
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(stats);
            }
        }
    }

    debug!("traffic ledger stopped");
}

/// Format bytes to human readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;
    const GB: u64 = 1024 * 1024 * 1024;
    const TB: u64 = 1024 * 1024 * 1024 * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{:.2} B", bytes as f64)
    }
}

/// Format bytes per second to human readable string
pub fn format_speed(bytes_per_sec: f64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;

    if bytes_per_sec >= GB {
        format!("{:.2} GB/s", bytes_per_sec / GB)
    } else if bytes_per_sec >= MB {
        format!("{:.2} MB/s", bytes_per_sec / MB)
    } else if bytes_per_sec >= KB {
        format!("{:.2} KB/s", bytes_per_sec / KB)
    } else {
        format!("{:.2} B/s", bytes_per_sec)
    }
}

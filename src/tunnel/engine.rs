//! Tunnel Orchestrator
//!
//! Owns the packet loop: read a batch from the device, then per
//! packet parse, count, classify, dispatch. The loop itself never
//! waits on network IO; DNS resolution and proxy writes happen on
//! spawned tasks, and everything going back out of the tunnel (direct
//! write-backs and upstream relay bytes) is serialized through the
//! reply pump.
//!
//! Classification: a DNS query is always proxied, regardless of the
//! rule set; everything else asks the rule engine with the
//! `http://<destination>` string.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::common::{Endpoint, Packet, TunnelPacket};
use crate::config::Config;
use crate::dns::Resolver;
use crate::error::{Error, Result};
use crate::proxy::{ProxyForwarder, ProxySettings};
use crate::router::{RuleAction, RuleEngine};
use crate::stats::TrafficAccountant;

use super::device::TunnelDevice;

/// Lifecycle states published on the engine's watch channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

struct EngineInner {
    device: Arc<dyn TunnelDevice>,
    rules: Arc<RuleEngine>,
    resolver: Arc<Resolver>,
    accountant: TrafficAccountant,
    forwarder: ProxyForwarder,
    /// Tunnel-side address, used as the source for host-originated sends
    local: Ipv4Addr,
    /// Everything written back to the device goes through this channel
    device_tx: mpsc::UnboundedSender<TunnelPacket>,
    state_tx: watch::Sender<TunnelState>,
    shutdown_tx: broadcast::Sender<()>,
    device_rx: Mutex<Option<mpsc::UnboundedReceiver<TunnelPacket>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// The tunnel engine: one per tunnel device
///
/// Built from a validated config, started once, stopped once. Clones
/// share the same engine.
#[derive(Clone)]
pub struct TunnelEngine {
    inner: Arc<EngineInner>,
}

impl TunnelEngine {
    /// Build an engine from configuration and a device
    ///
    /// The configuration is validated up front; an invalid config
    /// fails here and nothing is started.
    pub fn new(config: Config, device: Arc<dyn TunnelDevice>) -> Result<Self> {
        config.validate()?;

        let local = config.tunnel.local_address.parse::<Ipv4Addr>().map_err(|_| {
            Error::Config(format!(
                "invalid tunnel local address: {}",
                config.tunnel.local_address
            ))
        })?;
        let servers = config.dns.server_addrs()?;
        let settings = ProxySettings::new(config.proxy.host.clone(), config.proxy.port)
            .with_connect_timeout(Duration::from_secs(config.proxy.connect_timeout))
            .with_idle_timeout(Duration::from_secs(config.proxy.idle_timeout));

        let accountant = TrafficAccountant::spawn();
        let rules = Arc::new(RuleEngine::new(config.rules));
        let resolver = Arc::new(Resolver::new(servers));
        let (device_tx, device_rx) = mpsc::unbounded_channel();
        let forwarder = ProxyForwarder::new(settings, accountant.clone(), device_tx.clone());
        let (state_tx, _) = watch::channel(TunnelState::Idle);
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            inner: Arc::new(EngineInner {
                device,
                rules,
                resolver,
                accountant,
                forwarder,
                local,
                device_tx,
                state_tx,
                shutdown_tx,
                device_rx: Mutex::new(Some(device_rx)),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Spawn the packet loop and the reply pump
    pub fn start(&self) -> Result<()> {
        let state = *self.inner.state_tx.borrow();
        if state != TunnelState::Idle {
            return Err(Error::Tunnel(format!("cannot start from {:?} state", state)));
        }
        let device_rx = match self.inner.device_rx.lock().take() {
            Some(rx) => rx,
            None => return Err(Error::Tunnel("engine already started".to_string())),
        };

        info!("starting tunnel engine");
        self.inner.state_tx.send_replace(TunnelState::Starting);

        let mut tasks = Vec::with_capacity(2);
        tasks.push(tokio::spawn(read_loop(
            self.inner.clone(),
            self.inner.shutdown_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(reply_pump(
            self.inner.clone(),
            device_rx,
            self.inner.shutdown_tx.subscribe(),
        )));
        *self.inner.tasks.lock() = tasks;

        self.inner.state_tx.send_replace(TunnelState::Running);
        Ok(())
    }

    /// Stop the loops, drain the forwarder, publish `Stopped`
    pub async fn stop(&self) -> Result<()> {
        let state = *self.inner.state_tx.borrow();
        if !matches!(state, TunnelState::Running | TunnelState::Failed) {
            return Err(Error::Tunnel(format!("cannot stop from {:?} state", state)));
        }

        info!("stopping tunnel engine");
        self.inner.state_tx.send_replace(TunnelState::Stopping);

        let _ = self.inner.shutdown_tx.send(());
        let tasks: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.inner.forwarder.shutdown().await;

        self.inner.state_tx.send_replace(TunnelState::Stopped);
        info!("tunnel engine stopped");
        Ok(())
    }

    /// Send a payload to a destination through the proxy path
    ///
    /// Domain endpoints are resolved first, off the caller's path;
    /// a resolution failure drops the payload and is logged.
    pub fn send_via_proxy(&self, packet: TunnelPacket, destination: Endpoint) {
        let source = Endpoint::ip_port(self.inner.local.into(), 0);
        dispatch_proxy(&self.inner, packet, source, destination);
    }

    /// Current lifecycle state
    pub fn state(&self) -> TunnelState {
        *self.inner.state_tx.borrow()
    }

    /// Subscribe to lifecycle state changes
    pub fn subscribe(&self) -> watch::Receiver<TunnelState> {
        self.inner.state_tx.subscribe()
    }

    /// Traffic accounting handle
    pub fn accountant(&self) -> &TrafficAccountant {
        &self.inner.accountant
    }

    /// Rule engine handle
    pub fn rules(&self) -> &RuleEngine {
        &self.inner.rules
    }

    /// DNS resolver handle
    pub fn resolver(&self) -> &Resolver {
        &self.inner.resolver
    }

    /// Live proxy connection count
    pub fn active_proxy_connections(&self) -> usize {
        self.inner.forwarder.active_connections()
    }
}

async fn read_loop(inner: Arc<EngineInner>, mut shutdown: broadcast::Receiver<()>) {
    loop {
        let batch = tokio::select! {
            result = inner.device.read_packets() => result,
            _ = shutdown.recv() => break,
        };
        match batch {
            Ok(batch) => {
                for packet in batch {
                    handle_packet(&inner, packet);
                }
            }
            Err(e) => {
                // A failure during Stopping is the device going away
                // underneath us, not a fault.
                if *inner.state_tx.borrow() == TunnelState::Running {
                    error!("tunnel device read failed: {}", e);
                    inner.state_tx.send_replace(TunnelState::Failed);
                }
                break;
            }
        }
    }
    debug!("packet loop stopped");
}

async fn reply_pump(
    inner: Arc<EngineInner>,
    mut packets: mpsc::UnboundedReceiver<TunnelPacket>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let packet = tokio::select! {
            packet = packets.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
            _ = shutdown.recv() => break,
        };
        if let Err(e) = inner.device.write_packets(&[packet]).await {
            warn!("tunnel device write failed: {}", e);
        }
    }
    debug!("reply pump stopped");
}

fn handle_packet(inner: &Arc<EngineInner>, packet: TunnelPacket) {
    let parsed = match Packet::parse(packet.payload.clone()) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!("dropping unparseable packet: {}", e);
            return;
        }
    };
    inner.accountant.add_inbound(packet.len() as u64);

    match classify(inner, &parsed) {
        RuleAction::Proxy => {
            let destination = match parsed.destination() {
                Some(addr) => addr,
                None => {
                    debug!("dropping proxied packet without an IPv4 destination");
                    return;
                }
            };
            let port = parsed.udp_destination_port().unwrap_or(0);
            let source = parsed
                .source()
                .map(|addr| Endpoint::ip_port(addr.into(), 0))
                .unwrap_or_else(|| Endpoint::ip_port(inner.local.into(), 0));
            dispatch_proxy(
                inner,
                packet,
                source,
                Endpoint::ip_port(destination.into(), port),
            );
        }
        RuleAction::Direct => dispatch_direct(inner, packet),
        RuleAction::Reject => {
            debug!("rejecting packet to {:?}", parsed.destination());
        }
    }
}

fn classify(inner: &EngineInner, packet: &Packet) -> RuleAction {
    // DNS goes through the proxy unconditionally so answers arrive
    // even when a rule would reject the resolver's address.
    if packet.is_dns_query() {
        return RuleAction::Proxy;
    }
    inner.rules.select(packet.destination_url().as_deref())
}

fn dispatch_proxy(
    inner: &Arc<EngineInner>,
    packet: TunnelPacket,
    source: Endpoint,
    destination: Endpoint,
) {
    match destination {
        Endpoint::Domain(host, port) => {
            let inner = inner.clone();
            let mut shutdown = inner.shutdown_tx.subscribe();
            tokio::spawn(async move {
                let resolved = tokio::select! {
                    result = inner.resolver.resolve(&host) => result,
                    _ = shutdown.recv() => return,
                };
                match resolved {
                    Ok(addr) => {
                        let endpoint = Endpoint::ip_port(addr, port);
                        if let Err(e) = inner.forwarder.forward(packet, source, endpoint) {
                            debug!("forward for {} failed: {}", host, e);
                        }
                    }
                    Err(e) => {
                        debug!("dropping packet for {}: resolution failed: {}", host, e);
                    }
                }
            });
        }
        endpoint @ Endpoint::Socket(_) => {
            if let Err(e) = inner.forwarder.forward(packet, source, endpoint) {
                debug!("forward failed: {}", e);
            }
        }
    }
}

fn dispatch_direct(inner: &EngineInner, packet: TunnelPacket) {
    inner.accountant.add_outbound(packet.len() as u64);
    if inner.device_tx.send(packet).is_err() {
        debug!("direct write after pump stopped");
    }
}

// ============================================================================
// Tests
// ============================================================================

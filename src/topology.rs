//! # Topology Manager
//!
//! Owns the peer set, the degree target, the mesh view and the router's
//! dedupe state. Everything that mutates them runs inside one actor task.
//!
//! ## Architecture
//!
//! ```text
//!   Topology (handle, cheap clone)          link reader tasks
//!          │ TopologyCommand                      │ LinkEvent
//!          ▼                                      ▼
//!   ┌──────────────────────────────────────────────────────┐
//!   │ TopologyActor                                        │
//!   │   peers: name → PeerLink   view: MeshView            │
//!   │   degree, dedupe, auto-dial in flight                │
//!   └──────────────────────────────────────────────────────┘
//!          │ try_send(Frame)          │ InboundCommand     │ deliver()
//!          ▼                          ▼                    ▼
//!     link writer tasks          dispatcher           aggregator
//! ```
//!
//! ## Duplicate Links
//!
//! At most one link per peer. When a second link to the same peer shows
//! up, the link dialed by the lexicographically smaller node name wins, so
//! two nodes dialing each other at the same time keep the same link.
//!
//! Every `Hello` lists the dialer's current peers. A dialer that already
//! lists us is redialing over a live link and is refused, whatever address
//! it used to reach us. A peer that redials without listing us replaces its
//! old link (it restarted or lost it).

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use quinn::{ClientConfig, Endpoint};
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::aggregator::Aggregator;
use crate::config::DEFAULT_PORT;
use crate::dispatch::InboundCommand;
use crate::error::MeshError;
use crate::identity::NodeName;
use crate::messages::{Frame, Payload, RoutedEnvelope};
use crate::router::{self, DEDUPE_CACHE_SIZE, Dedupe};
use crate::transport::{Connector, Direction, LinkEvent, LinkId, PeerLink};
use crate::view::{Mesh, MeshView};

const COMMAND_CHANNEL_SIZE: usize = 256;
const EVENT_CHANNEL_SIZE: usize = 1024;

/// Answer to an incoming `Hello`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accept,
    Reject(String),
}

/// Counters reported by `mesh status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshStatus {
    /// Nodes in the current snapshot, including this one.
    pub mesh_size: usize,
    pub degree: usize,
    /// Live direct peers.
    pub peers: usize,
}

/// Tunables the actor needs at spawn time.
#[derive(Debug, Clone)]
pub struct TopologySettings {
    pub degree: usize,
    pub gossip_interval: Duration,
    pub row_ttl: Duration,
    pub max_hops: u8,
}

// ============================================================================
// Actor Commands
// ============================================================================

enum TopologyCommand {
    Admit {
        name: NodeName,
        dialer_peers: Vec<NodeName>,
        reply: oneshot::Sender<Admission>,
    },
    Register {
        link: PeerLink,
        reply: oneshot::Sender<Result<(), MeshError>>,
    },
    Hangup {
        name: NodeName,
        reply: oneshot::Sender<Result<(), MeshError>>,
    },
    SetDegree(usize),
    GetDegree {
        reply: oneshot::Sender<usize>,
    },
    Snapshot {
        reply: oneshot::Sender<Mesh>,
    },
    Status {
        reply: oneshot::Sender<MeshStatus>,
    },
    IsConnected {
        name: NodeName,
        reply: oneshot::Sender<bool>,
    },
    Peers {
        reply: oneshot::Sender<Vec<NodeName>>,
    },
    Route {
        targets: Vec<NodeName>,
        payload: Payload,
        reply: oneshot::Sender<Vec<NodeName>>,
    },
    AutoDialDone {
        name: NodeName,
    },
    Quit,
}

// ============================================================================
// Topology Handle (public API - cheap to clone)
// ============================================================================

#[derive(Clone)]
pub struct Topology {
    cmd_tx: mpsc::Sender<TopologyCommand>,
    connector: Arc<Connector>,
}

impl Topology {
    pub fn spawn(
        endpoint: Endpoint,
        client_config: ClientConfig,
        local: NodeName,
        addrs: Vec<String>,
        settings: TopologySettings,
        aggregator: Arc<Aggregator>,
        dispatch_tx: mpsc::Sender<InboundCommand>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let connector = Arc::new(Connector::new(
            endpoint,
            client_config,
            local.clone(),
            addrs.clone(),
            events_tx,
        ));

        let actor = TopologyActor {
            local: local.clone(),
            peers: HashMap::new(),
            view: MeshView::new(local, addrs),
            dedupe: Dedupe::new(DEDUPE_CACHE_SIZE),
            dialing: HashSet::new(),
            settings,
            aggregator,
            dispatch_tx,
            connector: connector.clone(),
            self_tx: cmd_tx.downgrade(),
        };
        tokio::spawn(actor.run(cmd_rx, events_rx));

        Self { cmd_tx, connector }
    }

    pub fn local(&self) -> &NodeName {
        self.connector.local()
    }

    pub(crate) fn connector(&self) -> &Connector {
        &self.connector
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> TopologyCommand,
    ) -> Result<T, MeshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply_tx))
            .await
            .map_err(|_| MeshError::Shutdown)?;
        reply_rx.await.map_err(|_| MeshError::Shutdown)
    }

    /// Decide whether `name`, which announced `dialer_peers` in its
    /// `Hello`, may open a link.
    pub async fn admit(
        &self,
        name: NodeName,
        dialer_peers: Vec<NodeName>,
    ) -> Result<Admission, MeshError> {
        self.call(|reply| TopologyCommand::Admit {
            name,
            dialer_peers,
            reply,
        })
        .await
    }

    pub async fn register(&self, link: PeerLink) -> Result<(), MeshError> {
        self.call(|reply| TopologyCommand::Register { link, reply })
            .await?
    }

    /// Connect to `host` (a node name, host, or `host:port`).
    ///
    /// Returns the name the remote announced.
    pub async fn dial(&self, host: &str) -> Result<NodeName, MeshError> {
        let host = host.trim();
        if host.is_empty() {
            return Err(MeshError::Connect("empty host".into()));
        }
        if host == self.local().as_str() {
            return Err(MeshError::Connect("cannot dial self".into()));
        }
        if let Ok(name) = NodeName::new(host) {
            if self.is_connected(&name).await? {
                return Err(MeshError::Connect(format!("already connected to {}", name)));
            }
        }
        self.connect(&with_default_port(host)).await
    }

    async fn connect(&self, target: &str) -> Result<NodeName, MeshError> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(target)
            .await
            .map_err(|e| MeshError::Connect(format!("{}: {}", target, e)))?
            .collect();
        let peers = self.peer_names().await?;

        let mut last_err = None;
        for addr in addrs {
            match self.connector.dial(addr, &peers).await {
                Ok(link) => {
                    let name = link.name().clone();
                    self.register(link).await?;
                    return Ok(name);
                }
                Err(e) => {
                    debug!(target, addr = %addr, error = %format!("{e:#}"), "dial attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(match last_err {
            Some(e) => MeshError::Connect(format!("{}: {:#}", target, e)),
            None => MeshError::Connect(format!("{}: no addresses", target)),
        })
    }

    pub async fn hangup(&self, name: NodeName) -> Result<(), MeshError> {
        self.call(|reply| TopologyCommand::Hangup { name, reply })
            .await?
    }

    pub async fn set_degree(&self, degree: usize) -> Result<(), MeshError> {
        self.cmd_tx
            .send(TopologyCommand::SetDegree(degree))
            .await
            .map_err(|_| MeshError::Shutdown)
    }

    pub async fn degree(&self) -> Result<usize, MeshError> {
        self.call(|reply| TopologyCommand::GetDegree { reply }).await
    }

    pub async fn snapshot(&self) -> Result<Mesh, MeshError> {
        self.call(|reply| TopologyCommand::Snapshot { reply }).await
    }

    pub async fn status(&self) -> Result<MeshStatus, MeshError> {
        self.call(|reply| TopologyCommand::Status { reply }).await
    }

    /// Names of the live direct peers.
    pub async fn peer_names(&self) -> Result<Vec<NodeName>, MeshError> {
        self.call(|reply| TopologyCommand::Peers { reply }).await
    }

    pub async fn is_connected(&self, name: &NodeName) -> Result<bool, MeshError> {
        let name = name.clone();
        self.call(|reply| TopologyCommand::IsConnected { name, reply })
            .await
    }

    /// Route a payload from this node to `targets`. Returns the targets
    /// that had no known path.
    pub async fn route(
        &self,
        targets: Vec<NodeName>,
        payload: Payload,
    ) -> Result<Vec<NodeName>, MeshError> {
        self.call(|reply| TopologyCommand::Route {
            targets,
            payload,
            reply,
        })
        .await
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(TopologyCommand::Quit).await;
    }
}

/// Append the default port unless `host` already names one.
fn with_default_port(host: &str) -> String {
    if host.parse::<SocketAddr>().is_ok() {
        return host.to_string();
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return SocketAddr::new(ip, DEFAULT_PORT).to_string();
    }
    if host.contains(':') {
        host.to_string()
    } else {
        format!("{}:{}", host, DEFAULT_PORT)
    }
}

/// Whether a new link dialed by `new_dialer` replaces an existing link to
/// the same peer dialed by `old_dialer`.
fn supersedes(local: &NodeName, new_dialer: &NodeName, old_dialer: &NodeName) -> bool {
    if new_dialer == old_dialer {
        // The remote redialed; our own duplicate dials never win.
        new_dialer != local
    } else {
        new_dialer < old_dialer
    }
}

/// Answer a `Hello` from `name`. `existing_dialer` is the dialer of the
/// link we already hold to `name`, if any.
fn admission(
    local: &NodeName,
    name: &NodeName,
    dialer_peers: &[NodeName],
    existing_dialer: Option<&NodeName>,
) -> Admission {
    if name == local {
        return Admission::Reject("cannot connect to self".into());
    }
    match existing_dialer {
        Some(old) if dialer_peers.contains(local) || !supersedes(local, name, old) => {
            Admission::Reject(format!("{} already connected to {}", local, name))
        }
        _ => Admission::Accept,
    }
}

// ============================================================================
// Actor (owns all mutable state)
// ============================================================================

struct TopologyActor {
    local: NodeName,
    peers: HashMap<NodeName, PeerLink>,
    view: MeshView,
    dedupe: Dedupe,
    /// Auto-dials in flight, counted against the degree.
    dialing: HashSet<NodeName>,
    settings: TopologySettings,
    aggregator: Arc<Aggregator>,
    dispatch_tx: mpsc::Sender<InboundCommand>,
    connector: Arc<Connector>,
    self_tx: mpsc::WeakSender<TopologyCommand>,
}

impl TopologyActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<TopologyCommand>,
        mut events_rx: mpsc::Receiver<LinkEvent>,
    ) {
        let mut gossip = tokio::time::interval(self.settings.gossip_interval);
        gossip.set_missed_tick_behavior(MissedTickBehavior::Delay);
        gossip.tick().await; // Skip initial tick

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(TopologyCommand::Quit) | None => {
                            debug!("topology actor shutting down");
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd),
                    }
                }
                Some(event) = events_rx.recv() => {
                    self.handle_event(event);
                }
                _ = gossip.tick() => {
                    self.tick();
                }
            }
        }

        for link in self.peers.values() {
            link.close("shutdown");
        }
    }

    fn handle_command(&mut self, cmd: TopologyCommand) {
        match cmd {
            TopologyCommand::Admit {
                name,
                dialer_peers,
                reply,
            } => {
                let _ = reply.send(self.admit(&name, &dialer_peers));
            }
            TopologyCommand::Register { link, reply } => {
                let _ = reply.send(self.register(link));
            }
            TopologyCommand::Hangup { name, reply } => {
                let _ = reply.send(self.hangup(&name));
            }
            TopologyCommand::SetDegree(degree) => {
                info!(degree, "degree changed");
                self.settings.degree = degree;
                self.auto_dial();
            }
            TopologyCommand::GetDegree { reply } => {
                let _ = reply.send(self.settings.degree);
            }
            TopologyCommand::Snapshot { reply } => {
                let _ = reply.send(self.view.snapshot());
            }
            TopologyCommand::Status { reply } => {
                let _ = reply.send(MeshStatus {
                    mesh_size: self.view.snapshot().len(),
                    degree: self.settings.degree,
                    peers: self.peers.len(),
                });
            }
            TopologyCommand::IsConnected { name, reply } => {
                let _ = reply.send(self.peers.contains_key(&name));
            }
            TopologyCommand::Peers { reply } => {
                let _ = reply.send(self.peers.keys().cloned().collect());
            }
            TopologyCommand::Route {
                targets,
                payload,
                reply,
            } => {
                let envelope = RoutedEnvelope {
                    id: rand::random(),
                    source: self.local.clone(),
                    targets,
                    hops_left: self.settings.max_hops,
                    payload,
                };
                let _ = reply.send(self.route(envelope, None));
            }
            TopologyCommand::AutoDialDone { name } => {
                self.dialing.remove(&name);
            }
            TopologyCommand::Quit => {}
        }
    }

    fn handle_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Frame {
                link_id,
                from,
                frame,
            } => {
                if !self.is_current(&from, link_id) {
                    trace!(peer = %from, link = link_id, "frame from stale link dropped");
                    return;
                }
                match frame {
                    Frame::Gossip(row) => {
                        if self.view.merge(row.clone()) {
                            trace!(node = %row.node, seq = row.seq, "adjacency row accepted");
                            self.flood(Frame::Gossip(row), Some(&from));
                        }
                    }
                    Frame::Route(envelope) => {
                        self.route(envelope, Some(&from));
                    }
                    other => {
                        debug!(peer = %from, kind = other.kind(), "unexpected frame after handshake");
                    }
                }
            }
            LinkEvent::Closed { link_id, name } => {
                if self.is_current(&name, link_id) {
                    self.peers.remove(&name);
                    info!(peer = %name, "peer disconnected");
                    self.announce();
                }
            }
        }
    }

    fn is_current(&self, name: &NodeName, link_id: LinkId) -> bool {
        self.peers.get(name).map(PeerLink::id) == Some(link_id)
    }

    fn admit(&self, name: &NodeName, dialer_peers: &[NodeName]) -> Admission {
        let existing = self
            .peers
            .get(name)
            .map(|link| link.dialer(&self.local));
        admission(&self.local, name, dialer_peers, existing)
    }

    fn register(&mut self, link: PeerLink) -> Result<(), MeshError> {
        let name = link.name().clone();
        if name == self.local {
            link.close("self");
            return Err(MeshError::Connect("cannot connect to self".into()));
        }
        if let Some(existing) = self.peers.get(&name) {
            if !supersedes(&self.local, link.dialer(&self.local), existing.dialer(&self.local)) {
                link.close("duplicate link");
                return Err(MeshError::Connect(format!("already connected to {}", name)));
            }
            debug!(peer = %name, old = existing.id(), new = link.id(), "replacing link");
            existing.close("superseded");
        }

        info!(
            peer = %name,
            direction = ?link.direction(),
            remote = %link.remote(),
            addrs = ?link.addrs(),
            "peer connected"
        );
        // Full dump so the newcomer converges without waiting a gossip round.
        for row in self.view.rows() {
            link.try_send(Frame::Gossip(row));
        }
        self.peers.insert(name, link);
        self.announce();
        Ok(())
    }

    fn hangup(&mut self, name: &NodeName) -> Result<(), MeshError> {
        let Some(link) = self.peers.remove(name) else {
            return Err(MeshError::NotConnected(name.to_string()));
        };
        link.close("hangup");
        info!(peer = %name, "hung up");
        self.announce();
        Ok(())
    }

    /// Rebuild the local row from the peer set and flood it.
    fn announce(&mut self) {
        let row = self.view.set_local_peers(self.peers.keys().cloned());
        self.flood(Frame::Gossip(row), None);
    }

    fn flood(&self, frame: Frame, except: Option<&NodeName>) {
        for (name, link) in &self.peers {
            if Some(name) != except {
                link.try_send(frame.clone());
            }
        }
    }

    fn tick(&mut self) {
        let expired = self.view.expire(self.settings.row_ttl);
        if !expired.is_empty() {
            debug!(count = expired.len(), "expired stale adjacency rows");
        }
        let row = self.view.refresh_local();
        self.flood(Frame::Gossip(row), None);
        self.auto_dial();
    }

    fn route(&mut self, envelope: RoutedEnvelope, incoming: Option<&NodeName>) -> Vec<NodeName> {
        let targets = self
            .dedupe
            .filter(&envelope.source, envelope.id, envelope.targets);
        if targets.is_empty() {
            return Vec::new();
        }

        let peers: BTreeSet<NodeName> = self.peers.keys().cloned().collect();
        let mesh = self.view.snapshot();
        let plan = router::plan(&mesh, &self.local, &peers, incoming, &targets);
        let mut unreachable = plan.unreachable;

        if plan.local {
            self.deliver_local(&envelope.source, envelope.payload.clone());
        }

        if !plan.hops.is_empty() && envelope.hops_left == 0 {
            warn!(
                source = %envelope.source,
                tid = envelope.payload.tid(),
                "hop limit reached, dropping envelope"
            );
            unreachable.extend(plan.hops.into_values().flatten());
        } else {
            for (hop, targets) in plan.hops {
                let Some(link) = self.peers.get(&hop) else {
                    unreachable.extend(targets);
                    continue;
                };
                trace!(next_hop = %hop, targets = targets.len(), "forwarding envelope");
                link.try_send(Frame::Route(RoutedEnvelope {
                    id: envelope.id,
                    source: envelope.source.clone(),
                    targets,
                    hops_left: envelope.hops_left - 1,
                    payload: envelope.payload.clone(),
                }));
            }
        }

        for target in &unreachable {
            debug!(
                target = %target,
                source = %envelope.source,
                tid = envelope.payload.tid(),
                "no route to target"
            );
        }
        unreachable
    }

    fn deliver_local(&self, source: &NodeName, payload: Payload) {
        match payload {
            Payload::Command(command) => {
                let tid = command.tid;
                let inbound = InboundCommand {
                    source: source.clone(),
                    command,
                };
                if let Err(e) = self.dispatch_tx.try_send(inbound) {
                    warn!(source = %source, tid, error = %e, "dispatcher unavailable, dropping command");
                }
            }
            Payload::Response(response) => {
                self.aggregator.deliver(response);
            }
        }
    }

    /// Dial random known nodes until outbound links reach the degree.
    fn auto_dial(&mut self) {
        let outbound = self
            .peers
            .values()
            .filter(|link| link.direction() == Direction::Outbound)
            .count();
        let slots = self
            .settings
            .degree
            .saturating_sub(outbound + self.dialing.len());
        if slots == 0 {
            return;
        }
        let Some(cmd_tx) = self.self_tx.upgrade() else {
            return;
        };

        let mut candidates: Vec<(NodeName, Vec<String>)> = self
            .view
            .snapshot()
            .into_keys()
            .filter(|n| *n != self.local && !self.peers.contains_key(n) && !self.dialing.contains(n))
            .filter_map(|n| {
                let addrs = self.view.addrs_of(&n)?.to_vec();
                (!addrs.is_empty()).then_some((n, addrs))
            })
            .collect();
        candidates.shuffle(&mut rand::thread_rng());

        for (name, addrs) in candidates.into_iter().take(slots) {
            debug!(peer = %name, "auto-dialing to reach degree");
            self.dialing.insert(name.clone());
            let topology = Topology {
                cmd_tx: cmd_tx.clone(),
                connector: self.connector.clone(),
            };
            tokio::spawn(async move {
                for addr in &addrs {
                    match topology.connect(&with_default_port(addr)).await {
                        Ok(_) => break,
                        Err(e) => debug!(peer = %name, addr = %addr, error = %e, "auto-dial failed"),
                    }
                }
                let _ = topology
                    .cmd_tx
                    .send(TopologyCommand::AutoDialDone { name })
                    .await;
            });
        }
    }
}

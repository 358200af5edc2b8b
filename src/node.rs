//! # High-Level Node API
//!
//! A [`Node`] binds a QUIC endpoint and wires the mesh components together
//! behind one handle: the topology actor (peer links, gossip, routing), the
//! response aggregator and, once [`Node::serve`] is called, the command
//! dispatcher.
//!
//! ## Quick Start
//!
//! ```ignore
//! let config = MeshConfig::new("kn1".parse()?).with_bind("0.0.0.0:9000".parse()?);
//! let node = Arc::new(Node::bind(config).await?);
//! node.serve(CliHandler::new(node.clone())).await?;
//!
//! node.dial("kn2").await?;
//! let result = node.send("kn[2-4]", "hostname").await?;
//! for response in &result.responses {
//!     print!("{}", response);
//! }
//! ```

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use quinn::Endpoint;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::aggregator::{Aggregator, Issuer, Pending, RequestResult};
use crate::config::MeshConfig;
use crate::crypto::{create_client_config, create_server_config, generate_self_signed_cert};
use crate::dispatch::{self, DISPATCH_QUEUE_SIZE, InboundCommand};
use crate::error::MeshError;
use crate::identity::NodeName;
use crate::messages::{CommandEnvelope, Payload};
use crate::protocols::CommandHandler;
use crate::resolver;
use crate::topology::{MeshStatus, Topology, TopologySettings};
use crate::transport;
use crate::view::{self, Mesh};

/// A receiver that can be taken exactly once via `.take()`.
type TakeOnce<T> = tokio::sync::Mutex<Option<mpsc::Receiver<T>>>;

pub struct Node {
    name: NodeName,
    endpoint: Endpoint,
    topology: Topology,
    aggregator: Arc<Aggregator>,
    timeout: RwLock<Duration>,
    dispatch_rx: TakeOnce<InboundCommand>,
    listener: tokio::task::JoinHandle<()>,
}

impl Node {
    /// Bind the endpoint and start the topology actor.
    ///
    /// Commands routed here are queued until a handler is installed with
    /// [`Node::serve`].
    pub async fn bind(config: MeshConfig) -> Result<Self> {
        let (certs, key) = generate_self_signed_cert()?;
        let server_config = create_server_config(certs, key)?;
        let client_config = create_client_config()?;

        let endpoint = Endpoint::server(server_config, config.bind)
            .with_context(|| format!("failed to bind {}", config.bind))?;
        let local_addr = endpoint
            .local_addr()
            .context("failed to read bound address")?;
        let addrs = config.advertised_addrs(local_addr);

        let aggregator = Arc::new(Aggregator::new());
        let (dispatch_tx, dispatch_rx) = mpsc::channel(DISPATCH_QUEUE_SIZE);
        let topology = Topology::spawn(
            endpoint.clone(),
            client_config,
            config.name.clone(),
            addrs.clone(),
            TopologySettings {
                degree: config.degree,
                gossip_interval: config.gossip_interval,
                row_ttl: config.row_ttl(),
                max_hops: config.max_hops,
            },
            aggregator.clone(),
            dispatch_tx,
        );

        let listener = {
            let endpoint = endpoint.clone();
            let topology = topology.clone();
            tokio::spawn(async move {
                while let Some(incoming) = endpoint.accept().await {
                    let topology = topology.clone();
                    tokio::spawn(async move {
                        if let Err(e) = transport::accept(incoming, topology).await {
                            warn!("connection error: {:#}", e);
                        }
                    });
                }
            })
        };

        info!(name = %config.name, addr = %local_addr, advertise = ?addrs, "mesh node listening");

        Ok(Self {
            name: config.name,
            endpoint,
            topology,
            aggregator,
            timeout: RwLock::new(config.timeout),
            dispatch_rx: tokio::sync::Mutex::new(Some(dispatch_rx)),
            listener,
        })
    }

    /// Install the handler that executes commands routed to this node.
    /// Can be called once.
    pub async fn serve<H: CommandHandler>(&self, handler: H) -> Result<()> {
        let rx = self
            .dispatch_rx
            .lock()
            .await
            .take()
            .context("command handler already installed")?;
        tokio::spawn(dispatch::run(Arc::new(handler), self.topology.clone(), rx));
        Ok(())
    }

    pub fn name(&self) -> &NodeName {
        &self.name
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint
            .local_addr()
            .context("failed to get local address")
    }

    pub async fn degree(&self) -> Result<usize, MeshError> {
        self.topology.degree().await
    }

    /// Set the target number of outbound links. Lowering it keeps existing
    /// links.
    pub async fn set_degree(&self, degree: usize) -> Result<(), MeshError> {
        self.topology.set_degree(degree).await
    }

    /// Connect to a node by name, host or `host:port` (default port 9000).
    pub async fn dial(&self, host: &str) -> Result<NodeName, MeshError> {
        self.topology.dial(host).await
    }

    pub async fn hangup(&self, peer: &str) -> Result<(), MeshError> {
        let name = NodeName::new(peer.trim())
            .map_err(|_| MeshError::NotConnected(peer.to_string()))?;
        self.topology.hangup(name).await
    }

    /// Point-in-time snapshot of the mesh reachable from this node.
    pub async fn mesh(&self) -> Result<Mesh, MeshError> {
        self.topology.snapshot().await
    }

    pub async fn dot(&self) -> Result<String, MeshError> {
        let mesh = self.mesh().await?;
        Ok(view::dot(&mesh, &self.name))
    }

    pub async fn status(&self) -> Result<MeshStatus, MeshError> {
        self.topology.status().await
    }

    pub fn timeout(&self) -> Duration {
        *self.timeout.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Applies to requests issued after the call.
    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.write().unwrap_or_else(|e| e.into_inner()) = timeout;
    }

    /// Send `command` to every node `recipients` expands to and wait for
    /// their responses.
    pub async fn send(&self, recipients: &str, command: &str) -> Result<RequestResult, MeshError> {
        let timeout = self.timeout();
        let pending = {
            let mut issuer = self.aggregator.issuer().await;
            let mesh = self.topology.snapshot().await?;
            let targets = resolver::resolve(recipients, &mesh)?;
            self.issue(&mut issuer, targets, command).await?
        };
        Ok(pending.collect(timeout).await)
    }

    /// Like [`Node::send`] with an already resolved target list.
    pub async fn request(
        &self,
        targets: &[NodeName],
        command: &str,
    ) -> Result<RequestResult, MeshError> {
        let timeout = self.timeout();
        let pending = {
            let mut issuer = self.aggregator.issuer().await;
            self.issue(&mut issuer, targets.to_vec(), command).await?
        };
        Ok(pending.collect(timeout).await)
    }

    async fn issue(
        &self,
        issuer: &mut Issuer<'_>,
        targets: Vec<NodeName>,
        command: &str,
    ) -> Result<Pending, MeshError> {
        let pending = issuer.register(targets.iter().cloned());
        let tid = pending.tid();
        debug!(
            tid,
            targets = pending.expected().len(),
            outstanding = self.aggregator.outstanding(),
            command,
            "issuing command"
        );
        let payload = Payload::Command(CommandEnvelope {
            original: command.to_string(),
            tid,
        });
        let unreachable = self.topology.route(targets, payload).await?;
        if !unreachable.is_empty() {
            debug!(tid, unreachable = unreachable.len(), "some targets have no route");
        }
        Ok(pending)
    }

    pub async fn shutdown(&self) {
        // Stop accepting before tearing down the actor.
        self.listener.abort();
        self.topology.quit().await;
        self.endpoint.close(0u32.into(), b"shutdown");
    }
}

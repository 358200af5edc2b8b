//! # Node Configuration
//!
//! [`MeshConfig`] collects everything a node needs at bind time. Values can
//! be set with the `with_*` builders or read from the environment with
//! [`MeshConfig::from_env`]:
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `MESH_NAME` | node name | host name |
//! | `MESH_BIND` | UDP bind address | `0.0.0.0:9000` |
//! | `MESH_DEGREE` | target outbound links | `0` |
//! | `MESH_TIMEOUT` | request timeout, seconds | `10` |
//! | `MESH_PEERS` | comma separated peers dialed at start-up | empty |

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::identity::NodeName;

/// Default UDP port for mesh links.
pub const DEFAULT_PORT: u16 = 9000;

/// Default time a request waits for all of its responses.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default interval between adjacency re-announcements.
pub const DEFAULT_GOSSIP_INTERVAL: Duration = Duration::from_secs(10);

/// Rows not refreshed within this many gossip intervals are expired.
pub const ROW_TTL_INTERVALS: u32 = 3;

/// Default hop cap for routed envelopes.
pub const DEFAULT_MAX_HOPS: u8 = 32;

#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub name: NodeName,
    pub bind: SocketAddr,
    /// Addresses other nodes should dial to reach us. Derived from the bound
    /// socket when empty.
    pub advertise: Vec<String>,
    pub degree: usize,
    pub timeout: Duration,
    pub gossip_interval: Duration,
    pub max_hops: u8,
    /// Peers dialed once the node is up.
    pub peers: Vec<String>,
}

impl MeshConfig {
    pub fn new(name: NodeName) -> Self {
        Self {
            name,
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            advertise: Vec::new(),
            degree: 0,
            timeout: DEFAULT_TIMEOUT,
            gossip_interval: DEFAULT_GOSSIP_INTERVAL,
            max_hops: DEFAULT_MAX_HOPS,
            peers: Vec::new(),
        }
    }

    /// Build a configuration from `MESH_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let name = match env_var("MESH_NAME") {
            Some(name) => name,
            None => local_hostname(),
        };
        let mut config = Self::new(
            NodeName::new(&name).with_context(|| format!("invalid MESH_NAME {:?}", name))?,
        );

        if let Some(bind) = env_var("MESH_BIND") {
            config.bind = bind
                .parse()
                .with_context(|| format!("invalid MESH_BIND {:?}", bind))?;
        }
        if let Some(degree) = env_var("MESH_DEGREE") {
            config.degree = degree
                .parse()
                .with_context(|| format!("invalid MESH_DEGREE {:?}", degree))?;
        }
        if let Some(timeout) = env_var("MESH_TIMEOUT") {
            let secs: u64 = timeout
                .parse()
                .with_context(|| format!("invalid MESH_TIMEOUT {:?}", timeout))?;
            config.timeout = Duration::from_secs(secs);
        }
        config.peers = env_var("MESH_PEERS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(config)
    }

    pub fn with_bind(mut self, bind: SocketAddr) -> Self {
        self.bind = bind;
        self
    }

    pub fn with_advertise(mut self, addrs: Vec<String>) -> Self {
        self.advertise = addrs;
        self
    }

    pub fn with_degree(mut self, degree: usize) -> Self {
        self.degree = degree;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_gossip_interval(mut self, interval: Duration) -> Self {
        self.gossip_interval = interval;
        self
    }

    pub fn with_max_hops(mut self, hops: u8) -> Self {
        self.max_hops = hops;
        self
    }

    pub fn with_peers(mut self, peers: Vec<String>) -> Self {
        self.peers = peers;
        self
    }

    /// How long a gossiped row stays valid without a refresh.
    pub fn row_ttl(&self) -> Duration {
        self.gossip_interval * ROW_TTL_INTERVALS
    }

    /// Addresses to advertise given the socket we actually bound.
    ///
    /// An unspecified bind address is not dialable, so the node name plus the
    /// bound port is advertised instead and left to name resolution.
    pub(crate) fn advertised_addrs(&self, bound: SocketAddr) -> Vec<String> {
        if !self.advertise.is_empty() {
            return self.advertise.clone();
        }
        if bound.ip().is_unspecified() {
            vec![format!("{}:{}", self.name, bound.port())]
        } else {
            vec![bound.to_string()]
        }
    }
}

/// Host name of this machine, or `"localhost"` if it cannot be read.
pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .map(|h| h.to_string_lossy().into_owned())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".into())
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

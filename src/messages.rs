//! # Wire Protocol Messages
//!
//! Every byte exchanged over a Peer Link is a [`Frame`]. Frames are
//! serialized with bincode and prefixed with a 4-byte big-endian length
//! (see `transport`).
//!
//! ## Frame Kinds
//!
//! | Frame | Direction | Purpose |
//! |-------|-----------|---------|
//! | `Hello` | dialer → acceptor | handshake: dialer's name, addresses, current peers |
//! | `Welcome` | acceptor → dialer | handshake accepted |
//! | `Reject` | acceptor → dialer | handshake refused (self, duplicate) |
//! | `Gossip` | any | one node's adjacency row |
//! | `Route` | any | routed command or response envelope |
//!
//! ## Security Limits
//!
//! - `MAX_FRAME_SIZE`: largest frame accepted from a peer
//! - All deserialization goes through [`deserialize_bounded`]

use std::fmt;

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::identity::NodeName;

/// Transaction identifier correlating a request with its responses.
pub type Tid = u64;

/// Maximum size of a single frame on the wire (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE as u64)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize_frame(frame: &Frame) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(frame)
}

pub fn deserialize_frame(data: &[u8]) -> Result<Frame, bincode::Error> {
    deserialize_bounded(data)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Frame {
    Hello {
        name: NodeName,
        addrs: Vec<String>,
        /// Nodes the dialer already holds links to.
        peers: Vec<NodeName>,
    },
    Welcome {
        name: NodeName,
        addrs: Vec<String>,
    },
    Reject {
        reason: String,
    },
    Gossip(AdjacencyRow),
    Route(RoutedEnvelope),
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "hello",
            Frame::Welcome { .. } => "welcome",
            Frame::Reject { .. } => "reject",
            Frame::Gossip(_) => "gossip",
            Frame::Route(_) => "route",
        }
    }
}

/// One node's view of its own direct peers.
///
/// `seq` orders rows from the same node: a receiver keeps the row with the
/// highest `seq` and ignores older copies still circulating.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjacencyRow {
    pub node: NodeName,
    pub seq: u64,
    pub peers: Vec<NodeName>,
    /// Addresses the node can be dialed on.
    pub addrs: Vec<String>,
}

/// A payload travelling through the mesh towards a set of named targets.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoutedEnvelope {
    /// Random per-message identifier, unique per source.
    pub id: u64,
    /// Node that originated the message; responses are routed back here.
    pub source: NodeName,
    /// Targets still to be reached through the receiving node.
    pub targets: Vec<NodeName>,
    /// Remaining forwarding budget.
    pub hops_left: u8,
    pub payload: Payload,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Payload {
    Command(CommandEnvelope),
    Response(ResponseEnvelope),
}

impl Payload {
    pub fn tid(&self) -> Tid {
        match self {
            Payload::Command(cmd) => cmd.tid,
            Payload::Response(resp) => resp.tid,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Command text exactly as the operator typed it.
    pub original: String,
    pub tid: Tid,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub response: Response,
    pub tid: Tid,
}

/// Result of running one command on one host.
///
/// Either a textual `body`, a table (`header` + `tabular`), or an `error`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub host: String,
    pub body: String,
    pub header: Vec<String>,
    pub tabular: Vec<Vec<String>>,
    pub error: Option<String>,
}

impl Response {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_table(mut self, header: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        self.header = header;
        self.tabular = rows;
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(error) = &self.error {
            return writeln!(f, "{}: error: {}", self.host, error);
        }
        if !self.header.is_empty() {
            let columns = self.header.len();
            let mut widths: Vec<usize> = self.header.iter().map(|h| h.len()).collect();
            for row in &self.tabular {
                for (i, cell) in row.iter().take(columns).enumerate() {
                    widths[i] = widths[i].max(cell.len());
                }
            }
            write!(f, "{:<width$}", "host", width = self.host.len().max(4))?;
            for (i, h) in self.header.iter().enumerate() {
                write!(f, " | {:<width$}", h, width = widths[i])?;
            }
            writeln!(f)?;
            for row in &self.tabular {
                write!(f, "{:<width$}", self.host, width = self.host.len().max(4))?;
                for (i, cell) in row.iter().take(columns).enumerate() {
                    write!(f, " | {:<width$}", cell, width = widths[i])?;
                }
                writeln!(f)?;
            }
            return Ok(());
        }
        if self.body.is_empty() {
            return Ok(());
        }
        write!(f, "{}", self.body)?;
        if !self.body.ends_with('\n') {
            writeln!(f)?;
        }
        Ok(())
    }
}

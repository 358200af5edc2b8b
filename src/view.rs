//! # Mesh View
//!
//! Every node keeps an adjacency row per known node, learned from gossip.
//! A row is the named node's own statement of its direct peers, versioned
//! by a sequence number the node bumps whenever it re-announces.
//!
//! ## Merge Rules
//!
//! | Incoming row | Action |
//! |--------------|--------|
//! | unknown node | insert |
//! | `seq` greater than stored | replace |
//! | `seq` equal or lower | ignore (stale or duplicate) |
//! | our own name | ignore, but adopt a higher `seq` |
//!
//! Rows not refreshed for the row TTL are expired on the gossip tick.
//! Snapshots only include rows reachable from the local node, so rows of
//! departed nodes stop influencing routing as soon as nobody links to them.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt::Write;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::identity::NodeName;
use crate::messages::AdjacencyRow;

/// Point-in-time snapshot of the mesh: node → its direct peers (sorted).
pub type Mesh = BTreeMap<NodeName, Vec<NodeName>>;

#[derive(Debug, Clone)]
struct Row {
    seq: u64,
    peers: BTreeSet<NodeName>,
    addrs: Vec<String>,
    refreshed: Instant,
}

#[derive(Debug)]
pub struct MeshView {
    local: NodeName,
    local_seq: u64,
    local_peers: BTreeSet<NodeName>,
    local_addrs: Vec<String>,
    rows: HashMap<NodeName, Row>,
}

impl MeshView {
    pub fn new(local: NodeName, local_addrs: Vec<String>) -> Self {
        // Wall-clock seed so a restarted node's rows supersede its old ones.
        let local_seq = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            local,
            local_seq,
            local_peers: BTreeSet::new(),
            local_addrs,
            rows: HashMap::new(),
        }
    }

    /// Replace the local adjacency and bump the sequence number.
    /// Returns the row to announce.
    pub fn set_local_peers(&mut self, peers: impl IntoIterator<Item = NodeName>) -> AdjacencyRow {
        self.local_peers = peers.into_iter().collect();
        self.refresh_local()
    }

    /// Bump the local sequence number without changing the peers.
    pub fn refresh_local(&mut self) -> AdjacencyRow {
        self.local_seq += 1;
        self.local_row()
    }

    pub fn local_row(&self) -> AdjacencyRow {
        AdjacencyRow {
            node: self.local.clone(),
            seq: self.local_seq,
            peers: self.local_peers.iter().cloned().collect(),
            addrs: self.local_addrs.clone(),
        }
    }

    /// Merge a gossiped row. Returns `true` if it was new and should be
    /// re-flooded.
    pub fn merge(&mut self, row: AdjacencyRow) -> bool {
        if row.node == self.local {
            if row.seq > self.local_seq {
                self.local_seq = row.seq;
            }
            return false;
        }
        if let Some(existing) = self.rows.get(&row.node) {
            if existing.seq >= row.seq {
                return false;
            }
        }
        self.rows.insert(
            row.node,
            Row {
                seq: row.seq,
                peers: row.peers.into_iter().collect(),
                addrs: row.addrs,
                refreshed: Instant::now(),
            },
        );
        true
    }

    /// Drop rows not refreshed within `ttl`. Returns the expired names.
    pub fn expire(&mut self, ttl: Duration) -> Vec<NodeName> {
        let now = Instant::now();
        let expired: Vec<NodeName> = self
            .rows
            .iter()
            .filter(|(_, row)| now.duration_since(row.refreshed) > ttl)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &expired {
            self.rows.remove(name);
        }
        expired
    }

    /// Current rows of other nodes, for a full dump to a new peer.
    pub fn rows(&self) -> Vec<AdjacencyRow> {
        self.rows
            .iter()
            .map(|(node, row)| AdjacencyRow {
                node: node.clone(),
                seq: row.seq,
                peers: row.peers.iter().cloned().collect(),
                addrs: row.addrs.clone(),
            })
            .collect()
    }

    /// Advertised addresses of `node`, if a row for it is known.
    pub fn addrs_of(&self, node: &NodeName) -> Option<&[String]> {
        if *node == self.local {
            return Some(&self.local_addrs);
        }
        self.rows.get(node).map(|row| row.addrs.as_slice())
    }

    fn peers_of(&self, node: &NodeName) -> Option<&BTreeSet<NodeName>> {
        if *node == self.local {
            Some(&self.local_peers)
        } else {
            self.rows.get(node).map(|row| &row.peers)
        }
    }

    /// Snapshot of every row reachable from the local node.
    ///
    /// Edges count in either direction: a node whose row has not arrived
    /// yet is still present (with no peers) if a known row names it.
    pub fn snapshot(&self) -> Mesh {
        let mut mesh = Mesh::new();
        let mut queue = VecDeque::from([self.local.clone()]);
        mesh.insert(self.local.clone(), Vec::new());

        while let Some(node) = queue.pop_front() {
            let peers: Vec<NodeName> = self
                .peers_of(&node)
                .map(|p| p.iter().cloned().collect())
                .unwrap_or_default();
            for peer in &peers {
                if !mesh.contains_key(peer) {
                    mesh.insert(peer.clone(), Vec::new());
                    queue.push_back(peer.clone());
                }
            }
            mesh.insert(node, peers);
        }
        mesh
    }
}

/// Render a snapshot in Graphviz dot format.
///
/// One edge per adjacency entry; the local node is filled.
pub fn dot(mesh: &Mesh, local: &NodeName) -> String {
    let mut out = String::from("digraph meshage {\n");
    let _ = writeln!(out, "\t\"{}\" [style=filled, fillcolor=lightblue];", local);
    for (node, peers) in mesh {
        if peers.is_empty() && node != local {
            let _ = writeln!(out, "\t\"{}\";", node);
        }
        for peer in peers {
            let _ = writeln!(out, "\t\"{}\" -> \"{}\";", node, peer);
        }
    }
    out.push_str("}\n");
    out
}

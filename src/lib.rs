//! # Meshage - Command-and-Control Overlay Mesh
//!
//! Meshage lets any node in a cluster run an administrative command on one,
//! many or all other nodes without full pairwise connectivity, and collects
//! every target's response under a bounded wait.
//!
//! - **Topology**: each node keeps a bounded-degree set of QUIC peer links
//!   and floods its adjacency row so every node learns the whole mesh
//! - **Routing**: commands carry a target list and are split per first hop
//!   along shortest paths; every hop re-plans for what it carries
//! - **Aggregation**: responses are matched to requests by transaction id
//!   and collected until all targets answered or the timeout elapsed
//!
//! ## Architecture
//!
//! The codebase uses the **Actor Pattern** for shared state:
//! - The topology manager has a public Handle and a private Actor
//! - Handles are cheap to clone and communicate via async channels
//! - The actor owns all mutable state and processes commands sequentially
//!
//! ## Security Model
//!
//! Links are encrypted (QUIC/TLS 1.3) but peers are **not** authenticated:
//! any node that can reach the listener may join and issue commands. Run
//! meshage on trusted networks only.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API combining all components |
//! | `identity` | Validated node names |
//! | `config` | Node configuration and defaults |
//! | `crypto` | TLS certificates and QUIC configuration |
//! | `transport` | Peer links: handshake, framing, link state |
//! | `topology` | Peer set, degree, gossip, auto-dial (actor) |
//! | `view` | Mesh view, snapshots, graphviz rendering |
//! | `router` | First-hop planning and loop prevention |
//! | `resolver` | Recipient expression expansion |
//! | `aggregator` | Transaction ids and response collection |
//! | `dispatch` | Execution of commands routed to this node |
//! | `protocols` | Command handler trait |
//! | `cli` | Built-in command interpreter |
//! | `messages` | Serialization types for the wire protocol |

mod aggregator;
mod cli;
mod config;
mod crypto;
mod dispatch;
mod error;
mod identity;
mod messages;
mod node;
mod protocols;
mod resolver;
mod router;
mod topology;
mod transport;
mod view;

pub use aggregator::RequestResult;
pub use cli::{CliHandler, Command, MeshCommand};
pub use config::{
    DEFAULT_GOSSIP_INTERVAL, DEFAULT_MAX_HOPS, DEFAULT_PORT, DEFAULT_TIMEOUT, MeshConfig,
    local_hostname,
};
pub use error::MeshError;
pub use identity::NodeName;
pub use messages::{Response, Tid};
pub use node::Node;
pub use protocols::CommandHandler;
pub use resolver::{MAX_RECIPIENTS, expand_recipients, resolve};
pub use topology::MeshStatus;
pub use view::{Mesh, dot};

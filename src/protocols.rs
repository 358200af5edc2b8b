//! Collaborator trait definitions for the mesh.
//!
//! The mesh moves command strings and response records between nodes; what
//! a command *means* is up to the embedding application. It plugs in by
//! implementing [`CommandHandler`], which the command dispatcher invokes for
//! every command addressed to this node.
//!
//! ## Protocol Traits
//!
//! | Trait | Step | Failure |
//! |-------|------|---------|
//! | [`CommandHandler::compile`] | text → command | `MeshError::Parse`, logged and dropped |
//! | [`CommandHandler::execute`] | command → response records | `MeshError::Execution`, returned as an error record |

use async_trait::async_trait;

use crate::error::MeshError;
use crate::messages::Response;

/// Interprets and runs commands received over the mesh.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    /// Compiled form of a command.
    type Command: Send + 'static;

    /// Parse the command text exactly as the originator typed it.
    fn compile(&self, original: &str) -> Result<Self::Command, MeshError>;

    /// Run a compiled command locally.
    ///
    /// Should produce exactly one record; the dispatcher substitutes an
    /// empty record for none and keeps only the first of many. The `host`
    /// field is overwritten with the local node name.
    async fn execute(&self, command: Self::Command) -> Result<Vec<Response>, MeshError>;
}

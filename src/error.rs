//! Error kinds surfaced by the mesh.
//!
//! Dial, hangup and resolver failures are returned to the caller. Parse
//! failures of commands arriving over the mesh are only logged on the
//! receiving node; execution failures travel back inside a normal response
//! record. A target that never answers is not an error at all, it shows up
//! as a missing host in the request result.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MeshError {
    /// Dial target unreachable, self-dial, or duplicate link.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Hangup on a peer that has no live link.
    #[error("not connected to {0}")]
    NotConnected(String),

    /// Command text could not be compiled into a local command.
    #[error("invalid command: {0}")]
    Parse(String),

    /// Malformed recipient expression.
    #[error("invalid recipient expression: {0}")]
    RangeSyntax(String),

    /// Local command execution failed.
    #[error("execution failed: {0}")]
    Execution(String),

    #[error("invalid node name: {0}")]
    InvalidName(String),

    /// The node's actors have stopped.
    #[error("mesh node is shut down")]
    Shutdown,
}

//! # Command Interpreter
//!
//! The built-in [`CommandHandler`] used by the `meshage` binary, both for
//! commands typed at the local prompt and for commands arriving over the
//! mesh.
//!
//! | Command | Effect |
//! |---------|--------|
//! | `mesh degree [n]` | view or set the degree |
//! | `mesh dial <host>` | connect to another node |
//! | `mesh dot <file>` | write the topology as graphviz |
//! | `mesh hangup <host>` | drop a link |
//! | `mesh list` | adjacency list |
//! | `mesh status` | mesh size, degree, peers |
//! | `mesh timeout [secs]` | view or set the request timeout |
//! | `mesh send <recipients> <command>` | run a command on other nodes |
//! | `echo <text>` | reply with `text` |
//! | `hostname` | reply with the node name |

use std::fmt::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::error::MeshError;
use crate::messages::Response;
use crate::node::Node;
use crate::protocols::CommandHandler;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Mesh(MeshCommand),
    Echo(String),
    Hostname,
}

/// `mesh ...` subcommands. Numeric arguments are kept as typed and
/// validated on execution, so a bad value yields an error record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshCommand {
    Degree(Option<String>),
    Dial(String),
    Dot(PathBuf),
    Hangup(String),
    List,
    Status,
    Timeout(Option<String>),
    Send { recipients: String, command: String },
}

/// Split off the first whitespace-delimited word.
fn next_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(i) => (&s[..i], &s[i..]),
        None => (s, ""),
    }
}

fn parse_error(msg: impl Into<String>) -> MeshError {
    MeshError::Parse(msg.into())
}

fn optional_arg(sub: &str, rest: &str) -> Result<Option<String>, MeshError> {
    let (arg, extra) = next_word(rest);
    if !extra.trim().is_empty() {
        return Err(parse_error(format!("too many arguments to mesh {}", sub)));
    }
    Ok((!arg.is_empty()).then(|| arg.to_string()))
}

fn required_arg(sub: &str, rest: &str) -> Result<String, MeshError> {
    optional_arg(sub, rest)?
        .ok_or_else(|| parse_error(format!("mesh {} requires an argument", sub)))
}

fn no_args(sub: &str, rest: &str) -> Result<(), MeshError> {
    if rest.trim().is_empty() {
        Ok(())
    } else {
        Err(parse_error(format!("mesh {} takes no arguments", sub)))
    }
}

impl MeshCommand {
    fn parse(text: &str) -> Result<Self, MeshError> {
        let (sub, rest) = next_word(text);
        match sub {
            "degree" => Ok(Self::Degree(optional_arg(sub, rest)?)),
            "dial" => Ok(Self::Dial(required_arg(sub, rest)?)),
            "dot" => Ok(Self::Dot(PathBuf::from(required_arg(sub, rest)?))),
            "hangup" => Ok(Self::Hangup(required_arg(sub, rest)?)),
            "list" => no_args(sub, rest).map(|_| Self::List),
            "status" => no_args(sub, rest).map(|_| Self::Status),
            "timeout" => Ok(Self::Timeout(optional_arg(sub, rest)?)),
            "send" => {
                let (recipients, command) = next_word(rest);
                let command = command.trim();
                if recipients.is_empty() || command.is_empty() {
                    return Err(parse_error("usage: mesh send <recipients> <command>"));
                }
                Ok(Self::Send {
                    recipients: recipients.to_string(),
                    command: command.to_string(),
                })
            }
            "" => Err(parse_error("missing mesh subcommand")),
            other => Err(parse_error(format!("unknown mesh subcommand {:?}", other))),
        }
    }
}

impl Command {
    pub fn parse(text: &str) -> Result<Self, MeshError> {
        let (head, rest) = next_word(text);
        match head {
            "mesh" => MeshCommand::parse(rest).map(Command::Mesh),
            "echo" => Ok(Command::Echo(rest.trim().to_string())),
            "hostname" => no_args(head, rest).map(|_| Command::Hostname),
            "" => Err(parse_error("empty command")),
            other => Err(parse_error(format!("unknown command {:?}", other))),
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

fn record(node: &Node) -> Response {
    Response::new(node.name().as_str())
}

fn outcome(node: &Node, result: Result<(), MeshError>) -> Response {
    match result {
        Ok(()) => record(node),
        Err(e) => record(node).with_error(e.to_string()),
    }
}

pub async fn degree(node: &Node, arg: Option<&str>) -> Response {
    match arg {
        Some(arg) => match arg.parse::<usize>() {
            Ok(degree) => outcome(node, node.set_degree(degree).await),
            Err(e) => record(node).with_error(format!("invalid degree {:?}: {}", arg, e)),
        },
        None => match node.degree().await {
            Ok(degree) => record(node).with_body(degree.to_string()),
            Err(e) => record(node).with_error(e.to_string()),
        },
    }
}

pub async fn dial(node: &Node, host: &str) -> Response {
    outcome(node, node.dial(host).await.map(|_| ()))
}

pub async fn hangup(node: &Node, host: &str) -> Response {
    outcome(node, node.hangup(host).await)
}

pub async fn dot(node: &Node, path: &std::path::Path) -> Response {
    let graph = match node.dot().await {
        Ok(graph) => graph,
        Err(e) => return record(node).with_error(e.to_string()),
    };
    match tokio::fs::write(path, graph).await {
        Ok(()) => record(node),
        Err(e) => record(node).with_error(format!("{}: {}", path.display(), e)),
    }
}

pub async fn list(node: &Node) -> Response {
    let mesh = match node.mesh().await {
        Ok(mesh) => mesh,
        Err(e) => return record(node).with_error(e.to_string()),
    };
    let mut body = String::new();
    for (name, peers) in &mesh {
        let _ = writeln!(body, "{}", name);
        for peer in peers {
            let _ = writeln!(body, " |--{}", peer);
        }
    }
    record(node).with_body(body)
}

pub async fn status(node: &Node) -> Response {
    match node.status().await {
        Ok(status) => record(node).with_table(
            vec!["mesh size".into(), "degree".into(), "peers".into()],
            vec![vec![
                status.mesh_size.to_string(),
                status.degree.to_string(),
                status.peers.to_string(),
            ]],
        ),
        Err(e) => record(node).with_error(e.to_string()),
    }
}

pub async fn timeout(node: &Node, arg: Option<&str>) -> Response {
    match arg {
        Some(arg) => match arg.parse::<u64>() {
            Ok(secs) => {
                node.set_timeout(Duration::from_secs(secs));
                record(node)
            }
            Err(e) => record(node).with_error(format!("invalid timeout {:?}: {}", arg, e)),
        },
        None => record(node).with_body(format!("{:?}", node.timeout())),
    }
}

pub async fn send(node: &Node, recipients: &str, command: &str) -> Vec<Response> {
    match node.send(recipients, command).await {
        Ok(result) => {
            if !result.missing.is_empty() {
                warn!(
                    missing = ?result.missing.iter().map(|n| n.as_str()).collect::<Vec<_>>(),
                    "timed out waiting for responses"
                );
            }
            result.responses
        }
        Err(e) => vec![record(node).with_error(e.to_string())],
    }
}

// ============================================================================
// CommandHandler
// ============================================================================

/// Interpreter for the built-in commands, bound to one node.
pub struct CliHandler {
    node: Arc<Node>,
}

impl CliHandler {
    pub fn new(node: Arc<Node>) -> Self {
        Self { node }
    }

    /// Compile and run `text` locally, as typed at the prompt.
    pub async fn run_line(&self, text: &str) -> Vec<Response> {
        let command = match self.compile(text) {
            Ok(command) => command,
            Err(e) => return vec![record(&self.node).with_error(e.to_string())],
        };
        match self.execute(command).await {
            Ok(responses) => responses,
            Err(e) => vec![record(&self.node).with_error(e.to_string())],
        }
    }
}

#[async_trait]
impl CommandHandler for CliHandler {
    type Command = Command;

    fn compile(&self, original: &str) -> Result<Command, MeshError> {
        Command::parse(original)
    }

    async fn execute(&self, command: Command) -> Result<Vec<Response>, MeshError> {
        let node = self.node.as_ref();
        let response = match command {
            Command::Hostname => record(node).with_body(node.name().as_str()),
            Command::Echo(text) => record(node).with_body(text),
            Command::Mesh(MeshCommand::Degree(arg)) => degree(node, arg.as_deref()).await,
            Command::Mesh(MeshCommand::Dial(host)) => dial(node, &host).await,
            Command::Mesh(MeshCommand::Dot(path)) => dot(node, &path).await,
            Command::Mesh(MeshCommand::Hangup(host)) => hangup(node, &host).await,
            Command::Mesh(MeshCommand::List) => list(node).await,
            Command::Mesh(MeshCommand::Status) => status(node).await,
            Command::Mesh(MeshCommand::Timeout(arg)) => timeout(node, arg.as_deref()).await,
            Command::Mesh(MeshCommand::Send {
                recipients,
                command,
            }) => return Ok(send(node, &recipients, &command).await),
        };
        Ok(vec![response])
    }
}

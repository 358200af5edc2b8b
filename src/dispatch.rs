//! # Command Dispatcher
//!
//! Executes commands routed to this node. Each inbound command runs in its
//! own task, so a slow command never delays the next one:
//!
//! 1. `compile` the command text; a parse failure is logged and dropped
//! 2. `execute` it; an execution failure becomes the record's `error`
//! 3. route exactly one response record, stamped with the local name and
//!    the command's TID, back to the source

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::identity::NodeName;
use crate::messages::{CommandEnvelope, Payload, Response, ResponseEnvelope};
use crate::protocols::CommandHandler;
use crate::topology::Topology;

/// Commands buffered for the dispatcher before new ones are dropped.
pub const DISPATCH_QUEUE_SIZE: usize = 1024;

/// A command addressed to this node.
#[derive(Debug, Clone)]
pub struct InboundCommand {
    pub source: NodeName,
    pub command: CommandEnvelope,
}

/// Run the dispatch loop until the inbound channel closes.
pub async fn run<H: CommandHandler>(
    handler: Arc<H>,
    topology: Topology,
    mut inbound_rx: mpsc::Receiver<InboundCommand>,
) {
    while let Some(inbound) = inbound_rx.recv().await {
        let handler = handler.clone();
        let topology = topology.clone();
        tokio::spawn(async move {
            let InboundCommand { source, command } = inbound;
            let tid = command.tid;
            let Some(response) = handle(handler.as_ref(), topology.local(), command).await else {
                return;
            };
            let payload = Payload::Response(ResponseEnvelope { response, tid });
            match topology.route(vec![source.clone()], payload).await {
                Ok(unreachable) if !unreachable.is_empty() => {
                    debug!(source = %source, tid, "no route back to command source");
                }
                Ok(_) => {}
                Err(e) => debug!(tid, error = %e, "response not routed"),
            }
        });
    }
    debug!("dispatcher stopped");
}

/// Compile and execute one command, producing the single response record
/// to send back. `None` if the command did not compile.
pub(crate) async fn handle<H: CommandHandler>(
    handler: &H,
    local: &NodeName,
    command: CommandEnvelope,
) -> Option<Response> {
    let compiled = match handler.compile(&command.original) {
        Ok(compiled) => compiled,
        Err(e) => {
            error!(tid = command.tid, command = %command.original, error = %e, "dropping command");
            return None;
        }
    };

    let mut response = match handler.execute(compiled).await {
        Ok(records) => {
            if records.len() > 1 {
                error!(
                    tid = command.tid,
                    count = records.len(),
                    "command produced more than one response, keeping the first"
                );
            }
            records.into_iter().next().unwrap_or_default()
        }
        Err(e) => Response::default().with_error(e.to_string()),
    };
    response.host = local.to_string();
    Some(response)
}

//! # Response Aggregator
//!
//! Correlates incoming response envelopes with the request that caused
//! them and waits, bounded by the request timeout, until every expected
//! host answered.
//!
//! ## Delivery Rules
//!
//! - Unknown or finished TID: dropped
//! - Host not in the expected set: dropped
//! - Second response from the same host: dropped
//!
//! A [`Pending`] entry removes itself from the table when dropped, so a
//! cancelled request never leaks its slot.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{MutexGuard, mpsc};
use tracing::{debug, trace};

use crate::identity::NodeName;
use crate::messages::{Response, ResponseEnvelope, Tid};

/// Outcome of one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestResult {
    /// Responses in arrival order, at most one per host.
    pub responses: Vec<Response>,
    /// Expected hosts that did not answer in time, sorted.
    pub missing: Vec<NodeName>,
}

impl RequestResult {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

type PendingTable = Arc<Mutex<HashMap<Tid, mpsc::UnboundedSender<Response>>>>;

pub struct Aggregator {
    pending: PendingTable,
    /// Next TID. Held across allocation, resolution and routing so local
    /// issuance is serialized.
    issuer: tokio::sync::Mutex<Tid>,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregator {
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            issuer: tokio::sync::Mutex::new(rand::random()),
        }
    }

    /// Take the issuance lock.
    pub async fn issuer(&self) -> Issuer<'_> {
        Issuer {
            aggregator: self,
            next: self.issuer.lock().await,
        }
    }

    /// Hand a response to the request waiting on its TID.
    /// Returns `false` if no request is waiting.
    pub fn deliver(&self, envelope: ResponseEnvelope) -> bool {
        let table = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        match table.get(&envelope.tid) {
            Some(tx) => tx.send(envelope.response).is_ok(),
            None => {
                trace!(tid = envelope.tid, "response for unknown request dropped");
                false
            }
        }
    }

    pub fn outstanding(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Exclusive right to allocate TIDs, held while a request is issued.
pub struct Issuer<'a> {
    aggregator: &'a Aggregator,
    next: MutexGuard<'a, Tid>,
}

impl Issuer<'_> {
    /// Allocate a TID and register the hosts expected to answer.
    pub fn register(&mut self, expected: impl IntoIterator<Item = NodeName>) -> Pending {
        let mut table = self
            .aggregator
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let mut tid = *self.next;
        while table.contains_key(&tid) {
            tid = tid.wrapping_add(1);
        }
        *self.next = tid.wrapping_add(1);

        let (tx, rx) = mpsc::unbounded_channel();
        table.insert(tid, tx);
        Pending {
            tid,
            expected: expected.into_iter().collect(),
            rx,
            table: self.aggregator.pending.clone(),
        }
    }
}

/// An outstanding request. Dropping it unregisters the TID.
pub struct Pending {
    tid: Tid,
    expected: BTreeSet<NodeName>,
    rx: mpsc::UnboundedReceiver<Response>,
    table: PendingTable,
}

impl Pending {
    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn expected(&self) -> &BTreeSet<NodeName> {
        &self.expected
    }

    /// Wait until every expected host answered or `timeout` elapsed.
    pub async fn collect(mut self, timeout: Duration) -> RequestResult {
        let mut remaining = self.expected.clone();
        let mut responses = Vec::with_capacity(remaining.len());
        let deadline = tokio::time::Instant::now() + timeout;

        while !remaining.is_empty() {
            let response = match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(response)) => response,
                Ok(None) => break,
                Err(_) => {
                    debug!(
                        tid = self.tid,
                        missing = remaining.len(),
                        "request timed out"
                    );
                    break;
                }
            };
            if remaining.remove(response.host.as_str()) {
                responses.push(response);
            } else {
                trace!(tid = self.tid, host = %response.host, "unexpected or duplicate response dropped");
            }
        }

        RequestResult {
            responses,
            missing: remaining.into_iter().collect(),
        }
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        self.table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.tid);
    }
}

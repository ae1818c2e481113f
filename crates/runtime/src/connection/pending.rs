use std::collections::BTreeMap;

use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::error::ConnectionError;
use crate::protocol::{RequestId, ResponseEnvelope};

pub(crate) type Reply = oneshot::Sender<Result<ResponseEnvelope, ConnectionError>>;

/// An issued request awaiting its response or its timeout.
pub(crate) struct PendingEntry {
    pub request_id: RequestId,
    pub issued_at: Instant,
    pub target: Option<String>,
    timeout: AbortHandle,
    /// False once the channel it was sent on has gone away. Detached entries
    /// only resolve through their timeout.
    attached: bool,
    reply: Reply,
}

impl PendingEntry {
    pub fn new(
        request_id: RequestId,
        target: Option<String>,
        timeout: AbortHandle,
        reply: Reply,
    ) -> Self {
        Self {
            request_id,
            issued_at: Instant::now(),
            target,
            timeout,
            attached: true,
            reply,
        }
    }

    /// Deliver the outcome and cancel the timeout. Consumes the entry, so each
    /// request resolves at most once.
    pub fn resolve(self, outcome: Result<ResponseEnvelope, ConnectionError>) {
        self.timeout.abort();
        let _ = self.reply.send(outcome);
    }
}

/// Ordered by request id, which is also issue order.
#[derive(Default)]
pub(crate) struct PendingTable {
    entries: BTreeMap<RequestId, PendingEntry>,
}

impl PendingTable {
    pub fn insert(&mut self, entry: PendingEntry) {
        self.entries.insert(entry.request_id, entry);
    }

    pub fn remove(&mut self, request_id: RequestId) -> Option<PendingEntry> {
        self.entries.remove(&request_id)
    }

    /// Oldest entry still attached to the current channel.
    pub fn take_oldest_attached(&mut self) -> Option<PendingEntry> {
        let request_id = self
            .entries
            .values()
            .find(|entry| entry.attached)
            .map(|entry| entry.request_id)?;
        self.entries.remove(&request_id)
    }

    pub fn is_attached(&self, request_id: RequestId) -> bool {
        self.entries
            .get(&request_id)
            .is_some_and(|entry| entry.attached)
    }

    pub fn take_attached(&mut self, request_id: RequestId) -> Option<PendingEntry> {
        match self.entries.get(&request_id) {
            Some(entry) if entry.attached => self.entries.remove(&request_id),
            _ => None,
        }
    }

    /// Stop matching responses to every current entry. Returns how many were
    /// attached.
    pub fn detach_all(&mut self) -> usize {
        let mut detached = 0;
        for entry in self.entries.values_mut().filter(|entry| entry.attached) {
            entry.attached = false;
            detached += 1;
        }
        detached
    }

    pub fn target_busy(&self, target: &str) -> bool {
        self.entries
            .values()
            .any(|entry| entry.target.as_deref() == Some(target))
    }

    /// Remove everything, cancelling timeouts. Dropped replies surface as
    /// [`ConnectionError::Shutdown`] to waiters.
    pub fn clear(&mut self) {
        for entry in std::mem::take(&mut self.entries).into_values() {
            entry.timeout.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

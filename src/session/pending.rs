//! Requests that have been sent and are waiting for a reply.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::RpcError;

/// Where the outcome of a request goes.
#[derive(Debug)]
pub(crate) enum Target {
    /// A caller awaiting `Session::call`.
    Caller(oneshot::Sender<Result<Value, RpcError>>),
    /// Internal liveness probe.
    Probe,
    /// Internal volume poll for transports without push.
    VolumePoll,
}

impl Target {
    /// Deliver a failure. Internal targets have nobody to tell.
    pub(crate) fn fail(self, error: RpcError) {
        if let Target::Caller(reply) = self {
            let _ = reply.send(Err(error));
        }
    }
}

#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub(crate) id: u64,
    pub(crate) method: String,
    pub(crate) params: Value,
    pub(crate) target: Target,
    pub(crate) submitted_at: Instant,
    pub(crate) attempt: u32,
}

/// Live requests keyed by id.
///
/// Ids increase monotonically and wrap only at `u64::MAX`. An id is never
/// handed out while a request holding it is still live, and 0 is never used.
#[derive(Debug)]
pub(crate) struct PendingTable {
    next_id: u64,
    entries: HashMap<u64, PendingRequest>,
}

impl PendingTable {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 1,
            entries: HashMap::new(),
        }
    }

    pub(crate) fn allocate_id(&mut self) -> u64 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if id != 0 && !self.entries.contains_key(&id) {
                return id;
            }
        }
    }

    pub(crate) fn insert(&mut self, request: PendingRequest) {
        debug_assert!(!self.entries.contains_key(&request.id));
        self.entries.insert(request.id, request);
    }

    pub(crate) fn remove(&mut self, id: u64) -> Option<PendingRequest> {
        self.entries.remove(&id)
    }

    /// Remove and return every request older than `timeout`, oldest id first.
    pub(crate) fn take_expired(&mut self, now: Instant, timeout: Duration) -> Vec<PendingRequest> {
        let mut expired: Vec<u64> = self
            .entries
            .values()
            .filter(|r| now.saturating_duration_since(r.submitted_at) > timeout)
            .map(|r| r.id)
            .collect();
        expired.sort_unstable();
        expired
            .into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .collect()
    }

    /// Remove every request, oldest id first.
    pub(crate) fn drain(&mut self) -> Vec<PendingRequest> {
        let mut all: Vec<PendingRequest> = self.entries.drain().map(|(_, r)| r).collect();
        all.sort_unstable_by_key(|r| r.id);
        all
    }

    /// Forget probes and volume polls, keeping only caller requests.
    /// Returns how many were dropped.
    pub(crate) fn discard_internal(&mut self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, r| matches!(r.target, Target::Caller(_)));
        before - self.entries.len()
    }

    pub(crate) fn has_volume_poll(&self) -> bool {
        self.entries
            .values()
            .any(|r| matches!(r.target, Target::VolumePoll))
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

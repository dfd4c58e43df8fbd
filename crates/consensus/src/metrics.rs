//! Integer counters for the consensus core. Deterministic and allocation
//! free; the node surfaces the snapshot through its status logging.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub rounds_started: u64,
    pub rounds_accepted: u64,
    pub rounds_aborted: u64,
    pub proposals_accepted: u64,
    pub proposals_stale: u64,
    pub proposals_untrusted: u64,
    pub proposals_invalid: u64,
    pub position_changes: u64,
    pub stalls_detected: u64,
    pub peer_positions_expired: u64,
}

/// Consensus metrics collector.
#[derive(Debug, Default)]
pub struct ConsensusMetrics {
    inner: Mutex<MetricsSnapshot>,
}

impl ConsensusMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_round_started(&self) {
        self.inner.lock().rounds_started += 1;
    }

    pub fn record_round_accepted(&self) {
        self.inner.lock().rounds_accepted += 1;
    }

    pub fn record_round_aborted(&self) {
        self.inner.lock().rounds_aborted += 1;
    }

    pub fn record_proposal_accepted(&self) {
        self.inner.lock().proposals_accepted += 1;
    }

    pub fn record_proposal_stale(&self) {
        self.inner.lock().proposals_stale += 1;
    }

    pub fn record_proposal_untrusted(&self) {
        self.inner.lock().proposals_untrusted += 1;
    }

    pub fn record_proposal_invalid(&self) {
        self.inner.lock().proposals_invalid += 1;
    }

    pub fn record_position_change(&self) {
        self.inner.lock().position_changes += 1;
    }

    pub fn record_stall(&self) {
        self.inner.lock().stalls_detected += 1;
    }

    pub fn record_peer_positions_expired(&self, count: u64) {
        self.inner.lock().peer_positions_expired += count;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        *self.inner.lock()
    }
}

//! Meridian consensus core. Drives a population of validator peers to agree
//! on a sequence of ledger states: the timing oracle decides *when* to close
//! the open ledger, and the round driver decides *what* the closing ledger
//! contains — exchanging proposals, biasing toward the majority under a
//! rising threshold, and locking in once agreement is strong enough.

use serde::{Deserialize, Serialize};

pub mod cache;
pub mod driver;
pub mod engine;
pub mod metrics;
pub mod open_ledger;
pub mod round;
pub mod timing;

pub use cache::TaggedCache;
pub use driver::{ProposalDisposition, RoundDriver};
pub use engine::{
    MemoryEngine, Mutation, StaticUnl, TxEngine, UnlRegistry, ENTRY_ACCOUNT_ROOT, RESULT_UNFUNDED,
};
pub use metrics::{ConsensusMetrics, MetricsSnapshot};
pub use open_ledger::{AdmitError, OpenLedger};
pub use round::{
    inclusion_threshold_pct, preferred_close_time, PeerPosition, Position, RoundPhase, RoundState,
    RoundStats,
};
pub use timing::{
    have_consensus, have_consensus_with, should_close, should_close_with, LEDGER_IDLE_INTERVAL,
    LEDGER_MIN_CONSENSUS,
};

/// Consensus errors. Per-proposal problems are dispositions, not errors;
/// these cover round-scoped and storage-scoped failures.
#[derive(thiserror::Error, Debug)]
pub enum ConsensusError {
    #[error("a consensus round is already in progress")]
    RoundInProgress,
    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),
}

/// Consensus configuration. Defaults match the network-wide policy knobs;
/// the timing values must be stable node-to-node for close boundaries to
/// align.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Idle close cadence, seconds.
    pub ledger_idle_interval: u32,
    /// Minimum round length, seconds.
    pub ledger_min_consensus: u32,
    /// Peer positions older than this are discarded, seconds.
    pub peer_position_timeout: u32,
    /// Round age after which stall detection engages, seconds.
    pub round_stall_threshold: u32,
    /// Quiet period of no peer movement that marks a stall, seconds.
    pub stall_quiet: u32,
    /// Close-time vote granularity, seconds.
    pub close_time_resolution: u32,
    /// Verified-proposal cache: target entries and idle age.
    pub verify_cache_size: usize,
    pub verify_cache_age: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            ledger_idle_interval: timing::LEDGER_IDLE_INTERVAL,
            ledger_min_consensus: timing::LEDGER_MIN_CONSENSUS,
            peer_position_timeout: 20,
            round_stall_threshold: 20,
            stall_quiet: 5,
            close_time_resolution: 10,
            verify_cache_size: 16384,
            verify_cache_age: 90,
        }
    }
}

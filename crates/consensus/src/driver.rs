//! The consensus round driver. Runs one round at a time on a single logical
//! thread: peer threads push proposals into the inbox, the outer scheduler
//! calls `tick` at a fixed cadence, and the driver does everything else —
//! admission, bias, close-time voting, agreement detection, and closed-ledger
//! assembly.

use crate::cache::TaggedCache;
use crate::engine::{TxEngine, UnlRegistry};
use crate::metrics::ConsensusMetrics;
use crate::open_ledger::OpenLedger;
use crate::round::{
    inclusion_threshold_pct, preferred_close_time, PeerPosition, Position, RoundPhase, RoundState,
    RoundStats,
};
use crate::{timing, ConsensusConfig, ConsensusError};
use anyhow::Result;
use ed25519_dalek::SigningKey;
use meridian_meta::TransactionMetaSet;
use meridian_storage::LedgerStore;
use meridian_types::{
    round_close_time, ClosedLedger, LedgerHeader, Proposal, Seconds, Transaction, TransactionSet,
    TxMetaRecord,
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Outcome of integrating a peer proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalDisposition {
    /// Integrated as the proposer's current position.
    Accepted,
    /// Superseded, out of round, or for a different parent; dropped without
    /// error.
    Stale,
    /// Proposer not in the UNL; dropped silently, no load debit.
    Untrusted,
    /// Signature failed; the source should be debited.
    Invalid,
}

pub struct RoundDriver {
    config: ConsensusConfig,
    key: SigningKey,
    store: Arc<dyn LedgerStore>,
    engine: Arc<dyn TxEngine>,
    unl: Arc<dyn UnlRegistry>,
    open_ledger: Arc<OpenLedger>,
    metrics: Arc<ConsensusMetrics>,
    /// Memoizes signature-verified proposals by signing digest.
    verified: TaggedCache<meridian_types::Hash256, Proposal>,
    inbox_tx: mpsc::UnboundedSender<Proposal>,
    inbox_rx: mpsc::UnboundedReceiver<Proposal>,
    outbound: mpsc::UnboundedSender<Proposal>,
    round: Option<RoundState>,
    last_round: RoundStats,
    /// Trusted peers that closed their open ledger since our last close.
    closed_validators: HashSet<[u8; 32]>,
}

impl RoundDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ConsensusConfig,
        key: SigningKey,
        store: Arc<dyn LedgerStore>,
        engine: Arc<dyn TxEngine>,
        unl: Arc<dyn UnlRegistry>,
        open_ledger: Arc<OpenLedger>,
        metrics: Arc<ConsensusMetrics>,
        outbound: mpsc::UnboundedSender<Proposal>,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let verified = TaggedCache::new(
            "verified-proposals",
            config.verify_cache_size,
            config.verify_cache_age,
        );
        Self {
            config,
            key,
            store,
            engine,
            unl,
            open_ledger,
            metrics,
            verified,
            inbox_tx,
            inbox_rx,
            outbound,
            round: None,
            last_round: RoundStats::default(),
            closed_validators: HashSet::new(),
        }
    }

    /// Handle peer threads use to deliver proposals; drained at the start of
    /// each tick.
    pub fn proposal_sender(&self) -> mpsc::UnboundedSender<Proposal> {
        self.inbox_tx.clone()
    }

    pub fn phase(&self) -> Option<RoundPhase> {
        self.round.as_ref().map(|r| r.phase)
    }

    pub fn in_round(&self) -> bool {
        self.round.is_some()
    }

    pub fn last_round_stats(&self) -> RoundStats {
        self.last_round
    }

    pub fn our_position(&self) -> Option<&Position> {
        self.round.as_ref().map(|r| &r.position)
    }

    /// Record that a trusted peer closed its open ledger.
    pub fn note_peer_closed(&mut self, peer: [u8; 32]) {
        if !self.unl.is_trusted(&peer) {
            return;
        }
        match self.round.as_mut() {
            Some(round) => {
                round.closed_peers.insert(peer);
            }
            None => {
                self.closed_validators.insert(peer);
            }
        }
    }

    /// Should the open ledger close now? Consults the timing oracle with the
    /// previous round's statistics.
    pub fn should_close_now(&self, any_transactions: bool, current_open_secs: u32) -> bool {
        let target = timing::should_close_with(
            any_transactions,
            self.last_round.proposers,
            self.closed_validators.len() as u32,
            self.last_round.duration_secs,
            current_open_secs,
            self.config.ledger_idle_interval,
        );
        current_open_secs >= target
    }

    /// Begin a round: drain the candidate pool into our initial position,
    /// sign and broadcast the first proposal, and start establishing.
    pub fn start_round(&mut self, now: Seconds) -> Result<(), ConsensusError> {
        if self.round.is_some() {
            return Err(ConsensusError::RoundInProgress);
        }

        let parent = self
            .store
            .latest()
            .map_err(ConsensusError::Storage)?
            .map(|l| l.header)
            .unwrap_or_else(|| LedgerHeader::genesis(now));

        // Signatures were checked at admission; the pool is our opening set.
        let set = self.open_ledger.drain();
        let close_estimate = round_close_time(now, self.config.close_time_resolution);
        let proposal = Proposal::signed(&self.key, 0, set.root(), close_estimate, parent.hash());

        let mut state = RoundState::new(parent, Position { proposal, set }, self.last_round, now);
        state.closed_peers = std::mem::take(&mut self.closed_validators);
        // Proposals start flowing immediately.
        state.phase = RoundPhase::Establishing;

        info!(
            seq = state.parent.seq + 1,
            candidates = state.position.set.len(),
            "consensus round started"
        );
        self.metrics.record_round_started();
        let _ = self.outbound.send(state.position.proposal.clone());
        self.round = Some(state);
        Ok(())
    }

    /// Integrate a peer proposal. Trusted proposer, fresh sequence number,
    /// and a valid signature are all required; verification results are
    /// memoized by signing digest.
    pub fn apply_peer_proposal(&mut self, proposal: Proposal, now: Seconds) -> ProposalDisposition {
        if !self.unl.is_trusted(&proposal.proposer) {
            self.metrics.record_proposal_untrusted();
            debug!(proposer = %hex::encode(proposal.proposer), "untrusted proposer");
            return ProposalDisposition::Untrusted;
        }

        let Some(round) = self.round.as_mut() else {
            self.metrics.record_proposal_stale();
            return ProposalDisposition::Stale;
        };

        if proposal.parent_hash != round.parent.hash() {
            // An opinion about some other ledger.
            self.metrics.record_proposal_stale();
            return ProposalDisposition::Stale;
        }

        if let Some(existing) = round.peer_positions.get(&proposal.proposer) {
            if existing.proposal.seq >= proposal.seq {
                self.metrics.record_proposal_stale();
                return ProposalDisposition::Stale;
            }
        }

        let digest = proposal.signing_digest();
        if self.verified.fetch(&digest, now as u64).is_none() {
            if !proposal.verify() {
                self.metrics.record_proposal_invalid();
                warn!(
                    proposer = %hex::encode(proposal.proposer),
                    seq = proposal.seq,
                    "proposal signature failed"
                );
                return ProposalDisposition::Invalid;
            }
            self.verified.store(digest, proposal.clone(), now as u64);
        }

        round.peer_positions.insert(
            proposal.proposer,
            PeerPosition {
                proposal,
                received: now,
            },
        );
        round.last_position_change = now;
        self.metrics.record_proposal_accepted();
        ProposalDisposition::Accepted
    }

    /// Register the contents of a transaction set a peer proposal refers to.
    /// Until a set's contents arrive, positions naming it abstain from
    /// per-transaction voting.
    pub fn register_tx_set(&mut self, set: TransactionSet) {
        if let Some(round) = self.round.as_mut() {
            round.tx_sets.insert(set.root(), set);
        }
    }

    /// Drop the current round; used when the node falls out of sync.
    /// In-flight application work is discarded, but the candidates return to
    /// the pool for the next round.
    pub fn abort(&mut self) {
        if let Some(round) = self.round.take() {
            let candidates: Vec<Transaction> = round
                .tx_sets
                .values()
                .flat_map(|set| set.iter().cloned())
                .collect();
            self.open_ledger.restore(candidates);
            warn!("consensus round aborted");
            self.metrics.record_round_aborted();
        }
    }

    /// One driver tick: drain the inbox, expire stale positions, run the
    /// bias update, and poll the agreement predicate. Returns the closed
    /// ledger when the round completes.
    pub fn tick(&mut self, now: Seconds) -> Result<Option<ClosedLedger>> {
        let mut pending = Vec::new();
        while let Ok(proposal) = self.inbox_rx.try_recv() {
            pending.push(proposal);
        }
        for proposal in pending {
            self.apply_peer_proposal(proposal, now);
        }

        if self.round.is_none() {
            return Ok(None);
        }

        self.expire_stale_positions(now);
        self.update_position(now);

        let agreed = {
            let round = self.round.as_ref().expect("round checked above");
            let agree_secs = round.agree_secs(now);
            timing::have_consensus_with(
                round.prev_round.proposers,
                round.peer_positions.len() as u32,
                round.agree_count(),
                round.closed_peers.len() as u32,
                round.prev_round.duration_secs,
                agree_secs,
                self.config.ledger_min_consensus,
            )
        };

        if agreed {
            let mut round = self.round.take().expect("round checked above");
            round.phase = RoundPhase::Accepted;
            round.consensus_reached = true;
            let agree_secs = round.agree_secs(now);
            self.last_round = RoundStats {
                proposers: round.peer_positions.len() as u32,
                duration_secs: agree_secs,
            };

            let ledger = self.build_closed_ledger(&round);
            self.store.push_closed_ledger(ledger.clone())?;
            self.requeue_dropped(&round);

            info!(
                seq = ledger.seq(),
                transactions = ledger.tx_set.len(),
                duration = agree_secs,
                "consensus reached; ledger closed"
            );
            self.metrics.record_round_accepted();
            return Ok(Some(ledger));
        }

        self.detect_stall(now);
        Ok(None)
    }

    /// Sweep the verification cache; called by the node's sweep task.
    pub fn sweep_caches(&self, now: u64) {
        self.verified.sweep(now);
    }

    fn expire_stale_positions(&mut self, now: Seconds) {
        let timeout = self.config.peer_position_timeout;
        let round = self.round.as_mut().expect("round present");
        let before = round.peer_positions.len();
        round
            .peer_positions
            .retain(|_, pos| now.saturating_sub(pos.received) <= timeout);
        let expired = before - round.peer_positions.len();
        if expired > 0 {
            debug!(expired, "stale peer positions discarded");
            self.metrics.record_peer_positions_expired(expired as u64);
        }
    }

    /// Bias our set toward the weighted peer vote and adopt the most common
    /// close time. Any change bumps the proposal sequence and re-broadcasts.
    fn update_position(&mut self, now: Seconds) {
        let resolution = self.config.close_time_resolution;
        let round = self.round.as_mut().expect("round present");

        let threshold = inclusion_threshold_pct(round.agree_secs(now));
        let next_set = round.biased_set(threshold);
        let votes = round.close_time_votes(resolution);
        let next_close = preferred_close_time(&votes, round.position.proposal.close_time);

        let set_changed = next_set != round.position.set;
        let close_changed = next_close != round.position.proposal.close_time;
        if !set_changed && !close_changed {
            return;
        }

        let proposal = Proposal::signed(
            &self.key,
            round.position.proposal.seq + 1,
            next_set.root(),
            next_close,
            round.parent.hash(),
        );
        debug!(
            seq = proposal.seq,
            txs = next_set.len(),
            close = next_close,
            "position changed"
        );
        round.tx_sets.insert(next_set.root(), next_set.clone());
        round.position = Position {
            proposal: proposal.clone(),
            set: next_set,
        };
        self.metrics.record_position_change();
        let _ = self.outbound.send(proposal);
    }

    /// Apply the agreed set in canonical order and assemble the closed
    /// ledger. Per-transaction failures become result codes in the metadata;
    /// they never abort the round.
    fn build_closed_ledger(&self, round: &RoundState) -> ClosedLedger {
        let parent = &round.parent;
        let seq = parent.seq + 1;
        let set = &round.position.set;

        let mut metas = Vec::with_capacity(set.len());
        for (index, tx) in set.iter().enumerate() {
            let tx_index = index as u32;
            let mut meta = TransactionMetaSet::new(tx.id, seq);
            let (result, mutations) = self.engine.apply(tx, seq, tx_index);
            for mutation in mutations {
                let node = meta.affect(mutation.ledger_index, mutation.entry_type, mutation.kind);
                node.new_fields = mutation.new_fields;
                node.final_fields = mutation.final_fields;
                node.previous_fields = mutation.previous_fields;
                if let Some((prev_tx, prev_seq)) = mutation.thread {
                    node.thread(prev_tx, prev_seq);
                }
            }
            let bytes = meta.finalize(result, tx_index);
            metas.push(TxMetaRecord {
                tx_id: tx.id,
                result,
                tx_index,
                meta: bytes,
            });
        }

        let header = LedgerHeader {
            seq,
            parent_hash: parent.hash(),
            tx_set_hash: set.root(),
            account_hash: self.engine.state_root(),
            close_time: round.position.proposal.close_time,
            closed: true,
            accepted: true,
        };

        ClosedLedger {
            header,
            tx_set: set.clone(),
            metas,
        }
    }

    /// Candidates the bias dropped go back into the pool for the next round.
    /// Every registered set is scanned, our own superseded positions
    /// included.
    fn requeue_dropped(&self, round: &RoundState) {
        let final_set = &round.position.set;
        let dropped: Vec<Transaction> = round
            .tx_sets
            .values()
            .flat_map(|set| set.iter())
            .filter(|tx| !final_set.contains(&tx.id))
            .cloned()
            .collect();
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "requeueing dropped candidates");
            self.open_ledger.restore(dropped);
        }
    }

    /// Fork suspicion: the round is old, the predicate still fails, and no
    /// peer has moved. Observability signal only; the round continues.
    fn detect_stall(&mut self, now: Seconds) {
        let stall_threshold = self.config.round_stall_threshold;
        let quiet = self.config.stall_quiet;
        let round = self.round.as_mut().expect("round present");

        if round.agree_secs(now) <= stall_threshold {
            return;
        }
        if now.saturating_sub(round.last_position_change) <= quiet {
            return;
        }
        let recently_warned = round
            .last_stall_warning
            .is_some_and(|at| now.saturating_sub(at) < quiet);
        if recently_warned {
            return;
        }

        round.last_stall_warning = Some(now);
        warn!(
            age = round.agree_secs(now),
            peers = round.peer_positions.len(),
            agree = round.agree_count(),
            "round stalled; possible fork"
        );
        self.metrics.record_stall();
    }
}

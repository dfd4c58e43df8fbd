//! Per-round state. A round runs from the close signal to ledger acceptance:
//! the phase machine, our own position, the most recent proposal per peer,
//! and the close-time vote table all live here and die with the round.

use meridian_types::{Hash256, LedgerHeader, Proposal, Seconds, TransactionSet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Consensus round phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundPhase {
    /// Accepting candidate transactions; no proposals broadcast.
    Open,
    /// Proposals exchanged; our position may mutate every tick.
    Establishing,
    /// Position frozen; building the closed ledger.
    Accepted,
}

/// Statistics carried from the previous round into the next one's timing
/// decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundStats {
    pub proposers: u32,
    pub duration_secs: u32,
}

impl Default for RoundStats {
    fn default() -> Self {
        Self {
            proposers: 0,
            duration_secs: crate::timing::LEDGER_IDLE_INTERVAL,
        }
    }
}

/// Our own current proposal together with the raw set it refers to.
#[derive(Debug, Clone)]
pub struct Position {
    pub proposal: Proposal,
    pub set: TransactionSet,
}

/// A peer's most recent accepted proposal, stamped for staleness expiry.
#[derive(Debug, Clone)]
pub struct PeerPosition {
    pub proposal: Proposal,
    pub received: Seconds,
}

/// Ephemeral state for one consensus round.
pub struct RoundState {
    pub phase: RoundPhase,
    /// Header of the ledger this round builds on.
    pub parent: LedgerHeader,
    pub position: Position,
    /// Most recent accepted proposal per proposer.
    pub peer_positions: HashMap<[u8; 32], PeerPosition>,
    /// Known transaction-set contents by root hash, ours included.
    pub tx_sets: HashMap<Hash256, TransactionSet>,
    /// Trusted peers that have closed their open ledger this round.
    pub closed_peers: HashSet<[u8; 32]>,
    /// Wall-clock second the round started.
    pub round_start: Seconds,
    pub prev_round: RoundStats,
    pub consensus_reached: bool,
    /// Last wall-clock second any peer position changed; drives stall
    /// detection.
    pub last_position_change: Seconds,
    /// Last stall warning, to keep the signal rate-limited.
    pub last_stall_warning: Option<Seconds>,
}

impl RoundState {
    pub fn new(
        parent: LedgerHeader,
        position: Position,
        prev_round: RoundStats,
        now: Seconds,
    ) -> Self {
        let mut tx_sets = HashMap::new();
        tx_sets.insert(position.proposal.tx_set_hash, position.set.clone());
        Self {
            phase: RoundPhase::Open,
            parent,
            position,
            peer_positions: HashMap::new(),
            tx_sets,
            closed_peers: HashSet::new(),
            round_start: now,
            prev_round,
            consensus_reached: false,
            last_position_change: now,
            last_stall_warning: None,
        }
    }

    /// Seconds this round has been trying to agree.
    pub fn agree_secs(&self, now: Seconds) -> u32 {
        now.saturating_sub(self.round_start)
    }

    /// Peers whose current position matches ours, by set hash.
    pub fn agree_count(&self) -> u32 {
        let ours = self.position.proposal.tx_set_hash;
        self.peer_positions
            .values()
            .filter(|p| p.proposal.tx_set_hash == ours)
            .count() as u32
    }

    /// Every transaction id named by our position or any registered peer
    /// set, deduplicated and in ascending order.
    pub fn candidate_ids(&self) -> BTreeSet<Hash256> {
        let mut ids: BTreeSet<Hash256> = self.position.set.ids().copied().collect();
        for peer in self.peer_positions.values() {
            if let Some(set) = self.tx_sets.get(&peer.proposal.tx_set_hash) {
                ids.extend(set.ids().copied());
            }
        }
        ids
    }

    /// Recompute our transaction set from the current snapshot of peer
    /// positions under the given inclusion threshold. Peers whose set
    /// contents are unknown abstain. Order-independent: only the snapshot
    /// matters.
    pub fn biased_set(&self, threshold_pct: u32) -> TransactionSet {
        let mut voters = 0u32;
        let mut votes: BTreeMap<Hash256, u32> = BTreeMap::new();
        for peer in self.peer_positions.values() {
            let Some(set) = self.tx_sets.get(&peer.proposal.tx_set_hash) else {
                continue;
            };
            voters += 1;
            for id in set.ids() {
                *votes.entry(*id).or_insert(0) += 1;
            }
        }

        let mut next = TransactionSet::new();
        for id in self.candidate_ids() {
            let include = if voters == 0 {
                // No information; keep our own opinion.
                self.position.set.contains(&id)
            } else {
                let yes = votes.get(&id).copied().unwrap_or(0);
                yes * 100 > threshold_pct * voters
            };
            if include {
                if let Some(tx) = self.lookup_tx(&id) {
                    next.insert(tx.clone());
                }
            }
        }
        next
    }

    fn lookup_tx(&self, id: &Hash256) -> Option<&meridian_types::Transaction> {
        if let Some(tx) = self.position.set.get(id) {
            return Some(tx);
        }
        self.tx_sets.values().find_map(|set| set.get(id))
    }

    /// Close-time votes of current trusted peer positions, bucketed by the
    /// given resolution.
    pub fn close_time_votes(&self, resolution: Seconds) -> BTreeMap<Seconds, u32> {
        let mut votes = BTreeMap::new();
        for peer in self.peer_positions.values() {
            let bucket = meridian_types::round_close_time(peer.proposal.close_time, resolution);
            *votes.entry(bucket).or_insert(0u32) += 1;
        }
        votes
    }
}

/// Inclusion threshold (percent) for the bias update, escalating with the
/// round's agreement age so positions converge.
pub fn inclusion_threshold_pct(agree_secs: u32) -> u32 {
    if agree_secs < 6 {
        50
    } else if agree_secs < 12 {
        60
    } else if agree_secs < 18 {
        70
    } else {
        80
    }
}

/// The most common close-time vote; ties break toward the lower value. With
/// no votes, the fallback wins.
pub fn preferred_close_time(votes: &BTreeMap<Seconds, u32>, fallback: Seconds) -> Seconds {
    let mut best: Option<(Seconds, u32)> = None;
    for (&time, &count) in votes {
        match best {
            // Strictly-greater keeps the earliest time on a tie: the map
            // iterates in ascending key order.
            Some((_, best_count)) if count <= best_count => {}
            _ => best = Some((time, count)),
        }
    }
    best.map(|(time, _)| time).unwrap_or(fallback)
}

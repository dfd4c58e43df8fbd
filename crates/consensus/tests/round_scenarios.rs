//! End-to-end consensus round scenarios: idle closes, convergence under
//! peer pressure, close-time adoption, proposal supersession, stall
//! detection, and the shape of the resulting closed ledgers.

use ed25519_dalek::SigningKey;
use meridian_consensus::{
    ConsensusConfig, ConsensusMetrics, MemoryEngine, OpenLedger, ProposalDisposition, RoundDriver,
    RoundPhase, StaticUnl,
};
use meridian_meta::TransactionMetaSet;
use meridian_storage::{LedgerStore, MemoryLedgerStore};
use meridian_types::{
    ClosedLedger, Hash256, LedgerHeader, Proposal, Transaction, TransactionSet,
};
use std::sync::Arc;
use tokio::sync::mpsc;

struct Harness {
    driver: RoundDriver,
    outbound: mpsc::UnboundedReceiver<Proposal>,
    store: Arc<MemoryLedgerStore>,
    pool: Arc<OpenLedger>,
    metrics: Arc<ConsensusMetrics>,
    peers: Vec<SigningKey>,
    parent: LedgerHeader,
}

fn signed_tx(seed: u8, fee: u64) -> Transaction {
    let key = SigningKey::from_bytes(&[seed; 32]);
    let mut tx = Transaction::new(key.verifying_key().to_bytes(), 1, fee);
    tx.sign(&key).expect("sign test transaction");
    tx
}

fn harness(peer_count: usize) -> Harness {
    let peers: Vec<SigningKey> = (0..peer_count)
        .map(|i| SigningKey::from_bytes(&[100 + i as u8; 32]))
        .collect();
    let unl = StaticUnl::new(peers.iter().map(|k| k.verifying_key().to_bytes()));

    let store = Arc::new(MemoryLedgerStore::new());
    let parent = LedgerHeader::genesis(500);
    store
        .push_closed_ledger(ClosedLedger {
            header: parent.clone(),
            tx_set: TransactionSet::new(),
            metas: Vec::new(),
        })
        .expect("seed genesis");

    let pool = Arc::new(OpenLedger::new());
    let metrics = Arc::new(ConsensusMetrics::new());
    let (outbound_tx, outbound) = mpsc::unbounded_channel();
    let driver = RoundDriver::new(
        ConsensusConfig::default(),
        SigningKey::from_bytes(&[42u8; 32]),
        store.clone(),
        Arc::new(MemoryEngine::default()),
        Arc::new(unl),
        pool.clone(),
        metrics.clone(),
        outbound_tx,
    );

    Harness {
        driver,
        outbound,
        store,
        pool,
        metrics,
        peers,
        parent,
    }
}

fn peer_proposal(h: &Harness, peer: usize, seq: u32, set: &TransactionSet, close: u32) -> Proposal {
    Proposal::signed(&h.peers[peer], seq, set.root(), close, h.parent.hash())
}

#[test]
fn idle_round_closes_an_empty_ledger() {
    let mut h = harness(0);

    assert!(h.driver.should_close_now(false, 15));
    assert!(!h.driver.should_close_now(false, 14));

    h.driver.start_round(1000).unwrap();
    assert_eq!(h.driver.phase(), Some(RoundPhase::Establishing));

    // Under the minimum round length: no consensus yet.
    assert!(h.driver.tick(1002).unwrap().is_none());

    let ledger = h.driver.tick(1003).unwrap().expect("round should close");
    assert_eq!(ledger.seq(), 1);
    assert!(ledger.tx_set.is_empty());
    assert_eq!(ledger.header.parent_hash, h.parent.hash());
    assert!(!h.driver.in_round());
    assert_eq!(h.store.latest().unwrap().unwrap().seq(), 1);
}

#[test]
fn round_converges_toward_the_peer_majority() {
    let mut h = harness(4);

    let shared = signed_tx(1, 10);
    let local_only = signed_tx(2, 10);
    h.pool.add_candidate(shared.clone()).unwrap();
    h.pool.add_candidate(local_only.clone()).unwrap();

    h.driver.start_round(2000).unwrap();
    // Initial proposal covers the whole pool.
    let initial = h.outbound.try_recv().expect("initial proposal");
    assert_eq!(initial.seq, 0);

    let peer_set: TransactionSet = vec![shared.clone()].into_iter().collect();
    h.driver.register_tx_set(peer_set.clone());
    for peer in 0..4 {
        let p = peer_proposal(&h, peer, 1, &peer_set, 2000);
        assert_eq!(
            h.driver.apply_peer_proposal(p, 2001),
            ProposalDisposition::Accepted
        );
    }

    // The bias drops the unsupported transaction and re-proposes.
    assert!(h.driver.tick(2001).unwrap().is_none());
    let revised = h.outbound.try_recv().expect("revised proposal");
    assert_eq!(revised.seq, 1);
    assert_eq!(revised.tx_set_hash, peer_set.root());

    // Past the minimum round length, 4-of-4 agreement closes the ledger.
    let ledger = h.driver.tick(2003).unwrap().expect("consensus");
    assert_eq!(ledger.tx_set.len(), 1);
    assert!(ledger.tx_set.contains(&shared.id));
    assert!(!ledger.tx_set.contains(&local_only.id));

    // The dropped candidate goes back into the pool for the next round.
    assert!(h.pool.contains(&local_only.id));
}

#[test]
fn closed_ledger_metadata_is_ordered_and_round_trips() {
    let mut h = harness(0);

    let txs: Vec<Transaction> = vec![signed_tx(1, 10), signed_tx(2, 20), signed_tx(3, 30)];
    for tx in &txs {
        h.pool.add_candidate(tx.clone()).unwrap();
    }

    h.driver.start_round(3000).unwrap();
    let ledger = h.driver.tick(3003).unwrap().expect("consensus");
    assert_eq!(ledger.metas.len(), 3);

    // Application order is ascending by transaction id.
    let applied: Vec<Hash256> = ledger.metas.iter().map(|m| m.tx_id).collect();
    let mut sorted = applied.clone();
    sorted.sort();
    assert_eq!(applied, sorted);

    for (index, record) in ledger.metas.iter().enumerate() {
        assert_eq!(record.tx_index, index as u32);
        assert_eq!(record.result, 0);
        let mut parsed =
            TransactionMetaSet::deserialize(record.tx_id, ledger.seq(), &record.meta)
                .expect("stored metadata parses");
        assert_eq!(parsed.finalize(record.result, record.tx_index), record.meta);
    }
}

#[test]
fn later_proposals_supersede_earlier_ones() {
    let mut h = harness(1);
    h.driver.start_round(4000).unwrap();

    let set = TransactionSet::new();
    let newer = peer_proposal(&h, 0, 2, &set, 4000);
    let older = peer_proposal(&h, 0, 1, &set, 4000);

    assert_eq!(
        h.driver.apply_peer_proposal(newer.clone(), 4001),
        ProposalDisposition::Accepted
    );
    // A lower sequence from the same proposer arriving late is discarded.
    assert_eq!(
        h.driver.apply_peer_proposal(older, 4001),
        ProposalDisposition::Stale
    );
    // So is a replay of the same sequence.
    assert_eq!(
        h.driver.apply_peer_proposal(newer, 4002),
        ProposalDisposition::Stale
    );
}

#[test]
fn untrusted_and_invalid_proposals_are_rejected() {
    let mut h = harness(1);
    h.driver.start_round(5000).unwrap();

    let set = TransactionSet::new();
    let stranger = SigningKey::from_bytes(&[77u8; 32]);
    let outsider = Proposal::signed(&stranger, 1, set.root(), 5000, h.parent.hash());
    assert_eq!(
        h.driver.apply_peer_proposal(outsider, 5001),
        ProposalDisposition::Untrusted
    );

    let mut forged = peer_proposal(&h, 0, 1, &set, 5000);
    forged.close_time = 5010;
    assert_eq!(
        h.driver.apply_peer_proposal(forged, 5001),
        ProposalDisposition::Invalid
    );
    assert_eq!(h.metrics.snapshot().proposals_invalid, 1);
}

#[test]
fn proposals_for_another_parent_are_stale() {
    let mut h = harness(1);
    h.driver.start_round(6000).unwrap();

    let set = TransactionSet::new();
    let elsewhere = Proposal::signed(&h.peers[0], 1, set.root(), 6000, Hash256([9u8; 32]));
    assert_eq!(
        h.driver.apply_peer_proposal(elsewhere, 6001),
        ProposalDisposition::Stale
    );
}

#[test]
fn close_time_voting_adopts_the_majority_and_breaks_ties_low() {
    let mut h = harness(4);
    h.driver.start_round(7000).unwrap();

    let set = h.driver.our_position().unwrap().set.clone();
    h.driver.register_tx_set(set.clone());

    // Two votes for 7010, one for 7000; ours starts at 7000.
    for (peer, close) in [(0usize, 7010u32), (1, 7010), (2, 7000)] {
        let p = peer_proposal(&h, peer, 1, &set, close);
        assert_eq!(
            h.driver.apply_peer_proposal(p, 7001),
            ProposalDisposition::Accepted
        );
    }
    h.driver.tick(7001).unwrap();
    assert_eq!(h.driver.our_position().unwrap().proposal.close_time, 7010);

    // A fourth vote for 7000 ties the buckets; the lower time wins.
    let p = peer_proposal(&h, 3, 1, &set, 7000);
    assert_eq!(
        h.driver.apply_peer_proposal(p, 7002),
        ProposalDisposition::Accepted
    );
    h.driver.tick(7002).unwrap();
    assert_eq!(h.driver.our_position().unwrap().proposal.close_time, 7000);
}

#[test]
fn quiet_old_rounds_raise_a_stall_signal_once() {
    let mut h = harness(1);
    h.driver.start_round(0).unwrap();

    let foreign_set: TransactionSet = vec![signed_tx(9, 10)].into_iter().collect();
    let p1 = peer_proposal(&h, 0, 1, &foreign_set, 0);
    assert_eq!(
        h.driver.apply_peer_proposal(p1, 1),
        ProposalDisposition::Accepted
    );
    let p2 = peer_proposal(&h, 0, 2, &foreign_set, 0);
    assert_eq!(
        h.driver.apply_peer_proposal(p2, 16),
        ProposalDisposition::Accepted
    );

    // Age 22 > 20, no peer movement for 6 > 5 seconds: stall, exactly once.
    assert!(h.driver.tick(22).unwrap().is_none());
    assert_eq!(h.metrics.snapshot().stalls_detected, 1);
    assert!(h.driver.tick(23).unwrap().is_none());
    assert_eq!(h.metrics.snapshot().stalls_detected, 1);
    // The round survives the stall.
    assert!(h.driver.in_round());
}

#[test]
fn stale_peer_positions_expire() {
    let mut h = harness(1);
    h.driver.start_round(0).unwrap();

    let set = TransactionSet::new();
    let p = peer_proposal(&h, 0, 1, &set, 0);
    assert_eq!(
        h.driver.apply_peer_proposal(p, 1),
        ProposalDisposition::Accepted
    );

    h.driver.tick(22).unwrap();
    assert_eq!(h.metrics.snapshot().peer_positions_expired, 1);
}

#[test]
fn inbox_proposals_are_drained_on_tick() {
    let mut h = harness(1);
    h.driver.start_round(8000).unwrap();

    let set = TransactionSet::new();
    let sender = h.driver.proposal_sender();
    sender.send(peer_proposal(&h, 0, 1, &set, 8000)).unwrap();

    h.driver.tick(8001).unwrap();
    assert_eq!(h.metrics.snapshot().proposals_accepted, 1);
}

#[test]
fn aborted_rounds_leave_no_ledger_behind() {
    let mut h = harness(0);
    h.pool.add_candidate(signed_tx(1, 10)).unwrap();
    h.driver.start_round(9000).unwrap();
    assert!(h.driver.start_round(9000).is_err());

    h.driver.abort();
    assert!(!h.driver.in_round());
    assert_eq!(h.store.latest().unwrap().unwrap().seq(), 0);
    assert_eq!(h.metrics.snapshot().rounds_aborted, 1);

    // A fresh round can start after the abort.
    h.driver.start_round(9010).unwrap();
    assert!(h.driver.in_round());
}

#[test]
fn consecutive_rounds_build_a_hash_linked_chain() {
    let mut h = harness(0);

    h.pool.add_candidate(signed_tx(1, 10)).unwrap();
    h.driver.start_round(1000).unwrap();
    let first = h.driver.tick(1003).unwrap().expect("first close");

    h.pool.add_candidate(signed_tx(2, 10)).unwrap();
    h.driver.start_round(1020).unwrap();
    let second = h.driver.tick(1023).unwrap().expect("second close");

    assert_eq!(first.seq(), 1);
    assert_eq!(second.seq(), 2);
    assert_eq!(second.header.parent_hash, first.hash());
    assert_eq!(
        h.driver.last_round_stats().duration_secs,
        3,
    );
}

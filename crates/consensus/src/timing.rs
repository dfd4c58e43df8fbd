//! Continuous ledger timing. Two pure functions over integers decide when
//! the open ledger should close and whether the current round has converged.
//! Both are stateless and deterministic; every honest node evaluating them
//! over the same inputs reaches the same answer, which is what lets close
//! boundaries line up across the network.

/// Seconds a ledger stays open when the network is idle. Must be stable
/// node-to-node so the synchronisation rounding below can align.
pub const LEDGER_IDLE_INTERVAL: u32 = 15;

/// Minimum seconds a round must run before consensus can be declared.
pub const LEDGER_MIN_CONSENSUS: u32 = 2;

/// How many seconds the ledger should stay open. The caller closes once the
/// wall clock reaches the returned target.
///
/// `prev_open_secs` is how long the previous ledger was open;
/// `current_open_secs` is how long the current one has been.
pub fn should_close(
    any_transactions: bool,
    prev_proposers: u32,
    proposers_closed: u32,
    prev_open_secs: u32,
    current_open_secs: u32,
) -> u32 {
    should_close_with(
        any_transactions,
        prev_proposers,
        proposers_closed,
        prev_open_secs,
        current_open_secs,
        LEDGER_IDLE_INTERVAL,
    )
}

/// `should_close` with an explicit idle interval, for nodes configured off
/// the default cadence.
pub fn should_close_with(
    any_transactions: bool,
    prev_proposers: u32,
    proposers_closed: u32,
    prev_open_secs: u32,
    current_open_secs: u32,
    idle_interval: u32,
) -> u32 {
    if !any_transactions {
        // No transactions this interval.
        if proposers_closed > prev_proposers / 4 {
            // Peers are closing without us; we probably missed a transaction.
            return current_open_secs;
        }
        if prev_open_secs > idle_interval + 2 {
            // The last ledger was slow to close; accelerate.
            return prev_open_secs - 1;
        }
        return idle_interval;
    }

    if prev_open_secs == idle_interval {
        // Coming out of idle, close on the first transaction.
        return current_open_secs;
    }

    // When the network is slow, align close boundaries to coarser intervals.
    if prev_open_secs > 8 {
        return current_open_secs - current_open_secs % 4;
    }
    if prev_open_secs > 4 {
        return current_open_secs - current_open_secs % 2;
    }

    current_open_secs
}

/// Whether the round has converged. Once this returns true, every honest
/// node is expected to already hold what it needs to accept the result; our
/// vote is locked in.
///
/// Proposer counts exclude the local node; the `+1`/`±100` terms fold it
/// into the tallies (included on the agreement side, excluded on the
/// closed-peer side).
pub fn have_consensus(
    prev_proposers: u32,
    cur_proposers: u32,
    cur_agree: u32,
    cur_closed: u32,
    prev_agree_secs: u32,
    cur_agree_secs: u32,
) -> bool {
    have_consensus_with(
        prev_proposers,
        cur_proposers,
        cur_agree,
        cur_closed,
        prev_agree_secs,
        cur_agree_secs,
        LEDGER_MIN_CONSENSUS,
    )
}

/// `have_consensus` with an explicit minimum round length.
#[allow(clippy::too_many_arguments)]
pub fn have_consensus_with(
    prev_proposers: u32,
    cur_proposers: u32,
    cur_agree: u32,
    cur_closed: u32,
    prev_agree_secs: u32,
    cur_agree_secs: u32,
    min_consensus: u32,
) -> bool {
    if cur_agree_secs <= min_consensus {
        return false;
    }

    if cur_proposers < prev_proposers * 3 / 4 {
        // Proposer population shrank; give stragglers extra time.
        if cur_agree_secs < prev_agree_secs + 2 {
            return false;
        }
    }

    // 80% of current proposers (plus us) agree on a set.
    if (cur_agree as i64 * 100 + 100) / (cur_proposers as i64 + 1) > 80 {
        return true;
    }

    // Over half of the others have closed; we should close too.
    if (cur_closed as i64 * 100 - 100) / (cur_proposers as i64 + 1) > 50 {
        return true;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn idle_network_closes_on_the_idle_cadence() {
        assert_eq!(should_close(false, 10, 0, 10, 15), 15);
    }

    #[test]
    fn peers_closing_without_us_forces_immediate_close() {
        assert_eq!(should_close(false, 10, 3, 10, 6), 6);
        // A quarter of the previous proposers is not enough.
        assert_eq!(should_close(false, 12, 3, 10, 6), 15);
    }

    #[test]
    fn slow_previous_round_steps_down() {
        assert_eq!(should_close(false, 10, 0, 20, 4), 19);
        // Exactly idle + 2 does not trigger the step-down.
        assert_eq!(should_close(false, 10, 0, 17, 4), 15);
    }

    #[test]
    fn first_transaction_out_of_idle_closes_now() {
        assert_eq!(should_close(true, 10, 0, LEDGER_IDLE_INTERVAL, 3), 3);
    }

    #[test]
    fn slow_network_aligns_close_boundaries() {
        assert_eq!(should_close(true, 10, 0, 9, 7), 4);
        assert_eq!(should_close(true, 10, 0, 9, 8), 8);
        assert_eq!(should_close(true, 10, 0, 5, 7), 6);
        assert_eq!(should_close(true, 10, 0, 5, 8), 8);
    }

    #[test]
    fn fast_network_closes_immediately() {
        assert_eq!(should_close(true, 10, 0, 4, 7), 7);
    }

    #[test]
    fn consensus_requires_minimum_time() {
        // At exactly the minimum, not past it.
        assert!(!have_consensus(10, 10, 10, 0, 10, LEDGER_MIN_CONSENSUS));
        assert!(have_consensus(10, 10, 10, 0, 10, 3));
    }

    #[test]
    fn shrunken_population_needs_reassurance_time() {
        // 12 proposers is below 3/4 of 20.
        assert!(!have_consensus(20, 12, 11, 6, 10, 11));
        assert!(have_consensus(20, 12, 11, 6, 10, 12));
    }

    #[test]
    fn closed_peer_majority_forces_consensus() {
        // 4 of 8 agree (below 80%); 5 closed peers is not enough...
        assert!(!have_consensus(8, 8, 4, 5, 6, 3));
        // ...but 6 closed peers is: (600 - 100) / 9 = 55 > 50.
        assert!(have_consensus(8, 8, 4, 6, 6, 3));
    }

    #[test]
    fn no_closed_peers_does_not_underflow() {
        assert!(!have_consensus(8, 8, 0, 0, 6, 30));
    }

    proptest! {
        #[test]
        fn have_consensus_is_monotone_in_agreement(
            prev_proposers in 0u32..50,
            cur_proposers in 0u32..50,
            cur_agree in 0u32..50,
            cur_closed in 0u32..50,
            prev_agree_secs in 0u32..60,
            cur_agree_secs in 0u32..60,
            agree_bump in 0u32..10,
            time_bump in 0u32..10,
        ) {
            let base = have_consensus(
                prev_proposers, cur_proposers, cur_agree,
                cur_closed, prev_agree_secs, cur_agree_secs,
            );
            let bumped = have_consensus(
                prev_proposers, cur_proposers, cur_agree + agree_bump,
                cur_closed, prev_agree_secs, cur_agree_secs + time_bump,
            );
            // Once reached, consensus cannot be lost by more agreement or
            // more elapsed time.
            prop_assert!(!base || bumped);
        }
    }
}

//! Adaptive fee multiplier. Two fixed-point scale factors — one driven by
//! local load, one reported by the network — determine how far observed
//! transaction fees are scaled above the base fee.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Baseline scale factor; a factor of `NORMAL_FEE` means no scaling.
pub const NORMAL_FEE: u32 = 256;
/// Upper bound on either scale factor.
pub const FEE_MAX: u32 = NORMAL_FEE * 1_000_000;
/// Default escalation step: raise or lower by 1/16.
pub const DEFAULT_ESCALATION_FRACTION: u32 = 16;

/// Snapshot of the current fee factors for logging and status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeStatus {
    pub local: u32,
    pub remote: u32,
    pub factor: u32,
}

#[derive(Debug)]
struct FeeState {
    local_txn_load_fee: u32,
    remote_txn_load_fee: u32,
}

/// Tracks the node's fee/load schedule. All operations are constant-time
/// under the tracker's own mutex.
pub struct FeeTracker {
    escalation_fraction: u32,
    state: Mutex<FeeState>,
}

impl Default for FeeTracker {
    fn default() -> Self {
        Self::new(DEFAULT_ESCALATION_FRACTION)
    }
}

impl FeeTracker {
    pub fn new(escalation_fraction: u32) -> Self {
        Self {
            escalation_fraction: escalation_fraction.max(1),
            state: Mutex::new(FeeState {
                local_txn_load_fee: NORMAL_FEE,
                remote_txn_load_fee: NORMAL_FEE,
            }),
        }
    }

    /// Raise the local factor by one escalation step. Returns true if the
    /// value changed.
    pub fn raise_local_fee(&self) -> bool {
        let mut state = self.state.lock();
        let current = state.local_txn_load_fee;
        let step = (current / self.escalation_fraction).max(1);
        let next = current.saturating_add(step).min(FEE_MAX);
        state.local_txn_load_fee = next;
        if next != current {
            debug!(from = current, to = next, "local fee factor raised");
        }
        next != current
    }

    /// Lower the local factor by one escalation step, clamped at the normal
    /// fee. Returns true if the value changed.
    pub fn lower_local_fee(&self) -> bool {
        let mut state = self.state.lock();
        let current = state.local_txn_load_fee;
        let step = (current / self.escalation_fraction).max(1);
        let next = current.saturating_sub(step).max(NORMAL_FEE);
        state.local_txn_load_fee = next;
        if next != current {
            debug!(from = current, to = next, "local fee factor lowered");
        }
        next != current
    }

    /// Replace the network-reported factor.
    pub fn set_remote_fee(&self, factor: u32) {
        self.state.lock().remote_txn_load_fee = factor.min(FEE_MAX);
    }

    pub fn local_fee(&self) -> u32 {
        self.state.lock().local_txn_load_fee
    }

    pub fn remote_fee(&self) -> u32 {
        self.state.lock().remote_txn_load_fee
    }

    /// Effective scale factor: the larger of the local and remote factors.
    /// The local factor never drops below `NORMAL_FEE`, so neither does the
    /// result.
    pub fn load_factor(&self) -> u32 {
        let state = self.state.lock();
        state.local_txn_load_fee.max(state.remote_txn_load_fee)
    }

    pub fn status(&self) -> FeeStatus {
        let state = self.state.lock();
        FeeStatus {
            local: state.local_txn_load_fee,
            remote: state.remote_txn_load_fee,
            factor: state.local_txn_load_fee.max(state.remote_txn_load_fee),
        }
    }

    /// Scale a fee from fee units to drops of the base fee, rounding down.
    pub fn scale_fee_base(&self, fee: u64, base_fee: u64, reference_fee_units: u32) -> u64 {
        mul_div(fee, base_fee, reference_fee_units as u64)
    }

    /// Scale a fee by the base rate and the current load factor.
    pub fn scale_fee_load(&self, fee: u64, base_fee: u64, reference_fee_units: u32) -> u64 {
        let base = self.scale_fee_base(fee, base_fee, reference_fee_units);
        mul_div(base, self.load_factor() as u64, NORMAL_FEE as u64)
    }
}

/// `value * mul / div` with a 128-bit intermediate, saturating to `u64::MAX`
/// when the result no longer fits.
fn mul_div(value: u64, mul: u64, div: u64) -> u64 {
    if div == 0 {
        return u64::MAX;
    }
    let product = value as u128 * mul as u128;
    let scaled = product / div as u128;
    u64::try_from(scaled).unwrap_or(u64::MAX)
}

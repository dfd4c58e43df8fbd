//! The open ledger's candidate pool. Transactions accumulate here between
//! closes; the round driver drains the pool into its initial position when
//! the timing oracle says to close.

use meridian_types::{Hash256, Transaction, TransactionSet};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

/// Why a candidate was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitError {
    /// Signature did not verify; the submitting source should be debited.
    BadSignature,
    /// Already in the pool.
    Duplicate,
}

#[derive(Default)]
struct Inner {
    txs: HashMap<Hash256, Transaction>,
}

/// Thread-safe candidate pool. Signatures are checked at admission so the
/// drain into a round's initial position needs no re-verification.
#[derive(Default)]
pub struct OpenLedger {
    inner: RwLock<Inner>,
}

impl OpenLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a candidate transaction.
    pub fn add_candidate(&self, tx: Transaction) -> Result<(), AdmitError> {
        if !tx.verify_signature() {
            return Err(AdmitError::BadSignature);
        }
        let mut inner = self.inner.write();
        if inner.txs.contains_key(&tx.id) {
            return Err(AdmitError::Duplicate);
        }
        debug!(tx = %tx.id, "candidate admitted");
        inner.txs.insert(tx.id, tx);
        Ok(())
    }

    pub fn contains(&self, id: &Hash256) -> bool {
        self.inner.read().txs.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().txs.is_empty()
    }

    /// Move every candidate out of the pool into a transaction set.
    pub fn drain(&self) -> TransactionSet {
        let mut inner = self.inner.write();
        inner.txs.drain().map(|(_, tx)| tx).collect()
    }

    /// Re-admit transactions that consensus dropped from the closing ledger;
    /// they are candidates for the next one.
    pub fn restore(&self, txs: impl IntoIterator<Item = Transaction>) {
        let mut inner = self.inner.write();
        for tx in txs {
            inner.txs.entry(tx.id).or_insert(tx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;

    fn signed(seed: u8) -> Transaction {
        let key = SigningKey::from_bytes(&[seed; 32]);
        let mut tx = Transaction::new(key.verifying_key().to_bytes(), 1, 10);
        tx.sign(&key).expect("sign");
        tx
    }

    #[test]
    fn admits_valid_and_rejects_duplicates() {
        let pool = OpenLedger::new();
        let tx = signed(1);
        assert_eq!(pool.add_candidate(tx.clone()), Ok(()));
        assert_eq!(pool.add_candidate(tx), Err(AdmitError::Duplicate));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn rejects_bad_signatures() {
        let pool = OpenLedger::new();
        let mut tx = signed(1);
        tx.fee_units = 99;
        assert_eq!(pool.add_candidate(tx), Err(AdmitError::BadSignature));
        assert!(pool.is_empty());
    }

    #[test]
    fn drain_empties_the_pool() {
        let pool = OpenLedger::new();
        pool.add_candidate(signed(1)).unwrap();
        pool.add_candidate(signed(2)).unwrap();
        let set = pool.drain();
        assert_eq!(set.len(), 2);
        assert!(pool.is_empty());
    }

    #[test]
    fn restore_requeues_dropped_transactions() {
        let pool = OpenLedger::new();
        let tx = signed(3);
        pool.restore(vec![tx.clone()]);
        assert!(pool.contains(&tx.id));
    }
}

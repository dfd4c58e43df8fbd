use crate::hash::Hash256;
use crate::transaction::Transaction;
use blake3::Hasher as Blake3;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An unordered set of candidate transactions keyed by id. Equality is by
/// membership; the externally visible identity is the merkle root over the
/// sorted ids.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionSet {
    txs: BTreeMap<Hash256, Transaction>,
}

impl TransactionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a transaction; returns false if the id was already present.
    pub fn insert(&mut self, tx: Transaction) -> bool {
        self.txs.insert(tx.id, tx).is_none()
    }

    pub fn remove(&mut self, id: &Hash256) -> Option<Transaction> {
        self.txs.remove(id)
    }

    pub fn contains(&self, id: &Hash256) -> bool {
        self.txs.contains_key(id)
    }

    pub fn get(&self, id: &Hash256) -> Option<&Transaction> {
        self.txs.get(id)
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    /// Ids in ascending order — the canonical application order.
    pub fn ids(&self) -> impl Iterator<Item = &Hash256> {
        self.txs.keys()
    }

    /// Transactions in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &Transaction> {
        self.txs.values()
    }

    /// Merkle root over the sorted transaction ids. The empty set hashes to
    /// zero.
    pub fn root(&self) -> Hash256 {
        let ids: Vec<Hash256> = self.txs.keys().copied().collect();
        merkle_root(&ids)
    }
}

impl FromIterator<Transaction> for TransactionSet {
    fn from_iter<I: IntoIterator<Item = Transaction>>(iter: I) -> Self {
        let mut set = TransactionSet::new();
        for tx in iter {
            set.insert(tx);
        }
        set
    }
}

/// Pairwise merkle root over 32-byte leaves; an odd tail node is paired with
/// itself.
pub fn merkle_root(items: &[Hash256]) -> Hash256 {
    if items.is_empty() {
        return Hash256::ZERO;
    }
    if items.len() == 1 {
        return items[0];
    }

    let mut current: Vec<Hash256> = items.to_vec();
    while current.len() > 1 {
        let mut next = Vec::with_capacity(current.len().div_ceil(2));
        for chunk in current.chunks(2) {
            let left = chunk[0];
            let right = if chunk.len() == 2 { chunk[1] } else { chunk[0] };
            let mut hasher = Blake3::new();
            hasher.update(left.as_bytes());
            hasher.update(right.as_bytes());
            next.push(Hash256::from_hasher(hasher));
        }
        current = next;
    }
    current[0]
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
    fn root_ignores_insertion_order() {
        let (a, b, c) = (signed(1), signed(2), signed(3));
        let fwd: TransactionSet = vec![a.clone(), b.clone(), c.clone()].into_iter().collect();
        let rev: TransactionSet = vec![c, b, a].into_iter().collect();
        assert_eq!(fwd, rev);
        assert_eq!(fwd.root(), rev.root());
    }

    #[test]
    fn empty_set_has_zero_root() {
        assert_eq!(TransactionSet::new().root(), Hash256::ZERO);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut set = TransactionSet::new();
        let tx = signed(4);
        assert!(set.insert(tx.clone()));
        assert!(!set.insert(tx));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn membership_changes_the_root() {
        let mut set: TransactionSet = vec![signed(1)].into_iter().collect();
        let before = set.root();
        set.insert(signed(2));
        assert_ne!(before, set.root());
    }
}

//! Ledger store abstraction. The consensus core consumes this interface; the
//! on-disk database behind it belongs to another subsystem. An in-memory
//! backend is provided for the node's standalone mode and for tests.

use anyhow::Result;
use meridian_types::{ClosedLedger, Hash256};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Storage errors.
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("ledger {0} already stored with different content")]
    Conflict(Hash256),
    #[error("ledger seq {0} does not extend the chain tip {1}")]
    BrokenChain(u32, u32),
}

/// Abstract ledger store. Implementations must apply `push_closed_ledger`
/// transactionally: either every index sees the ledger or none does.
pub trait LedgerStore: Send + Sync {
    fn ledger_by_hash(&self, hash: &Hash256) -> Result<Option<ClosedLedger>>;
    fn ledger_by_seq(&self, seq: u32) -> Result<Option<ClosedLedger>>;
    fn push_closed_ledger(&self, ledger: ClosedLedger) -> Result<()>;
    /// Highest-sequence closed ledger, if any.
    fn latest(&self) -> Result<Option<ClosedLedger>>;
}

#[derive(Default)]
struct MemoryInner {
    by_hash: HashMap<Hash256, ClosedLedger>,
    by_seq: BTreeMap<u32, Hash256>,
}

/// In-memory ledger store.
#[derive(Default)]
pub struct MemoryLedgerStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().by_seq.is_empty()
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn ledger_by_hash(&self, hash: &Hash256) -> Result<Option<ClosedLedger>> {
        Ok(self.inner.read().by_hash.get(hash).cloned())
    }

    fn ledger_by_seq(&self, seq: u32) -> Result<Option<ClosedLedger>> {
        let inner = self.inner.read();
        Ok(inner
            .by_seq
            .get(&seq)
            .and_then(|hash| inner.by_hash.get(hash))
            .cloned())
    }

    fn push_closed_ledger(&self, ledger: ClosedLedger) -> Result<()> {
        let hash = ledger.hash();
        let seq = ledger.seq();
        let mut inner = self.inner.write();
        if let Some(existing) = inner.by_hash.get(&hash) {
            if *existing != ledger {
                return Err(StorageError::Conflict(hash).into());
            }
            return Ok(());
        }
        if let Some((tip_seq, _)) = inner.by_seq.iter().next_back() {
            if seq != tip_seq + 1 {
                return Err(StorageError::BrokenChain(seq, *tip_seq).into());
            }
        }
        inner.by_seq.insert(seq, hash);
        inner.by_hash.insert(hash, ledger);
        debug!(seq, %hash, "closed ledger stored");
        Ok(())
    }

    fn latest(&self) -> Result<Option<ClosedLedger>> {
        let inner = self.inner.read();
        Ok(inner
            .by_seq
            .iter()
            .next_back()
            .and_then(|(_, hash)| inner.by_hash.get(hash))
            .cloned())
    }
}

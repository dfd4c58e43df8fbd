use crate::hash::Hash256;
use crate::txset::TransactionSet;
use crate::Seconds;
use blake3::Hasher as Blake3;
use serde::{Deserialize, Serialize};
use serde_bytes;

/// Hash-linked ledger header. The consensus core holds references to the
/// previous closed ledger and the ledger being built; ledger storage itself
/// lives behind the `LedgerStore` trait.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerHeader {
    /// Sequence number; the parent's plus one.
    pub seq: u32,
    /// Hash of the parent ledger header.
    pub parent_hash: Hash256,
    /// Root of the transaction set applied in this ledger.
    pub tx_set_hash: Hash256,
    /// Account-state root after applying the transaction set.
    pub account_hash: Hash256,
    /// Agreed close time, rounded to the close-time resolution.
    pub close_time: Seconds,
    /// No further transactions may enter this ledger.
    pub closed: bool,
    /// Consensus validated this ledger.
    pub accepted: bool,
}

impl LedgerHeader {
    /// Genesis header: sequence zero with no parent.
    pub fn genesis(close_time: Seconds) -> Self {
        Self {
            seq: 0,
            parent_hash: Hash256::ZERO,
            tx_set_hash: Hash256::ZERO,
            account_hash: Hash256::ZERO,
            close_time,
            closed: true,
            accepted: true,
        }
    }

    /// Canonical header hash over a fixed byte preimage. Flags are excluded:
    /// they describe the local lifecycle, not ledger content.
    pub fn hash(&self) -> Hash256 {
        let mut hasher = Blake3::new();
        hasher.update(b"ledger");
        hasher.update(&self.seq.to_be_bytes());
        hasher.update(self.parent_hash.as_bytes());
        hasher.update(self.tx_set_hash.as_bytes());
        hasher.update(self.account_hash.as_bytes());
        hasher.update(&self.close_time.to_be_bytes());
        Hash256::from_hasher(hasher)
    }
}

/// Serialized transaction metadata, as stored alongside a closed ledger. The
/// byte layout is protocol-canonical and must round-trip bit-exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxMetaRecord {
    pub tx_id: Hash256,
    pub result: u8,
    pub tx_index: u32,
    #[serde(with = "serde_bytes")]
    pub meta: Vec<u8>,
}

/// A closed ledger: header, the agreed transaction set, and one metadata
/// record per applied transaction in application order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClosedLedger {
    pub header: LedgerHeader,
    pub tx_set: TransactionSet,
    pub metas: Vec<TxMetaRecord>,
}

impl ClosedLedger {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn seq(&self) -> u32 {
        self.header.seq
    }
}

/// Round a close time down to the given resolution. A zero resolution leaves
/// the time untouched.
pub fn round_close_time(time: Seconds, resolution: Seconds) -> Seconds {
    if resolution == 0 {
        return time;
    }
    time - time % resolution
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_hash_covers_content_not_flags() {
        let mut header = LedgerHeader::genesis(100);
        let base = header.hash();
        header.accepted = false;
        assert_eq!(header.hash(), base);
        header.seq = 1;
        assert_ne!(header.hash(), base);
    }

    #[test]
    fn genesis_links_to_zero() {
        let genesis = LedgerHeader::genesis(0);
        assert_eq!(genesis.parent_hash, Hash256::ZERO);
        assert!(genesis.closed && genesis.accepted);
    }

    #[test]
    fn close_time_rounds_down() {
        assert_eq!(round_close_time(107, 10), 100);
        assert_eq!(round_close_time(100, 10), 100);
        assert_eq!(round_close_time(55, 0), 55);
    }
}

//! Canonical Meridian data types. Aggregates the hash and account primitives,
//! ledger headers, candidate transactions, transaction sets, and consensus
//! proposals so the rest of the node uses a single crate for the shared data
//! model.

pub mod amount;
pub mod hash;
pub mod ledger;
pub mod proposal;
pub mod transaction;
pub mod txset;

pub use amount::Amount;
pub use hash::{AccountId, Hash256, ParseHashError};
pub use ledger::{round_close_time, ClosedLedger, LedgerHeader, TxMetaRecord};
pub use proposal::Proposal;
pub use transaction::Transaction;
pub use txset::TransactionSet;

/// Wall-clock seconds since the Unix epoch, as carried in ledger headers and
/// close-time votes.
pub type Seconds = u32;

//! External collaborators consumed by the round driver: the trusted
//! validator registry and the transaction state engine. Reference
//! implementations back the node's standalone mode and the test suites.

use meridian_meta::{codec::field, codec::FieldValue, FieldMap, NodeKind};
use meridian_types::{AccountId, Amount, Hash256, Transaction};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

/// Ledger entry type for an account root.
pub const ENTRY_ACCOUNT_ROOT: u16 = 1;

/// Result code for a transaction whose funding account cannot cover it.
pub const RESULT_UNFUNDED: u8 = 101;

/// The set of validators this node trusts.
pub trait UnlRegistry: Send + Sync {
    fn is_trusted(&self, proposer: &[u8; 32]) -> bool;
    fn trusted_count(&self) -> usize;
}

/// Fixed trusted-validator set.
#[derive(Debug, Default)]
pub struct StaticUnl {
    trusted: HashSet<[u8; 32]>,
}

impl StaticUnl {
    pub fn new(trusted: impl IntoIterator<Item = [u8; 32]>) -> Self {
        Self {
            trusted: trusted.into_iter().collect(),
        }
    }
}

impl UnlRegistry for StaticUnl {
    fn is_trusted(&self, proposer: &[u8; 32]) -> bool {
        self.trusted.contains(proposer)
    }

    fn trusted_count(&self) -> usize {
        self.trusted.len()
    }
}

/// One ledger-entry mutation produced by applying a transaction.
#[derive(Debug, Clone)]
pub struct Mutation {
    pub ledger_index: Hash256,
    pub entry_type: u16,
    pub kind: NodeKind,
    pub new_fields: FieldMap,
    pub final_fields: FieldMap,
    pub previous_fields: FieldMap,
    /// Prior transaction thread for this entry, when it already has history.
    pub thread: Option<(Hash256, u32)>,
}

/// The transaction state engine. Applying a transaction yields its result
/// code and the ledger-entry mutations it caused; what a transaction *means*
/// is decided here, outside the consensus core.
pub trait TxEngine: Send + Sync {
    fn verify_signature(&self, tx: &Transaction) -> bool;
    fn apply(&self, tx: &Transaction, ledger_seq: u32, tx_index: u32) -> (u8, Vec<Mutation>);
    /// Account-state root after the applications so far.
    fn state_root(&self) -> Hash256;
}

#[derive(Debug, Clone)]
struct AccountEntry {
    balance: u64,
    last_txn: Option<(Hash256, u32)>,
}

#[derive(Debug, Default)]
struct EngineState {
    entries: HashMap<Hash256, AccountEntry>,
    root: Hash256,
}

/// In-memory state engine: one account-root entry per account, debited by
/// fee. Enough behavior to exercise metadata assembly and threading without
/// a real transaction processor.
pub struct MemoryEngine {
    starting_balance: u64,
    state: Mutex<EngineState>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new(1_000_000)
    }
}

impl MemoryEngine {
    pub fn new(starting_balance: u64) -> Self {
        Self {
            starting_balance,
            state: Mutex::new(EngineState::default()),
        }
    }

    /// Deterministic ledger index of an account's root entry.
    pub fn account_index(account: &AccountId) -> Hash256 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"account-root");
        hasher.update(account.as_bytes());
        Hash256::from_hasher(hasher)
    }

    pub fn balance(&self, account: &AccountId) -> Option<u64> {
        let state = self.state.lock();
        state
            .entries
            .get(&Self::account_index(account))
            .map(|e| e.balance)
    }
}

impl TxEngine for MemoryEngine {
    fn verify_signature(&self, tx: &Transaction) -> bool {
        tx.verify_signature()
    }

    fn apply(&self, tx: &Transaction, ledger_seq: u32, _tx_index: u32) -> (u8, Vec<Mutation>) {
        let mut state = self.state.lock();
        let index = Self::account_index(&tx.account);

        let result;
        let mutation = match state.entries.get_mut(&index) {
            Some(entry) => {
                let previous_balance = entry.balance;
                let thread = entry.last_txn;
                if entry.balance < tx.fee_units {
                    result = RESULT_UNFUNDED;
                } else {
                    entry.balance -= tx.fee_units;
                    result = 0;
                }
                entry.last_txn = Some((tx.id, ledger_seq));

                let mut final_fields = FieldMap::new();
                final_fields.insert(field::ACCOUNT, FieldValue::Account(tx.account));
                final_fields.insert(
                    field::BALANCE,
                    FieldValue::Amount(Amount::native(entry.balance)),
                );
                let mut previous_fields = FieldMap::new();
                previous_fields.insert(
                    field::BALANCE,
                    FieldValue::Amount(Amount::native(previous_balance)),
                );
                Mutation {
                    ledger_index: index,
                    entry_type: ENTRY_ACCOUNT_ROOT,
                    kind: NodeKind::Modified,
                    new_fields: FieldMap::new(),
                    final_fields,
                    previous_fields,
                    thread,
                }
            }
            None => {
                result = 0;
                let balance = self.starting_balance.saturating_sub(tx.fee_units);
                state.entries.insert(
                    index,
                    AccountEntry {
                        balance,
                        last_txn: Some((tx.id, ledger_seq)),
                    },
                );
                let mut new_fields = FieldMap::new();
                new_fields.insert(field::ACCOUNT, FieldValue::Account(tx.account));
                new_fields.insert(field::BALANCE, FieldValue::Amount(Amount::native(balance)));
                Mutation {
                    ledger_index: index,
                    entry_type: ENTRY_ACCOUNT_ROOT,
                    kind: NodeKind::Created,
                    new_fields,
                    final_fields: FieldMap::new(),
                    previous_fields: FieldMap::new(),
                    thread: None,
                }
            }
        };

        // Fold the application into the running state root.
        let mut hasher = blake3::Hasher::new();
        hasher.update(state.root.as_bytes());
        hasher.update(tx.id.as_bytes());
        state.root = Hash256::from_hasher(hasher);

        (result, vec![mutation])
    }

    fn state_root(&self) -> Hash256 {
        self.state.lock().root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;

    fn signed(seed: u8, fee: u64) -> Transaction {
        let key = SigningKey::from_bytes(&[seed; 32]);
        let mut tx = Transaction::new(key.verifying_key().to_bytes(), 1, fee);
        tx.sign(&key).expect("sign");
        tx
    }

    #[test]
    fn first_application_creates_the_account_root() {
        let engine = MemoryEngine::default();
        let tx = signed(1, 10);
        let (result, mutations) = engine.apply(&tx, 1, 0);
        assert_eq!(result, 0);
        assert_eq!(mutations.len(), 1);
        assert_eq!(mutations[0].kind, NodeKind::Created);
        assert!(mutations[0].thread.is_none());
        assert_eq!(engine.balance(&tx.account), Some(999_990));
    }

    #[test]
    fn second_application_modifies_and_threads() {
        let engine = MemoryEngine::default();
        let first = signed(1, 10);
        let second = signed(1, 20);
        engine.apply(&first, 1, 0);
        let (result, mutations) = engine.apply(&second, 2, 0);
        assert_eq!(result, 0);
        assert_eq!(mutations[0].kind, NodeKind::Modified);
        assert_eq!(mutations[0].thread, Some((first.id, 1)));
    }

    #[test]
    fn unfunded_transaction_reports_a_result_code() {
        let engine = MemoryEngine::new(5);
        let tx = signed(1, 10);
        engine.apply(&tx, 1, 0);
        let (result, _) = engine.apply(&signed(1, 10), 2, 1);
        assert_eq!(result, RESULT_UNFUNDED);
    }

    #[test]
    fn state_root_tracks_applications() {
        let engine = MemoryEngine::default();
        let before = engine.state_root();
        engine.apply(&signed(1, 10), 1, 0);
        assert_ne!(engine.state_root(), before);
    }
}

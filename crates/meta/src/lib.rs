//! Transaction metadata assembly. A `TransactionMetaSet` is the canonical
//! record of which ledger entries a transaction touched, serialised into a
//! binary form that must round-trip bit-exactly: it is stored alongside the
//! ledger and hashed into history.

use meridian_types::{AccountId, Hash256};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub mod codec;

use codec::{field, FieldValue, Reader, Writer};

/// Metadata errors. Parse failures are local to the affected transaction and
/// never abort a consensus round.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum MetaError {
    #[error("malformed metadata: {0}")]
    MalformedMetadata(&'static str),
}

/// How a transaction touched a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Created,
    Modified,
    Deleted,
}

impl NodeKind {
    fn code(self) -> u8 {
        match self {
            NodeKind::Created => field::CREATED_NODE,
            NodeKind::Modified => field::MODIFIED_NODE,
            NodeKind::Deleted => field::DELETED_NODE,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            field::CREATED_NODE => Some(NodeKind::Created),
            field::MODIFIED_NODE => Some(NodeKind::Modified),
            field::DELETED_NODE => Some(NodeKind::Deleted),
            _ => None,
        }
    }
}

/// Scalar fields keyed by field code; the BTreeMap keeps them in canonical
/// (ascending-code) order for serialisation.
pub type FieldMap = BTreeMap<u8, FieldValue>;

/// One ledger entry affected by a transaction: its index, entry type, the
/// kind of mutation, and the before/after field subsets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffectedNode {
    pub ledger_index: Hash256,
    pub entry_type: u16,
    pub kind: NodeKind,
    /// Fields of a freshly created entry.
    pub new_fields: FieldMap,
    /// Fields after the mutation.
    pub final_fields: FieldMap,
    /// Prior values of the fields the mutation changed.
    pub previous_fields: FieldMap,
    pub previous_txn_id: Option<Hash256>,
    pub previous_txn_lgr_seq: Option<u32>,
}

impl AffectedNode {
    fn new(ledger_index: Hash256, entry_type: u16, kind: NodeKind) -> Self {
        Self {
            ledger_index,
            entry_type,
            kind,
            new_fields: FieldMap::new(),
            final_fields: FieldMap::new(),
            previous_fields: FieldMap::new(),
            previous_txn_id: None,
            previous_txn_lgr_seq: None,
        }
    }

    /// Record the entry's transaction thread. The first call stores the
    /// reference and returns true; later calls must agree with the stored
    /// values and return false.
    pub fn thread(&mut self, prev_tx_id: Hash256, prev_ledger_seq: u32) -> bool {
        if self.previous_txn_id.is_none() {
            debug_assert!(self.previous_txn_lgr_seq.is_none());
            self.previous_txn_id = Some(prev_tx_id);
            self.previous_txn_lgr_seq = Some(prev_ledger_seq);
            return true;
        }
        debug_assert_eq!(self.previous_txn_id, Some(prev_tx_id));
        debug_assert_eq!(self.previous_txn_lgr_seq, Some(prev_ledger_seq));
        false
    }

    fn serialize(&self, w: &mut Writer) {
        w.begin(self.kind.code());
        // Fields in ascending code order keeps the object canonical.
        w.scalar(field::LEDGER_ENTRY_TYPE, &FieldValue::U16(self.entry_type));
        if let Some(seq) = self.previous_txn_lgr_seq {
            w.scalar(field::PREVIOUS_TXN_LGR_SEQ, &FieldValue::U32(seq));
        }
        w.scalar(field::LEDGER_INDEX, &FieldValue::Hash(self.ledger_index));
        if let Some(id) = self.previous_txn_id {
            w.scalar(field::PREVIOUS_TXN_ID, &FieldValue::Hash(id));
        }
        Self::serialize_field_map(w, field::NEW_FIELDS, &self.new_fields);
        Self::serialize_field_map(w, field::FINAL_FIELDS, &self.final_fields);
        Self::serialize_field_map(w, field::PREVIOUS_FIELDS, &self.previous_fields);
        w.end();
    }

    fn serialize_field_map(w: &mut Writer, code: u8, map: &FieldMap) {
        if map.is_empty() {
            return;
        }
        w.begin(code);
        for (field_code, value) in map {
            w.scalar(*field_code, value);
        }
        w.end();
    }

    fn deserialize(r: &mut Reader<'_>, kind: NodeKind) -> Result<Self, MetaError> {
        let mut node = AffectedNode::new(Hash256::ZERO, 0, kind);
        let mut saw_index = false;
        loop {
            let code = r.code()?;
            match code {
                field::END => break,
                field::LEDGER_ENTRY_TYPE => node.entry_type = r.u16()?,
                field::PREVIOUS_TXN_LGR_SEQ => node.previous_txn_lgr_seq = Some(r.u32()?),
                field::LEDGER_INDEX => {
                    node.ledger_index = r.hash()?;
                    saw_index = true;
                }
                field::PREVIOUS_TXN_ID => node.previous_txn_id = Some(r.hash()?),
                field::NEW_FIELDS => node.new_fields = Self::deserialize_field_map(r)?,
                field::FINAL_FIELDS => node.final_fields = Self::deserialize_field_map(r)?,
                field::PREVIOUS_FIELDS => node.previous_fields = Self::deserialize_field_map(r)?,
                _ => return Err(MetaError::MalformedMetadata("unexpected field in node")),
            }
        }
        if !saw_index {
            return Err(MetaError::MalformedMetadata("node missing ledger index"));
        }
        Ok(node)
    }

    fn deserialize_field_map(r: &mut Reader<'_>) -> Result<FieldMap, MetaError> {
        let mut map = FieldMap::new();
        loop {
            let code = r.code()?;
            if code == field::END {
                return Ok(map);
            }
            map.insert(code, r.scalar(code)?);
        }
    }
}

/// Canonical post-application record for one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionMetaSet {
    tx_id: Hash256,
    ledger_seq: u32,
    result: u8,
    tx_index: u32,
    nodes: Vec<AffectedNode>,
}

impl TransactionMetaSet {
    /// Empty metadata set for the given transaction and ledger.
    pub fn new(tx_id: Hash256, ledger_seq: u32) -> Self {
        Self {
            tx_id,
            ledger_seq,
            result: 0,
            tx_index: 0,
            nodes: Vec::new(),
        }
    }

    pub fn tx_id(&self) -> Hash256 {
        self.tx_id
    }

    pub fn ledger_seq(&self) -> u32 {
        self.ledger_seq
    }

    pub fn result(&self) -> u8 {
        self.result
    }

    pub fn tx_index(&self) -> u32 {
        self.tx_index
    }

    pub fn nodes(&self) -> &[AffectedNode] {
        &self.nodes
    }

    pub fn is_node_affected(&self, ledger_index: &Hash256) -> bool {
        self.nodes.iter().any(|n| n.ledger_index == *ledger_index)
    }

    /// Make sure `ledger_index` is in the set and force its kind and entry
    /// type. Idempotent: a second call for the same index updates the
    /// existing entry rather than appending.
    pub fn affect(
        &mut self,
        ledger_index: Hash256,
        entry_type: u16,
        kind: NodeKind,
    ) -> &mut AffectedNode {
        if let Some(pos) = self
            .nodes
            .iter()
            .position(|n| n.ledger_index == ledger_index)
        {
            let node = &mut self.nodes[pos];
            node.kind = kind;
            node.entry_type = entry_type;
            return node;
        }
        self.nodes.push(AffectedNode::new(ledger_index, entry_type, kind));
        self.nodes.last_mut().expect("just pushed")
    }

    /// Look up a node previously added with `affect`.
    pub fn node_mut(&mut self, ledger_index: &Hash256) -> Option<&mut AffectedNode> {
        self.nodes
            .iter_mut()
            .find(|n| n.ledger_index == *ledger_index)
    }

    /// Accounts touched by this metadata: every account-valued field in the
    /// new/final field subsets, plus the issuer of any limit or offer-leg
    /// amount with a nonzero issuer.
    pub fn affected_accounts(&self) -> BTreeSet<AccountId> {
        let mut accounts = BTreeSet::new();
        for node in &self.nodes {
            for map in [&node.new_fields, &node.final_fields] {
                for (code, value) in map.iter() {
                    match value {
                        FieldValue::Account(account) => {
                            accounts.insert(*account);
                        }
                        FieldValue::Amount(amount)
                            if matches!(
                                *code,
                                field::LOW_LIMIT
                                    | field::HIGH_LIMIT
                                    | field::TAKER_PAYS
                                    | field::TAKER_GETS
                            ) =>
                        {
                            if let Some(issuer) = amount.issuer_account() {
                                accounts.insert(issuer);
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
        accounts
    }

    /// Freeze the set: record the result code and transaction index, sort the
    /// affected nodes ascending by ledger index, and serialise.
    pub fn finalize(&mut self, result: u8, tx_index: u32) -> Vec<u8> {
        debug_assert!(result == 0 || result >= 100);
        self.result = result;
        self.tx_index = tx_index;
        self.nodes.sort_by(|a, b| a.ledger_index.cmp(&b.ledger_index));

        let mut w = Writer::new();
        w.begin(field::TRANSACTION_META_DATA);
        w.scalar(field::TRANSACTION_RESULT, &FieldValue::U8(self.result));
        w.scalar(field::TRANSACTION_INDEX, &FieldValue::U32(self.tx_index));
        w.begin(field::AFFECTED_NODES);
        for node in &self.nodes {
            node.serialize(&mut w);
        }
        w.end();
        w.end();
        w.into_bytes()
    }

    /// Parse a serialised metadata set.
    pub fn deserialize(
        tx_id: Hash256,
        ledger_seq: u32,
        bytes: &[u8],
    ) -> Result<Self, MetaError> {
        let mut r = Reader::new(bytes);
        if r.code()? != field::TRANSACTION_META_DATA {
            return Err(MetaError::MalformedMetadata("outer object absent"));
        }

        let mut result = None;
        let mut tx_index = None;
        let mut nodes = None;
        loop {
            let code = r.code()?;
            match code {
                field::END => break,
                field::TRANSACTION_RESULT => result = Some(r.u8()?),
                field::TRANSACTION_INDEX => tx_index = Some(r.u32()?),
                field::AFFECTED_NODES => nodes = Some(Self::deserialize_nodes(&mut r)?),
                _ => return Err(MetaError::MalformedMetadata("unexpected field in metadata")),
            }
        }
        if !r.is_exhausted() {
            return Err(MetaError::MalformedMetadata("trailing bytes"));
        }

        Ok(Self {
            tx_id,
            ledger_seq,
            result: result.ok_or(MetaError::MalformedMetadata("missing result"))?,
            tx_index: tx_index.ok_or(MetaError::MalformedMetadata("missing index"))?,
            nodes: nodes.ok_or(MetaError::MalformedMetadata("missing affected nodes"))?,
        })
    }

    fn deserialize_nodes(r: &mut Reader<'_>) -> Result<Vec<AffectedNode>, MetaError> {
        let mut nodes = Vec::new();
        loop {
            let code = r.code()?;
            if code == field::END {
                return Ok(nodes);
            }
            let kind = NodeKind::from_code(code)
                .ok_or(MetaError::MalformedMetadata("bad node discriminator"))?;
            nodes.push(AffectedNode::deserialize(r, kind)?);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_types::Amount;
    use proptest::prelude::*;

    fn sample_set() -> TransactionMetaSet {
        let mut meta = TransactionMetaSet::new(Hash256([7u8; 32]), 42);

        let created = meta.affect(Hash256([0xAA; 32]), 3, NodeKind::Created);
        created
            .new_fields
            .insert(field::ACCOUNT, FieldValue::Account(AccountId([1u8; 32])));
        created
            .new_fields
            .insert(field::BALANCE, FieldValue::Amount(Amount::native(1000)));

        let modified = meta.affect(Hash256([0x11; 32]), 1, NodeKind::Modified);
        modified
            .final_fields
            .insert(field::BALANCE, FieldValue::Amount(Amount::native(900)));
        modified
            .previous_fields
            .insert(field::BALANCE, FieldValue::Amount(Amount::native(1000)));
        modified.thread(Hash256([2u8; 32]), 41);

        let deleted = meta.affect(Hash256([0x55; 32]), 5, NodeKind::Deleted);
        deleted.final_fields.insert(
            field::LOW_LIMIT,
            FieldValue::Amount(Amount::issued(0, AccountId([9u8; 32]))),
        );

        meta
    }

    #[test]
    fn affect_is_idempotent() {
        let mut meta = TransactionMetaSet::new(Hash256([1u8; 32]), 1);
        let index = Hash256([4u8; 32]);
        meta.affect(index, 1, NodeKind::Created);
        meta.affect(index, 2, NodeKind::Modified);
        assert_eq!(meta.nodes().len(), 1);
        assert_eq!(meta.nodes()[0].entry_type, 2);
        assert_eq!(meta.nodes()[0].kind, NodeKind::Modified);
    }

    #[test]
    fn thread_sets_once_then_reports_existing() {
        let mut meta = TransactionMetaSet::new(Hash256([1u8; 32]), 5);
        let node = meta.affect(Hash256([4u8; 32]), 1, NodeKind::Modified);
        assert!(node.thread(Hash256([8u8; 32]), 4));
        assert!(!node.thread(Hash256([8u8; 32]), 4));
        assert_eq!(node.previous_txn_id, Some(Hash256([8u8; 32])));
        assert_eq!(node.previous_txn_lgr_seq, Some(4));
    }

    #[test]
    fn finalize_sorts_nodes_by_ledger_index() {
        let mut meta = sample_set();
        let bytes = meta.finalize(0, 3);
        let parsed = TransactionMetaSet::deserialize(meta.tx_id(), 42, &bytes).unwrap();
        let indices: Vec<Hash256> = parsed.nodes().iter().map(|n| n.ledger_index).collect();
        assert_eq!(
            indices,
            vec![
                Hash256([0x11; 32]),
                Hash256([0x55; 32]),
                Hash256([0xAA; 32])
            ]
        );
    }

    #[test]
    fn round_trip_is_bit_exact() {
        let mut meta = sample_set();
        let bytes = meta.finalize(0, 3);
        let mut parsed = TransactionMetaSet::deserialize(meta.tx_id(), 42, &bytes).unwrap();
        assert_eq!(parsed.finalize(0, 3), bytes);
    }

    #[test]
    fn affected_accounts_includes_fields_and_issuers() {
        let meta = sample_set();
        let accounts = meta.affected_accounts();
        assert!(accounts.contains(&AccountId([1u8; 32])));
        assert!(accounts.contains(&AccountId([9u8; 32])));
        assert_eq!(accounts.len(), 2);
    }

    #[test]
    fn deserialize_rejects_wrong_outer_object() {
        let mut w = Writer::new();
        w.begin(field::AFFECTED_NODES);
        w.end();
        let err = TransactionMetaSet::deserialize(Hash256::ZERO, 1, &w.into_bytes());
        assert_eq!(
            err,
            Err(MetaError::MalformedMetadata("outer object absent"))
        );
    }

    #[test]
    fn deserialize_rejects_truncation() {
        let mut meta = sample_set();
        let bytes = meta.finalize(0, 3);
        for cut in [1usize, bytes.len() / 2, bytes.len() - 1] {
            assert!(TransactionMetaSet::deserialize(Hash256::ZERO, 1, &bytes[..cut]).is_err());
        }
    }

    fn arbitrary_node() -> impl Strategy<Value = (Hash256, u16, u8, u64, Option<u32>)> {
        (
            prop::array::uniform32(any::<u8>()),
            any::<u16>(),
            0u8..3,
            any::<u64>(),
            prop::option::of(any::<u32>()),
        )
            .prop_map(|(index, entry_type, kind, balance, thread_seq)| {
                (Hash256(index), entry_type, kind, balance, thread_seq)
            })
    }

    proptest! {
        #[test]
        fn round_trip_law_holds(
            nodes in prop::collection::vec(arbitrary_node(), 0..12),
            result in prop_oneof![Just(0u8), 100u8..=255],
            tx_index in any::<u32>(),
        ) {
            let mut meta = TransactionMetaSet::new(Hash256([3u8; 32]), 9);
            for (index, entry_type, kind_idx, balance, thread_seq) in nodes {
                let kind = match kind_idx {
                    0 => NodeKind::Created,
                    1 => NodeKind::Modified,
                    _ => NodeKind::Deleted,
                };
                let node = meta.affect(index, entry_type, kind);
                node.final_fields
                    .insert(field::BALANCE, FieldValue::Amount(Amount::native(balance)));
                if let Some(seq) = thread_seq {
                    node.thread(Hash256([6u8; 32]), seq);
                }
            }

            let bytes = meta.finalize(result, tx_index);
            let mut parsed =
                TransactionMetaSet::deserialize(meta.tx_id(), 9, &bytes).unwrap();
            prop_assert_eq!(parsed.finalize(result, tx_index), bytes);

            // Serialised nodes are sorted ascending by ledger index.
            let indices: Vec<Hash256> =
                parsed.nodes().iter().map(|n| n.ledger_index).collect();
            let mut sorted = indices.clone();
            sorted.sort();
            prop_assert_eq!(indices, sorted);
        }
    }
}

//! Canonical binary field codec for transaction metadata. Every field is a
//! one-byte field code followed by a fixed-width payload; composite values
//! (objects, arrays) close with an end marker. Objects serialise their fields
//! in ascending field-code order, which makes the encoding canonical: equal
//! values always produce equal bytes.

use crate::MetaError;
use meridian_types::{AccountId, Amount, Hash256};
use serde::{Deserialize, Serialize};

/// Field codes. The table is closed; the serialised layout is part of the
/// node's persistent storage format and changes require a protocol bump.
pub mod field {
    pub const TRANSACTION_RESULT: u8 = 1;
    pub const TRANSACTION_INDEX: u8 = 2;
    pub const LEDGER_ENTRY_TYPE: u8 = 3;
    pub const PREVIOUS_TXN_LGR_SEQ: u8 = 4;

    pub const LEDGER_INDEX: u8 = 16;
    pub const PREVIOUS_TXN_ID: u8 = 17;

    pub const ACCOUNT: u8 = 32;
    pub const OWNER: u8 = 33;
    pub const BALANCE: u8 = 34;

    pub const LOW_LIMIT: u8 = 48;
    pub const HIGH_LIMIT: u8 = 49;
    pub const TAKER_PAYS: u8 = 50;
    pub const TAKER_GETS: u8 = 51;

    pub const NEW_FIELDS: u8 = 64;
    pub const FINAL_FIELDS: u8 = 65;
    pub const PREVIOUS_FIELDS: u8 = 66;

    pub const CREATED_NODE: u8 = 80;
    pub const MODIFIED_NODE: u8 = 81;
    pub const DELETED_NODE: u8 = 82;

    pub const AFFECTED_NODES: u8 = 96;
    pub const TRANSACTION_META_DATA: u8 = 97;

    /// Terminates the current object or array.
    pub const END: u8 = 0xFF;
}

/// A scalar field value. The wire type is determined by the field code, so
/// the writer asserts that code and value agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    U8(u8),
    U16(u16),
    U32(u32),
    Hash(Hash256),
    Account(AccountId),
    Amount(Amount),
}

/// Wire type of a scalar field code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    U8,
    U16,
    U32,
    Hash,
    Account,
    Amount,
}

impl FieldValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            FieldValue::U8(_) => ValueKind::U8,
            FieldValue::U16(_) => ValueKind::U16,
            FieldValue::U32(_) => ValueKind::U32,
            FieldValue::Hash(_) => ValueKind::Hash,
            FieldValue::Account(_) => ValueKind::Account,
            FieldValue::Amount(_) => ValueKind::Amount,
        }
    }
}

/// Wire type for a scalar field code; `None` for composite or unknown codes.
pub fn scalar_kind(code: u8) -> Option<ValueKind> {
    match code {
        field::TRANSACTION_RESULT => Some(ValueKind::U8),
        field::LEDGER_ENTRY_TYPE => Some(ValueKind::U16),
        field::TRANSACTION_INDEX | field::PREVIOUS_TXN_LGR_SEQ => Some(ValueKind::U32),
        field::LEDGER_INDEX | field::PREVIOUS_TXN_ID => Some(ValueKind::Hash),
        field::ACCOUNT | field::OWNER => Some(ValueKind::Account),
        field::BALANCE
        | field::LOW_LIMIT
        | field::HIGH_LIMIT
        | field::TAKER_PAYS
        | field::TAKER_GETS => Some(ValueKind::Amount),
        _ => None,
    }
}

/// Append-only canonical writer.
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Open a composite value (object or array) under `code`.
    pub fn begin(&mut self, code: u8) {
        self.buf.push(code);
    }

    /// Close the innermost composite value.
    pub fn end(&mut self) {
        self.buf.push(field::END);
    }

    /// Write one scalar field. Code and value type must agree.
    pub fn scalar(&mut self, code: u8, value: &FieldValue) {
        debug_assert_eq!(scalar_kind(code), Some(value.kind()));
        self.buf.push(code);
        match value {
            FieldValue::U8(v) => self.buf.push(*v),
            FieldValue::U16(v) => self.buf.extend_from_slice(&v.to_be_bytes()),
            FieldValue::U32(v) => self.buf.extend_from_slice(&v.to_be_bytes()),
            FieldValue::Hash(h) => self.buf.extend_from_slice(h.as_bytes()),
            FieldValue::Account(a) => self.buf.extend_from_slice(a.as_bytes()),
            FieldValue::Amount(a) => {
                self.buf.extend_from_slice(&a.value.to_be_bytes());
                self.buf.extend_from_slice(a.issuer.as_bytes());
            }
        }
    }
}

/// Cursor-based reader. All failures surface as `MetaError::MalformedMetadata`
/// rather than panics.
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn is_exhausted(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], MetaError> {
        if self.pos + n > self.buf.len() {
            return Err(MetaError::MalformedMetadata("unexpected end of input"));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Next field code (or END marker).
    pub fn code(&mut self) -> Result<u8, MetaError> {
        Ok(self.take(1)?[0])
    }

    pub fn u8(&mut self) -> Result<u8, MetaError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, MetaError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, MetaError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn hash(&mut self) -> Result<Hash256, MetaError> {
        let bytes = self.take(32)?;
        let mut out = [0u8; 32];
        out.copy_from_slice(bytes);
        Ok(Hash256(out))
    }

    pub fn account(&mut self) -> Result<AccountId, MetaError> {
        let bytes = self.take(32)?;
        let mut out = [0u8; 32];
        out.copy_from_slice(bytes);
        Ok(AccountId(out))
    }

    pub fn amount(&mut self) -> Result<Amount, MetaError> {
        let value_bytes = self.take(8)?;
        let mut value = [0u8; 8];
        value.copy_from_slice(value_bytes);
        let issuer = self.account()?;
        Ok(Amount {
            value: u64::from_be_bytes(value),
            issuer,
        })
    }

    /// Read the scalar value declared for `code`.
    pub fn scalar(&mut self, code: u8) -> Result<FieldValue, MetaError> {
        match scalar_kind(code) {
            Some(ValueKind::U8) => Ok(FieldValue::U8(self.u8()?)),
            Some(ValueKind::U16) => Ok(FieldValue::U16(self.u16()?)),
            Some(ValueKind::U32) => Ok(FieldValue::U32(self.u32()?)),
            Some(ValueKind::Hash) => Ok(FieldValue::Hash(self.hash()?)),
            Some(ValueKind::Account) => Ok(FieldValue::Account(self.account()?)),
            Some(ValueKind::Amount) => Ok(FieldValue::Amount(self.amount()?)),
            None => Err(MetaError::MalformedMetadata("unknown scalar field code")),
        }
    }
}

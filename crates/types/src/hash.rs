use blake3::Hasher as Blake3;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error raised when decoding a hash or account id from hex.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ParseHashError {
    #[error("invalid hex: {0}")]
    InvalidHex(String),
    #[error("expected 32 bytes, got {0}")]
    BadLength(usize),
}

fn decode_32(s: &str) -> Result<[u8; 32], ParseHashError> {
    let trimmed = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    let bytes = hex::decode(trimmed).map_err(|e| ParseHashError::InvalidHex(e.to_string()))?;
    if bytes.len() != 32 {
        return Err(ParseHashError::BadLength(bytes.len()));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// 256-bit content hash. Also used as a ledger-entry index; the byte-wise
/// `Ord` on this type is the canonical order for transaction application and
/// metadata node sorting.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    pub const ZERO: Hash256 = Hash256([0u8; 32]);

    /// Single-shot blake3 digest of `data`.
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Blake3::new();
        hasher.update(data);
        Self::from_hasher(hasher)
    }

    /// Finish a blake3 hasher into a `Hash256`.
    pub fn from_hasher(hasher: Blake3) -> Self {
        let hash = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&hash.as_bytes()[0..32]);
        Hash256(out)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps round logs readable.
        write!(f, "{}..", &hex::encode(self.0)[..8])
    }
}

impl FromStr for Hash256 {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_32(s).map(Hash256)
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Hash256(bytes)
    }
}

/// 32-byte account identifier (hash of the owning public key).
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct AccountId(pub [u8; 32]);

impl AccountId {
    pub const ZERO: AccountId = AccountId([0u8; 32]);

    /// Derive an account id from a verifying-key byte string.
    pub fn from_public_key(key: &[u8]) -> Self {
        let mut hasher = Blake3::new();
        hasher.update(b"account");
        hasher.update(key);
        AccountId(Hash256::from_hasher(hasher).0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..", &hex::encode(self.0)[..8])
    }
}

impl FromStr for AccountId {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_32(s).map(AccountId)
    }
}

impl From<[u8; 32]> for AccountId {
    fn from(bytes: [u8; 32]) -> Self {
        AccountId(bytes)
    }
}

use crate::hash::{AccountId, Hash256};
use blake3::Hasher as Blake3;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_bytes;

/// A candidate transaction as seen by the consensus core: enough structure to
/// identify it, order it, charge fees for it, and check its signature. What a
/// transaction *does* to balances is the business of the state engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    /// Canonical identifier (hash of payload and signature).
    pub id: Hash256,
    /// Account submitting the transaction.
    pub account: AccountId,
    /// Per-account sequence number.
    pub sequence: u32,
    /// Nominal fee in fee units.
    pub fee_units: u64,
    /// Ed25519 public key the signature is checked against.
    pub signing_key: [u8; 32],
    /// Ed25519 signature over the signing payload.
    #[serde(with = "serde_bytes")]
    pub signature: [u8; 64],
}

impl Transaction {
    /// Create an unsigned transaction for the given signing key.
    pub fn new(signing_key: [u8; 32], sequence: u32, fee_units: u64) -> Self {
        Self {
            id: Hash256::ZERO,
            account: AccountId::from_public_key(&signing_key),
            sequence,
            fee_units,
            signing_key,
            signature: [0u8; 64],
        }
    }

    fn signing_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(32 + 32 + 4 + 8);
        payload.extend_from_slice(b"txn");
        payload.extend_from_slice(self.account.as_bytes());
        payload.extend_from_slice(&self.signing_key);
        payload.extend_from_slice(&self.sequence.to_be_bytes());
        payload.extend_from_slice(&self.fee_units.to_be_bytes());
        payload
    }

    /// Sign with `key` and refresh the canonical id. Fails if `key` does not
    /// match the declared signing key.
    pub fn sign(&mut self, key: &SigningKey) -> Result<(), ed25519_dalek::SignatureError> {
        if key.verifying_key().to_bytes() != self.signing_key {
            return Err(ed25519_dalek::SignatureError::new());
        }
        let sig = key.sign(&self.signing_payload());
        self.signature = sig.to_bytes();
        self.id = self.hash();
        Ok(())
    }

    /// Verify the transaction signature against its declared signing key.
    pub fn verify_signature(&self) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.signing_key) else {
            return false;
        };
        let sig = Signature::from_bytes(&self.signature);
        key.verify(&self.signing_payload(), &sig).is_ok()
    }

    /// Canonical identifier: blake3 over payload and signature.
    pub fn hash(&self) -> Hash256 {
        let mut hasher = Blake3::new();
        hasher.update(&self.signing_payload());
        hasher.update(&self.signature);
        Hash256::from_hasher(hasher)
    }
}

use crate::hash::Hash256;
use crate::Seconds;
use blake3::Hasher as Blake3;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_bytes;

/// A validator's signed opinion on the closing ledger: which transaction set
/// it should contain and when it should close. Within a round, a proposer's
/// highest-numbered proposal supersedes its earlier ones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Proposal {
    /// Proposer's Ed25519 verifying key.
    pub proposer: [u8; 32],
    /// Monotonic per-proposer sequence within the round.
    pub seq: u32,
    /// Root of the proposed transaction set.
    pub tx_set_hash: Hash256,
    /// Proposed close time, pre-rounded by the proposer.
    pub close_time: Seconds,
    /// Hash of the parent ledger this proposal builds on.
    pub parent_hash: Hash256,
    #[serde(with = "serde_bytes")]
    pub signature: [u8; 64],
}

impl Proposal {
    /// Build and sign a proposal in one step.
    pub fn signed(
        key: &SigningKey,
        seq: u32,
        tx_set_hash: Hash256,
        close_time: Seconds,
        parent_hash: Hash256,
    ) -> Self {
        let mut proposal = Self {
            proposer: key.verifying_key().to_bytes(),
            seq,
            tx_set_hash,
            close_time,
            parent_hash,
            signature: [0u8; 64],
        };
        let sig = key.sign(&proposal.signing_payload());
        proposal.signature = sig.to_bytes();
        proposal
    }

    fn signing_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(8 + 32 + 4 + 32 + 4 + 32);
        payload.extend_from_slice(b"proposal");
        payload.extend_from_slice(&self.proposer);
        payload.extend_from_slice(&self.seq.to_be_bytes());
        payload.extend_from_slice(self.tx_set_hash.as_bytes());
        payload.extend_from_slice(&self.close_time.to_be_bytes());
        payload.extend_from_slice(self.parent_hash.as_bytes());
        payload
    }

    /// Digest of the signed content plus signature; the memoization key for
    /// verification caching.
    pub fn signing_digest(&self) -> Hash256 {
        let mut hasher = Blake3::new();
        hasher.update(&self.signing_payload());
        hasher.update(&self.signature);
        Hash256::from_hasher(hasher)
    }

    /// Verify the proposal signature against the embedded proposer key.
    pub fn verify(&self) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.proposer) else {
            return false;
        };
        let sig = Signature::from_bytes(&self.signature);
        key.verify(&self.signing_payload(), &sig).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    #[test]
    fn signed_proposal_verifies() {
        let p = Proposal::signed(&key(1), 0, Hash256([5u8; 32]), 100, Hash256::ZERO);
        assert!(p.verify());
    }

    #[test]
    fn altered_fields_fail_verification() {
        let mut p = Proposal::signed(&key(1), 0, Hash256([5u8; 32]), 100, Hash256::ZERO);
        p.close_time = 110;
        assert!(!p.verify());
    }

    #[test]
    fn signing_digest_tracks_sequence() {
        let a = Proposal::signed(&key(1), 0, Hash256([5u8; 32]), 100, Hash256::ZERO);
        let b = Proposal::signed(&key(1), 1, Hash256([5u8; 32]), 100, Hash256::ZERO);
        assert_ne!(a.signing_digest(), b.signing_digest());
    }
}

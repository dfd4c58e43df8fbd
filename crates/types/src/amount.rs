use crate::hash::AccountId;
use serde::{Deserialize, Serialize};

/// A value as it appears inside ledger-entry fields. Native amounts carry a
/// zero issuer; issued amounts (trust-line limits, offer legs) name the
/// issuing account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amount {
    pub value: u64,
    pub issuer: AccountId,
}

impl Amount {
    pub fn native(value: u64) -> Self {
        Self {
            value,
            issuer: AccountId::ZERO,
        }
    }

    pub fn issued(value: u64, issuer: AccountId) -> Self {
        Self { value, issuer }
    }

    pub fn is_native(&self) -> bool {
        self.issuer.is_zero()
    }

    /// The issuing account, when one is named.
    pub fn issuer_account(&self) -> Option<AccountId> {
        if self.issuer.is_zero() {
            None
        } else {
            Some(self.issuer)
        }
    }
}

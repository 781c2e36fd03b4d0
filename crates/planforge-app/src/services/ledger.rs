//! Prepaid credit ledger with atomic debit semantics.

use bincode::config;
use bincode::error::{DecodeError, EncodeError};
use bincode::serde::{decode_from_slice, encode_to_vec};
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::paths::{AppPaths, PathError};

const LEDGER_ENV_MAP_SIZE_BYTES: usize = 1 << 26; // 64 MiB

/// Which of the two per-user balances an operation touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CreditBucket {
    Free,
    Paid,
}

impl CreditBucket {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            CreditBucket::Free => "free",
            CreditBucket::Paid => "paid",
        }
    }
}

/// Per-user balances. Both stay non-negative; a debit that would go below
/// zero is rejected rather than clamped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditBalance {
    pub free_credits: u64,
    pub paid_credits: u64,
}

impl CreditBalance {
    #[must_use]
    pub fn get(&self, bucket: CreditBucket) -> u64 {
        match bucket {
            CreditBucket::Free => self.free_credits,
            CreditBucket::Paid => self.paid_credits,
        }
    }

    fn slot_mut(&mut self, bucket: CreditBucket) -> &mut u64 {
        match bucket {
            CreditBucket::Free => &mut self.free_credits,
            CreditBucket::Paid => &mut self.paid_credits,
        }
    }
}

/// Errors emitted by the credit ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Heed(#[from] heed::Error),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("insufficient {bucket} credits for user `{user_id}`: requested {requested}, available {available}")]
    InsufficientFunds {
        user_id: String,
        bucket: &'static str,
        requested: u64,
        available: u64,
    },
}

/// LMDB-backed credit ledger.
///
/// Debit and credit for one user are serialized by the single LMDB write
/// transaction, so a debit is a true compare-and-decrement: two concurrent
/// debits can never both succeed past the available balance.
#[derive(Debug)]
pub struct CreditLedger {
    env: Env,
    accounts: Database<Str, Bytes>,
}

impl CreditLedger {
    pub fn open(paths: &AppPaths) -> Result<Self, LedgerError> {
        let path = paths.ledger_lmdb_dir()?;
        debug_assert!(path.exists());

        let mut options = EnvOpenOptions::new();
        options.max_dbs(4);
        options.map_size(LEDGER_ENV_MAP_SIZE_BYTES);
        let env = unsafe {
            // SAFETY: LMDB requires callers to uphold environment lifetime invariants.
            options.open(&path)?
        };
        let accounts = {
            let rtxn = env.read_txn()?;
            let opened = env.open_database::<Str, Bytes>(&rtxn, Some("accounts"))?;
            drop(rtxn);
            match opened {
                Some(existing) => existing,
                None => {
                    let mut wtxn = env.write_txn()?;
                    let db = env.create_database::<Str, Bytes>(&mut wtxn, Some("accounts"))?;
                    wtxn.commit()?;
                    db
                }
            }
        };
        Ok(Self { env, accounts })
    }

    /// Current balances for a user; unknown users hold zero in both buckets.
    pub fn balance(&self, user_id: &str) -> Result<CreditBalance, LedgerError> {
        debug_assert!(!user_id.is_empty());
        let rtxn = self.env.read_txn()?;
        match self.accounts.get(&rtxn, user_id)? {
            Some(raw) => {
                let (balance, _) = decode_from_slice::<CreditBalance, _>(raw, config::standard())?;
                Ok(balance)
            }
            None => Ok(CreditBalance::default()),
        }
    }

    /// Atomically subtract `amount` from one bucket. The balance change is
    /// committed before this returns, so callers may start work that assumes
    /// the debit happened.
    pub fn try_debit(
        &self,
        user_id: &str,
        amount: u64,
        bucket: CreditBucket,
    ) -> Result<CreditBalance, LedgerError> {
        debug_assert!(!user_id.is_empty());
        debug_assert!(amount > 0);

        let mut wtxn = self.env.write_txn()?;
        let mut balance = match self.accounts.get(&wtxn, user_id)? {
            Some(raw) => decode_from_slice::<CreditBalance, _>(raw, config::standard())?.0,
            None => CreditBalance::default(),
        };
        let available = balance.get(bucket);
        if available < amount {
            return Err(LedgerError::InsufficientFunds {
                user_id: user_id.to_string(),
                bucket: bucket.label(),
                requested: amount,
                available,
            });
        }
        *balance.slot_mut(bucket) = available - amount;
        let encoded = encode_to_vec(&balance, config::standard())?;
        self.accounts.put(&mut wtxn, user_id, encoded.as_slice())?;
        wtxn.commit()?;
        debug!(user_id, bucket = bucket.label(), amount, "debited credits");
        Ok(balance)
    }

    /// Add `amount` to one bucket; used for top-ups and refunds. Always
    /// succeeds for any known or unknown user.
    pub fn credit(
        &self,
        user_id: &str,
        amount: u64,
        bucket: CreditBucket,
    ) -> Result<CreditBalance, LedgerError> {
        debug_assert!(!user_id.is_empty());
        debug_assert!(amount > 0);

        let mut wtxn = self.env.write_txn()?;
        let mut balance = match self.accounts.get(&wtxn, user_id)? {
            Some(raw) => decode_from_slice::<CreditBalance, _>(raw, config::standard())?.0,
            None => CreditBalance::default(),
        };
        let slot = balance.slot_mut(bucket);
        *slot = slot.saturating_add(amount);
        let encoded = encode_to_vec(&balance, config::standard())?;
        self.accounts.put(&mut wtxn, user_id, encoded.as_slice())?;
        wtxn.commit()?;
        debug!(user_id, bucket = bucket.label(), amount, "credited credits");
        Ok(balance)
    }
}

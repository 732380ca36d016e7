//! Idempotency Ledger
//!
//! Durable records keyed by provider-scoped external reference. The atomic
//! insert behind [`IdempotencyLedger::try_begin`] is the sole concurrency
//! gate against double settlement of a retried or duplicated delivery:
//! exactly one concurrent caller wins a key, everyone else observes the
//! existing record.

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::store::{BeginOutcome, IdempotencyCompletion, SettlementStore, StoreError};

/// Idempotency record status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    Pending,
    Completed,
    Failed,
}

impl std::fmt::Display for IdempotencyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdempotencyStatus::Pending => write!(f, "pending"),
            IdempotencyStatus::Completed => write!(f, "completed"),
            IdempotencyStatus::Failed => write!(f, "failed"),
        }
    }
}

impl From<String> for IdempotencyStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "completed" => IdempotencyStatus::Completed,
            "failed" => IdempotencyStatus::Failed,
            _ => IdempotencyStatus::Pending,
        }
    }
}

/// Stored idempotency record.
///
/// Created at `pending` on first receipt of a key; moved to `completed` or
/// `failed` exactly once. Completed and permanently failed records are never
/// revisited except to replay their stored outcome.
#[derive(Debug, Clone)]
pub struct IdempotencyRecord {
    pub key: String,
    pub status: IdempotencyStatus,
    /// Failed records only: whether a retry would fail identically
    pub permanent: bool,
    /// Hash of the settlement-relevant payload fields, for detecting a
    /// re-used key carrying a different payload
    pub payload_hash: String,
    pub ledger_entry_id: Option<Uuid>,
    /// The outcome to replay on duplicate delivery
    pub outcome: Option<serde_json::Value>,
    pub first_seen: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// New pending record for a first-seen key.
    pub fn pending(key: &str, payload_hash: &str, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            key: key.to_string(),
            status: IdempotencyStatus::Pending,
            permanent: false,
            payload_hash: payload_hash.to_string(),
            ledger_entry_id: None,
            outcome: None,
            first_seen: now,
            expires_at: now + ttl,
        }
    }

    /// Deserialize the stored outcome, if any.
    pub fn stored_outcome<T: DeserializeOwned>(&self) -> Option<T> {
        self.outcome
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Idempotency Ledger errors
#[derive(Debug, thiserror::Error)]
pub enum IdempotencyError {
    /// The key exists but the payload differs: a client error, not a retry
    #[error("Payload mismatch for idempotency key {0}")]
    PayloadMismatch(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of attempting to begin a settlement under a key
#[derive(Debug)]
pub enum Begin {
    /// This caller owns the pending record and must settle or fail it
    Won,
    /// The key was already taken; the record says what happened to it
    Existing(IdempotencyRecord),
}

/// The idempotency ledger component.
///
/// Completion is not a standalone write: it rides inside the same storage
/// atomic unit as the balance mutation (see
/// [`crate::store::SettlementStore::commit_mutations`]), so a settlement can
/// never be applied without being recorded or vice versa. This type builds
/// the completion payload and owns the begin/fail transitions.
#[derive(Clone)]
pub struct IdempotencyLedger {
    store: Arc<dyn SettlementStore>,
}

impl IdempotencyLedger {
    pub fn new(store: Arc<dyn SettlementStore>) -> Self {
        Self { store }
    }

    /// Atomically insert a pending record, or observe the existing one.
    ///
    /// A transiently failed record counts as a win: the key is re-armed to
    /// pending and the event settles again. An existing record whose payload
    /// hash differs from `payload_hash` is a `PayloadMismatch` error.
    pub async fn try_begin(
        &self,
        key: &str,
        payload_hash: &str,
        ttl: Duration,
    ) -> Result<Begin, IdempotencyError> {
        let record = IdempotencyRecord::pending(key, payload_hash, ttl);
        match self.store.begin_idempotent(&record).await? {
            BeginOutcome::Won => Ok(Begin::Won),
            BeginOutcome::Existing(existing) => {
                if existing.payload_hash != payload_hash {
                    return Err(IdempotencyError::PayloadMismatch(key.to_string()));
                }
                Ok(Begin::Existing(existing))
            }
        }
    }

    /// Build the completion that [`crate::wallet::BalanceStore::apply`]
    /// commits together with the balance mutation.
    pub fn completion<T: Serialize>(
        &self,
        key: &str,
        ledger_entry_id: Uuid,
        outcome: &T,
    ) -> Result<IdempotencyCompletion, IdempotencyError> {
        let outcome = serde_json::to_value(outcome).map_err(StoreError::from)?;
        Ok(IdempotencyCompletion {
            key: key.to_string(),
            ledger_entry_id,
            outcome,
        })
    }

    /// Mark a pending record failed. Permanent failures replay their stored
    /// outcome on redelivery; transient ones allow the event to settle again.
    pub async fn fail<T: Serialize>(
        &self,
        key: &str,
        outcome: &T,
        permanent: bool,
    ) -> Result<(), IdempotencyError> {
        let outcome = serde_json::to_value(outcome).map_err(StoreError::from)?;
        self.store
            .fail_idempotency(key, &outcome, permanent)
            .await?;
        Ok(())
    }
}

//! Storage boundary
//!
//! Explicit transaction contract for the settlement core. The two
//! operations that carry the correctness guarantees are:
//!
//! - [`SettlementStore::commit_mutations`]: conditional balance writes plus
//!   ledger appends (plus, optionally, idempotency completion) as one atomic
//!   unit with guaranteed rollback on any failure path;
//! - [`SettlementStore::begin_idempotent`]: a single atomic insert-or-read,
//!   so exactly one of any number of concurrent callers wins a key.
//!
//! Everything above this trait is storage-agnostic; the Postgres
//! implementation backs production and the in-memory implementation backs
//! tests and local runs.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::domain::CurrencyCode;
use crate::idempotency::IdempotencyRecord;
use crate::ledger::LedgerEntry;
use crate::rates::RateSnapshot;
use crate::wallet::{WalletAccount, WalletStatus};

/// Errors from the storage boundary
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The conditional balance write lost the version race
    #[error("Concurrency conflict for wallet {wallet_id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        wallet_id: Uuid,
        expected: i64,
        actual: i64,
    },

    /// A mutation referenced a wallet that does not exist
    #[error("Wallet not found: {0}")]
    WalletNotFound(Uuid),

    /// Uniqueness constraint violation on insert
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Stored data failed to parse back into domain types
    #[error("Corrupt stored data: {0}")]
    Corrupt(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Check if this error is a concurrency conflict
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, StoreError::ConcurrencyConflict { .. })
    }
}

/// One conditional balance write and its ledger entry.
///
/// The write is applied only if the wallet's version still equals
/// `expected_version`; on success the version becomes `expected_version + 1`
/// and `entry` is appended in the same atomic unit.
#[derive(Debug, Clone)]
pub struct BalanceMutation {
    pub expected_version: i64,
    pub new_balance: Decimal,
    pub entry: LedgerEntry,
}

/// Idempotency completion rolled into the same atomic unit as the balance
/// mutation, so a settlement can never be half-recorded: either the balance
/// moved, the entry exists and the key is completed, or none of it happened.
#[derive(Debug, Clone)]
pub struct IdempotencyCompletion {
    pub key: String,
    pub ledger_entry_id: Uuid,
    /// Outcome to replay on duplicate delivery, as stored JSON
    pub outcome: serde_json::Value,
}

/// Result of the atomic insert-or-read idempotency gate
#[derive(Debug)]
pub enum BeginOutcome {
    /// This caller inserted the pending record and owns the settlement
    Won,
    /// Another caller holds or held the key
    Existing(IdempotencyRecord),
}

/// The settlement core's storage contract.
#[async_trait]
pub trait SettlementStore: Send + Sync {
    // -- wallets ----------------------------------------------------------

    async fn insert_wallet(&self, wallet: &WalletAccount) -> Result<(), StoreError>;

    async fn fetch_wallet(&self, wallet_id: Uuid) -> Result<Option<WalletAccount>, StoreError>;

    async fn find_wallet(
        &self,
        owner_id: Uuid,
        currency: &CurrencyCode,
    ) -> Result<Option<WalletAccount>, StoreError>;

    async fn update_wallet_status(
        &self,
        wallet_id: Uuid,
        status: WalletStatus,
    ) -> Result<(), StoreError>;

    /// Apply every mutation (version-conditioned balance write + ledger
    /// append) and the optional idempotency completion atomically. Any
    /// version mismatch aborts the whole unit with `ConcurrencyConflict`.
    async fn commit_mutations(
        &self,
        mutations: &[BalanceMutation],
        completion: Option<&IdempotencyCompletion>,
    ) -> Result<(), StoreError>;

    /// All entries for a wallet, oldest first.
    async fn ledger_entries(&self, wallet_id: Uuid) -> Result<Vec<LedgerEntry>, StoreError>;

    // -- idempotency ------------------------------------------------------

    /// Atomic insert-or-read of a pending record. A transiently failed
    /// record is re-armed to pending (the caller wins); completed, pending
    /// and permanently failed records are returned as `Existing`.
    async fn begin_idempotent(
        &self,
        record: &IdempotencyRecord,
    ) -> Result<BeginOutcome, StoreError>;

    async fn fetch_idempotency(
        &self,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Mark a pending record failed. Does nothing if the record already
    /// reached a terminal state.
    async fn fail_idempotency(
        &self,
        key: &str,
        outcome: &serde_json::Value,
        permanent: bool,
    ) -> Result<(), StoreError>;

    /// Reset pending records first seen before `cutoff` to transient-failed
    /// so the event becomes re-deliverable. Returns the number reset.
    async fn reset_stale_pending(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Delete records whose retention window has passed.
    async fn delete_expired_idempotency(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    // -- rate snapshots ---------------------------------------------------

    async fn insert_rate_snapshot(&self, snapshot: &RateSnapshot) -> Result<(), StoreError>;

    /// Delete snapshots no longer valid at `now`. Returns the number deleted.
    async fn delete_expired_rate_snapshots(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

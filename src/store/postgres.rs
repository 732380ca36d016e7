//! Postgres store
//!
//! Production implementation of the storage boundary. The conditional
//! balance write is a single `UPDATE ... WHERE id = $1 AND version = $2`;
//! zero rows affected means the caller's snapshot is stale. All writes
//! belonging to one settlement happen inside one transaction, so any
//! failure rolls the whole unit back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::{CurrencyCode, Direction, PaymentSource};
use crate::idempotency::{IdempotencyRecord, IdempotencyStatus};
use crate::ledger::LedgerEntry;
use crate::rates::RateSnapshot;
use crate::wallet::{WalletAccount, WalletStatus};

use super::{BalanceMutation, BeginOutcome, IdempotencyCompletion, SettlementStore, StoreError};

type WalletRow = (
    Uuid,
    Uuid,
    String,
    Decimal,
    i64,
    String,
    bool,
    DateTime<Utc>,
);

type LedgerRow = (
    Uuid,
    Uuid,
    Decimal,
    Decimal,
    Option<String>,
    String,
    String,
    Uuid,
    DateTime<Utc>,
);

type IdempotencyRow = (
    String,
    String,
    bool,
    String,
    Option<Uuid>,
    Option<serde_json::Value>,
    DateTime<Utc>,
    DateTime<Utc>,
);

fn wallet_from_row(row: WalletRow) -> Result<WalletAccount, StoreError> {
    let (id, owner_id, currency, balance, version, status, overdraft_eligible, created_at) = row;
    let currency = CurrencyCode::new(&currency)
        .map_err(|e| StoreError::Corrupt(format!("wallet {}: {}", id, e)))?;
    let status = WalletStatus::from_str(&status)
        .map_err(|e| StoreError::Corrupt(format!("wallet {}: {}", id, e)))?;
    Ok(WalletAccount {
        id,
        owner_id,
        currency,
        balance,
        version,
        status,
        overdraft_eligible,
        created_at,
    })
}

fn entry_from_row(row: LedgerRow) -> Result<LedgerEntry, StoreError> {
    let (id, wallet_id, amount, balance_after, external_ref, direction, source, correlation_id, created_at) =
        row;
    let direction = Direction::from_str(&direction)
        .map_err(|e| StoreError::Corrupt(format!("ledger entry {}: {}", id, e)))?;
    let source = PaymentSource::from_str(&source)
        .map_err(|e| StoreError::Corrupt(format!("ledger entry {}: {}", id, e)))?;
    Ok(LedgerEntry {
        id,
        wallet_id,
        amount,
        balance_after,
        external_ref,
        direction,
        source,
        correlation_id,
        created_at,
    })
}

fn record_from_row(row: IdempotencyRow) -> IdempotencyRecord {
    let (key, status, permanent, payload_hash, ledger_entry_id, outcome, first_seen, expires_at) =
        row;
    IdempotencyRecord {
        key,
        status: IdempotencyStatus::from(status),
        permanent,
        payload_hash,
        ledger_entry_id,
        outcome,
        first_seen,
        expires_at,
    }
}

/// Postgres implementation of the settlement store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn apply_mutation(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        mutation: &BalanceMutation,
    ) -> Result<(), StoreError> {
        let wallet_id = mutation.entry.wallet_id;

        let updated = sqlx::query(
            r#"
            UPDATE wallets
            SET balance = $2, version = version + 1, updated_at = NOW()
            WHERE id = $1 AND version = $3
            "#,
        )
        .bind(wallet_id)
        .bind(mutation.new_balance)
        .bind(mutation.expected_version)
        .execute(&mut **tx)
        .await?
        .rows_affected();

        if updated == 0 {
            let actual: Option<i64> =
                sqlx::query_scalar("SELECT version FROM wallets WHERE id = $1")
                    .bind(wallet_id)
                    .fetch_optional(&mut **tx)
                    .await?;
            return match actual {
                Some(actual) => Err(StoreError::ConcurrencyConflict {
                    wallet_id,
                    expected: mutation.expected_version,
                    actual,
                }),
                None => Err(StoreError::WalletNotFound(wallet_id)),
            };
        }

        let entry = &mutation.entry;
        sqlx::query(
            r#"
            INSERT INTO ledger_entries (
                id, wallet_id, amount, balance_after,
                external_ref, direction, source, correlation_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.id)
        .bind(entry.wallet_id)
        .bind(entry.amount)
        .bind(entry.balance_after)
        .bind(&entry.external_ref)
        .bind(entry.direction.to_string())
        .bind(entry.source.to_string())
        .bind(entry.correlation_id)
        .bind(entry.created_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl SettlementStore for PgStore {
    async fn insert_wallet(&self, wallet: &WalletAccount) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO wallets (
                id, owner_id, currency, balance, version,
                status, overdraft_eligible, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            "#,
        )
        .bind(wallet.id)
        .bind(wallet.owner_id)
        .bind(wallet.currency.as_str())
        .bind(wallet.balance)
        .bind(wallet.version)
        .bind(wallet.status.to_string())
        .bind(wallet.overdraft_eligible)
        .bind(wallet.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(
                StoreError::DuplicateKey(format!("{}/{}", wallet.owner_id, wallet.currency)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn fetch_wallet(&self, wallet_id: Uuid) -> Result<Option<WalletAccount>, StoreError> {
        let row: Option<WalletRow> = sqlx::query_as(
            r#"
            SELECT id, owner_id, currency, balance, version,
                   status, overdraft_eligible, created_at
            FROM wallets
            WHERE id = $1
            "#,
        )
        .bind(wallet_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(wallet_from_row).transpose()
    }

    async fn find_wallet(
        &self,
        owner_id: Uuid,
        currency: &CurrencyCode,
    ) -> Result<Option<WalletAccount>, StoreError> {
        let row: Option<WalletRow> = sqlx::query_as(
            r#"
            SELECT id, owner_id, currency, balance, version,
                   status, overdraft_eligible, created_at
            FROM wallets
            WHERE owner_id = $1 AND currency = $2
            "#,
        )
        .bind(owner_id)
        .bind(currency.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(wallet_from_row).transpose()
    }

    async fn update_wallet_status(
        &self,
        wallet_id: Uuid,
        status: WalletStatus,
    ) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE wallets SET status = $2, updated_at = NOW() WHERE id = $1
            "#,
        )
        .bind(wallet_id)
        .bind(status.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(StoreError::WalletNotFound(wallet_id));
        }
        Ok(())
    }

    async fn commit_mutations(
        &self,
        mutations: &[BalanceMutation],
        completion: Option<&IdempotencyCompletion>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        for mutation in mutations {
            // A conflict drops the transaction, rolling back earlier legs
            self.apply_mutation(&mut tx, mutation).await?;
        }

        if let Some(completion) = completion {
            sqlx::query(
                r#"
                UPDATE idempotency_records
                SET status = 'completed', ledger_entry_id = $2, outcome = $3
                WHERE key = $1 AND status = 'pending'
                "#,
            )
            .bind(&completion.key)
            .bind(completion.ledger_entry_id)
            .bind(&completion.outcome)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn ledger_entries(&self, wallet_id: Uuid) -> Result<Vec<LedgerEntry>, StoreError> {
        let rows: Vec<LedgerRow> = sqlx::query_as(
            r#"
            SELECT id, wallet_id, amount, balance_after,
                   external_ref, direction, source, correlation_id, created_at
            FROM ledger_entries
            WHERE wallet_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(wallet_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(entry_from_row).collect()
    }

    async fn begin_idempotent(
        &self,
        record: &IdempotencyRecord,
    ) -> Result<BeginOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO idempotency_records (
                key, status, permanent_failure, payload_hash,
                ledger_entry_id, outcome, first_seen, expires_at
            )
            VALUES ($1, 'pending', FALSE, $2, NULL, NULL, $3, $4)
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(&record.key)
        .bind(&record.payload_hash)
        .bind(record.first_seen)
        .bind(record.expires_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 1 {
            tx.commit().await?;
            return Ok(BeginOutcome::Won);
        }

        // The key exists. Lock the row so a concurrent re-arm attempt on a
        // transiently failed record has exactly one winner.
        let row: Option<IdempotencyRow> = sqlx::query_as(
            r#"
            SELECT key, status, permanent_failure, payload_hash,
                   ledger_entry_id, outcome, first_seen, expires_at
            FROM idempotency_records
            WHERE key = $1
            FOR UPDATE
            "#,
        )
        .bind(&record.key)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            // Deleted between the insert and the select; retry would win,
            // but a vanished key during settlement is a retention bug.
            return Err(StoreError::Corrupt(format!(
                "idempotency record vanished: {}",
                record.key
            )));
        };
        let existing = record_from_row(row);

        if existing.status == IdempotencyStatus::Failed && !existing.permanent {
            sqlx::query(
                r#"
                UPDATE idempotency_records
                SET status = 'pending', permanent_failure = FALSE, payload_hash = $2,
                    ledger_entry_id = NULL, outcome = NULL, first_seen = $3, expires_at = $4
                WHERE key = $1
                "#,
            )
            .bind(&record.key)
            .bind(&record.payload_hash)
            .bind(record.first_seen)
            .bind(record.expires_at)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(BeginOutcome::Won);
        }

        tx.commit().await?;
        Ok(BeginOutcome::Existing(existing))
    }

    async fn fetch_idempotency(
        &self,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let row: Option<IdempotencyRow> = sqlx::query_as(
            r#"
            SELECT key, status, permanent_failure, payload_hash,
                   ledger_entry_id, outcome, first_seen, expires_at
            FROM idempotency_records
            WHERE key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(record_from_row))
    }

    async fn fail_idempotency(
        &self,
        key: &str,
        outcome: &serde_json::Value,
        permanent: bool,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE idempotency_records
            SET status = 'failed', permanent_failure = $2, outcome = $3
            WHERE key = $1 AND status = 'pending'
            "#,
        )
        .bind(key)
        .bind(permanent)
        .bind(outcome)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn reset_stale_pending(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let reset = sqlx::query(
            r#"
            UPDATE idempotency_records
            SET status = 'failed', permanent_failure = FALSE
            WHERE status = 'pending' AND first_seen < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(reset)
    }

    async fn delete_expired_idempotency(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let deleted = sqlx::query("DELETE FROM idempotency_records WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(deleted)
    }

    async fn insert_rate_snapshot(&self, snapshot: &RateSnapshot) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO rate_snapshots (
                id, base, quote, rate, inverse_rate,
                provider, fetched_at, valid_until
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(snapshot.id)
        .bind(snapshot.base.as_str())
        .bind(snapshot.quote.as_str())
        .bind(snapshot.rate)
        .bind(snapshot.inverse_rate)
        .bind(&snapshot.provider)
        .bind(snapshot.fetched_at)
        .bind(snapshot.valid_until)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_expired_rate_snapshots(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let deleted = sqlx::query("DELETE FROM rate_snapshots WHERE valid_until <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(deleted)
    }
}

//! In-memory store
//!
//! Backs tests and local runs. A single mutex serializes access, but the
//! contract exposed is identical to the Postgres store: version-conditioned
//! writes that fail with `ConcurrencyConflict` when the caller's snapshot
//! is stale, and an insert-or-read idempotency gate with exactly one winner.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::CurrencyCode;
use crate::idempotency::{IdempotencyRecord, IdempotencyStatus};
use crate::ledger::LedgerEntry;
use crate::rates::RateSnapshot;
use crate::wallet::{WalletAccount, WalletStatus};

use super::{BalanceMutation, BeginOutcome, IdempotencyCompletion, SettlementStore, StoreError};

#[derive(Default)]
struct Inner {
    wallets: HashMap<Uuid, WalletAccount>,
    entries: Vec<LedgerEntry>,
    idempotency: HashMap<String, IdempotencyRecord>,
    rates: Vec<RateSnapshot>,
}

/// In-memory implementation of the settlement store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All rate snapshots ever persisted, for test assertions.
    pub async fn rate_snapshots(&self) -> Vec<RateSnapshot> {
        self.inner.lock().await.rates.clone()
    }
}

#[async_trait]
impl SettlementStore for MemoryStore {
    async fn insert_wallet(&self, wallet: &WalletAccount) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.wallets.contains_key(&wallet.id) {
            return Err(StoreError::DuplicateKey(wallet.id.to_string()));
        }
        if inner
            .wallets
            .values()
            .any(|w| w.owner_id == wallet.owner_id && w.currency == wallet.currency)
        {
            return Err(StoreError::DuplicateKey(format!(
                "{}/{}",
                wallet.owner_id, wallet.currency
            )));
        }
        inner.wallets.insert(wallet.id, wallet.clone());
        Ok(())
    }

    async fn fetch_wallet(&self, wallet_id: Uuid) -> Result<Option<WalletAccount>, StoreError> {
        Ok(self.inner.lock().await.wallets.get(&wallet_id).cloned())
    }

    async fn find_wallet(
        &self,
        owner_id: Uuid,
        currency: &CurrencyCode,
    ) -> Result<Option<WalletAccount>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .wallets
            .values()
            .find(|w| w.owner_id == owner_id && &w.currency == currency)
            .cloned())
    }

    async fn update_wallet_status(
        &self,
        wallet_id: Uuid,
        status: WalletStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let wallet = inner
            .wallets
            .get_mut(&wallet_id)
            .ok_or(StoreError::WalletNotFound(wallet_id))?;
        wallet.status = status;
        Ok(())
    }

    async fn commit_mutations(
        &self,
        mutations: &[BalanceMutation],
        completion: Option<&IdempotencyCompletion>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;

        // Validate every condition before touching anything, so a failure
        // leaves no partial state.
        for mutation in mutations {
            let wallet_id = mutation.entry.wallet_id;
            let wallet = inner
                .wallets
                .get(&wallet_id)
                .ok_or(StoreError::WalletNotFound(wallet_id))?;
            if wallet.version != mutation.expected_version {
                return Err(StoreError::ConcurrencyConflict {
                    wallet_id,
                    expected: mutation.expected_version,
                    actual: wallet.version,
                });
            }
        }

        for mutation in mutations {
            if let Some(wallet) = inner.wallets.get_mut(&mutation.entry.wallet_id) {
                wallet.balance = mutation.new_balance;
                wallet.version += 1;
                inner.entries.push(mutation.entry.clone());
            }
        }

        if let Some(completion) = completion {
            if let Some(record) = inner.idempotency.get_mut(&completion.key) {
                if record.status == IdempotencyStatus::Pending {
                    record.status = IdempotencyStatus::Completed;
                    record.ledger_entry_id = Some(completion.ledger_entry_id);
                    record.outcome = Some(completion.outcome.clone());
                }
            }
        }

        Ok(())
    }

    async fn ledger_entries(&self, wallet_id: Uuid) -> Result<Vec<LedgerEntry>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .entries
            .iter()
            .filter(|e| e.wallet_id == wallet_id)
            .cloned()
            .collect())
    }

    async fn begin_idempotent(
        &self,
        record: &IdempotencyRecord,
    ) -> Result<BeginOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.idempotency.get(&record.key) {
            None => {
                inner.idempotency.insert(record.key.clone(), record.clone());
                Ok(BeginOutcome::Won)
            }
            Some(existing) if existing.status == IdempotencyStatus::Failed && !existing.permanent => {
                // Transient failure: re-arm to pending, this caller wins
                inner.idempotency.insert(record.key.clone(), record.clone());
                Ok(BeginOutcome::Won)
            }
            Some(existing) => Ok(BeginOutcome::Existing(existing.clone())),
        }
    }

    async fn fetch_idempotency(
        &self,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        Ok(self.inner.lock().await.idempotency.get(key).cloned())
    }

    async fn fail_idempotency(
        &self,
        key: &str,
        outcome: &serde_json::Value,
        permanent: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(record) = inner.idempotency.get_mut(key) {
            if record.status == IdempotencyStatus::Pending {
                record.status = IdempotencyStatus::Failed;
                record.permanent = permanent;
                record.outcome = Some(outcome.clone());
            }
        }
        Ok(())
    }

    async fn reset_stale_pending(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut reset = 0;
        for record in inner.idempotency.values_mut() {
            if record.status == IdempotencyStatus::Pending && record.first_seen < cutoff {
                record.status = IdempotencyStatus::Failed;
                record.permanent = false;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn delete_expired_idempotency(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let before = inner.idempotency.len();
        inner.idempotency.retain(|_, r| r.expires_at > now);
        Ok((before - inner.idempotency.len()) as u64)
    }

    async fn insert_rate_snapshot(&self, snapshot: &RateSnapshot) -> Result<(), StoreError> {
        self.inner.lock().await.rates.push(snapshot.clone());
        Ok(())
    }

    async fn delete_expired_rate_snapshots(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let before = inner.rates.len();
        inner.rates.retain(|s| s.valid_until > now);
        Ok((before - inner.rates.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Amount, Direction, PaymentSource};
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn wallet() -> WalletAccount {
        WalletAccount::activate(Uuid::new_v4(), CurrencyCode::new("USD").unwrap(), false)
    }

    fn mutation_for(wallet: &WalletAccount, amount: rust_decimal::Decimal) -> BalanceMutation {
        let amount = Amount::new(amount).unwrap();
        let new_balance = wallet.balance + amount.value();
        BalanceMutation {
            expected_version: wallet.version,
            new_balance,
            entry: LedgerEntry::record(
                wallet.id,
                Direction::Credit,
                &amount,
                new_balance,
                Some("ref".to_string()),
                PaymentSource::Card,
                Uuid::new_v4(),
            ),
        }
    }

    #[tokio::test]
    async fn test_cas_conflict_on_stale_version() {
        let store = MemoryStore::new();
        let w = wallet();
        store.insert_wallet(&w).await.unwrap();

        let m1 = mutation_for(&w, dec!(50));
        let m2 = mutation_for(&w, dec!(30));

        store.commit_mutations(&[m1], None).await.unwrap();
        let err = store.commit_mutations(&[m2], None).await.unwrap_err();
        assert!(err.is_concurrency_conflict());

        // The losing attempt left no ledger entry behind
        assert_eq!(store.ledger_entries(w.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_begin_idempotent_single_winner() {
        let store = MemoryStore::new();
        let record = IdempotencyRecord::pending("card:r1", "h", Duration::hours(1));

        assert!(matches!(
            store.begin_idempotent(&record).await.unwrap(),
            BeginOutcome::Won
        ));
        assert!(matches!(
            store.begin_idempotent(&record).await.unwrap(),
            BeginOutcome::Existing(_)
        ));
    }

    #[tokio::test]
    async fn test_transient_failure_rearms() {
        let store = MemoryStore::new();
        let record = IdempotencyRecord::pending("card:r1", "h", Duration::hours(1));
        store.begin_idempotent(&record).await.unwrap();
        store
            .fail_idempotency("card:r1", &serde_json::json!({}), false)
            .await
            .unwrap();

        assert!(matches!(
            store.begin_idempotent(&record).await.unwrap(),
            BeginOutcome::Won
        ));
    }

    #[tokio::test]
    async fn test_permanent_failure_does_not_rearm() {
        let store = MemoryStore::new();
        let record = IdempotencyRecord::pending("card:r1", "h", Duration::hours(1));
        store.begin_idempotent(&record).await.unwrap();
        store
            .fail_idempotency("card:r1", &serde_json::json!({}), true)
            .await
            .unwrap();

        match store.begin_idempotent(&record).await.unwrap() {
            BeginOutcome::Existing(existing) => {
                assert_eq!(existing.status, IdempotencyStatus::Failed);
                assert!(existing.permanent);
            }
            BeginOutcome::Won => panic!("permanent failure must not re-arm"),
        }
    }

    #[tokio::test]
    async fn test_two_leg_commit_is_atomic() {
        let store = MemoryStore::new();
        let a = wallet();
        let b = wallet();
        store.insert_wallet(&a).await.unwrap();
        store.insert_wallet(&b).await.unwrap();

        let good = mutation_for(&a, dec!(10));
        let mut stale = mutation_for(&b, dec!(10));
        stale.expected_version = b.version + 7;

        let err = store.commit_mutations(&[good, stale], None).await.unwrap_err();
        assert!(err.is_concurrency_conflict());

        // Neither leg applied
        let a_after = store.fetch_wallet(a.id).await.unwrap().unwrap();
        assert_eq!(a_after.balance, dec!(0));
        assert_eq!(a_after.version, 1);
        assert!(store.ledger_entries(a.id).await.unwrap().is_empty());
    }
}

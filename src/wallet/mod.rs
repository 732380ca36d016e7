//! Wallet accounts and the balance store
//!
//! A wallet holds a single currency for a single owner. Balances are
//! mutated only through compare-and-swap on the wallet's version counter,
//! with the matching ledger entry appended in the same atomic unit.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::{Amount, CurrencyCode, Direction, DomainError, PaymentSource};
use crate::ledger::LedgerEntry;
use crate::store::{BalanceMutation, IdempotencyCompletion, SettlementStore, StoreError};

/// Wallet lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletStatus {
    Active,
    Frozen,
    Closed,
}

impl std::fmt::Display for WalletStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WalletStatus::Active => write!(f, "active"),
            WalletStatus::Frozen => write!(f, "frozen"),
            WalletStatus::Closed => write!(f, "closed"),
        }
    }
}

impl FromStr for WalletStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(WalletStatus::Active),
            "frozen" => Ok(WalletStatus::Frozen),
            "closed" => Ok(WalletStatus::Closed),
            other => Err(format!("unknown wallet status: {}", other)),
        }
    }
}

/// A per-owner, per-currency wallet.
///
/// `version` is the optimistic-concurrency counter: every successful balance
/// mutation increments it, and writes are conditioned on the version the
/// caller read. Wallets are never deleted, only marked closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletAccount {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub currency: CurrencyCode,
    /// Fixed-point balance; may be negative only for overdraft-eligible wallets
    pub balance: Decimal,
    pub version: i64,
    pub status: WalletStatus,
    pub overdraft_eligible: bool,
    pub created_at: DateTime<Utc>,
}

impl WalletAccount {
    /// Activate a new wallet for the owner's first use of a currency.
    pub fn activate(owner_id: Uuid, currency: CurrencyCode, overdraft_eligible: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id,
            currency,
            balance: Decimal::ZERO,
            version: 1,
            status: WalletStatus::Active,
            overdraft_eligible,
            created_at: Utc::now(),
        }
    }

    /// Reject movements on frozen or closed wallets.
    pub fn ensure_open(&self) -> Result<(), DomainError> {
        match self.status {
            WalletStatus::Active => Ok(()),
            WalletStatus::Frozen => Err(DomainError::WalletFrozen(self.id)),
            WalletStatus::Closed => Err(DomainError::WalletClosed(self.id)),
        }
    }

    /// Compute the balance this movement would leave, enforcing the
    /// non-negative rule for wallets without overdraft.
    pub fn projected_balance(
        &self,
        direction: Direction,
        amount: &Amount,
    ) -> Result<Decimal, DomainError> {
        match direction {
            Direction::Credit => Ok(self.balance + amount.value()),
            Direction::Debit => {
                let next = self.balance - amount.value();
                if next < Decimal::ZERO && !self.overdraft_eligible {
                    return Err(DomainError::insufficient_funds(
                        amount.value(),
                        self.balance,
                    ));
                }
                Ok(next)
            }
        }
    }
}

/// Audit fields carried onto the ledger entry of a movement.
#[derive(Debug, Clone)]
pub struct EntryMeta {
    /// Provider reference; `None` for internal adjustments
    pub external_ref: Option<String>,
    pub source: PaymentSource,
    /// Shared across the legs of a multi-leg operation
    pub correlation_id: Uuid,
}

/// Result of a successfully applied movement.
#[derive(Debug, Clone)]
pub struct Applied {
    pub entry: LedgerEntry,
    pub balance: Decimal,
    pub version: i64,
}

/// Errors from balance store operations
#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    /// Business rule violation; permanent under retry
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Another writer won the version race; the caller may retry
    #[error("Concurrency conflict for wallet {wallet_id}: expected version {expected}, found {actual}")]
    Conflict {
        wallet_id: Uuid,
        expected: i64,
        actual: i64,
    },

    /// Storage failure; the attempt aborted without partial writes
    #[error("Store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for WalletError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ConcurrencyConflict {
                wallet_id,
                expected,
                actual,
            } => WalletError::Conflict {
                wallet_id,
                expected,
                actual,
            },
            other => WalletError::Store(other),
        }
    }
}

/// Balance store: the only component that mutates wallet balances.
///
/// Each movement is a single CAS attempt; callers that can tolerate
/// contention retry around it (the reconciler does, with a bounded budget).
#[derive(Clone)]
pub struct BalanceStore {
    store: Arc<dyn SettlementStore>,
}

impl BalanceStore {
    pub fn new(store: Arc<dyn SettlementStore>) -> Self {
        Self { store }
    }

    /// Activate a wallet on first use of a currency for this owner.
    pub async fn activate(
        &self,
        owner_id: Uuid,
        currency: CurrencyCode,
        overdraft_eligible: bool,
    ) -> Result<WalletAccount, WalletError> {
        if let Some(existing) = self.store.find_wallet(owner_id, &currency).await? {
            return Err(DomainError::WalletExists {
                owner_id,
                currency: existing.currency,
            }
            .into());
        }

        let wallet = WalletAccount::activate(owner_id, currency, overdraft_eligible);
        self.store.insert_wallet(&wallet).await?;

        tracing::info!(
            wallet_id = %wallet.id,
            owner_id = %wallet.owner_id,
            currency = %wallet.currency,
            "Wallet activated"
        );

        Ok(wallet)
    }

    /// Fetch a wallet or fail with `WalletNotFound`.
    pub async fn get(&self, wallet_id: Uuid) -> Result<WalletAccount, WalletError> {
        self.store
            .fetch_wallet(wallet_id)
            .await?
            .ok_or_else(|| DomainError::WalletNotFound(wallet_id).into())
    }

    /// Build the conditional write for a movement against a wallet snapshot.
    ///
    /// Pure validation and computation; the `amount` must already be in the
    /// wallet's currency. Nothing is persisted until [`BalanceStore::apply`].
    pub fn prepare(
        &self,
        wallet: &WalletAccount,
        direction: Direction,
        amount: &Amount,
        meta: EntryMeta,
    ) -> Result<BalanceMutation, DomainError> {
        wallet.ensure_open()?;
        let new_balance = wallet.projected_balance(direction, amount)?;

        let entry = LedgerEntry::record(
            wallet.id,
            direction,
            amount,
            new_balance,
            meta.external_ref,
            meta.source,
            meta.correlation_id,
        );

        Ok(BalanceMutation {
            expected_version: wallet.version,
            new_balance,
            entry,
        })
    }

    /// Commit one movement: CAS the balance and append the ledger entry in a
    /// single atomic unit, optionally completing an idempotency record in
    /// the same unit.
    pub async fn apply(
        &self,
        mutation: BalanceMutation,
        completion: Option<&IdempotencyCompletion>,
    ) -> Result<Applied, WalletError> {
        let applied = Applied {
            balance: mutation.new_balance,
            version: mutation.expected_version + 1,
            entry: mutation.entry.clone(),
        };
        self.store.commit_mutations(&[mutation], completion).await?;
        Ok(applied)
    }

    /// Commit the two legs of a transfer atomically: both succeed or neither.
    pub async fn apply_pair(
        &self,
        debit: BalanceMutation,
        credit: BalanceMutation,
        completion: Option<&IdempotencyCompletion>,
    ) -> Result<(Applied, Applied), WalletError> {
        let applied_debit = Applied {
            balance: debit.new_balance,
            version: debit.expected_version + 1,
            entry: debit.entry.clone(),
        };
        let applied_credit = Applied {
            balance: credit.new_balance,
            version: credit.expected_version + 1,
            entry: credit.entry.clone(),
        };

        // Deterministic ordering by wallet id keeps concurrent transfers
        // from deadlocking on row locks.
        let mutations = if debit.entry.wallet_id <= credit.entry.wallet_id {
            [debit, credit]
        } else {
            [credit, debit]
        };
        self.store.commit_mutations(&mutations, completion).await?;
        Ok((applied_debit, applied_credit))
    }

    /// Single-attempt credit. The amount's currency must match the wallet's.
    pub async fn credit(
        &self,
        wallet_id: Uuid,
        amount: &Amount,
        currency: &CurrencyCode,
        meta: EntryMeta,
    ) -> Result<Applied, WalletError> {
        self.movement(wallet_id, Direction::Credit, amount, currency, meta)
            .await
    }

    /// Single-attempt debit. The amount's currency must match the wallet's.
    pub async fn debit(
        &self,
        wallet_id: Uuid,
        amount: &Amount,
        currency: &CurrencyCode,
        meta: EntryMeta,
    ) -> Result<Applied, WalletError> {
        self.movement(wallet_id, Direction::Debit, amount, currency, meta)
            .await
    }

    async fn movement(
        &self,
        wallet_id: Uuid,
        direction: Direction,
        amount: &Amount,
        currency: &CurrencyCode,
        meta: EntryMeta,
    ) -> Result<Applied, WalletError> {
        let wallet = self.get(wallet_id).await?;
        if &wallet.currency != currency {
            return Err(DomainError::CurrencyMismatch {
                wallet: wallet.currency,
                movement: currency.clone(),
            }
            .into());
        }
        let mutation = self.prepare(&wallet, direction, amount, meta)?;
        self.apply(mutation, None).await
    }

    /// Freeze an active wallet.
    pub async fn freeze(&self, wallet_id: Uuid) -> Result<(), WalletError> {
        self.transition(wallet_id, WalletStatus::Frozen).await
    }

    /// Unfreeze a frozen wallet.
    pub async fn unfreeze(&self, wallet_id: Uuid) -> Result<(), WalletError> {
        let wallet = self.get(wallet_id).await?;
        if wallet.status == WalletStatus::Closed {
            return Err(DomainError::WalletClosed(wallet_id).into());
        }
        self.store
            .update_wallet_status(wallet_id, WalletStatus::Active)
            .await?;
        Ok(())
    }

    /// Close a wallet permanently. Closed wallets are kept for audit.
    pub async fn close(&self, wallet_id: Uuid) -> Result<(), WalletError> {
        self.transition(wallet_id, WalletStatus::Closed).await
    }

    async fn transition(&self, wallet_id: Uuid, status: WalletStatus) -> Result<(), WalletError> {
        // Existence check first so callers get WalletNotFound, not a no-op
        let _ = self.get(wallet_id).await?;
        self.store.update_wallet_status(wallet_id, status).await?;
        tracing::info!(wallet_id = %wallet_id, status = %status, "Wallet status changed");
        Ok(())
    }
}

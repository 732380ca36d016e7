//! Settlement Reconciler
//!
//! Orchestrates exactly-once settlement of payment events and internal
//! transfers. Every settlement runs the same shape:
//!
//! 1. win the idempotency gate (or replay the recorded outcome),
//! 2. convert the amount once, stamping the rate for the whole attempt,
//! 3. commit the balance mutation under a bounded CAS retry budget, with
//!    the idempotency completion riding in the same atomic unit.
//!
//! Business rejections (insufficient funds, frozen wallet) are recorded as
//! permanent failures and replayed verbatim on redelivery. Infrastructure
//! failures are recorded as transient so the provider's retry settles the
//! event on a later delivery.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use uuid::Uuid;

use crate::domain::{Amount, DomainError, PaymentEvent, SettlementOutcome, TransferCommand, TransferOutcome};
use crate::idempotency::{Begin, IdempotencyError, IdempotencyLedger, IdempotencyStatus};
use crate::rates::ExchangeRateCache;
use crate::store::StoreError;
use crate::wallet::{BalanceStore, EntryMeta, WalletAccount, WalletError};

/// Tunable settlement behavior.
#[derive(Debug, Clone)]
pub struct SettlementPolicy {
    /// CAS attempts per settlement before recording a transient failure
    pub max_balance_retries: u32,
    /// Linear backoff unit between CAS attempts
    pub balance_retry_backoff: StdDuration,
    /// How many times to poll a key that another delivery holds pending
    pub in_progress_polls: u32,
    pub in_progress_poll_interval: StdDuration,
    /// Refuse rates served past their validity window under provider failure
    pub reject_stale_rates: bool,
    /// Retention window for idempotency records
    pub idempotency_ttl: Duration,
}

impl Default for SettlementPolicy {
    fn default() -> Self {
        Self {
            max_balance_retries: 5,
            balance_retry_backoff: StdDuration::from_millis(25),
            in_progress_polls: 3,
            in_progress_poll_interval: StdDuration::from_millis(50),
            reject_stale_rates: false,
            idempotency_ttl: Duration::hours(24),
        }
    }
}

/// Errors that abort a settlement without a recorded outcome
#[derive(Debug, thiserror::Error)]
pub enum SettleError {
    /// Another delivery holds the key pending; the caller should retry later
    #[error("Settlement in progress for key {0}")]
    InFlight(String),

    /// The key exists with a different payload; a client error
    #[error("Payload mismatch for idempotency key {0}")]
    PayloadMismatch(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<IdempotencyError> for SettleError {
    fn from(e: IdempotencyError) -> Self {
        match e {
            IdempotencyError::PayloadMismatch(key) => SettleError::PayloadMismatch(key),
            IdempotencyError::Store(e) => SettleError::Store(e),
        }
    }
}

/// The settlement reconciler component.
#[derive(Clone)]
pub struct SettlementReconciler {
    balances: BalanceStore,
    idempotency: IdempotencyLedger,
    rates: Arc<ExchangeRateCache>,
    policy: SettlementPolicy,
}

impl SettlementReconciler {
    pub fn new(
        balances: BalanceStore,
        idempotency: IdempotencyLedger,
        rates: Arc<ExchangeRateCache>,
        policy: SettlementPolicy,
    ) -> Self {
        Self {
            balances,
            idempotency,
            rates,
            policy,
        }
    }

    /// Settle a payment event exactly once.
    ///
    /// Duplicate deliveries of a completed settlement replay the recorded
    /// outcome with `Duplicate` status and never touch balances. Redelivery
    /// after a transient failure settles the event again.
    pub async fn settle(&self, event: &PaymentEvent) -> Result<SettlementOutcome, SettleError> {
        let key = event.idempotency_key();
        let hash = event.payload_hash();

        let mut polls = 0;
        loop {
            match self
                .idempotency
                .try_begin(&key, &hash, self.policy.idempotency_ttl)
                .await?
            {
                Begin::Won => return self.run_settlement(event, &key).await,
                Begin::Existing(record) => match record.status {
                    IdempotencyStatus::Completed => {
                        tracing::info!(key = %key, "Duplicate delivery, replaying completed settlement");
                        return Ok(SettlementOutcome::duplicate(record.ledger_entry_id));
                    }
                    IdempotencyStatus::Failed => {
                        // Transient failures re-arm inside try_begin, so
                        // only permanent rejections reach this arm.
                        let outcome = record
                            .stored_outcome()
                            .unwrap_or_else(|| SettlementOutcome::failed("previously rejected"));
                        tracing::info!(key = %key, "Duplicate delivery, replaying permanent rejection");
                        return Ok(outcome);
                    }
                    IdempotencyStatus::Pending => {
                        if polls >= self.policy.in_progress_polls {
                            return Err(SettleError::InFlight(key));
                        }
                        polls += 1;
                        tokio::time::sleep(self.policy.in_progress_poll_interval).await;
                    }
                },
            }
        }
    }

    async fn run_settlement(
        &self,
        event: &PaymentEvent,
        key: &str,
    ) -> Result<SettlementOutcome, SettleError> {
        let wallet = match self.balances.get(event.wallet_id).await {
            Ok(wallet) => wallet,
            Err(WalletError::Domain(e)) => return self.reject_settlement(key, &e).await,
            Err(e) => return self.abort_settlement(key, e).await,
        };

        // Convert once, before the CAS loop, so every retry settles at the
        // same stamped rate.
        let amount = match self.settlement_amount(event, &wallet).await {
            Ok(amount) => amount,
            Err(Conversion::Rejected(reason)) => {
                let outcome = SettlementOutcome::failed(&reason);
                self.idempotency.fail(key, &outcome, true).await?;
                tracing::warn!(key = %key, reason = %reason, "Settlement rejected");
                return Ok(outcome);
            }
            Err(Conversion::Unavailable(reason)) => {
                let outcome = SettlementOutcome::failed(&reason);
                self.idempotency.fail(key, &outcome, false).await?;
                tracing::warn!(key = %key, reason = %reason, "Settlement deferred, no usable rate");
                return Ok(outcome);
            }
        };

        let correlation_id = Uuid::new_v4();

        for attempt in 0..self.policy.max_balance_retries {
            let wallet = match self.balances.get(event.wallet_id).await {
                Ok(wallet) => wallet,
                Err(WalletError::Domain(e)) => return self.reject_settlement(key, &e).await,
                Err(e) => return self.abort_settlement(key, e).await,
            };

            let meta = EntryMeta {
                external_ref: Some(event.external_ref.clone()),
                source: event.source,
                correlation_id,
            };
            let mutation = match self.balances.prepare(&wallet, event.direction, &amount, meta) {
                Ok(mutation) => mutation,
                Err(e) => return self.reject_settlement(key, &e).await,
            };

            let outcome = SettlementOutcome::completed(mutation.entry.id);
            let completion = self.idempotency.completion(key, mutation.entry.id, &outcome)?;

            match self.balances.apply(mutation, Some(&completion)).await {
                Ok(applied) => {
                    tracing::info!(
                        key = %key,
                        wallet_id = %event.wallet_id,
                        entry_id = %applied.entry.id,
                        balance = %applied.balance,
                        "Settlement completed"
                    );
                    return Ok(outcome);
                }
                Err(WalletError::Conflict { .. }) => {
                    tracing::warn!(
                        key = %key,
                        "Concurrency conflict, retrying (attempt {}/{})",
                        attempt + 1,
                        self.policy.max_balance_retries
                    );
                    tokio::time::sleep(self.policy.balance_retry_backoff * (attempt + 1)).await;
                }
                Err(WalletError::Domain(e)) => return self.reject_settlement(key, &e).await,
                Err(e) => return self.abort_settlement(key, e).await,
            }
        }

        // Retry budget exhausted under contention: record transient so the
        // provider's redelivery settles the event.
        let outcome = SettlementOutcome::failed("concurrency conflict, retry budget exhausted");
        self.idempotency.fail(key, &outcome, false).await?;
        tracing::warn!(key = %key, "Settlement failed transiently under contention");
        Ok(outcome)
    }

    /// Resolve the amount in the wallet's currency.
    async fn settlement_amount(
        &self,
        event: &PaymentEvent,
        wallet: &WalletAccount,
    ) -> Result<Amount, Conversion> {
        if event.currency == wallet.currency {
            return Ok(event.amount.clone());
        }

        let quote = self
            .rates
            .get_rate(&event.currency, &wallet.currency)
            .await
            .map_err(|e| Conversion::Unavailable(e.to_string()))?;

        if quote.stale && self.policy.reject_stale_rates {
            return Err(Conversion::Unavailable(format!(
                "stale rate refused for {}/{}",
                event.currency, wallet.currency
            )));
        }

        event
            .amount
            .convert(quote.snapshot.rate)
            .map_err(|e| Conversion::Rejected(format!("conversion failed: {}", e)))
    }

    /// Record a permanent business rejection and replay it on redelivery.
    async fn reject_settlement(
        &self,
        key: &str,
        error: &DomainError,
    ) -> Result<SettlementOutcome, SettleError> {
        let outcome = SettlementOutcome::failed(error.to_string());
        self.idempotency
            .fail(key, &outcome, error.is_permanent())
            .await?;
        tracing::warn!(key = %key, error = %error, "Settlement rejected");
        Ok(outcome)
    }

    /// Best-effort transient failure marker before surfacing a store error.
    /// If the marker write fails too, the stale-pending job re-arms the key.
    async fn abort_settlement(
        &self,
        key: &str,
        error: WalletError,
    ) -> Result<SettlementOutcome, SettleError> {
        let outcome = SettlementOutcome::failed("storage failure during settlement");
        if let Err(e) = self.idempotency.fail(key, &outcome, false).await {
            tracing::error!(key = %key, error = %e, "Failed to record transient failure");
        }
        match error {
            WalletError::Store(e) => Err(SettleError::Store(e)),
            WalletError::Conflict {
                wallet_id,
                expected,
                actual,
            } => Err(SettleError::Store(StoreError::ConcurrencyConflict {
                wallet_id,
                expected,
                actual,
            })),
            WalletError::Domain(e) => {
                // Shouldn't reach here; treat as a recorded rejection
                Ok(SettlementOutcome::failed(e.to_string()))
            }
        }
    }

    /// Execute an internal transfer exactly once.
    ///
    /// Both legs commit atomically under one correlation id; the credit leg
    /// is converted at a rate stamped once before the retry loop.
    pub async fn transfer(&self, cmd: &TransferCommand) -> Result<TransferOutcome, SettleError> {
        let key = cmd.idempotency_key();
        let hash = cmd.payload_hash();

        let mut polls = 0;
        loop {
            match self
                .idempotency
                .try_begin(&key, &hash, self.policy.idempotency_ttl)
                .await?
            {
                Begin::Won => return self.run_transfer(cmd, &key).await,
                Begin::Existing(record) => match record.status {
                    IdempotencyStatus::Completed => {
                        let mut outcome: TransferOutcome = record
                            .stored_outcome()
                            .unwrap_or_else(|| TransferOutcome::failed("outcome unavailable"));
                        outcome.status = crate::domain::SettlementStatus::Duplicate;
                        tracing::info!(key = %key, "Duplicate transfer, replaying completed outcome");
                        return Ok(outcome);
                    }
                    IdempotencyStatus::Failed => {
                        let outcome = record
                            .stored_outcome()
                            .unwrap_or_else(|| TransferOutcome::failed("previously rejected"));
                        return Ok(outcome);
                    }
                    IdempotencyStatus::Pending => {
                        if polls >= self.policy.in_progress_polls {
                            return Err(SettleError::InFlight(key));
                        }
                        polls += 1;
                        tokio::time::sleep(self.policy.in_progress_poll_interval).await;
                    }
                },
            }
        }
    }

    async fn run_transfer(
        &self,
        cmd: &TransferCommand,
        key: &str,
    ) -> Result<TransferOutcome, SettleError> {
        if cmd.from_wallet_id == cmd.to_wallet_id {
            return self
                .reject_transfer(key, &DomainError::SameWalletTransfer)
                .await;
        }

        let (from, to) = match self.transfer_wallets(cmd).await {
            Ok(pair) => pair,
            Err(TransferFetch::Domain(e)) => return self.reject_transfer(key, &e).await,
            Err(TransferFetch::Wallet(e)) => return self.abort_transfer(key, e).await,
        };

        let credit_amount = if from.currency == to.currency {
            cmd.amount.clone()
        } else {
            match self.conversion_amount(cmd, &from, &to).await {
                Ok(amount) => amount,
                Err(Conversion::Rejected(reason)) => {
                    let outcome = TransferOutcome::failed(&reason);
                    self.idempotency.fail(key, &outcome, true).await?;
                    return Ok(outcome);
                }
                Err(Conversion::Unavailable(reason)) => {
                    let outcome = TransferOutcome::failed(&reason);
                    self.idempotency.fail(key, &outcome, false).await?;
                    return Ok(outcome);
                }
            }
        };

        let correlation_id = Uuid::new_v4();

        for attempt in 0..self.policy.max_balance_retries {
            let (from, to) = match self.transfer_wallets(cmd).await {
                Ok(pair) => pair,
                Err(TransferFetch::Domain(e)) => return self.reject_transfer(key, &e).await,
                Err(TransferFetch::Wallet(e)) => return self.abort_transfer(key, e).await,
            };

            let meta = EntryMeta {
                external_ref: None,
                source: crate::domain::PaymentSource::InternalTransfer,
                correlation_id,
            };
            let debit = match self.balances.prepare(
                &from,
                crate::domain::Direction::Debit,
                &cmd.amount,
                meta.clone(),
            ) {
                Ok(mutation) => mutation,
                Err(e) => return self.reject_transfer(key, &e).await,
            };
            let credit = match self.balances.prepare(
                &to,
                crate::domain::Direction::Credit,
                &credit_amount,
                meta,
            ) {
                Ok(mutation) => mutation,
                Err(e) => return self.reject_transfer(key, &e).await,
            };

            let outcome = TransferOutcome::completed(correlation_id, debit.entry.id, credit.entry.id);
            let completion = self.idempotency.completion(key, debit.entry.id, &outcome)?;

            match self.balances.apply_pair(debit, credit, Some(&completion)).await {
                Ok((applied_debit, applied_credit)) => {
                    tracing::info!(
                        key = %key,
                        correlation_id = %correlation_id,
                        debit_entry = %applied_debit.entry.id,
                        credit_entry = %applied_credit.entry.id,
                        "Transfer completed"
                    );
                    return Ok(outcome);
                }
                Err(WalletError::Conflict { .. }) => {
                    tracing::warn!(
                        key = %key,
                        "Concurrency conflict, retrying (attempt {}/{})",
                        attempt + 1,
                        self.policy.max_balance_retries
                    );
                    tokio::time::sleep(self.policy.balance_retry_backoff * (attempt + 1)).await;
                }
                Err(WalletError::Domain(e)) => return self.reject_transfer(key, &e).await,
                Err(e) => return self.abort_transfer(key, e).await,
            }
        }

        let outcome = TransferOutcome::failed("concurrency conflict, retry budget exhausted");
        self.idempotency.fail(key, &outcome, false).await?;
        tracing::warn!(key = %key, "Transfer failed transiently under contention");
        Ok(outcome)
    }

    async fn transfer_wallets(
        &self,
        cmd: &TransferCommand,
    ) -> Result<(WalletAccount, WalletAccount), TransferFetch> {
        let from = self.fetch_for_transfer(cmd.from_wallet_id).await?;
        let to = self.fetch_for_transfer(cmd.to_wallet_id).await?;
        Ok((from, to))
    }

    async fn fetch_for_transfer(&self, wallet_id: Uuid) -> Result<WalletAccount, TransferFetch> {
        match self.balances.get(wallet_id).await {
            Ok(wallet) => Ok(wallet),
            Err(WalletError::Domain(e)) => Err(TransferFetch::Domain(e)),
            Err(e) => Err(TransferFetch::Wallet(e)),
        }
    }

    async fn conversion_amount(
        &self,
        cmd: &TransferCommand,
        from: &WalletAccount,
        to: &WalletAccount,
    ) -> Result<Amount, Conversion> {
        let quote = self
            .rates
            .get_rate(&from.currency, &to.currency)
            .await
            .map_err(|e| Conversion::Unavailable(e.to_string()))?;

        if quote.stale && self.policy.reject_stale_rates {
            return Err(Conversion::Unavailable(format!(
                "stale rate refused for {}/{}",
                from.currency, to.currency
            )));
        }

        cmd.amount
            .convert(quote.snapshot.rate)
            .map_err(|e| Conversion::Rejected(format!("conversion failed: {}", e)))
    }

    async fn reject_transfer(
        &self,
        key: &str,
        error: &DomainError,
    ) -> Result<TransferOutcome, SettleError> {
        let outcome = TransferOutcome::failed(error.to_string());
        self.idempotency
            .fail(key, &outcome, error.is_permanent())
            .await?;
        tracing::warn!(key = %key, error = %error, "Transfer rejected");
        Ok(outcome)
    }

    async fn abort_transfer(
        &self,
        key: &str,
        error: WalletError,
    ) -> Result<TransferOutcome, SettleError> {
        let outcome = TransferOutcome::failed("storage failure during transfer");
        if let Err(e) = self.idempotency.fail(key, &outcome, false).await {
            tracing::error!(key = %key, error = %e, "Failed to record transient failure");
        }
        match error {
            WalletError::Store(e) => Err(SettleError::Store(e)),
            WalletError::Conflict {
                wallet_id,
                expected,
                actual,
            } => Err(SettleError::Store(StoreError::ConcurrencyConflict {
                wallet_id,
                expected,
                actual,
            })),
            WalletError::Domain(e) => Ok(TransferOutcome::failed(e.to_string())),
        }
    }
}

/// Why an amount could not be resolved in the wallet's currency
enum Conversion {
    /// Deterministic rejection; recorded permanent
    Rejected(String),
    /// No usable rate right now; recorded transient
    Unavailable(String),
}

/// Why a transfer leg's wallet could not be loaded
enum TransferFetch {
    Domain(DomainError),
    Wallet(WalletError),
}

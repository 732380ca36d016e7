//! Wallet ledger
//!
//! Immutable, append-only audit records of balance changes. Every wallet
//! mutation appends exactly one entry in the same atomic unit, so the sum of
//! a wallet's entries always equals its current balance.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{Amount, Direction, PaymentSource};

/// A single immutable ledger entry.
///
/// `amount` is signed: positive for credits, negative for debits.
/// `balance_after` snapshots the wallet balance that resulted from this
/// entry, so the ledger is auditable without replaying it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub wallet_id: Uuid,
    /// Signed amount in the wallet's currency
    pub amount: Decimal,
    /// Wallet balance immediately after this entry
    pub balance_after: Decimal,
    /// Provider transaction reference; `None` for internal adjustments
    pub external_ref: Option<String>,
    pub direction: Direction,
    pub source: PaymentSource,
    /// Links the legs of a multi-leg operation (e.g. a conversion's debit
    /// and credit entries share one correlation id)
    pub correlation_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Build an entry for a movement of `amount` in `direction`.
    pub fn record(
        wallet_id: Uuid,
        direction: Direction,
        amount: &Amount,
        balance_after: Decimal,
        external_ref: Option<String>,
        source: PaymentSource,
        correlation_id: Uuid,
    ) -> Self {
        let signed = match direction {
            Direction::Credit => amount.value(),
            Direction::Debit => -amount.value(),
        };
        Self {
            id: Uuid::new_v4(),
            wallet_id,
            amount: signed,
            balance_after,
            external_ref,
            direction,
            source,
            correlation_id,
            created_at: Utc::now(),
        }
    }
}

/// Sum of the signed amounts of a wallet's entries.
pub fn ledger_sum(entries: &[LedgerEntry]) -> Decimal {
    entries.iter().map(|e| e.amount).sum()
}

/// Conservation invariant: the entries must add up to the wallet balance.
pub fn is_conserved(entries: &[LedgerEntry], balance: Decimal) -> bool {
    ledger_sum(entries) == balance
}

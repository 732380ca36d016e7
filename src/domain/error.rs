//! Domain Error Types
//!
//! Pure domain errors that don't depend on infrastructure.

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use super::CurrencyCode;

/// Business rule violations and domain invariant failures.
///
/// Independent of the web/infrastructure layer. The reconciler uses
/// [`DomainError::is_permanent`] to decide whether a failed settlement may
/// be re-delivered: permanent failures are recorded and replayed verbatim,
/// since retrying them would re-attempt the same violation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DomainError {
    /// Debit would drive a non-overdraft wallet negative
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds {
        required: Decimal,
        available: Decimal,
    },

    /// Wallet is frozen and cannot process movements
    #[error("Wallet is frozen: {0}")]
    WalletFrozen(Uuid),

    /// Wallet has been closed
    #[error("Wallet is closed: {0}")]
    WalletClosed(Uuid),

    /// Wallet not found
    #[error("Wallet not found: {0}")]
    WalletNotFound(Uuid),

    /// A wallet for this owner and currency already exists
    #[error("Wallet already exists for owner {owner_id} in {currency}")]
    WalletExists {
        owner_id: Uuid,
        currency: CurrencyCode,
    },

    /// Amount currency does not match the wallet currency
    #[error("Currency mismatch: wallet holds {wallet}, movement is in {movement}")]
    CurrencyMismatch {
        wallet: CurrencyCode,
        movement: CurrencyCode,
    },

    /// Transfer with identical source and destination wallet
    #[error("Cannot transfer to the same wallet")]
    SameWalletTransfer,

    /// Invalid amount (zero, negative, or exceeds limit)
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
}

impl DomainError {
    /// Create an insufficient funds error
    pub fn insufficient_funds(required: Decimal, available: Decimal) -> Self {
        Self::InsufficientFunds {
            required,
            available,
        }
    }

    /// Whether retrying the same operation would fail identically.
    ///
    /// Permanent failures are recorded against the idempotency key so a
    /// redelivered event replays the rejection instead of re-attempting it.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::InsufficientFunds { .. }
                | Self::WalletFrozen(_)
                | Self::WalletClosed(_)
                | Self::WalletNotFound(_)
                | Self::CurrencyMismatch { .. }
                | Self::SameWalletTransfer
                | Self::InvalidAmount(_)
        )
    }
}

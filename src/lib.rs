//! remitflow Library
//!
//! Re-exports modules for integration testing and external use.

pub mod api;
pub mod config;
pub mod db;
pub mod domain;
pub mod idempotency;
pub mod jobs;
pub mod ledger;
pub mod rates;
pub mod reconciler;
pub mod store;
pub mod wallet;

mod error;

pub use config::Config;
pub use domain::{
    Amount, AmountError, CurrencyCode, Direction, DomainError, PaymentEvent, PaymentSource,
    SettlementOutcome, SettlementStatus, TransferCommand, TransferOutcome,
};
pub use error::{AppError, AppResult};
pub use reconciler::{SettleError, SettlementPolicy, SettlementReconciler};

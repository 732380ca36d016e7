//! Domain module
//!
//! Validated domain primitives and the settlement core's inbound/outbound
//! shapes.

pub mod error;
pub mod event;
pub mod money;

pub use error::DomainError;
pub use event::{
    Direction, PaymentEvent, PaymentSource, SettlementOutcome, SettlementStatus, TransferCommand,
    TransferOutcome,
};
pub use money::{Amount, AmountError, CurrencyCode, CurrencyError};

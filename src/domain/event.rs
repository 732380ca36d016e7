//! Payment events and settlement outcomes
//!
//! The inbound and outbound shapes of the settlement core. A `PaymentEvent`
//! is what a provider webhook collaborator hands us after signature and
//! shape validation; a `SettlementOutcome` is what the notification
//! dispatcher consumes afterwards.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::{Amount, CurrencyCode};

/// Direction of a balance movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Credit,
    Debit,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Credit => write!(f, "credit"),
            Direction::Debit => write!(f, "debit"),
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "credit" => Ok(Direction::Credit),
            "debit" => Ok(Direction::Debit),
            other => Err(format!("Unknown direction: {}", other)),
        }
    }
}

/// Origin of a balance movement.
///
/// Provider-originated sources (mobile money, crypto, card) arrive as
/// webhook events; the remaining sources are produced internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentSource {
    MobileMoney,
    Crypto,
    Card,
    InternalTransfer,
    Fee,
    Refund,
}

impl fmt::Display for PaymentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaymentSource::MobileMoney => write!(f, "mobile_money"),
            PaymentSource::Crypto => write!(f, "crypto"),
            PaymentSource::Card => write!(f, "card"),
            PaymentSource::InternalTransfer => write!(f, "internal_transfer"),
            PaymentSource::Fee => write!(f, "fee"),
            PaymentSource::Refund => write!(f, "refund"),
        }
    }
}

impl std::str::FromStr for PaymentSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mobile_money" => Ok(PaymentSource::MobileMoney),
            "crypto" => Ok(PaymentSource::Crypto),
            "card" => Ok(PaymentSource::Card),
            "internal_transfer" => Ok(PaymentSource::InternalTransfer),
            "fee" => Ok(PaymentSource::Fee),
            "refund" => Ok(PaymentSource::Refund),
            other => Err(format!("Unknown payment source: {}", other)),
        }
    }
}

/// A validated payment event, ready for settlement.
///
/// `external_ref` is the provider-supplied transaction reference. It is
/// unique per provider, so the idempotency key scopes it by source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentEvent {
    /// Provider-supplied transaction reference
    pub external_ref: String,
    /// Which rail delivered this event
    pub source: PaymentSource,
    /// Target wallet
    pub wallet_id: Uuid,
    /// Amount in the event's currency (always positive)
    pub amount: Amount,
    /// Currency the provider settled in
    pub currency: CurrencyCode,
    /// Credit or debit against the wallet
    pub direction: Direction,
    /// Opaque provider metadata, stored for audit only
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl PaymentEvent {
    /// Idempotency key for this event: the external reference scoped by
    /// provider, since references are only unique per provider.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.source, self.external_ref)
    }

    /// SHA-256 hash over the settlement-relevant fields.
    ///
    /// Used to detect a re-used reference carrying a different payload,
    /// which is a client error rather than a retry.
    pub fn payload_hash(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.external_ref.as_bytes());
        hasher.update(self.source.to_string().as_bytes());
        hasher.update(self.wallet_id.as_bytes());
        hasher.update(self.amount.value().to_string().as_bytes());
        hasher.update(self.currency.as_str().as_bytes());
        hasher.update(self.direction.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Final status of a settlement attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    Completed,
    Failed,
    Duplicate,
}

/// Outcome of settling a payment event.
///
/// Consumed by notification/dispatch collaborators and stored alongside the
/// idempotency record so duplicate deliveries replay the original result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementOutcome {
    pub status: SettlementStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_entry_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SettlementOutcome {
    pub fn completed(ledger_entry_id: Uuid) -> Self {
        Self {
            status: SettlementStatus::Completed,
            ledger_entry_id: Some(ledger_entry_id),
            reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: SettlementStatus::Failed,
            ledger_entry_id: None,
            reason: Some(reason.into()),
        }
    }

    /// Replay of a previously completed settlement.
    pub fn duplicate(ledger_entry_id: Option<Uuid>) -> Self {
        Self {
            status: SettlementStatus::Duplicate,
            ledger_entry_id,
            reason: None,
        }
    }
}

/// Command for an internal wallet-to-wallet transfer or conversion.
///
/// `reference` is caller-supplied and idempotent: re-submitting the same
/// reference replays the original outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferCommand {
    pub reference: String,
    pub from_wallet_id: Uuid,
    pub to_wallet_id: Uuid,
    /// Amount in the source wallet's currency
    pub amount: Amount,
    #[serde(default)]
    pub memo: Option<String>,
}

impl TransferCommand {
    /// Idempotency key for this transfer.
    pub fn idempotency_key(&self) -> String {
        format!("internal_transfer:{}", self.reference)
    }

    /// SHA-256 hash over the transfer-relevant fields.
    pub fn payload_hash(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.reference.as_bytes());
        hasher.update(self.from_wallet_id.as_bytes());
        hasher.update(self.to_wallet_id.as_bytes());
        hasher.update(self.amount.value().to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Outcome of an internal transfer: two ledger entries linked by a shared
/// correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOutcome {
    pub status: SettlementStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debit_entry_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credit_entry_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl TransferOutcome {
    pub fn completed(correlation_id: Uuid, debit_entry_id: Uuid, credit_entry_id: Uuid) -> Self {
        Self {
            status: SettlementStatus::Completed,
            correlation_id: Some(correlation_id),
            debit_entry_id: Some(debit_entry_id),
            credit_entry_id: Some(credit_entry_id),
            reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: SettlementStatus::Failed,
            correlation_id: None,
            debit_entry_id: None,
            credit_entry_id: None,
            reason: Some(reason.into()),
        }
    }
}

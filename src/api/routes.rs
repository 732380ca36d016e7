//! API Routes
//!
//! HTTP endpoint definitions.

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{
    Amount, CurrencyCode, Direction, PaymentEvent, PaymentSource, SettlementOutcome,
    TransferCommand, TransferOutcome,
};
use crate::error::AppError;
use crate::ledger::LedgerEntry;
use crate::reconciler::SettlementReconciler;
use crate::store::SettlementStore;
use crate::wallet::{BalanceStore, WalletAccount, WalletStatus};

const MAX_REFERENCE_LEN: usize = 128;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SettlementStore>,
    pub balances: BalanceStore,
    pub reconciler: Arc<SettlementReconciler>,
}

// =========================================================================
// Request/Response types
// =========================================================================

#[derive(Debug, Deserialize)]
pub struct CreateWalletRequest {
    pub owner_id: Uuid,
    pub currency: String,
    #[serde(default)]
    pub overdraft_eligible: bool,
}

#[derive(Debug, Serialize)]
pub struct WalletResponse {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub currency: String,
    pub balance: Decimal,
    pub version: i64,
    pub status: WalletStatus,
    pub overdraft_eligible: bool,
    pub created_at: DateTime<Utc>,
}

impl From<WalletAccount> for WalletResponse {
    fn from(wallet: WalletAccount) -> Self {
        Self {
            id: wallet.id,
            owner_id: wallet.owner_id,
            currency: wallet.currency.to_string(),
            balance: wallet.balance,
            version: wallet.version,
            status: wallet.status,
            overdraft_eligible: wallet.overdraft_eligible,
            created_at: wallet.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PaymentWebhookRequest {
    pub external_ref: String,
    pub source: String,
    pub wallet_id: Uuid,
    pub amount: String,
    pub currency: String,
    pub direction: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl PaymentWebhookRequest {
    /// Shape validation: everything a provider can get wrong before the
    /// settlement core ever sees the event.
    fn validate(self) -> Result<PaymentEvent, AppError> {
        if self.external_ref.trim().is_empty() {
            return Err(AppError::InvalidRequest(
                "external_ref must not be empty".to_string(),
            ));
        }
        if self.external_ref.len() > MAX_REFERENCE_LEN {
            return Err(AppError::InvalidRequest(format!(
                "external_ref exceeds {} characters",
                MAX_REFERENCE_LEN
            )));
        }

        let source = PaymentSource::from_str(&self.source)
            .map_err(AppError::InvalidRequest)?;
        let direction = Direction::from_str(&self.direction)
            .map_err(AppError::InvalidRequest)?;
        let amount = Amount::from_str(&self.amount)
            .map_err(|e| AppError::InvalidRequest(e.to_string()))?;
        let currency = CurrencyCode::new(&self.currency)
            .map_err(|e| AppError::InvalidRequest(e.to_string()))?;

        Ok(PaymentEvent {
            external_ref: self.external_ref,
            source,
            wallet_id: self.wallet_id,
            amount,
            currency,
            direction,
            metadata: self.metadata,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub reference: String,
    pub from_wallet_id: Uuid,
    pub to_wallet_id: Uuid,
    pub amount: String,
    #[serde(default)]
    pub memo: Option<String>,
}

impl TransferRequest {
    fn validate(self) -> Result<TransferCommand, AppError> {
        if self.reference.trim().is_empty() {
            return Err(AppError::InvalidRequest(
                "reference must not be empty".to_string(),
            ));
        }
        if self.reference.len() > MAX_REFERENCE_LEN {
            return Err(AppError::InvalidRequest(format!(
                "reference exceeds {} characters",
                MAX_REFERENCE_LEN
            )));
        }

        let amount = Amount::from_str(&self.amount)
            .map_err(|e| AppError::InvalidRequest(e.to_string()))?;

        Ok(TransferCommand {
            reference: self.reference,
            from_wallet_id: self.from_wallet_id,
            to_wallet_id: self.to_wallet_id,
            amount,
            memo: self.memo,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct LedgerEntryResponse {
    pub id: Uuid,
    pub amount: Decimal,
    pub balance_after: Decimal,
    pub external_ref: Option<String>,
    pub direction: Direction,
    pub source: PaymentSource,
    pub correlation_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl From<LedgerEntry> for LedgerEntryResponse {
    fn from(entry: LedgerEntry) -> Self {
        Self {
            id: entry.id,
            amount: entry.amount,
            balance_after: entry.balance_after,
            external_ref: entry.external_ref,
            direction: entry.direction,
            source: entry.source,
            correlation_id: entry.correlation_id,
            created_at: entry.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LedgerResponse {
    pub wallet_id: Uuid,
    pub balance: Decimal,
    pub entries: Vec<LedgerEntryResponse>,
}

// =========================================================================
// API Router
// =========================================================================

/// Create the API router
pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/wallets", post(create_wallet))
        .route("/wallets/:wallet_id", get(get_wallet))
        .route("/wallets/:wallet_id/ledger", get(get_ledger))
        .route("/wallets/:wallet_id/freeze", post(freeze_wallet))
        .route("/wallets/:wallet_id/unfreeze", post(unfreeze_wallet))
        .route("/wallets/:wallet_id/close", post(close_wallet))
        .route("/webhooks/payments", post(settle_payment))
        .route("/transfers", post(transfer))
}

// =========================================================================
// POST /wallets
// =========================================================================

/// Activate a wallet for an owner's first use of a currency
async fn create_wallet(
    State(state): State<AppState>,
    Json(request): Json<CreateWalletRequest>,
) -> Result<(StatusCode, Json<WalletResponse>), AppError> {
    let currency = CurrencyCode::new(&request.currency)
        .map_err(|e| AppError::InvalidRequest(e.to_string()))?;

    let wallet = state
        .balances
        .activate(request.owner_id, currency, request.overdraft_eligible)
        .await?;

    Ok((StatusCode::CREATED, Json(wallet.into())))
}

// =========================================================================
// GET /wallets/:wallet_id
// =========================================================================

/// Get wallet by ID
async fn get_wallet(
    State(state): State<AppState>,
    Path(wallet_id): Path<Uuid>,
) -> Result<Json<WalletResponse>, AppError> {
    let wallet = state.balances.get(wallet_id).await?;
    Ok(Json(wallet.into()))
}

// =========================================================================
// GET /wallets/:wallet_id/ledger
// =========================================================================

/// Full movement history for a wallet, oldest first
async fn get_ledger(
    State(state): State<AppState>,
    Path(wallet_id): Path<Uuid>,
) -> Result<Json<LedgerResponse>, AppError> {
    let wallet = state.balances.get(wallet_id).await?;
    let entries = state.store.ledger_entries(wallet_id).await?;

    Ok(Json(LedgerResponse {
        wallet_id,
        balance: wallet.balance,
        entries: entries.into_iter().map(Into::into).collect(),
    }))
}

// =========================================================================
// Wallet status transitions
// =========================================================================

async fn freeze_wallet(
    State(state): State<AppState>,
    Path(wallet_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.balances.freeze(wallet_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn unfreeze_wallet(
    State(state): State<AppState>,
    Path(wallet_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.balances.unfreeze(wallet_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn close_wallet(
    State(state): State<AppState>,
    Path(wallet_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.balances.close(wallet_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// =========================================================================
// POST /webhooks/payments
// =========================================================================

/// Settle a provider payment event.
///
/// Always returns 200 with the settlement outcome, including duplicate
/// replays and recorded rejections, so providers stop retrying. Transport
/// and contention errors surface as HTTP errors and should be retried.
async fn settle_payment(
    State(state): State<AppState>,
    Json(request): Json<PaymentWebhookRequest>,
) -> Result<Json<SettlementOutcome>, AppError> {
    let event = request.validate()?;
    let outcome = state.reconciler.settle(&event).await?;
    Ok(Json(outcome))
}

// =========================================================================
// POST /transfers
// =========================================================================

/// Execute an internal transfer between two wallets
async fn transfer(
    State(state): State<AppState>,
    Json(request): Json<TransferRequest>,
) -> Result<Json<TransferOutcome>, AppError> {
    let cmd = request.validate()?;
    let outcome = state.reconciler.transfer(&cmd).await?;
    Ok(Json(outcome))
}

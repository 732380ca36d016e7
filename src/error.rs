//! Error handling module
//!
//! Centralized error types and HTTP response conversion.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::domain::DomainError;
use crate::reconciler::SettleError;
use crate::store::StoreError;
use crate::wallet::WalletError;

/// Application-wide Result type
pub type AppResult<T> = Result<T, AppError>;

/// Application error types
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    // Client errors (4xx)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Version conflict: concurrent modification detected")]
    VersionConflict,

    #[error("Settlement in progress for key {0}")]
    SettlementInProgress(String),

    #[error("Idempotency conflict: same key with different payload")]
    IdempotencyConflict(String),

    // Domain errors
    #[error(transparent)]
    Domain(#[from] DomainError),

    // Server errors (5xx)
    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl From<WalletError> for AppError {
    fn from(e: WalletError) -> Self {
        match e {
            WalletError::Domain(e) => AppError::Domain(e),
            WalletError::Conflict { .. } => AppError::VersionConflict,
            WalletError::Store(e) => AppError::Store(e),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ConcurrencyConflict { .. } => AppError::VersionConflict,
            StoreError::WalletNotFound(id) => AppError::Domain(DomainError::WalletNotFound(id)),
            other => AppError::Store(other),
        }
    }
}

impl From<SettleError> for AppError {
    fn from(e: SettleError) -> Self {
        match e {
            SettleError::InFlight(key) => AppError::SettlementInProgress(key),
            SettleError::PayloadMismatch(key) => AppError::IdempotencyConflict(key),
            SettleError::Store(StoreError::ConcurrencyConflict { .. }) => AppError::VersionConflict,
            SettleError::Store(e) => AppError::Store(e),
        }
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, details) = match &self {
            // 400 Bad Request
            AppError::InvalidRequest(msg) => {
                (StatusCode::BAD_REQUEST, "invalid_request", Some(msg.clone()))
            }

            // 409 Conflict
            AppError::VersionConflict => {
                (StatusCode::CONFLICT, "version_conflict", None)
            }
            AppError::SettlementInProgress(key) => {
                (StatusCode::CONFLICT, "settlement_in_progress", Some(key.clone()))
            }
            AppError::IdempotencyConflict(key) => {
                (StatusCode::CONFLICT, "idempotency_conflict", Some(key.clone()))
            }

            // Domain errors - map to appropriate HTTP status
            AppError::Domain(ref domain_err) => {
                match domain_err {
                    DomainError::InsufficientFunds { .. } => {
                        (StatusCode::BAD_REQUEST, "insufficient_funds", Some(domain_err.to_string()))
                    }
                    DomainError::WalletFrozen(_) => {
                        (StatusCode::BAD_REQUEST, "wallet_frozen", Some(domain_err.to_string()))
                    }
                    DomainError::WalletClosed(_) => {
                        (StatusCode::BAD_REQUEST, "wallet_closed", Some(domain_err.to_string()))
                    }
                    DomainError::SameWalletTransfer => {
                        (StatusCode::BAD_REQUEST, "same_wallet_transfer", None)
                    }
                    DomainError::InvalidAmount(msg) => {
                        (StatusCode::BAD_REQUEST, "invalid_amount", Some(msg.clone()))
                    }
                    DomainError::WalletNotFound(id) => {
                        (StatusCode::NOT_FOUND, "wallet_not_found", Some(id.to_string()))
                    }
                    DomainError::WalletExists { .. } => {
                        (StatusCode::CONFLICT, "wallet_exists", Some(domain_err.to_string()))
                    }
                    DomainError::CurrencyMismatch { .. } => {
                        (StatusCode::UNPROCESSABLE_ENTITY, "currency_mismatch", Some(domain_err.to_string()))
                    }
                }
            }

            // 500 Internal Server Error
            AppError::Store(e) => {
                tracing::error!("Store error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "store_error", None)
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "database_error", None)
            }
            AppError::Config(e) => {
                tracing::error!("Config error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "config_error", None)
            }
        };

        let body = ErrorResponse {
            error: self.to_string(),
            error_code: error_code.to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

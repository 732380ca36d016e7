//! Exchange Rate Cache
//!
//! Time-bounded cache of conversion-rate snapshots. A snapshot is never
//! mutated after insertion: a fresh fetch creates a new one and the stale
//! one expires. On provider failure, an expired snapshot within the
//! staleness tolerance may be served flagged stale; whether that is
//! acceptable is the caller's policy, not the cache's.

pub mod provider;

pub use provider::{ProviderError, RateProvider, StaticRateProvider};

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::CurrencyCode;
use crate::store::{SettlementStore, StoreError};

/// Inverse rates are stored at a bounded scale to keep them representable.
const INVERSE_SCALE: u32 = 12;

/// Immutable record of a quoted rate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateSnapshot {
    pub id: Uuid,
    pub base: CurrencyCode,
    pub quote: CurrencyCode,
    /// One unit of `base` in `quote` currency
    pub rate: Decimal,
    pub inverse_rate: Decimal,
    pub provider: String,
    pub fetched_at: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

impl RateSnapshot {
    /// Whether the snapshot is still within its validity window.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now < self.valid_until
    }

    /// View of this snapshot for the reverse pair. Keeps the same id so the
    /// audit trail points at the snapshot actually fetched.
    pub fn inverted(&self) -> RateSnapshot {
        RateSnapshot {
            id: self.id,
            base: self.quote.clone(),
            quote: self.base.clone(),
            rate: self.inverse_rate,
            inverse_rate: self.rate,
            provider: self.provider.clone(),
            fetched_at: self.fetched_at,
            valid_until: self.valid_until,
        }
    }
}

/// A rate handed to the reconciler: the snapshot plus whether it was served
/// past its validity window under provider-failure fallback.
#[derive(Debug, Clone)]
pub struct Quote {
    pub snapshot: RateSnapshot,
    pub stale: bool,
}

/// Exchange Rate Cache errors
#[derive(Debug, thiserror::Error)]
pub enum RateError {
    /// No usable rate: provider failed and no snapshot within tolerance
    #[error("No rate available for {base}/{quote}: {reason}")]
    Unavailable {
        base: CurrencyCode,
        quote: CurrencyCode,
        reason: String,
    },

    /// Provider returned a rate that cannot price anything
    #[error("Provider {provider} returned non-positive rate {rate} for {base}/{quote}")]
    InvalidRate {
        provider: String,
        base: CurrencyCode,
        quote: CurrencyCode,
        rate: Decimal,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The exchange rate cache component.
pub struct ExchangeRateCache {
    provider: Arc<dyn RateProvider>,
    store: Arc<dyn SettlementStore>,
    cache: RwLock<HashMap<(CurrencyCode, CurrencyCode), RateSnapshot>>,
    /// How long a fetched snapshot prices new settlements
    validity: Duration,
    /// How far past expiry a snapshot may be served (flagged) on provider failure
    stale_tolerance: Duration,
}

impl ExchangeRateCache {
    pub fn new(
        provider: Arc<dyn RateProvider>,
        store: Arc<dyn SettlementStore>,
        validity: Duration,
        stale_tolerance: Duration,
    ) -> Self {
        Self {
            provider,
            store,
            cache: RwLock::new(HashMap::new()),
            validity,
            stale_tolerance,
        }
    }

    /// Get a rate for converting `from` into `to`.
    ///
    /// Serves the cached snapshot while valid; otherwise fetches from the
    /// provider, persists the new snapshot, and caches it. If the provider
    /// fails and an expired snapshot exists within the staleness tolerance,
    /// returns it with `stale: true` instead of failing outright.
    pub async fn get_rate(
        &self,
        from: &CurrencyCode,
        to: &CurrencyCode,
    ) -> Result<Quote, RateError> {
        let now = Utc::now();

        if let Some(snapshot) = self.cached(from, to).await {
            if snapshot.is_valid(now) {
                return Ok(Quote {
                    snapshot,
                    stale: false,
                });
            }
        }

        match self.provider.fetch(from, to).await {
            Ok(rate) => {
                if rate <= Decimal::ZERO {
                    return Err(RateError::InvalidRate {
                        provider: self.provider.name().to_string(),
                        base: from.clone(),
                        quote: to.clone(),
                        rate,
                    });
                }
                let snapshot = self.insert_snapshot(from, to, rate, now).await?;
                Ok(Quote {
                    snapshot,
                    stale: false,
                })
            }
            Err(e) => {
                // Provider outage: fall back to the expired snapshot if it
                // is within tolerance, flagged so the caller can refuse it.
                if let Some(snapshot) = self.cached(from, to).await {
                    if now < snapshot.valid_until + self.stale_tolerance {
                        tracing::warn!(
                            base = %from,
                            quote = %to,
                            fetched_at = %snapshot.fetched_at,
                            error = %e,
                            "Serving stale rate snapshot under provider failure"
                        );
                        return Ok(Quote {
                            snapshot,
                            stale: true,
                        });
                    }
                }
                Err(RateError::Unavailable {
                    base: from.clone(),
                    quote: to.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn cached(&self, from: &CurrencyCode, to: &CurrencyCode) -> Option<RateSnapshot> {
        let cache = self.cache.read().await;
        if let Some(snapshot) = cache.get(&(from.clone(), to.clone())) {
            return Some(snapshot.clone());
        }
        // The reverse pair's snapshot prices this direction via its inverse.
        cache
            .get(&(to.clone(), from.clone()))
            .map(|snapshot| snapshot.inverted())
    }

    async fn insert_snapshot(
        &self,
        from: &CurrencyCode,
        to: &CurrencyCode,
        rate: Decimal,
        now: DateTime<Utc>,
    ) -> Result<RateSnapshot, RateError> {
        let snapshot = RateSnapshot {
            id: Uuid::new_v4(),
            base: from.clone(),
            quote: to.clone(),
            rate,
            inverse_rate: (Decimal::ONE / rate).round_dp(INVERSE_SCALE),
            provider: self.provider.name().to_string(),
            fetched_at: now,
            valid_until: now + self.validity,
        };

        self.store.insert_rate_snapshot(&snapshot).await?;
        self.cache
            .write()
            .await
            .insert((from.clone(), to.clone()), snapshot.clone());

        tracing::debug!(
            base = %snapshot.base,
            quote = %snapshot.quote,
            rate = %snapshot.rate,
            provider = %snapshot.provider,
            "Cached new rate snapshot"
        );

        Ok(snapshot)
    }
}

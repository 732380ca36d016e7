//! Rate providers
//!
//! The cache talks to providers through a trait so the settlement core never
//! depends on a concrete rate API. The static provider serves a fixed table,
//! which covers tests and deployments that pin rates operationally.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::domain::CurrencyCode;

/// A provider failed to quote a pair
#[derive(Debug, Clone, thiserror::Error)]
#[error("Rate provider {provider} failed for {base}/{quote}: {message}")]
pub struct ProviderError {
    pub provider: String,
    pub base: CurrencyCode,
    pub quote: CurrencyCode,
    pub message: String,
}

/// Source of conversion rates.
#[async_trait]
pub trait RateProvider: Send + Sync {
    /// Provider name, recorded on every snapshot for audit.
    fn name(&self) -> &str;

    /// Quote one unit of `base` in `quote` currency.
    async fn fetch(
        &self,
        base: &CurrencyCode,
        quote: &CurrencyCode,
    ) -> Result<Decimal, ProviderError>;
}

/// Provider backed by a fixed in-memory table.
///
/// Quotes the inverse of a stored pair when only the reverse direction is
/// configured. Rates can be updated at runtime, which doubles as the fault
/// injection hook in tests.
pub struct StaticRateProvider {
    name: String,
    table: RwLock<HashMap<(CurrencyCode, CurrencyCode), Decimal>>,
}

impl StaticRateProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: RwLock::new(HashMap::new()),
        }
    }

    /// Seed a provider from `(base, quote, rate)` triples.
    pub fn with_rates(
        name: impl Into<String>,
        rates: impl IntoIterator<Item = (CurrencyCode, CurrencyCode, Decimal)>,
    ) -> Self {
        let table = rates
            .into_iter()
            .map(|(base, quote, rate)| ((base, quote), rate))
            .collect();
        Self {
            name: name.into(),
            table: RwLock::new(table),
        }
    }

    /// Insert or replace a rate.
    pub async fn set_rate(&self, base: CurrencyCode, quote: CurrencyCode, rate: Decimal) {
        self.table.write().await.insert((base, quote), rate);
    }

    /// Remove a rate, making subsequent fetches for the pair fail.
    pub async fn remove_rate(&self, base: &CurrencyCode, quote: &CurrencyCode) {
        self.table
            .write()
            .await
            .remove(&(base.clone(), quote.clone()));
    }
}

#[async_trait]
impl RateProvider for StaticRateProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(
        &self,
        base: &CurrencyCode,
        quote: &CurrencyCode,
    ) -> Result<Decimal, ProviderError> {
        let table = self.table.read().await;

        if let Some(rate) = table.get(&(base.clone(), quote.clone())) {
            return Ok(*rate);
        }
        // Fall back to the inverse of the reverse pair
        if let Some(rate) = table.get(&(quote.clone(), base.clone())) {
            if *rate > Decimal::ZERO {
                return Ok(Decimal::ONE / rate);
            }
        }

        Err(ProviderError {
            provider: self.name.clone(),
            base: base.clone(),
            quote: quote.clone(),
            message: "pair not configured".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn usd() -> CurrencyCode {
        CurrencyCode::new("USD").unwrap()
    }

    fn kes() -> CurrencyCode {
        CurrencyCode::new("KES").unwrap()
    }

    #[tokio::test]
    async fn test_static_provider_direct_pair() {
        let provider =
            StaticRateProvider::with_rates("static", vec![(usd(), kes(), dec!(129.50))]);
        let rate = provider.fetch(&usd(), &kes()).await.unwrap();
        assert_eq!(rate, dec!(129.50));
    }

    #[tokio::test]
    async fn test_static_provider_inverse_pair() {
        let provider = StaticRateProvider::with_rates("static", vec![(usd(), kes(), dec!(2))]);
        let rate = provider.fetch(&kes(), &usd()).await.unwrap();
        assert_eq!(rate, dec!(0.5));
    }

    #[tokio::test]
    async fn test_static_provider_unknown_pair() {
        let provider = StaticRateProvider::new("static");
        let result = provider.fetch(&usd(), &kes()).await;
        assert!(result.is_err());
    }
}

//! Configuration module
//!
//! Loads configuration from environment variables.

use std::env;

use rust_decimal::Decimal;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection URL
    pub database_url: String,

    /// Maximum database connections in pool
    pub database_max_connections: u32,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Environment (development, production)
    pub environment: String,

    /// CAS attempts per settlement before a transient failure is recorded
    pub settlement_max_retries: u32,

    /// Seconds a fetched rate snapshot prices new settlements
    pub rate_validity_secs: i64,

    /// Seconds past expiry a snapshot may be served on provider failure
    pub rate_stale_tolerance_secs: i64,

    /// Refuse stale rate snapshots instead of serving them flagged
    pub reject_stale_rates: bool,

    /// Hours idempotency records are retained
    pub idempotency_ttl_hours: i64,

    /// Pinned rates, e.g. `RATES="USD/KES=129.50,EUR/USD=1.0850"`
    pub rates: Vec<(String, String, Decimal)>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnv("DATABASE_URL"))?;

        let database_max_connections = env::var("DATABASE_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("DATABASE_MAX_CONNECTIONS"))?;

        let host = env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("PORT"))?;

        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let settlement_max_retries = env::var("SETTLEMENT_MAX_RETRIES")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("SETTLEMENT_MAX_RETRIES"))?;

        let rate_validity_secs = env::var("RATE_VALIDITY_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("RATE_VALIDITY_SECS"))?;

        let rate_stale_tolerance_secs = env::var("RATE_STALE_TOLERANCE_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("RATE_STALE_TOLERANCE_SECS"))?;

        let reject_stale_rates = env::var("REJECT_STALE_RATES")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("REJECT_STALE_RATES"))?;

        let idempotency_ttl_hours = env::var("IDEMPOTENCY_TTL_HOURS")
            .unwrap_or_else(|_| "24".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("IDEMPOTENCY_TTL_HOURS"))?;

        let rates = match env::var("RATES") {
            Ok(raw) => parse_rates(&raw)?,
            Err(_) => Vec::new(),
        };

        Ok(Self {
            database_url,
            database_max_connections,
            host,
            port,
            environment,
            settlement_max_retries,
            rate_validity_secs,
            rate_stale_tolerance_secs,
            reject_stale_rates,
            idempotency_ttl_hours,
            rates,
        })
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

/// Parse the pinned-rates table: comma-separated `BASE/QUOTE=rate` pairs.
fn parse_rates(raw: &str) -> Result<Vec<(String, String, Decimal)>, ConfigError> {
    let mut rates = Vec::new();
    for pair in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (codes, rate) = pair
            .split_once('=')
            .ok_or(ConfigError::InvalidValue("RATES"))?;
        let (base, quote) = codes
            .split_once('/')
            .ok_or(ConfigError::InvalidValue("RATES"))?;
        let rate: Decimal = rate
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue("RATES"))?;
        rates.push((base.trim().to_string(), quote.trim().to_string(), rate));
    }
    Ok(rates)
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_rates_table() {
        let rates = parse_rates("USD/KES=129.50, EUR/USD=1.0850").unwrap();
        assert_eq!(
            rates,
            vec![
                ("USD".to_string(), "KES".to_string(), dec!(129.50)),
                ("EUR".to_string(), "USD".to_string(), dec!(1.0850)),
            ]
        );
    }

    #[test]
    fn test_parse_rates_empty() {
        assert!(parse_rates("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_rates_rejects_garbage() {
        assert!(parse_rates("USDKES=129.50").is_err());
        assert!(parse_rates("USD/KES=not_a_number").is_err());
    }
}

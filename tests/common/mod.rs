//! Common test utilities

// Each test binary uses a subset of these helpers
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration as StdDuration;

use axum::Router;
use rust_decimal::Decimal;
use uuid::Uuid;

use remitflow::api::{self, AppState};
use remitflow::idempotency::IdempotencyLedger;
use remitflow::rates::{ExchangeRateCache, StaticRateProvider};
use remitflow::store::{MemoryStore, SettlementStore};
use remitflow::wallet::BalanceStore;
use remitflow::{
    Amount, CurrencyCode, Direction, PaymentEvent, PaymentSource, SettlementPolicy,
    SettlementReconciler,
};

/// Fully wired settlement core over the in-memory store.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub balances: BalanceStore,
    pub reconciler: SettlementReconciler,
    pub provider: Arc<StaticRateProvider>,
    pub cache: Arc<ExchangeRateCache>,
}

/// Retry and polling timings tightened so contention tests run fast.
pub fn tight_policy() -> SettlementPolicy {
    SettlementPolicy {
        balance_retry_backoff: StdDuration::from_millis(1),
        in_progress_poll_interval: StdDuration::from_millis(10),
        in_progress_polls: 20,
        ..SettlementPolicy::default()
    }
}

/// Build a harness with the given pinned rates, snapshot validity, and policy.
pub fn harness_with(
    rates: Vec<(&str, &str, Decimal)>,
    rate_validity: chrono::Duration,
    policy: SettlementPolicy,
) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let dyn_store: Arc<dyn SettlementStore> = store.clone();

    let table: Vec<(CurrencyCode, CurrencyCode, Decimal)> = rates
        .into_iter()
        .map(|(base, quote, rate)| (currency(base), currency(quote), rate))
        .collect();
    let provider = Arc::new(StaticRateProvider::with_rates("test", table));

    let cache = Arc::new(ExchangeRateCache::new(
        provider.clone(),
        dyn_store.clone(),
        rate_validity,
        chrono::Duration::seconds(300),
    ));

    let balances = BalanceStore::new(dyn_store.clone());
    let idempotency = IdempotencyLedger::new(dyn_store);

    let reconciler =
        SettlementReconciler::new(balances.clone(), idempotency, cache.clone(), policy);

    Harness {
        store,
        balances,
        reconciler,
        provider,
        cache,
    }
}

pub fn harness_with_rates(rates: Vec<(&str, &str, Decimal)>) -> Harness {
    harness_with(rates, chrono::Duration::seconds(60), tight_policy())
}

/// A second reconciler over the harness's store, with its own policy.
pub fn reconciler_with(harness: &Harness, policy: SettlementPolicy) -> SettlementReconciler {
    let store: Arc<dyn SettlementStore> = harness.store.clone();
    SettlementReconciler::new(
        harness.balances.clone(),
        IdempotencyLedger::new(store),
        harness.cache.clone(),
        policy,
    )
}

pub fn harness() -> Harness {
    harness_with_rates(vec![("USD", "KES", Decimal::new(12950, 2))])
}

pub fn currency(code: &str) -> CurrencyCode {
    CurrencyCode::new(code).unwrap()
}

pub fn amount(value: &str) -> Amount {
    value.parse().unwrap()
}

/// A credit event from a card rail, the common case in these tests.
pub fn credit_event(wallet_id: Uuid, external_ref: &str, value: &str, code: &str) -> PaymentEvent {
    PaymentEvent {
        external_ref: external_ref.to_string(),
        source: PaymentSource::Card,
        wallet_id,
        amount: amount(value),
        currency: currency(code),
        direction: Direction::Credit,
        metadata: serde_json::Value::Null,
    }
}

pub fn debit_event(wallet_id: Uuid, external_ref: &str, value: &str, code: &str) -> PaymentEvent {
    PaymentEvent {
        direction: Direction::Debit,
        ..credit_event(wallet_id, external_ref, value, code)
    }
}

/// Router wired like the production binary, but over the in-memory store.
pub fn test_app(harness: &Harness) -> Router {
    let state = AppState {
        store: harness.store.clone(),
        balances: harness.balances.clone(),
        reconciler: Arc::new(harness.reconciler.clone()),
    };

    Router::new()
        .route("/health", axum::routing::get(|| async { "OK" }))
        .nest("/api/v1", api::create_router())
        .with_state(state)
}

//! Settlement end-to-end tests over the in-memory store.
//!
//! These cover the core guarantees: exactly-once settlement under
//! concurrent duplicate delivery, ledger conservation, permanent-rejection
//! replay, and settlement-time rate stamping.

use rust_decimal_macros::dec;
use uuid::Uuid;

use remitflow::ledger::is_conserved;
use remitflow::reconciler::SettleError;
use remitflow::store::SettlementStore;
use remitflow::wallet::EntryMeta;
use remitflow::{PaymentSource, SettlementPolicy, SettlementStatus, TransferCommand};

mod common;
use common::{
    amount, credit_event, currency, debit_event, harness, harness_with, harness_with_rates,
    reconciler_with, tight_policy,
};

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_duplicate_deliveries_settle_once() {
    let h = harness();
    let wallet = h
        .balances
        .activate(Uuid::new_v4(), currency("USD"), false)
        .await
        .unwrap();

    let event = credit_event(wallet.id, "dup-1", "100.00", "USD");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let reconciler = h.reconciler.clone();
        let event = event.clone();
        handles.push(tokio::spawn(
            async move { reconciler.settle(&event).await },
        ));
    }

    let mut completed = 0;
    let mut duplicates = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(outcome) => match outcome.status {
                SettlementStatus::Completed => completed += 1,
                SettlementStatus::Duplicate => duplicates += 1,
                SettlementStatus::Failed => panic!("no delivery should fail"),
            },
            Err(SettleError::InFlight(_)) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(completed, 1, "exactly one delivery settles");
    assert!(duplicates <= 7);

    let after = h.balances.get(wallet.id).await.unwrap();
    assert_eq!(after.balance, dec!(100.00), "credited exactly once");

    let entries = h.store.ledger_entries(wallet.id).await.unwrap();
    assert_eq!(entries.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_parallel_distinct_refs_all_settle() {
    let h = harness();
    let wallet = h
        .balances
        .activate(Uuid::new_v4(), currency("USD"), false)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..10 {
        let reconciler = h.reconciler.clone();
        let event = credit_event(wallet.id, &format!("ref-{}", i), "10.00", "USD");
        handles.push(tokio::spawn(
            async move { reconciler.settle(&event).await },
        ));
    }

    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.status, SettlementStatus::Completed);
    }

    let after = h.balances.get(wallet.id).await.unwrap();
    assert_eq!(after.balance, dec!(100.00));
    // Ten CAS wins on top of the activation version
    assert_eq!(after.version, 11);

    let entries = h.store.ledger_entries(wallet.id).await.unwrap();
    assert_eq!(entries.len(), 10);
    assert!(is_conserved(&entries, after.balance));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_settlement_worked_example() {
    // Wallet W starts at 100.00 USD, version 1. Concurrent credits with the
    // same ref "a" settle once; a later ref "b" credit lands on top.
    let h = harness();
    let mut wallet =
        remitflow::wallet::WalletAccount::activate(Uuid::new_v4(), currency("USD"), false);
    wallet.balance = dec!(100.00);
    h.store.insert_wallet(&wallet).await.unwrap();

    let e1 = credit_event(wallet.id, "a", "50.00", "USD");
    let e2 = e1.clone();
    let (r1, r2) = tokio::join!(
        {
            let reconciler = h.reconciler.clone();
            async move { reconciler.settle(&e1).await }
        },
        {
            let reconciler = h.reconciler.clone();
            async move { reconciler.settle(&e2).await }
        }
    );
    let statuses = [r1.unwrap().status, r2.unwrap().status];
    assert!(statuses.contains(&SettlementStatus::Completed));
    assert!(!statuses.contains(&SettlementStatus::Failed));

    let mid = h.balances.get(wallet.id).await.unwrap();
    assert_eq!(mid.balance, dec!(150.00), "ref \"a\" applied exactly once");

    let e3 = credit_event(wallet.id, "b", "20.00", "USD");
    let outcome = h.reconciler.settle(&e3).await.unwrap();
    assert_eq!(outcome.status, SettlementStatus::Completed);

    let after = h.balances.get(wallet.id).await.unwrap();
    assert_eq!(after.balance, dec!(170.00));
    assert_eq!(after.version, 3);

    let entries = h.store.ledger_entries(wallet.id).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(
        entries.iter().filter(|e| e.external_ref.as_deref() == Some("a")).count(),
        1,
        "exactly one entry for ref \"a\""
    );
}

#[tokio::test]
async fn test_ledger_conservation_with_debits() {
    let h = harness();
    let wallet = h
        .balances
        .activate(Uuid::new_v4(), currency("USD"), false)
        .await
        .unwrap();

    h.reconciler
        .settle(&credit_event(wallet.id, "c1", "200.00", "USD"))
        .await
        .unwrap();
    h.reconciler
        .settle(&debit_event(wallet.id, "d1", "75.50", "USD"))
        .await
        .unwrap();
    h.reconciler
        .settle(&credit_event(wallet.id, "c2", "0.50", "USD"))
        .await
        .unwrap();

    let after = h.balances.get(wallet.id).await.unwrap();
    assert_eq!(after.balance, dec!(125.00));

    let entries = h.store.ledger_entries(wallet.id).await.unwrap();
    assert!(is_conserved(&entries, after.balance));

    // Each entry's running balance matches the sum of the prefix
    let mut running = dec!(0);
    for entry in &entries {
        running += entry.amount;
        assert_eq!(entry.balance_after, running);
    }
}

#[tokio::test]
async fn test_insufficient_funds_rejected_and_replayed() {
    let h = harness();
    let wallet = h
        .balances
        .activate(Uuid::new_v4(), currency("USD"), false)
        .await
        .unwrap();

    h.reconciler
        .settle(&credit_event(wallet.id, "fund", "20.00", "USD"))
        .await
        .unwrap();

    let overdraw = debit_event(wallet.id, "overdraw", "50.00", "USD");
    let outcome = h.reconciler.settle(&overdraw).await.unwrap();
    assert_eq!(outcome.status, SettlementStatus::Failed);
    assert!(outcome.reason.is_some());

    // Redelivery replays the rejection identically, no retry of the debit
    let replay = h.reconciler.settle(&overdraw).await.unwrap();
    assert_eq!(replay, outcome);

    let after = h.balances.get(wallet.id).await.unwrap();
    assert_eq!(after.balance, dec!(20.00));
    assert_eq!(h.store.ledger_entries(wallet.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_payload_mismatch_is_client_error() {
    let h = harness();
    let wallet = h
        .balances
        .activate(Uuid::new_v4(), currency("USD"), false)
        .await
        .unwrap();

    h.reconciler
        .settle(&credit_event(wallet.id, "ref-x", "100.00", "USD"))
        .await
        .unwrap();

    // Same reference, different amount: not a retry
    let tampered = credit_event(wallet.id, "ref-x", "999.00", "USD");
    let result = h.reconciler.settle(&tampered).await;
    assert!(matches!(result, Err(SettleError::PayloadMismatch(_))));

    let after = h.balances.get(wallet.id).await.unwrap();
    assert_eq!(after.balance, dec!(100.00));
}

#[tokio::test]
async fn test_conversion_stamped_at_settlement_time() {
    let h = harness_with_rates(vec![("USD", "KES", dec!(129.50))]);
    let wallet = h
        .balances
        .activate(Uuid::new_v4(), currency("KES"), false)
        .await
        .unwrap();

    let outcome = h
        .reconciler
        .settle(&credit_event(wallet.id, "fx-1", "100.00", "USD"))
        .await
        .unwrap();
    assert_eq!(outcome.status, SettlementStatus::Completed);

    let after = h.balances.get(wallet.id).await.unwrap();
    assert_eq!(after.balance, dec!(12950.00));

    // A provider rate change within the validity window does not affect
    // settlements priced off the cached snapshot
    h.provider
        .set_rate(currency("USD"), currency("KES"), dec!(200))
        .await;
    h.reconciler
        .settle(&credit_event(wallet.id, "fx-2", "100.00", "USD"))
        .await
        .unwrap();

    let after = h.balances.get(wallet.id).await.unwrap();
    assert_eq!(after.balance, dec!(25900.00));

    // One snapshot fetched, stamped on both settlements
    assert_eq!(h.store.rate_snapshots().await.len(), 1);
}

#[tokio::test]
async fn test_stale_rate_refused_when_policy_rejects() {
    let mut policy = tight_policy();
    policy.reject_stale_rates = true;
    // Zero validity: every settlement needs a fresh provider fetch
    let h = harness_with(
        vec![("USD", "KES", dec!(129.50))],
        chrono::Duration::zero(),
        policy,
    );
    let wallet = h
        .balances
        .activate(Uuid::new_v4(), currency("KES"), false)
        .await
        .unwrap();

    let outcome = h
        .reconciler
        .settle(&credit_event(wallet.id, "fx-fresh", "100.00", "USD"))
        .await
        .unwrap();
    assert_eq!(outcome.status, SettlementStatus::Completed);

    // Provider outage: the cache offers the expired snapshot flagged stale,
    // and the policy refuses it instead of pricing off it
    h.provider
        .remove_rate(&currency("USD"), &currency("KES"))
        .await;
    let event = credit_event(wallet.id, "fx-outage", "100.00", "USD");
    let outcome = h.reconciler.settle(&event).await.unwrap();
    assert_eq!(outcome.status, SettlementStatus::Failed);
    assert!(outcome.reason.is_some());
    assert_eq!(h.balances.get(wallet.id).await.unwrap().balance, dec!(12950.00));

    // The refusal is transient: redelivery settles once the provider is back
    h.provider
        .set_rate(currency("USD"), currency("KES"), dec!(129.50))
        .await;
    let outcome = h.reconciler.settle(&event).await.unwrap();
    assert_eq!(outcome.status, SettlementStatus::Completed);
    assert_eq!(h.balances.get(wallet.id).await.unwrap().balance, dec!(25900.00));
}

#[tokio::test]
async fn test_retry_budget_exhaustion_is_transient() {
    let h = harness();
    let wallet = h
        .balances
        .activate(Uuid::new_v4(), currency("USD"), false)
        .await
        .unwrap();
    let event = credit_event(wallet.id, "contended", "40.00", "USD");

    // A reconciler with no CAS attempts left models exhaustion under
    // contention: the outcome is a recorded transient failure
    let starved = reconciler_with(
        &h,
        SettlementPolicy {
            max_balance_retries: 0,
            ..tight_policy()
        },
    );
    let outcome = starved.settle(&event).await.unwrap();
    assert_eq!(outcome.status, SettlementStatus::Failed);
    assert!(outcome.reason.is_some());
    assert_eq!(h.balances.get(wallet.id).await.unwrap().balance, dec!(0));

    // Redelivery re-arms the key and settles exactly once
    let outcome = h.reconciler.settle(&event).await.unwrap();
    assert_eq!(outcome.status, SettlementStatus::Completed);
    assert_eq!(h.balances.get(wallet.id).await.unwrap().balance, dec!(40.00));
    assert_eq!(h.store.ledger_entries(wallet.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_rate_unavailable_is_transient() {
    let h = harness_with_rates(vec![]);
    let wallet = h
        .balances
        .activate(Uuid::new_v4(), currency("KES"), false)
        .await
        .unwrap();

    let event = credit_event(wallet.id, "fx-gap", "100.00", "USD");
    let outcome = h.reconciler.settle(&event).await.unwrap();
    assert_eq!(outcome.status, SettlementStatus::Failed);

    // The rate appears; redelivery settles because the failure was transient
    h.provider
        .set_rate(currency("USD"), currency("KES"), dec!(129.50))
        .await;
    let outcome = h.reconciler.settle(&event).await.unwrap();
    assert_eq!(outcome.status, SettlementStatus::Completed);

    let after = h.balances.get(wallet.id).await.unwrap();
    assert_eq!(after.balance, dec!(12950.00));
}

#[tokio::test]
async fn test_frozen_wallet_rejects_settlement() {
    let h = harness();
    let wallet = h
        .balances
        .activate(Uuid::new_v4(), currency("USD"), false)
        .await
        .unwrap();
    h.balances.freeze(wallet.id).await.unwrap();

    let outcome = h
        .reconciler
        .settle(&credit_event(wallet.id, "frozen-1", "10.00", "USD"))
        .await
        .unwrap();
    assert_eq!(outcome.status, SettlementStatus::Failed);

    let after = h.balances.get(wallet.id).await.unwrap();
    assert_eq!(after.balance, dec!(0));
}

#[tokio::test]
async fn test_transfer_conserves_total() {
    let h = harness();
    let from = h
        .balances
        .activate(Uuid::new_v4(), currency("USD"), false)
        .await
        .unwrap();
    let to = h
        .balances
        .activate(Uuid::new_v4(), currency("USD"), false)
        .await
        .unwrap();

    let meta = EntryMeta {
        external_ref: None,
        source: PaymentSource::Fee,
        correlation_id: Uuid::new_v4(),
    };
    h.balances
        .credit(from.id, &amount("500.00"), &currency("USD"), meta)
        .await
        .unwrap();

    let cmd = TransferCommand {
        reference: "tr-1".to_string(),
        from_wallet_id: from.id,
        to_wallet_id: to.id,
        amount: amount("120.00"),
        memo: None,
    };
    let outcome = h.reconciler.transfer(&cmd).await.unwrap();
    assert_eq!(outcome.status, SettlementStatus::Completed);

    let from_after = h.balances.get(from.id).await.unwrap();
    let to_after = h.balances.get(to.id).await.unwrap();
    assert_eq!(from_after.balance, dec!(380.00));
    assert_eq!(to_after.balance, dec!(120.00));
    assert_eq!(from_after.balance + to_after.balance, dec!(500.00));

    // Both legs share the correlation id
    let debit_entries = h.store.ledger_entries(from.id).await.unwrap();
    let credit_entries = h.store.ledger_entries(to.id).await.unwrap();
    assert_eq!(
        debit_entries.last().unwrap().correlation_id,
        credit_entries.last().unwrap().correlation_id
    );

    // Resubmission replays without moving money again
    let replay = h.reconciler.transfer(&cmd).await.unwrap();
    assert_eq!(replay.status, SettlementStatus::Duplicate);
    assert_eq!(replay.debit_entry_id, outcome.debit_entry_id);
    assert_eq!(replay.credit_entry_id, outcome.credit_entry_id);
    assert_eq!(h.balances.get(from.id).await.unwrap().balance, dec!(380.00));
}

#[tokio::test]
async fn test_cross_currency_transfer_converts_credit_leg() {
    let h = harness_with_rates(vec![("USD", "KES", dec!(129.50))]);
    let from = h
        .balances
        .activate(Uuid::new_v4(), currency("USD"), false)
        .await
        .unwrap();
    let to = h
        .balances
        .activate(Uuid::new_v4(), currency("KES"), false)
        .await
        .unwrap();

    let meta = EntryMeta {
        external_ref: None,
        source: PaymentSource::Fee,
        correlation_id: Uuid::new_v4(),
    };
    h.balances
        .credit(from.id, &amount("50.00"), &currency("USD"), meta)
        .await
        .unwrap();

    let cmd = TransferCommand {
        reference: "fx-tr".to_string(),
        from_wallet_id: from.id,
        to_wallet_id: to.id,
        amount: amount("10.00"),
        memo: Some("conversion".to_string()),
    };
    let outcome = h.reconciler.transfer(&cmd).await.unwrap();
    assert_eq!(outcome.status, SettlementStatus::Completed);

    assert_eq!(h.balances.get(from.id).await.unwrap().balance, dec!(40.00));
    assert_eq!(h.balances.get(to.id).await.unwrap().balance, dec!(1295.00));
}

#[tokio::test]
async fn test_transfer_to_same_wallet_rejected() {
    let h = harness();
    let wallet = h
        .balances
        .activate(Uuid::new_v4(), currency("USD"), false)
        .await
        .unwrap();

    let cmd = TransferCommand {
        reference: "self".to_string(),
        from_wallet_id: wallet.id,
        to_wallet_id: wallet.id,
        amount: amount("1.00"),
        memo: None,
    };
    let outcome = h.reconciler.transfer(&cmd).await.unwrap();
    assert_eq!(outcome.status, SettlementStatus::Failed);
}

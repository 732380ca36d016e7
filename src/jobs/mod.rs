//! Scheduled Jobs
//!
//! Background jobs for periodic maintenance tasks: re-arming settlements
//! stuck pending after a crash, and pruning expired idempotency records
//! and rate snapshots.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

use crate::store::{SettlementStore, StoreError};

/// How long a settlement may sit pending before it is considered crashed
/// and re-armed for redelivery.
const STALE_PENDING_AFTER_MINUTES: i64 = 5;

/// Job error types
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Re-arm settlements stuck in 'pending'.
///
/// A record pending longer than the cutoff means its owner crashed between
/// winning the gate and committing. Marking it transient-failed lets the
/// provider's redelivery win the key and settle the event.
pub async fn reset_stale_pending(store: &dyn SettlementStore) -> Result<u64, JobError> {
    let cutoff = Utc::now() - ChronoDuration::minutes(STALE_PENDING_AFTER_MINUTES);
    let reset = store.reset_stale_pending(cutoff).await?;

    if reset > 0 {
        tracing::warn!(rows_affected = reset, "Reset stale pending settlements");
    }

    Ok(reset)
}

/// Delete idempotency records past their retention window.
pub async fn delete_expired_idempotency(store: &dyn SettlementStore) -> Result<u64, JobError> {
    let deleted = store.delete_expired_idempotency(Utc::now()).await?;

    if deleted > 0 {
        tracing::info!(rows_deleted = deleted, "Deleted expired idempotency records");
    }

    Ok(deleted)
}

/// Delete rate snapshots past their validity window.
pub async fn delete_expired_rate_snapshots(store: &dyn SettlementStore) -> Result<u64, JobError> {
    let deleted = store.delete_expired_rate_snapshots(Utc::now()).await?;

    if deleted > 0 {
        tracing::info!(rows_deleted = deleted, "Deleted expired rate snapshots");
    }

    Ok(deleted)
}

/// Report from running maintenance jobs
#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    pub pending_reset: u64,
    pub idempotency_deleted: u64,
    pub rate_snapshots_deleted: u64,
    pub errors: Vec<String>,
}

/// Run all maintenance jobs once (for manual trigger or testing).
pub async fn run_maintenance(store: &dyn SettlementStore) -> MaintenanceReport {
    let mut report = MaintenanceReport::default();

    match reset_stale_pending(store).await {
        Ok(count) => report.pending_reset = count,
        Err(e) => report.errors.push(format!("Stale pending reset: {}", e)),
    }

    match delete_expired_idempotency(store).await {
        Ok(count) => report.idempotency_deleted = count,
        Err(e) => report.errors.push(format!("Idempotency deletion: {}", e)),
    }

    match delete_expired_rate_snapshots(store).await {
        Ok(count) => report.rate_snapshots_deleted = count,
        Err(e) => report.errors.push(format!("Rate snapshot deletion: {}", e)),
    }

    report
}

/// Spawn the maintenance loop in the background.
/// Returns a handle that can be used to abort the loop.
pub fn spawn_maintenance(
    store: Arc<dyn SettlementStore>,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(period_secs = period.as_secs(), "Maintenance loop started");
        let mut ticker = interval(period);
        loop {
            ticker.tick().await;
            let report = run_maintenance(store.as_ref()).await;
            for error in &report.errors {
                tracing::error!(error = %error, "Maintenance job failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::IdempotencyRecord;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_stale_pending_rearmed_for_redelivery() {
        let store = MemoryStore::new();

        let mut record = IdempotencyRecord::pending("card:crashed", "h", ChronoDuration::hours(24));
        record.first_seen = Utc::now() - ChronoDuration::minutes(10);
        store.begin_idempotent(&record).await.unwrap();

        let report = run_maintenance(&store).await;
        assert_eq!(report.pending_reset, 1);
        assert!(report.errors.is_empty());

        // The redelivery now wins the key again
        let retry = IdempotencyRecord::pending("card:crashed", "h", ChronoDuration::hours(24));
        assert!(matches!(
            store.begin_idempotent(&retry).await.unwrap(),
            crate::store::BeginOutcome::Won
        ));
    }

    #[tokio::test]
    async fn test_fresh_pending_untouched() {
        let store = MemoryStore::new();
        let record = IdempotencyRecord::pending("card:live", "h", ChronoDuration::hours(24));
        store.begin_idempotent(&record).await.unwrap();

        let report = run_maintenance(&store).await;
        assert_eq!(report.pending_reset, 0);
    }

    #[tokio::test]
    async fn test_expired_records_pruned() {
        let store = MemoryStore::new();

        let mut expired = IdempotencyRecord::pending("card:old", "h", ChronoDuration::hours(24));
        expired.first_seen = Utc::now() - ChronoDuration::hours(48);
        expired.expires_at = Utc::now() - ChronoDuration::hours(24);
        store.begin_idempotent(&expired).await.unwrap();

        let report = run_maintenance(&store).await;
        assert_eq!(report.idempotency_deleted, 1);
        assert!(store.fetch_idempotency("card:old").await.unwrap().is_none());
    }
}

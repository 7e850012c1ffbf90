//! Freeze scheduler: moves old, settled records out of reconciliation.
//!
//! A tick selects at most `batch_size` eligible records, oldest
//! finalization first, and freezes them in one store operation. Ticks are
//! safe to repeat: frozen rows drop out of the eligibility filter.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use super::lifecycle::{SyncState, freeze_cutoff, is_freeze_eligible};
use crate::config::FreezeConfig;
use crate::error::Result;
use crate::store::Database;

/// Outcome of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FreezeReport {
    pub frozen_count: usize,
    /// Eligible records still waiting after this tick.
    pub remaining_eligible: u64,
}

/// Freezes one tenant's settled records.
pub struct FreezeScheduler {
    db: Arc<dyn Database>,
    tenant_id: String,
}

impl FreezeScheduler {
    pub fn new(db: Arc<dyn Database>, tenant_id: impl Into<String>) -> Self {
        Self {
            db,
            tenant_id: tenant_id.into(),
        }
    }

    /// Run one bounded freeze pass as of `now`.
    pub async fn tick(&self, config: &FreezeConfig, now: DateTime<Utc>) -> Result<FreezeReport> {
        let cutoff = freeze_cutoff(config.cooldown_hours, now);
        let candidates = self
            .db
            .list_eligible_for_freeze(&self.tenant_id, cutoff, config.batch_size)
            .await?;

        let ids: Vec<String> = candidates
            .into_iter()
            .filter(|c| {
                is_freeze_eligible(c.sync_state, Some(c.finalized_at), config.cooldown_hours, now)
            })
            .take(config.batch_size)
            .map(|c| c.provider_call_id)
            .collect();

        let frozen_count = self.db.batch_set_sync_state(&ids, SyncState::Frozen).await?;
        let remaining_eligible = self
            .db
            .count_eligible_for_freeze(&self.tenant_id, cutoff)
            .await?;

        info!(
            tenant_id = %self.tenant_id,
            frozen_count,
            remaining_eligible,
            cooldown_hours = config.cooldown_hours,
            "Freeze tick complete"
        );
        Ok(FreezeReport {
            frozen_count,
            remaining_eligible,
        })
    }
}

/// Spawn a background task that runs a freeze tick every `interval`.
///
/// Failed ticks are logged; the next tick retries from scratch.
pub fn spawn_freeze_task(
    scheduler: Arc<FreezeScheduler>,
    config: FreezeConfig,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = scheduler.tick(&config, Utc::now()).await {
                error!(error = %e, "Freeze tick failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::model::RawCallEvent;
    use crate::calls::normalizer::BusinessLineRoster;
    use crate::store::LibSqlBackend;
    use chrono::Duration as ChronoDuration;

    async fn seed(db: &Arc<dyn Database>, count: usize, finalized_at: DateTime<Utc>) {
        seed_tenant(db, "t1", "CA", count, finalized_at).await;
    }

    async fn seed_tenant(
        db: &Arc<dyn Database>,
        tenant_id: &str,
        prefix: &str,
        count: usize,
        finalized_at: DateTime<Utc>,
    ) {
        for i in 0..count {
            let event = RawCallEvent {
                leg_id: format!("{prefix}{i:03}"),
                raw_direction: "inbound".into(),
                raw_status: "completed".into(),
                from: "+15551234567".into(),
                to: "+15550001000".into(),
                finalized_at: Some(finalized_at + ChronoDuration::seconds(i as i64)),
                ..Default::default()
            };
            db.upsert_call_record(tenant_id, &event, &BusinessLineRoster::default())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn tick_is_bounded_and_drains_backlog() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let now = Utc::now();
        seed(&db, 25, now - ChronoDuration::days(2)).await;
        let scheduler = FreezeScheduler::new(Arc::clone(&db), "t1");
        let config = FreezeConfig::new(6, 10).unwrap();

        let first = scheduler.tick(&config, now).await.unwrap();
        assert_eq!(first, FreezeReport { frozen_count: 10, remaining_eligible: 15 });
        let second = scheduler.tick(&config, now).await.unwrap();
        assert_eq!(second, FreezeReport { frozen_count: 10, remaining_eligible: 5 });
        let third = scheduler.tick(&config, now).await.unwrap();
        assert_eq!(third, FreezeReport { frozen_count: 5, remaining_eligible: 0 });
        let idle = scheduler.tick(&config, now).await.unwrap();
        assert_eq!(idle, FreezeReport::default());
    }

    #[tokio::test]
    async fn oldest_records_freeze_first() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let now = Utc::now();
        seed(&db, 3, now - ChronoDuration::days(1)).await;
        let scheduler = FreezeScheduler::new(Arc::clone(&db), "t1");

        scheduler
            .tick(&FreezeConfig::new(6, 1).unwrap(), now)
            .await
            .unwrap();
        let oldest = db.get_call_record("CA000").await.unwrap().unwrap();
        let newer = db.get_call_record("CA001").await.unwrap().unwrap();
        assert_eq!(oldest.sync_state, SyncState::Frozen);
        assert_eq!(newer.sync_state, SyncState::Active);
    }

    #[tokio::test]
    async fn records_inside_cooldown_stay_active() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let now = Utc::now();
        seed(&db, 2, now - ChronoDuration::hours(2)).await;
        let scheduler = FreezeScheduler::new(Arc::clone(&db), "t1");

        let report = scheduler.tick(&FreezeConfig::default(), now).await.unwrap();
        assert_eq!(report, FreezeReport::default());
    }

    #[tokio::test]
    async fn tick_only_touches_own_tenant() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let now = Utc::now();
        seed_tenant(&db, "t1", "CA", 2, now - ChronoDuration::days(1)).await;
        seed_tenant(&db, "t2", "CB", 3, now - ChronoDuration::days(1)).await;

        let report = FreezeScheduler::new(Arc::clone(&db), "t1")
            .tick(&FreezeConfig::default(), now)
            .await
            .unwrap();
        assert_eq!(report, FreezeReport { frozen_count: 2, remaining_eligible: 0 });

        let theirs = db.get_call_record("CB000").await.unwrap().unwrap();
        assert_eq!(theirs.sync_state, SyncState::Active);
    }

    #[tokio::test]
    async fn huge_cooldown_is_a_quiet_tick() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let now = Utc::now();
        seed(&db, 3, now - ChronoDuration::days(400)).await;
        let scheduler = FreezeScheduler::new(Arc::clone(&db), "t1");

        let report = scheduler
            .tick(&FreezeConfig::new(3_000_000_000, 10).unwrap(), now)
            .await
            .unwrap();
        assert_eq!(report, FreezeReport::default());
    }

    #[tokio::test]
    async fn corrupt_record_does_not_block_freezing() {
        let backend = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let db: Arc<dyn Database> = backend.clone();
        let now = Utc::now();
        seed(&db, 3, now - ChronoDuration::days(1)).await;
        backend
            .execute_raw(
                "UPDATE call_records SET canonical_direction = 'outbound' WHERE provider_call_id = 'CA000'",
            )
            .await
            .unwrap();

        let report = FreezeScheduler::new(Arc::clone(&db), "t1")
            .tick(&FreezeConfig::default(), now)
            .await
            .unwrap();
        assert_eq!(report.frozen_count, 3);
    }
}

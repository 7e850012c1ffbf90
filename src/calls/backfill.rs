//! Backfill reconciler: re-normalizes stored records from their raw fields.
//!
//! Used after normalization rules or the business-line roster change. Raw
//! fields are never touched; a corrected record gets new canonical values
//! plus an audit entry holding the previous ones.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::model::{CallRecord, CorrectionAudit};
use super::normalizer::{self, BusinessLineRoster};
use crate::config::BackfillConfig;
use crate::error::{Error, Result};
use crate::store::Database;

/// Summary of a backfill pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub fixed: usize,
    pub unchanged: usize,
    pub errors: usize,
    pub total: usize,
}

/// Re-normalizes one tenant's records against that tenant's roster.
pub struct BackfillReconciler {
    db: Arc<dyn Database>,
    tenant_id: String,
    roster: BusinessLineRoster,
}

impl BackfillReconciler {
    pub fn new(
        db: Arc<dyn Database>,
        tenant_id: impl Into<String>,
        roster: BusinessLineRoster,
    ) -> Self {
        Self {
            db,
            tenant_id: tenant_id.into(),
            roster,
        }
    }

    /// Walk every stored record of the tenant, one bounded page at a time.
    ///
    /// Per-record failures, unreadable rows included, are counted; a store
    /// outage aborts the pass.
    pub async fn run(&self, config: &BackfillConfig, now: DateTime<Utc>) -> Result<BackfillReport> {
        let mut report = BackfillReport::default();
        let mut cursor: Option<String> = None;

        loop {
            let page = self
                .db
                .list_call_records(&self.tenant_id, cursor.as_deref(), config.batch_size)
                .await?;

            for item in &page {
                report.total += 1;
                let record = match item {
                    Ok(record) => record,
                    Err(unreadable) => {
                        warn!(
                            provider_call_id = %unreadable.provider_call_id,
                            error = %unreadable.error,
                            "Backfill skipped unreadable record"
                        );
                        report.errors += 1;
                        continue;
                    }
                };
                match self.reconcile(record, now).await {
                    Ok(true) => report.fixed += 1,
                    Ok(false) => report.unchanged += 1,
                    Err(e) if e.is_fatal() => {
                        error!(
                            processed = report.total,
                            error = %e,
                            "Backfill aborted: store unavailable"
                        );
                        return Err(e);
                    }
                    Err(e) => {
                        warn!(
                            provider_call_id = %record.provider_call_id,
                            error = %e,
                            "Backfill skipped record"
                        );
                        report.errors += 1;
                    }
                }
            }

            if page.len() < config.batch_size {
                break;
            }
            cursor = page.last().map(|item| match item {
                Ok(record) => record.provider_call_id.clone(),
                Err(unreadable) => unreadable.provider_call_id.clone(),
            });
        }

        info!(
            tenant_id = %self.tenant_id,
            fixed = report.fixed,
            unchanged = report.unchanged,
            errors = report.errors,
            total = report.total,
            "Backfill complete"
        );
        Ok(report)
    }

    /// Returns whether the record was corrected.
    async fn reconcile(&self, record: &CallRecord, now: DateTime<Utc>) -> Result<bool> {
        let normalized = normalizer::normalize(&record.raw_leg(), &self.roster).map_err(|e| {
            Error::PartialItem {
                id: record.provider_call_id.clone(),
                reason: e.to_string(),
            }
        })?;

        if normalized.direction == record.canonical_direction
            && normalized.status == record.canonical_status
        {
            return Ok(false);
        }

        let audit = CorrectionAudit {
            previous_direction: record.canonical_direction,
            previous_status: record.canonical_status,
            direction: normalized.direction,
            status: normalized.status,
            corrected_at: now,
        };
        let applied = self
            .db
            .correct_canonical(&record.provider_call_id, record.canonical(), &audit)
            .await
            .map_err(|e| {
                if e.is_transient() {
                    Error::TransientStore(e)
                } else {
                    Error::PartialItem {
                        id: record.provider_call_id.clone(),
                        reason: e.to_string(),
                    }
                }
            })?;

        if !applied {
            return Err(Error::PartialItem {
                id: record.provider_call_id.clone(),
                reason: "record changed during backfill".into(),
            });
        }
        debug!(
            provider_call_id = %record.provider_call_id,
            from = %audit.previous_direction,
            to = %audit.direction,
            "Canonical fields corrected"
        );
        Ok(true)
    }
}

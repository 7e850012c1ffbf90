//! Call ledger: the entry point tying ingestion, conversations, freezing and
//! backfill to one store and one tenant.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::backfill::{BackfillReconciler, BackfillReport};
use super::freeze::{FreezeReport, FreezeScheduler};
use super::model::{CallRecord, Conversation, ConversationMessage, RawCallEvent, UpsertOutcome};
use super::normalizer::{BusinessLineRoster, canonical_digits};
use super::resolver::{ConversationResolver, MergeReport};
use crate::config::{BackfillConfig, FreezeConfig};
use crate::error::{DatabaseError, Error, Result};
use crate::store::Database;

/// Attach attempts before a concurrently merged conversation is reported.
const MAX_ATTACH_ATTEMPTS: usize = 3;

pub struct CallLedger {
    db: Arc<dyn Database>,
    tenant_id: String,
    roster: BusinessLineRoster,
    resolver: ConversationResolver,
    freezer: Arc<FreezeScheduler>,
}

impl CallLedger {
    pub fn new(
        db: Arc<dyn Database>,
        tenant_id: impl Into<String>,
        roster: BusinessLineRoster,
    ) -> Self {
        let tenant_id = tenant_id.into();
        Self {
            resolver: ConversationResolver::new(Arc::clone(&db), tenant_id.clone()),
            freezer: Arc::new(FreezeScheduler::new(Arc::clone(&db), tenant_id.clone())),
            db,
            tenant_id,
            roster,
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Shared handle to the freeze scheduler, for [`super::freeze::spawn_freeze_task`].
    pub fn freezer(&self) -> Arc<FreezeScheduler> {
        Arc::clone(&self.freezer)
    }

    /// Record one provider event and file the call in its contact's conversation.
    ///
    /// A malformed event is rejected before the store is touched. Redelivering
    /// the same event is a no-op.
    pub async fn ingest(&self, event: &RawCallEvent) -> Result<CallRecord> {
        event.validate()?;

        let roster = event.roster_or(&self.roster);
        let upsert = self
            .db
            .upsert_call_record(&self.tenant_id, event, &roster)
            .await?;
        let mut record = upsert.record;

        match upsert.outcome {
            UpsertOutcome::FrozenAnomaly => warn!(
                provider_call_id = %record.provider_call_id,
                "Event arrived for a frozen call; stored without unfreezing"
            ),
            UpsertOutcome::Unchanged => debug!(
                provider_call_id = %record.provider_call_id,
                "Duplicate delivery ignored"
            ),
            UpsertOutcome::Inserted | UpsertOutcome::Updated => debug!(
                provider_call_id = %record.provider_call_id,
                outcome = ?upsert.outcome,
                direction = %record.canonical_direction,
                status = %record.canonical_status,
                "Call record stored"
            ),
        }
        if !record.extensions.warnings.is_empty() {
            warn!(
                provider_call_id = %record.provider_call_id,
                warnings = ?record.extensions.warnings,
                "Call normalized with warnings"
            );
        }

        if record.conversation_id.is_none() {
            let conversation_id = self.file_in_conversation(&record).await?;
            record.conversation_id = Some(conversation_id);
        }
        Ok(record)
    }

    /// Attach a not-yet-filed record to its counterparty's conversation.
    ///
    /// Filing happens once, keyed by the counterparty at first ingest. A later
    /// event or backfill that flips the direction changes `counterparty()`
    /// but leaves the record where it was filed; moving it is an explicit
    /// re-file, which the ledger does not do on its own.
    async fn file_in_conversation(&self, record: &CallRecord) -> Result<Uuid> {
        let counterparty = record.counterparty();
        let digits = canonical_digits(counterparty);
        let key = if digits.is_empty() {
            counterparty.trim().to_lowercase()
        } else {
            digits
        };
        let contact = self.db.resolve_contact(&self.tenant_id, &key).await?;

        for attempt in 1..=MAX_ATTACH_ATTEMPTS {
            let conversation = self.resolver.find_or_create(contact.id).await?;
            match self
                .db
                .attach_call(conversation.id, &record.provider_call_id, record.first_seen_at)
                .await
            {
                Ok(id) => return Ok(id),
                Err(DatabaseError::NotFound { .. }) => debug!(
                    conversation_id = %conversation.id,
                    attempt,
                    "Conversation merged away before attach, resolving again"
                ),
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::Conflict(format!(
            "could not attach {} to a conversation for contact {}",
            record.provider_call_id, contact.id
        )))
    }

    /// One freeze tick as of now.
    pub async fn freeze_tick(&self, config: &FreezeConfig) -> Result<FreezeReport> {
        self.freeze_tick_at(config, Utc::now()).await
    }

    pub async fn freeze_tick_at(
        &self,
        config: &FreezeConfig,
        now: DateTime<Utc>,
    ) -> Result<FreezeReport> {
        self.freezer.tick(config, now).await
    }

    /// Conversation for a contact, created on first use.
    pub async fn resolve_conversation(&self, contact_id: Uuid) -> Result<Conversation> {
        self.resolver.find_or_create(contact_id).await
    }

    /// Re-normalize the tenant's stored records against the ledger's roster.
    pub async fn backfill(&self, config: &BackfillConfig) -> Result<BackfillReport> {
        let reconciler = BackfillReconciler::new(
            Arc::clone(&self.db),
            self.tenant_id.clone(),
            self.roster.clone(),
        );
        reconciler.run(config, Utc::now()).await
    }

    pub async fn merge_duplicates(&self) -> Result<MergeReport> {
        self.resolver.merge_duplicates().await
    }

    pub async fn get_call(&self, provider_call_id: &str) -> Result<CallRecord> {
        self.db
            .get_call_record(provider_call_id)
            .await?
            .ok_or_else(|| Error::NotFound {
                entity: "call".into(),
                id: provider_call_id.to_string(),
            })
    }

    pub async fn get_conversation(&self, id: Uuid) -> Result<Conversation> {
        self.db
            .get_conversation(id)
            .await?
            .ok_or_else(|| Error::NotFound {
                entity: "conversation".into(),
                id: id.to_string(),
            })
    }

    /// Conversation plus its messages, oldest first.
    pub async fn conversation_timeline(
        &self,
        id: Uuid,
    ) -> Result<(Conversation, Vec<ConversationMessage>)> {
        let conversation = self.get_conversation(id).await?;
        let messages = self.db.list_conversation_messages(id).await?;
        info!(
            conversation_id = %id,
            messages = messages.len(),
            "Loaded conversation timeline"
        );
        Ok((conversation, messages))
    }
}

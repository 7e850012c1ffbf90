//! Conversation resolver: one conversation per contact.
//!
//! Ingestion never blocks on a global lock: it fetches, and if nothing is
//! there, tries a guarded create and re-fetches when another writer won.
//! Duplicates that slip through (older writers, imports) are folded back
//! together by [`ConversationResolver::merge_duplicates`].

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::Conversation;
use crate::error::{Error, Result};
use crate::store::Database;

/// Attempts at create-or-fetch before giving up with a conflict.
const MAX_CREATE_ATTEMPTS: usize = 3;

/// Summary of a `merge_duplicates` run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub contacts_merged: usize,
    pub conversations_removed: usize,
    pub errors: usize,
}

pub struct ConversationResolver {
    db: Arc<dyn Database>,
    tenant_id: String,
}

impl ConversationResolver {
    pub fn new(db: Arc<dyn Database>, tenant_id: impl Into<String>) -> Self {
        Self {
            db,
            tenant_id: tenant_id.into(),
        }
    }

    /// Existing conversation for the contact, or a new one.
    pub async fn find_or_create(&self, contact_id: Uuid) -> Result<Conversation> {
        for attempt in 1..=MAX_CREATE_ATTEMPTS {
            if let Some(found) = self.db.find_conversation(&self.tenant_id, contact_id).await? {
                return Ok(found);
            }
            if let Some(created) = self
                .db
                .create_conversation_if_absent(&self.tenant_id, contact_id)
                .await?
            {
                return Ok(created);
            }
            debug!(%contact_id, attempt, "Lost conversation create race, re-fetching");
        }
        Err(Error::Conflict(format!(
            "conversation for contact {contact_id} kept disappearing after {MAX_CREATE_ATTEMPTS} attempts"
        )))
    }

    /// Fold every contact's duplicate conversations into the earliest one.
    ///
    /// Each contact merges in its own transaction. A contact that fails is
    /// logged and counted; a store outage stops the run.
    pub async fn merge_duplicates(&self) -> Result<MergeReport> {
        let contacts = self
            .db
            .list_duplicate_contacts(&self.tenant_id)
            .await?;

        let mut report = MergeReport::default();
        for contact_id in contacts {
            match self
                .db
                .merge_contact_conversations(&self.tenant_id, contact_id)
                .await
            {
                Ok(Some(merge)) => {
                    info!(
                        %contact_id,
                        primary = %merge.primary.id,
                        removed = merge.removed.len(),
                        message_count = merge.primary.message_count,
                        "Merged duplicate conversations"
                    );
                    report.contacts_merged += 1;
                    report.conversations_removed += merge.removed.len();
                }
                Ok(None) => {}
                Err(e) if e.is_transient() => return Err(Error::TransientStore(e)),
                Err(e) => {
                    warn!(%contact_id, error = %e, "Conversation merge failed");
                    report.errors += 1;
                }
            }
        }

        info!(
            contacts_merged = report.contacts_merged,
            conversations_removed = report.conversations_removed,
            errors = report.errors,
            "Duplicate merge complete"
        );
        Ok(report)
    }
}

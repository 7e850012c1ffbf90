//! Backend-agnostic persistence interface for the call ledger.
//!
//! Every method is one store operation: it runs in its own transaction and
//! holds nothing once it returns.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::calls::lifecycle::SyncState;
use crate::calls::model::{
    CallRecord, Canonical, ContactRef, Conversation, ConversationMessage, CorrectionAudit,
    RawCallEvent, UpsertResult,
};
use crate::calls::normalizer::BusinessLineRoster;
use crate::error::DatabaseError;

/// Outcome of merging one contact's duplicate conversations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactMerge {
    pub primary: Conversation,
    pub removed: Vec<Uuid>,
}

/// Identity and freeze-relevant fields of one eligible record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreezeCandidate {
    pub provider_call_id: String,
    pub finalized_at: DateTime<Utc>,
    pub sync_state: SyncState,
}

/// A stored row that could not be decoded into a [`CallRecord`].
#[derive(Debug)]
pub struct UnreadableRecord {
    pub provider_call_id: String,
    pub error: DatabaseError,
}

/// Database trait covering call records, conversations, and contacts.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Call records ────────────────────────────────────────────────

    /// Insert or merge one raw event, keyed by its leg id.
    ///
    /// Applying the same event twice leaves the stored record unchanged.
    async fn upsert_call_record(
        &self,
        tenant_id: &str,
        event: &RawCallEvent,
        roster: &BusinessLineRoster,
    ) -> Result<UpsertResult, DatabaseError>;

    /// Look up a record by provider call id.
    async fn get_call_record(
        &self,
        provider_call_id: &str,
    ) -> Result<Option<CallRecord>, DatabaseError>;

    /// The tenant's active records finalized strictly before `cutoff`,
    /// oldest first. Only the columns the freeze decision needs are read.
    async fn list_eligible_for_freeze(
        &self,
        tenant_id: &str,
        cutoff: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<Vec<FreezeCandidate>, DatabaseError>;

    /// Number of the tenant's active records finalized strictly before `cutoff`.
    async fn count_eligible_for_freeze(
        &self,
        tenant_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, DatabaseError>;

    /// Move the given records to `state`.
    ///
    /// Rows whose current state cannot transition to `state` are skipped.
    /// Returns the number of rows changed.
    async fn batch_set_sync_state(
        &self,
        provider_call_ids: &[String],
        state: SyncState,
    ) -> Result<usize, DatabaseError>;

    /// Page through the tenant's records in provider call id order, after
    /// `cursor`. A row that fails to decode comes back as its own `Err`
    /// item; the rest of the page is unaffected.
    async fn list_call_records(
        &self,
        tenant_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Result<CallRecord, UnreadableRecord>>, DatabaseError>;

    /// Replace canonical fields if they still equal `expected`, appending
    /// `audit` to the record's corrections. Returns `false` when the record
    /// changed underneath the caller.
    async fn correct_canonical(
        &self,
        provider_call_id: &str,
        expected: Canonical,
        audit: &CorrectionAudit,
    ) -> Result<bool, DatabaseError>;

    // ── Contacts ────────────────────────────────────────────────────

    /// Fetch the contact for a phone number, registering it on first sight.
    async fn resolve_contact(
        &self,
        tenant_id: &str,
        phone_digits: &str,
    ) -> Result<ContactRef, DatabaseError>;

    // ── Conversations ───────────────────────────────────────────────

    /// Oldest conversation for a contact, if any.
    async fn find_conversation(
        &self,
        tenant_id: &str,
        contact_id: Uuid,
    ) -> Result<Option<Conversation>, DatabaseError>;

    /// Create a conversation unless one already exists for the contact.
    ///
    /// Returns `None` when another writer got there first.
    async fn create_conversation_if_absent(
        &self,
        tenant_id: &str,
        contact_id: Uuid,
    ) -> Result<Option<Conversation>, DatabaseError>;

    /// Unconditional insert, for importing conversations that already exist
    /// elsewhere with their own creation time.
    async fn insert_conversation(
        &self,
        tenant_id: &str,
        contact_id: Uuid,
        created_at: DateTime<Utc>,
    ) -> Result<Conversation, DatabaseError>;

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, DatabaseError>;

    /// Attach a call record to a conversation. A record that is already
    /// attached stays where it is; the conversation it lives in is returned.
    async fn attach_call(
        &self,
        conversation_id: Uuid,
        provider_call_id: &str,
        occurred_at: DateTime<Utc>,
    ) -> Result<Uuid, DatabaseError>;

    /// Timeline of a conversation, oldest first.
    async fn list_conversation_messages(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<ConversationMessage>, DatabaseError>;

    /// Contacts in the tenant that own more than one conversation.
    async fn list_duplicate_contacts(&self, tenant_id: &str) -> Result<Vec<Uuid>, DatabaseError>;

    /// Fold every conversation of a contact into the earliest-created one.
    ///
    /// Runs as one transaction. Returns `None` if the contact has at most one
    /// conversation by the time the transaction starts.
    async fn merge_contact_conversations(
        &self,
        tenant_id: &str,
        contact_id: Uuid,
    ) -> Result<Option<ContactMerge>, DatabaseError>;
}

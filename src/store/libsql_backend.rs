//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Every trait method is one
//! store operation: mutating ones run inside a single IMMEDIATE transaction.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, TransactionBehavior, params};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::calls::lifecycle::SyncState;
use crate::calls::model::{
    CallExtensions, CallRecord, Canonical, ContactRef, Conversation, ConversationMessage,
    CorrectionAudit, RawCallEvent, UpsertOutcome, UpsertResult, truncate_to_millis,
};
use crate::calls::normalizer::BusinessLineRoster;
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{ContactMerge, Database, FreezeCandidate, UnreadableRecord};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations. A
/// transaction opened on it is visible to every other statement on the same
/// connection, so all operations go through `gate`; each one holds it only
/// for its own duration.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    gate: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            gate: Mutex::new(()),
        })
    }

    /// Run a raw statement, bypassing the record model (tests only).
    #[cfg(test)]
    pub(crate) async fn execute_raw(&self, sql: &str) -> Result<u64, DatabaseError> {
        let _gate = self.gate.lock().await;
        self.conn.execute(sql, ()).await.map_err(query_err("execute_raw"))
    }

    async fn begin(&self) -> Result<libsql::Transaction, DatabaseError> {
        self.conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to begin transaction: {e}")))
    }
}

/// Commit on success, roll back on failure.
async fn finish<T>(
    tx: libsql::Transaction,
    result: Result<T, DatabaseError>,
) -> Result<T, DatabaseError> {
    match result {
        Ok(value) => {
            tx.commit()
                .await
                .map_err(|e| DatabaseError::Query(format!("commit: {e}")))?;
            Ok(value)
        }
        Err(err) => {
            if let Err(e) = tx.rollback().await {
                warn!("Rollback failed: {e}");
            }
            Err(err)
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width RFC 3339, so stored timestamps sort lexicographically.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid {s}: {e}")))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_int(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

fn query_err(op: &'static str) -> impl Fn(libsql::Error) -> DatabaseError {
    move |e| DatabaseError::Query(format!("{op}: {e}"))
}

const CALL_COLUMNS: &str = "c.provider_call_id, c.tenant_id, c.parent_call_id, c.from_number, \
    c.to_number, c.raw_direction, c.canonical_direction, c.raw_status, c.canonical_status, \
    c.duration_secs, c.finalized_at_ms, c.sync_state, c.extensions, c.attributes, \
    c.first_seen_at, c.updated_at, m.conversation_id";

const CALL_FROM: &str =
    "FROM call_records c LEFT JOIN conversation_messages m ON m.provider_call_id = c.provider_call_id";

const CONVERSATION_COLUMNS: &str =
    "id, tenant_id, contact_id, created_at, message_count, last_activity";

/// Map a libsql Row to a CallRecord. Column order matches CALL_COLUMNS.
fn row_to_call_record(row: &libsql::Row) -> Result<CallRecord, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("row parse: {e}"));

    let canonical_direction: String = row.get(6).map_err(parse)?;
    let canonical_status: String = row.get(8).map_err(parse)?;
    let sync_state: String = row.get(11).map_err(parse)?;
    let extensions: String = row.get(12).map_err(parse)?;
    let attributes: String = row.get(13).map_err(parse)?;
    let first_seen: String = row.get(14).map_err(parse)?;
    let updated: String = row.get(15).map_err(parse)?;
    let finalized_ms: Option<i64> = row.get(10).map_err(parse)?;
    let conversation_id: Option<String> = row.get(16).map_err(parse)?;

    Ok(CallRecord {
        provider_call_id: row.get(0).map_err(parse)?,
        tenant_id: row.get(1).map_err(parse)?,
        parent_call_id: row.get(2).map_err(parse)?,
        from: row.get(3).map_err(parse)?,
        to: row.get(4).map_err(parse)?,
        raw_direction: row.get(5).map_err(parse)?,
        raw_status: row.get(7).map_err(parse)?,
        canonical_direction: canonical_direction
            .parse()
            .map_err(DatabaseError::Serialization)?,
        canonical_status: canonical_status
            .parse()
            .map_err(DatabaseError::Serialization)?,
        duration: row.get(9).map_err(parse)?,
        finalized_at: finalized_ms.and_then(DateTime::from_timestamp_millis),
        sync_state: sync_state.parse().map_err(DatabaseError::Serialization)?,
        conversation_id: conversation_id.as_deref().map(parse_uuid).transpose()?,
        extensions: serde_json::from_str::<CallExtensions>(&extensions)
            .map_err(|e| DatabaseError::Serialization(format!("extensions: {e}")))?,
        attributes: serde_json::from_str(&attributes)
            .map_err(|e| DatabaseError::Serialization(format!("attributes: {e}")))?,
        first_seen_at: parse_datetime(&first_seen),
        updated_at: parse_datetime(&updated),
    })
}

/// Map a libsql Row to a Conversation. Column order matches CONVERSATION_COLUMNS.
fn row_to_conversation(row: &libsql::Row) -> Result<Conversation, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("row parse: {e}"));
    let id: String = row.get(0).map_err(parse)?;
    let contact_id: String = row.get(2).map_err(parse)?;
    let created: String = row.get(3).map_err(parse)?;
    let last_activity: String = row.get(5).map_err(parse)?;
    Ok(Conversation {
        id: parse_uuid(&id)?,
        tenant_id: row.get(1).map_err(parse)?,
        contact_id: parse_uuid(&contact_id)?,
        created_at: parse_datetime(&created),
        message_count: row.get(4).map_err(parse)?,
        last_activity: parse_datetime(&last_activity),
    })
}

async fn collect<T>(
    mut rows: libsql::Rows,
    op: &'static str,
    map: impl Fn(&libsql::Row) -> Result<T, DatabaseError>,
) -> Result<Vec<T>, DatabaseError> {
    let mut out = Vec::new();
    while let Some(row) = rows.next().await.map_err(query_err(op))? {
        out.push(map(&row)?);
    }
    Ok(out)
}

async fn fetch_call_record(
    conn: &Connection,
    provider_call_id: &str,
) -> Result<Option<CallRecord>, DatabaseError> {
    let rows = conn
        .query(
            &format!("SELECT {CALL_COLUMNS} {CALL_FROM} WHERE c.provider_call_id = ?1"),
            params![provider_call_id],
        )
        .await
        .map_err(query_err("get_call_record"))?;
    Ok(collect(rows, "get_call_record", row_to_call_record)
        .await?
        .into_iter()
        .next())
}

async fn write_call_record(conn: &Connection, record: &CallRecord) -> Result<(), DatabaseError> {
    let extensions = serde_json::to_string(&record.extensions)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let attributes = serde_json::to_string(&record.attributes)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

    conn.execute(
        "INSERT INTO call_records (provider_call_id, tenant_id, parent_call_id, from_number,
            to_number, raw_direction, canonical_direction, raw_status, canonical_status,
            duration_secs, finalized_at_ms, sync_state, extensions, attributes,
            first_seen_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
         ON CONFLICT (provider_call_id) DO UPDATE SET
            parent_call_id = excluded.parent_call_id,
            from_number = excluded.from_number,
            to_number = excluded.to_number,
            raw_direction = excluded.raw_direction,
            canonical_direction = excluded.canonical_direction,
            raw_status = excluded.raw_status,
            canonical_status = excluded.canonical_status,
            duration_secs = excluded.duration_secs,
            finalized_at_ms = excluded.finalized_at_ms,
            sync_state = excluded.sync_state,
            extensions = excluded.extensions,
            attributes = excluded.attributes,
            updated_at = excluded.updated_at",
        params![
            record.provider_call_id.as_str(),
            record.tenant_id.as_str(),
            opt_text(record.parent_call_id.as_deref()),
            record.from.as_str(),
            record.to.as_str(),
            record.raw_direction.as_str(),
            record.canonical_direction.as_str(),
            record.raw_status.as_str(),
            record.canonical_status.as_str(),
            opt_int(record.duration),
            opt_int(record.finalized_at.map(|t| t.timestamp_millis())),
            record.sync_state.as_str(),
            extensions,
            attributes,
            fmt_ts(record.first_seen_at),
            fmt_ts(record.updated_at),
        ],
    )
    .await
    .map_err(query_err("write_call_record"))?;
    Ok(())
}

async fn fetch_conversations(
    conn: &Connection,
    tenant_id: &str,
    contact_id: Uuid,
) -> Result<Vec<Conversation>, DatabaseError> {
    let rows = conn
        .query(
            &format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations
                 WHERE tenant_id = ?1 AND contact_id = ?2
                 ORDER BY created_at ASC, id ASC"
            ),
            params![tenant_id, contact_id.to_string()],
        )
        .await
        .map_err(query_err("fetch_conversations"))?;
    collect(rows, "fetch_conversations", row_to_conversation).await
}

async fn fetch_conversation(
    conn: &Connection,
    id: Uuid,
) -> Result<Option<Conversation>, DatabaseError> {
    let rows = conn
        .query(
            &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
            params![id.to_string()],
        )
        .await
        .map_err(query_err("get_conversation"))?;
    Ok(collect(rows, "get_conversation", row_to_conversation)
        .await?
        .into_iter()
        .next())
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        let _gate = self.gate.lock().await;
        migrations::run_migrations(&self.conn).await
    }

    // ── Call records ────────────────────────────────────────────────

    async fn upsert_call_record(
        &self,
        tenant_id: &str,
        event: &RawCallEvent,
        roster: &BusinessLineRoster,
    ) -> Result<UpsertResult, DatabaseError> {
        let _gate = self.gate.lock().await;
        let tx = self.begin().await?;
        let result: Result<UpsertResult, DatabaseError> = async {
            let existing = fetch_call_record(&tx, event.leg_id.trim()).await?;
            let now = truncate_to_millis(Utc::now());
            let (record, outcome) =
                CallRecord::apply_event(existing.as_ref(), tenant_id, event, roster, now)
                    .map_err(|e| DatabaseError::Constraint(format!("invalid call event: {e}")))?;
            if outcome != UpsertOutcome::Unchanged {
                write_call_record(&tx, &record).await?;
            }
            debug!(
                provider_call_id = %record.provider_call_id,
                outcome = ?outcome,
                "Call record upserted"
            );
            Ok(UpsertResult { record, outcome })
        }
        .await;
        finish(tx, result).await
    }

    async fn get_call_record(
        &self,
        provider_call_id: &str,
    ) -> Result<Option<CallRecord>, DatabaseError> {
        let _gate = self.gate.lock().await;
        fetch_call_record(&self.conn, provider_call_id).await
    }

    async fn list_eligible_for_freeze(
        &self,
        tenant_id: &str,
        cutoff: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<Vec<FreezeCandidate>, DatabaseError> {
        let _gate = self.gate.lock().await;
        let rows = self
            .conn
            .query(
                "SELECT provider_call_id, finalized_at_ms, sync_state FROM call_records
                 WHERE tenant_id = ?1
                   AND sync_state = 'active'
                   AND finalized_at_ms IS NOT NULL
                   AND finalized_at_ms < ?2
                 ORDER BY finalized_at_ms ASC, provider_call_id ASC
                 LIMIT ?3",
                params![tenant_id, cutoff.timestamp_millis(), batch_size as i64],
            )
            .await
            .map_err(query_err("list_eligible_for_freeze"))?;
        collect(rows, "list_eligible_for_freeze", |row| {
            let parse = |e: libsql::Error| DatabaseError::Query(format!("row parse: {e}"));
            let finalized_ms: i64 = row.get(1).map_err(parse)?;
            let sync_state: String = row.get(2).map_err(parse)?;
            Ok(FreezeCandidate {
                provider_call_id: row.get(0).map_err(parse)?,
                finalized_at: DateTime::from_timestamp_millis(finalized_ms)
                    .unwrap_or(DateTime::<Utc>::MIN_UTC),
                sync_state: sync_state.parse().map_err(DatabaseError::Serialization)?,
            })
        })
        .await
    }

    async fn count_eligible_for_freeze(
        &self,
        tenant_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let _gate = self.gate.lock().await;
        let rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM call_records
                 WHERE tenant_id = ?1
                   AND sync_state = 'active'
                   AND finalized_at_ms IS NOT NULL
                   AND finalized_at_ms < ?2",
                params![tenant_id, cutoff.timestamp_millis()],
            )
            .await
            .map_err(query_err("count_eligible_for_freeze"))?;
        let counts = collect(rows, "count_eligible_for_freeze", |row| {
            row.get::<i64>(0)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))
        })
        .await?;
        Ok(counts.first().copied().unwrap_or(0).max(0) as u64)
    }

    async fn batch_set_sync_state(
        &self,
        provider_call_ids: &[String],
        state: SyncState,
    ) -> Result<usize, DatabaseError> {
        let sources: Vec<SyncState> = [SyncState::Active, SyncState::Frozen]
            .into_iter()
            .filter(|from| from.can_transition_to(state))
            .collect();
        if provider_call_ids.is_empty() || sources.is_empty() {
            return Ok(0);
        }

        let _gate = self.gate.lock().await;
        let tx = self.begin().await?;
        let result: Result<usize, DatabaseError> = async {
            let now = fmt_ts(Utc::now());
            let mut changed = 0usize;
            for id in provider_call_ids {
                for from in &sources {
                    changed += tx
                        .execute(
                            "UPDATE call_records SET sync_state = ?1, updated_at = ?2
                             WHERE provider_call_id = ?3 AND sync_state = ?4",
                            params![state.as_str(), now.as_str(), id.as_str(), from.as_str()],
                        )
                        .await
                        .map_err(query_err("batch_set_sync_state"))?
                        as usize;
                }
            }
            Ok(changed)
        }
        .await;
        let changed = finish(tx, result).await?;
        if changed > 0 {
            info!(count = changed, state = %state, "Sync state updated");
        }
        Ok(changed)
    }

    async fn list_call_records(
        &self,
        tenant_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Result<CallRecord, UnreadableRecord>>, DatabaseError> {
        let _gate = self.gate.lock().await;
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {CALL_COLUMNS} {CALL_FROM}
                     WHERE c.tenant_id = ?1 AND c.provider_call_id > ?2
                     ORDER BY c.provider_call_id ASC
                     LIMIT ?3"
                ),
                params![tenant_id, cursor.unwrap_or(""), limit as i64],
            )
            .await
            .map_err(query_err("list_call_records"))?;
        collect(rows, "list_call_records", |row| {
            let provider_call_id: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
            Ok(row_to_call_record(row).map_err(|error| UnreadableRecord {
                provider_call_id,
                error,
            }))
        })
        .await
    }

    async fn correct_canonical(
        &self,
        provider_call_id: &str,
        expected: Canonical,
        audit: &CorrectionAudit,
    ) -> Result<bool, DatabaseError> {
        let _gate = self.gate.lock().await;
        let tx = self.begin().await?;
        let result: Result<bool, DatabaseError> = async {
            let mut record = fetch_call_record(&tx, provider_call_id).await?.ok_or_else(|| {
                DatabaseError::NotFound {
                    entity: "call_record".into(),
                    id: provider_call_id.to_string(),
                }
            })?;
            if record.canonical() != expected {
                return Ok(false);
            }
            record.canonical_direction = audit.direction;
            record.canonical_status = audit.status;
            record.extensions.corrections.push(audit.clone());
            record.updated_at = truncate_to_millis(Utc::now());
            write_call_record(&tx, &record).await?;
            Ok(true)
        }
        .await;
        finish(tx, result).await
    }

    // ── Contacts ────────────────────────────────────────────────────

    async fn resolve_contact(
        &self,
        tenant_id: &str,
        phone_digits: &str,
    ) -> Result<ContactRef, DatabaseError> {
        let _gate = self.gate.lock().await;
        let created = self
            .conn
            .execute(
                "INSERT INTO contacts (id, tenant_id, phone_digits, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (tenant_id, phone_digits) DO NOTHING",
                params![
                    Uuid::new_v4().to_string(),
                    tenant_id,
                    phone_digits,
                    fmt_ts(Utc::now())
                ],
            )
            .await
            .map_err(query_err("resolve_contact"))?;

        let rows = self
            .conn
            .query(
                "SELECT id, tenant_id, phone_digits FROM contacts
                 WHERE tenant_id = ?1 AND phone_digits = ?2",
                params![tenant_id, phone_digits],
            )
            .await
            .map_err(query_err("resolve_contact"))?;
        let contact = collect(rows, "resolve_contact", |row| {
            let parse = |e: libsql::Error| DatabaseError::Query(format!("row parse: {e}"));
            let id: String = row.get(0).map_err(parse)?;
            Ok(ContactRef {
                id: parse_uuid(&id)?,
                tenant_id: row.get(1).map_err(parse)?,
                phone_digits: row.get(2).map_err(parse)?,
            })
        })
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| DatabaseError::NotFound {
            entity: "contact".into(),
            id: phone_digits.to_string(),
        })?;

        if created > 0 {
            debug!(contact_id = %contact.id, "Contact registered");
        }
        Ok(contact)
    }

    // ── Conversations ───────────────────────────────────────────────

    async fn find_conversation(
        &self,
        tenant_id: &str,
        contact_id: Uuid,
    ) -> Result<Option<Conversation>, DatabaseError> {
        let _gate = self.gate.lock().await;
        Ok(fetch_conversations(&self.conn, tenant_id, contact_id)
            .await?
            .into_iter()
            .next())
    }

    async fn create_conversation_if_absent(
        &self,
        tenant_id: &str,
        contact_id: Uuid,
    ) -> Result<Option<Conversation>, DatabaseError> {
        let _gate = self.gate.lock().await;
        let id = Uuid::new_v4();
        let now = Utc::now();
        let inserted = self
            .conn
            .execute(
                "INSERT INTO conversations
                    (id, tenant_id, contact_id, created_at, message_count, last_activity)
                 SELECT ?1, ?2, ?3, ?4, 0, ?4
                 WHERE NOT EXISTS (
                    SELECT 1 FROM conversations WHERE tenant_id = ?2 AND contact_id = ?3
                 )",
                params![id.to_string(), tenant_id, contact_id.to_string(), fmt_ts(now)],
            )
            .await
            .map_err(query_err("create_conversation_if_absent"))?;

        if inserted == 0 {
            return Ok(None);
        }
        info!(conversation_id = %id, contact_id = %contact_id, "Conversation created");
        fetch_conversation(&self.conn, id).await
    }

    async fn insert_conversation(
        &self,
        tenant_id: &str,
        contact_id: Uuid,
        created_at: DateTime<Utc>,
    ) -> Result<Conversation, DatabaseError> {
        let _gate = self.gate.lock().await;
        let id = Uuid::new_v4();
        self.conn
            .execute(
                "INSERT INTO conversations
                    (id, tenant_id, contact_id, created_at, message_count, last_activity)
                 VALUES (?1, ?2, ?3, ?4, 0, ?4)",
                params![
                    id.to_string(),
                    tenant_id,
                    contact_id.to_string(),
                    fmt_ts(created_at)
                ],
            )
            .await
            .map_err(query_err("insert_conversation"))?;
        fetch_conversation(&self.conn, id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "conversation".into(),
                id: id.to_string(),
            })
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, DatabaseError> {
        let _gate = self.gate.lock().await;
        fetch_conversation(&self.conn, id).await
    }

    async fn attach_call(
        &self,
        conversation_id: Uuid,
        provider_call_id: &str,
        occurred_at: DateTime<Utc>,
    ) -> Result<Uuid, DatabaseError> {
        let _gate = self.gate.lock().await;
        let tx = self.begin().await?;
        let result: Result<Uuid, DatabaseError> = async {
            let rows = tx
                .query(
                    "SELECT conversation_id FROM conversation_messages WHERE provider_call_id = ?1",
                    params![provider_call_id],
                )
                .await
                .map_err(query_err("attach_call"))?;
            let attached = collect(rows, "attach_call", |row| {
                let id: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                parse_uuid(&id)
            })
            .await?;
            if let Some(existing) = attached.first() {
                return Ok(*existing);
            }

            if fetch_conversation(&tx, conversation_id).await?.is_none() {
                return Err(DatabaseError::NotFound {
                    entity: "conversation".into(),
                    id: conversation_id.to_string(),
                });
            }

            let occurred = fmt_ts(occurred_at);
            tx.execute(
                "INSERT INTO conversation_messages
                    (id, conversation_id, provider_call_id, occurred_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    Uuid::new_v4().to_string(),
                    conversation_id.to_string(),
                    provider_call_id,
                    occurred.as_str(),
                    fmt_ts(Utc::now())
                ],
            )
            .await
            .map_err(query_err("attach_call"))?;
            tx.execute(
                "UPDATE conversations SET
                    message_count = (SELECT COUNT(*) FROM conversation_messages
                                     WHERE conversation_id = ?1),
                    last_activity = MAX(last_activity, ?2)
                 WHERE id = ?1",
                params![conversation_id.to_string(), occurred.as_str()],
            )
            .await
            .map_err(query_err("attach_call"))?;
            debug!(%conversation_id, provider_call_id, "Call attached to conversation");
            Ok(conversation_id)
        }
        .await;
        finish(tx, result).await
    }

    async fn list_conversation_messages(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<ConversationMessage>, DatabaseError> {
        let _gate = self.gate.lock().await;
        let rows = self
            .conn
            .query(
                "SELECT id, conversation_id, provider_call_id, occurred_at
                 FROM conversation_messages WHERE conversation_id = ?1
                 ORDER BY occurred_at ASC, created_at ASC, id ASC",
                params![conversation_id.to_string()],
            )
            .await
            .map_err(query_err("list_conversation_messages"))?;
        collect(rows, "list_conversation_messages", |row| {
            let parse = |e: libsql::Error| DatabaseError::Query(format!("row parse: {e}"));
            let id: String = row.get(0).map_err(parse)?;
            let conversation_id: String = row.get(1).map_err(parse)?;
            let occurred: String = row.get(3).map_err(parse)?;
            Ok(ConversationMessage {
                id: parse_uuid(&id)?,
                conversation_id: parse_uuid(&conversation_id)?,
                provider_call_id: row.get(2).map_err(parse)?,
                occurred_at: parse_datetime(&occurred),
            })
        })
        .await
    }

    async fn list_duplicate_contacts(&self, tenant_id: &str) -> Result<Vec<Uuid>, DatabaseError> {
        let _gate = self.gate.lock().await;
        let rows = self
            .conn
            .query(
                "SELECT contact_id FROM conversations WHERE tenant_id = ?1
                 GROUP BY contact_id HAVING COUNT(*) > 1
                 ORDER BY contact_id",
                params![tenant_id],
            )
            .await
            .map_err(query_err("list_duplicate_contacts"))?;
        collect(rows, "list_duplicate_contacts", |row| {
            let id: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
            parse_uuid(&id)
        })
        .await
    }

    async fn merge_contact_conversations(
        &self,
        tenant_id: &str,
        contact_id: Uuid,
    ) -> Result<Option<ContactMerge>, DatabaseError> {
        let _gate = self.gate.lock().await;
        let tx = self.begin().await?;
        let result: Result<Option<ContactMerge>, DatabaseError> = async {
            let conversations = fetch_conversations(&tx, tenant_id, contact_id).await?;
            let Some((primary, rest)) = conversations.split_first() else {
                return Ok(None);
            };
            if rest.is_empty() {
                return Ok(None);
            }

            let last_activity = conversations
                .iter()
                .map(|c| c.last_activity)
                .max()
                .unwrap_or(primary.last_activity);
            let primary_id = primary.id.to_string();

            let mut removed = Vec::with_capacity(rest.len());
            for duplicate in rest {
                let duplicate_id = duplicate.id.to_string();
                tx.execute(
                    "UPDATE conversation_messages SET conversation_id = ?1
                     WHERE conversation_id = ?2",
                    params![primary_id.as_str(), duplicate_id.as_str()],
                )
                .await
                .map_err(query_err("merge_contact_conversations"))?;
                tx.execute(
                    "DELETE FROM conversations WHERE id = ?1",
                    params![duplicate_id.as_str()],
                )
                .await
                .map_err(query_err("merge_contact_conversations"))?;
                removed.push(duplicate.id);
            }

            tx.execute(
                "UPDATE conversations SET
                    message_count = (SELECT COUNT(*) FROM conversation_messages
                                     WHERE conversation_id = ?1),
                    last_activity = ?2
                 WHERE id = ?1",
                params![primary_id.as_str(), fmt_ts(last_activity)],
            )
            .await
            .map_err(query_err("merge_contact_conversations"))?;

            let primary = fetch_conversation(&tx, primary.id).await?.ok_or_else(|| {
                DatabaseError::NotFound {
                    entity: "conversation".into(),
                    id: primary_id.clone(),
                }
            })?;
            Ok(Some(ContactMerge { primary, removed }))
        }
        .await;
        finish(tx, result).await
    }
}

// ── Tests ───────────────────────────────────────────────────────────

//! Schema migrations for the call ledger database.
//!
//! Applied versions are recorded in `_migrations`; only newer steps run.

use libsql::Connection;
use tracing::{debug, info};

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS contacts (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                phone_digits TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (tenant_id, phone_digits)
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                contact_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                message_count INTEGER NOT NULL DEFAULT 0,
                last_activity TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_contact
                ON conversations(tenant_id, contact_id, created_at);

            CREATE TABLE IF NOT EXISTS conversation_messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                provider_call_id TEXT NOT NULL UNIQUE,
                occurred_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conversation_messages_conversation
                ON conversation_messages(conversation_id);

            CREATE TABLE IF NOT EXISTS call_records (
                provider_call_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                parent_call_id TEXT,
                from_number TEXT NOT NULL,
                to_number TEXT NOT NULL,
                raw_direction TEXT NOT NULL,
                canonical_direction TEXT NOT NULL,
                raw_status TEXT NOT NULL,
                canonical_status TEXT NOT NULL,
                duration_secs INTEGER,
                finalized_at_ms INTEGER,
                sync_state TEXT NOT NULL DEFAULT 'active',
                extensions TEXT NOT NULL DEFAULT '{}',
                attributes TEXT NOT NULL DEFAULT '{}',
                first_seen_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_call_records_tenant ON call_records(tenant_id);
            CREATE INDEX IF NOT EXISTS idx_call_records_parent ON call_records(parent_call_id);
        "#,
    },
    Migration {
        version: 2,
        name: "freeze_eligibility_index",
        sql: r#"
            CREATE INDEX IF NOT EXISTS idx_call_records_freeze
                ON call_records(sync_state, finalized_at_ms);
        "#,
    },
];

/// Bring the schema up to the latest version.
///
/// Each pending step runs in its own transaction together with its
/// `_migrations` row, so a failed step leaves the previous version intact.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("cannot create _migrations: {e}")))?;

    let applied = schema_version(conn).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > applied).collect();
    if pending.is_empty() {
        debug!(version = applied, "Schema up to date");
        return Ok(());
    }

    for step in pending {
        info!(version = step.version, name = step.name, "Applying migration");
        apply(conn, step).await?;
    }
    let version = schema_version(conn).await?;
    info!(version, "Schema migrated");
    Ok(())
}

async fn apply(conn: &Connection, step: &Migration) -> Result<(), DatabaseError> {
    let failed = |e: libsql::Error| {
        DatabaseError::Migration(format!("V{} {} failed: {e}", step.version, step.name))
    };

    let tx = conn.transaction().await.map_err(failed)?;
    let result = async {
        tx.execute_batch(step.sql).await?;
        tx.execute(
            "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
            libsql::params![step.version, step.name],
        )
        .await?;
        Ok::<(), libsql::Error>(())
    }
    .await;

    match result {
        Ok(()) => tx.commit().await.map_err(failed),
        Err(e) => {
            let _ = tx.rollback().await;
            Err(failed(e))
        }
    }
}

/// Highest applied version; 0 on a fresh database.
async fn schema_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Migration(format!("cannot read schema version: {e}"));
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(read)?;
    match rows.next().await.map_err(read)? {
        Some(row) => row.get::<i64>(0).map_err(read),
        None => Ok(0),
    }
}

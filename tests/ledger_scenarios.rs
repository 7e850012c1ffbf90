//! End-to-end ledger scenarios against an in-memory libSQL store.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use call_ledger::calls::lifecycle::should_freeze;
use call_ledger::calls::model::{CanonicalDirection, CanonicalStatus};
use call_ledger::calls::{BackfillReport, BusinessLineRoster, CallLedger, RawCallEvent, SyncState};
use call_ledger::config::{BackfillConfig, FreezeConfig};
use call_ledger::error::{Error, ValidationError};
use call_ledger::store::{Database, LibSqlBackend};

const TENANT: &str = "acme";
const OURS: &str = "+15550001000";
const CALLER: &str = "+15551234567";

async fn memory_db() -> Arc<dyn Database> {
    Arc::new(
        LibSqlBackend::new_memory()
            .await
            .expect("in-memory database"),
    )
}

fn roster() -> BusinessLineRoster {
    BusinessLineRoster::new([OURS])
}

fn event(leg_id: &str, status: &str) -> RawCallEvent {
    RawCallEvent {
        leg_id: leg_id.into(),
        raw_direction: "inbound".into(),
        raw_status: status.into(),
        from: CALLER.into(),
        to: OURS.into(),
        ..Default::default()
    }
}

fn fixed_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

#[tokio::test]
async fn redelivered_legs_collapse_to_one_record() {
    let db = memory_db().await;
    let ledger = CallLedger::new(Arc::clone(&db), TENANT, roster());

    let ringing = event("CA100", "ringing");
    let mut completed = event("CA100", "completed");
    completed.duration = Some(95);
    completed.finalized_at = Some(fixed_time());

    for delivery in [&ringing, &completed, &ringing, &completed] {
        ledger.ingest(delivery).await.unwrap();
    }

    let records = db.list_call_records(TENANT, None, 10).await.unwrap();
    assert_eq!(records.len(), 1);
    let record = records[0].as_ref().unwrap();
    assert_eq!(record.canonical_status, CanonicalStatus::Completed);
    assert_eq!(record.duration, Some(95));
    assert_eq!(record.finalized_at, Some(fixed_time()));

    let conversation = ledger
        .get_conversation(record.conversation_id.unwrap())
        .await
        .unwrap();
    assert_eq!(conversation.message_count, 1);
}

#[tokio::test]
async fn racing_conversation_creates_merge_into_earliest() {
    let db = memory_db().await;
    let ledger = CallLedger::new(Arc::clone(&db), TENANT, roster());
    let contact = db.resolve_contact(TENANT, "5551234567").await.unwrap();

    // Parent-then-child and child-then-parent orderings each created their own
    // conversation for the same contact.
    let t0 = fixed_time();
    let earliest = db.insert_conversation(TENANT, contact.id, t0).await.unwrap();
    let later = db
        .insert_conversation(TENANT, contact.id, t0 + Duration::seconds(3))
        .await
        .unwrap();

    let legs = [
        ("CA-parent", None, later.id),
        ("CA-child-1", Some("CA-parent"), later.id),
        ("CA-child-2", Some("CA-parent"), earliest.id),
    ];
    for (offset, (leg_id, parent, conversation_id)) in legs.into_iter().enumerate() {
        let mut raw = event(leg_id, "completed");
        raw.parent_id = parent.map(str::to_string);
        db.upsert_call_record(TENANT, &raw, &roster()).await.unwrap();
        db.attach_call(
            conversation_id,
            leg_id,
            t0 + Duration::minutes(offset as i64),
        )
        .await
        .unwrap();
    }

    let before_early = db.list_conversation_messages(earliest.id).await.unwrap();
    let before_late = db.list_conversation_messages(later.id).await.unwrap();
    assert_eq!(before_early.len() + before_late.len(), 3);
    assert_eq!(db.list_duplicate_contacts(TENANT).await.unwrap(), vec![contact.id]);

    let report = ledger.merge_duplicates().await.unwrap();
    assert_eq!(report.contacts_merged, 1);
    assert_eq!(report.conversations_removed, 1);

    let survivor = ledger.resolve_conversation(contact.id).await.unwrap();
    assert_eq!(survivor.id, earliest.id);
    assert_eq!(survivor.message_count, 3);
    assert!(db.get_conversation(later.id).await.unwrap().is_none());
    assert!(db.list_duplicate_contacts(TENANT).await.unwrap().is_empty());

    let (_, timeline) = ledger.conversation_timeline(survivor.id).await.unwrap();
    let ids: Vec<&str> = timeline.iter().map(|m| m.provider_call_id.as_str()).collect();
    assert_eq!(ids, ["CA-parent", "CA-child-1", "CA-child-2"]);

    let child = ledger.get_call("CA-child-1").await.unwrap();
    assert_eq!(child.conversation_id, Some(earliest.id));
}

#[tokio::test]
async fn freeze_waits_out_the_full_cooldown() {
    let db = memory_db().await;
    let ledger = CallLedger::new(Arc::clone(&db), TENANT, roster());
    let finalized = fixed_time();

    let mut raw = event("CA200", "completed");
    raw.finalized_at = Some(finalized);
    let record = ledger.ingest(&raw).await.unwrap();

    let just_before = finalized + Duration::hours(5) + Duration::minutes(59);
    let exactly = finalized + Duration::hours(6);
    let just_after = finalized + Duration::hours(6) + Duration::minutes(1);
    assert!(!should_freeze(&record, 6, just_before));
    assert!(!should_freeze(&record, 6, exactly));
    assert!(should_freeze(&record, 6, just_after));

    let config = FreezeConfig::new(6, 100).unwrap();
    let early = ledger.freeze_tick_at(&config, exactly).await.unwrap();
    assert_eq!(early.frozen_count, 0);
    let late = ledger.freeze_tick_at(&config, just_after).await.unwrap();
    assert_eq!(late.frozen_count, 1);
    assert_eq!(late.remaining_eligible, 0);

    let stored = ledger.get_call("CA200").await.unwrap();
    assert_eq!(stored.sync_state, SyncState::Frozen);
}

#[tokio::test]
async fn backfill_fixes_only_stale_records() {
    let db = memory_db().await;

    // Ingested before the business lines were configured.
    let unconfigured = CallLedger::new(Arc::clone(&db), TENANT, BusinessLineRoster::default());
    for i in 0..100 {
        let mut raw = event(&format!("CA{i:03}"), "completed");
        if i % 8 == 0 && i < 96 {
            raw.parent_id = Some("CA-root".into());
        }
        unconfigured.ingest(&raw).await.unwrap();
    }

    let configured = CallLedger::new(Arc::clone(&db), TENANT, roster());
    let report = configured
        .backfill(&BackfillConfig::new(7).unwrap())
        .await
        .unwrap();
    assert_eq!(
        report,
        BackfillReport {
            fixed: 12,
            unchanged: 88,
            errors: 0,
            total: 100
        }
    );

    let fixed = configured.get_call("CA008").await.unwrap();
    assert_eq!(fixed.canonical_direction, CanonicalDirection::Outgoing);
    assert_eq!(fixed.raw_direction, "inbound");
    assert_eq!(fixed.extensions.corrections.len(), 1);
    let audit = &fixed.extensions.corrections[0];
    assert_eq!(audit.previous_direction, CanonicalDirection::Inbound);
    assert_eq!(audit.direction, CanonicalDirection::Outgoing);

    let untouched = configured.get_call("CA001").await.unwrap();
    assert!(untouched.extensions.corrections.is_empty());

    let rerun = configured.backfill(&BackfillConfig::default()).await.unwrap();
    assert_eq!(rerun.fixed, 0);
    assert_eq!(rerun.unchanged, 100);
}

#[tokio::test]
async fn backfill_stays_inside_its_tenant() {
    let db = memory_db().await;
    let their_line = "+15559990000";
    let theirs = CallLedger::new(Arc::clone(&db), "other", BusinessLineRoster::new([their_line]));
    let mut outgoing = event("CB1", "completed");
    outgoing.raw_direction = "outbound-api".into();
    outgoing.from = their_line.into();
    outgoing.to = CALLER.into();
    theirs.ingest(&outgoing).await.unwrap();

    let ours = CallLedger::new(Arc::clone(&db), TENANT, BusinessLineRoster::new([CALLER]));
    let report = ours.backfill(&BackfillConfig::default()).await.unwrap();
    assert_eq!(report.total, 0);

    let record = theirs.get_call("CB1").await.unwrap();
    assert_eq!(record.canonical_direction, CanonicalDirection::Outgoing);
    assert!(record.extensions.corrections.is_empty());
}

#[tokio::test]
async fn event_without_leg_id_is_rejected() {
    let db = memory_db().await;
    let ledger = CallLedger::new(Arc::clone(&db), TENANT, roster());

    let raw: RawCallEvent = serde_json::from_str(
        r#"{"raw_direction":"inbound","raw_status":"completed","from":"+15551234567","to":"+15550001000"}"#,
    )
    .unwrap();
    let err = ledger.ingest(&raw).await.unwrap_err();

    assert!(matches!(
        err,
        Error::Validation(ValidationError::MissingField("leg_id"))
    ));
    assert_eq!(err.exit_code(), 2);
    assert!(db.list_call_records(TENANT, None, 10).await.unwrap().is_empty());
    assert!(db.find_conversation(TENANT, uuid::Uuid::nil()).await.unwrap().is_none());
}

#[tokio::test]
async fn frozen_records_never_thaw() {
    let db = memory_db().await;
    let ledger = CallLedger::new(Arc::clone(&db), TENANT, roster());
    let finalized = fixed_time();

    let mut raw = event("CA300", "completed");
    raw.finalized_at = Some(finalized);
    ledger.ingest(&raw).await.unwrap();
    ledger
        .freeze_tick_at(&FreezeConfig::default(), finalized + Duration::days(1))
        .await
        .unwrap();

    // Late events, backfill and merge all leave the state alone.
    let mut late = event("CA300", "no-answer");
    late.finalized_at = Some(finalized + Duration::hours(1));
    ledger.ingest(&late).await.unwrap();
    ledger.ingest(&event("CA300", "ringing")).await.unwrap();
    ledger.backfill(&BackfillConfig::default()).await.unwrap();
    ledger.merge_duplicates().await.unwrap();

    let changed = db
        .batch_set_sync_state(&["CA300".to_string()], SyncState::Active)
        .await
        .unwrap();
    assert_eq!(changed, 0);

    let record = ledger.get_call("CA300").await.unwrap();
    assert_eq!(record.sync_state, SyncState::Frozen);
    assert_eq!(record.finalized_at, Some(finalized));
}

#[tokio::test]
async fn file_backed_ledger_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("ledger.db");

    {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
        let ledger = CallLedger::new(db, TENANT, roster());
        ledger.ingest(&event("CA400", "completed")).await.unwrap();
    }

    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
    let ledger = CallLedger::new(Arc::clone(&db), TENANT, roster());
    let record = ledger.get_call("CA400").await.unwrap();
    assert_eq!(record.canonical_direction, CanonicalDirection::Inbound);
    assert!(record.conversation_id.is_some());

    // Reopening re-runs migrations as a no-op and keeps the data.
    let again = ledger.ingest(&event("CA400", "completed")).await.unwrap();
    assert_eq!(again, record);
}

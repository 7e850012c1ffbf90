//! Call data model: raw provider events, stored call records, conversations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::lifecycle::SyncState;
use super::normalizer::{self, BusinessLineRoster, NormalizationWarning, RawLeg};
use crate::error::ValidationError;

// ── Raw event ───────────────────────────────────────────────────────

/// One per-leg notification as delivered by the telephony provider.
///
/// Delivery is at-least-once and unordered. Fields the ledger does not
/// recognize are kept in `extra` and end up in the record's open
/// attribute map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawCallEvent {
    /// Provider call id of this leg. Required.
    #[serde(default)]
    pub leg_id: String,
    /// Provider call id of the parent leg, if this leg was spawned by one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub raw_direction: String,
    #[serde(default)]
    pub raw_status: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    /// Call duration in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalized_at: Option<DateTime<Utc>>,
    /// Numbers owned by the business, as known to the sender of this event.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub business_line_roster: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RawCallEvent {
    /// Parent id with blank values treated as absent.
    pub fn parent(&self) -> Option<&str> {
        self.parent_id
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }

    /// Borrow the fields the normalizer looks at.
    pub fn leg(&self) -> RawLeg<'_> {
        RawLeg {
            leg_id: self.leg_id.trim(),
            parent_id: self.parent(),
            raw_direction: &self.raw_direction,
            raw_status: &self.raw_status,
            from: &self.from,
            to: &self.to,
        }
    }

    /// Reject malformed events before anything is persisted.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let leg = self.leg();
        leg.validate()?;
        if let Some(duration) = self.duration.filter(|d| *d < 0) {
            return Err(ValidationError::NegativeDuration(duration));
        }
        Ok(())
    }

    /// The event's own roster, or `fallback` when the event carries none.
    pub fn roster_or(&self, fallback: &BusinessLineRoster) -> BusinessLineRoster {
        if self.business_line_roster.is_empty() {
            fallback.clone()
        } else {
            BusinessLineRoster::new(&self.business_line_roster)
        }
    }
}

// ── Canonical classification ────────────────────────────────────────

/// Business-perspective call direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CanonicalDirection {
    /// A customer called us.
    Inbound,
    /// We dialed out.
    Outgoing,
    /// Both ends are business lines.
    Internal,
}

impl CanonicalDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outgoing => "outgoing",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for CanonicalDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CanonicalDirection {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(Self::Inbound),
            "outgoing" => Ok(Self::Outgoing),
            "internal" => Ok(Self::Internal),
            _ => Err(format!("Unknown call direction: {}", s)),
        }
    }
}

/// Normalized call outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CanonicalStatus {
    Completed,
    Busy,
    Failed,
    NoAnswer,
    InProgress,
}

impl CanonicalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Busy => "busy",
            Self::Failed => "failed",
            Self::NoAnswer => "no-answer",
            Self::InProgress => "in-progress",
        }
    }
}

impl std::fmt::Display for CanonicalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CanonicalStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "busy" => Ok(Self::Busy),
            "failed" => Ok(Self::Failed),
            "no-answer" => Ok(Self::NoAnswer),
            "in-progress" => Ok(Self::InProgress),
            _ => Err(format!("Unknown call status: {}", s)),
        }
    }
}

/// Canonical classification of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Canonical {
    pub direction: CanonicalDirection,
    pub status: CanonicalStatus,
}

// ── Extensions ──────────────────────────────────────────────────────

/// Prior canonical values recorded when a backfill corrected a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectionAudit {
    pub previous_direction: CanonicalDirection,
    pub previous_status: CanonicalStatus,
    pub direction: CanonicalDirection,
    pub status: CanonicalStatus,
    pub corrected_at: DateTime<Utc>,
}

/// Typed, ledger-derived metadata. Never mixed with raw upstream fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallExtensions {
    /// Warnings produced by the latest normalization of this record.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<NormalizationWarning>,
    /// Backfill corrections, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub corrections: Vec<CorrectionAudit>,
}

// ── Call record ─────────────────────────────────────────────────────

/// Stored state of one provider call leg.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub provider_call_id: String,
    pub tenant_id: String,
    pub parent_call_id: Option<String>,
    pub from: String,
    pub to: String,
    pub raw_direction: String,
    pub raw_status: String,
    pub canonical_direction: CanonicalDirection,
    pub canonical_status: CanonicalStatus,
    pub duration: Option<i64>,
    /// Set once; later events never move it.
    pub finalized_at: Option<DateTime<Utc>>,
    pub sync_state: SyncState,
    /// Conversation holding this record, once attached.
    pub conversation_id: Option<Uuid>,
    pub extensions: CallExtensions,
    /// Unrecognized upstream metadata, merged key by key.
    pub attributes: serde_json::Map<String, serde_json::Value>,
    pub first_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What an upsert did to the stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Duplicate delivery; stored state untouched.
    Unchanged,
    /// A mutating event reached a frozen record. Raw fields were recorded,
    /// the record stays frozen.
    FrozenAnomaly,
}

/// Result of applying one event to the store.
#[derive(Debug, Clone)]
pub struct UpsertResult {
    pub record: CallRecord,
    pub outcome: UpsertOutcome,
}

impl CallRecord {
    /// Borrow the raw fields the normalizer derives canonical values from.
    pub fn raw_leg(&self) -> RawLeg<'_> {
        RawLeg {
            leg_id: &self.provider_call_id,
            parent_id: self.parent_call_id.as_deref(),
            raw_direction: &self.raw_direction,
            raw_status: &self.raw_status,
            from: &self.from,
            to: &self.to,
        }
    }

    pub fn canonical(&self) -> Canonical {
        Canonical {
            direction: self.canonical_direction,
            status: self.canonical_status,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized_at.is_some()
    }

    /// Phone number of the party on the other side of the business.
    pub fn counterparty(&self) -> &str {
        match self.canonical_direction {
            CanonicalDirection::Inbound => &self.from,
            CanonicalDirection::Outgoing | CanonicalDirection::Internal => &self.to,
        }
    }

    /// Merge an event into the stored record (or start a new one).
    ///
    /// Per-field last-write-wins, except:
    /// - `finalized_at` is set once;
    /// - absent optional fields (`parent_id`, `duration`) keep the stored value;
    /// - a finalized record keeps its status when a late non-final event arrives.
    ///
    /// Canonical fields are recomputed from the merged raw fields, so the
    /// result is the same no matter how often one event is applied.
    pub fn apply_event(
        existing: Option<&CallRecord>,
        tenant_id: &str,
        event: &RawCallEvent,
        roster: &BusinessLineRoster,
        now: DateTime<Utc>,
    ) -> Result<(CallRecord, UpsertOutcome), ValidationError> {
        event.validate()?;

        let finalized_at = existing
            .and_then(|r| r.finalized_at)
            .or(event.finalized_at.map(truncate_to_millis));
        let keep_status = existing.is_some_and(|r| r.is_finalized()) && event.finalized_at.is_none();

        let raw_status = match existing {
            Some(r) if keep_status => r.raw_status.clone(),
            _ => event.raw_status.clone(),
        };
        let raw_direction = match existing {
            Some(r) if event.raw_direction.trim().is_empty() => r.raw_direction.clone(),
            _ => event.raw_direction.clone(),
        };
        let parent_call_id = event
            .parent()
            .map(str::to_string)
            .or_else(|| existing.and_then(|r| r.parent_call_id.clone()));

        let mut attributes = existing.map(|r| r.attributes.clone()).unwrap_or_default();
        for (key, value) in &event.extra {
            attributes.insert(key.clone(), value.clone());
        }

        let leg = RawLeg {
            leg_id: event.leg_id.trim(),
            parent_id: parent_call_id.as_deref(),
            raw_direction: &raw_direction,
            raw_status: &raw_status,
            from: &event.from,
            to: &event.to,
        };
        let normalized = normalizer::normalize(&leg, roster)?;

        let mut merged = CallRecord {
            provider_call_id: event.leg_id.trim().to_string(),
            tenant_id: existing
                .map(|r| r.tenant_id.clone())
                .unwrap_or_else(|| tenant_id.to_string()),
            parent_call_id,
            from: event.from.clone(),
            to: event.to.clone(),
            raw_direction,
            raw_status,
            canonical_direction: normalized.direction,
            canonical_status: normalized.status,
            duration: event.duration.or(existing.and_then(|r| r.duration)),
            finalized_at,
            sync_state: existing.map(|r| r.sync_state).unwrap_or_default(),
            conversation_id: existing.and_then(|r| r.conversation_id),
            extensions: CallExtensions {
                warnings: normalized.warnings,
                corrections: existing
                    .map(|r| r.extensions.corrections.clone())
                    .unwrap_or_default(),
            },
            attributes,
            first_seen_at: existing.map(|r| r.first_seen_at).unwrap_or(now),
            updated_at: existing.map(|r| r.updated_at).unwrap_or(now),
        };

        let outcome = match existing {
            None => UpsertOutcome::Inserted,
            Some(prev) if *prev == merged => UpsertOutcome::Unchanged,
            Some(prev) => {
                merged.updated_at = now;
                if prev.sync_state == SyncState::Frozen {
                    UpsertOutcome::FrozenAnomaly
                } else {
                    UpsertOutcome::Updated
                }
            }
        };
        Ok((merged, outcome))
    }
}

/// Stored timestamps carry millisecond precision.
pub fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts.timestamp_millis()).unwrap_or(ts)
}

// ── Conversations and contacts ──────────────────────────────────────

/// Timeline of call records for one contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub tenant_id: String,
    pub contact_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub message_count: i64,
    pub last_activity: DateTime<Utc>,
}

/// One entry in a conversation's timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub provider_call_id: String,
    pub occurred_at: DateTime<Utc>,
}

/// Reference to a CRM contact. The contact itself lives outside the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactRef {
    pub id: Uuid,
    pub tenant_id: String,
    pub phone_digits: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn roster() -> BusinessLineRoster {
        BusinessLineRoster::new(["+1 (555) 000-1000"])
    }

    fn event(status: &str) -> RawCallEvent {
        RawCallEvent {
            leg_id: "CA1".into(),
            raw_direction: "inbound".into(),
            raw_status: status.into(),
            from: "+15551234567".into(),
            to: "+15550001000".into(),
            ..Default::default()
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn first_event_inserts() {
        let (record, outcome) =
            CallRecord::apply_event(None, "t1", &event("ringing"), &roster(), now()).unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted);
        assert_eq!(record.canonical_direction, CanonicalDirection::Inbound);
        assert_eq!(record.canonical_status, CanonicalStatus::InProgress);
        assert_eq!(record.sync_state, SyncState::Active);
        assert_eq!(record.tenant_id, "t1");
    }

    #[test]
    fn duplicate_event_is_unchanged() {
        let ev = event("completed");
        let (first, _) = CallRecord::apply_event(None, "t1", &ev, &roster(), now()).unwrap();
        let later = now() + chrono::Duration::minutes(5);
        let (second, outcome) =
            CallRecord::apply_event(Some(&first), "t1", &ev, &roster(), later).unwrap();
        assert_eq!(outcome, UpsertOutcome::Unchanged);
        assert_eq!(first, second);
    }

    #[test]
    fn finalized_at_is_set_once() {
        let mut done = event("completed");
        done.finalized_at = Some(now());
        let (first, _) = CallRecord::apply_event(None, "t1", &done, &roster(), now()).unwrap();

        let mut again = done.clone();
        again.finalized_at = Some(now() + chrono::Duration::hours(1));
        let (second, _) =
            CallRecord::apply_event(Some(&first), "t1", &again, &roster(), now()).unwrap();
        assert_eq!(second.finalized_at, Some(now()));
    }

    #[test]
    fn late_non_final_event_keeps_final_status() {
        let mut done = event("completed");
        done.finalized_at = Some(now());
        let (first, _) = CallRecord::apply_event(None, "t1", &done, &roster(), now()).unwrap();

        let (second, outcome) =
            CallRecord::apply_event(Some(&first), "t1", &event("ringing"), &roster(), now())
                .unwrap();
        assert_eq!(outcome, UpsertOutcome::Unchanged);
        assert_eq!(second.canonical_status, CanonicalStatus::Completed);
    }

    #[test]
    fn missing_parent_keeps_stored_parent() {
        let mut child = event("ringing");
        child.parent_id = Some("CA0".into());
        let (first, _) = CallRecord::apply_event(None, "t1", &child, &roster(), now()).unwrap();
        let (second, _) =
            CallRecord::apply_event(Some(&first), "t1", &event("completed"), &roster(), now())
                .unwrap();
        assert_eq!(second.parent_call_id.as_deref(), Some("CA0"));
    }

    #[test]
    fn unknown_fields_land_in_attributes() {
        let json = r#"{"leg_id":"CA9","raw_direction":"inbound","raw_status":"completed",
            "from":"+15551234567","to":"+15550001000","AnsweredBy":"human"}"#;
        let ev: RawCallEvent = serde_json::from_str(json).unwrap();
        let (record, _) = CallRecord::apply_event(None, "t1", &ev, &roster(), now()).unwrap();
        assert_eq!(record.attributes["AnsweredBy"], "human");
        assert!(record.extensions.warnings.is_empty());
    }

    #[test]
    fn event_for_frozen_record_is_flagged() {
        let (mut first, _) =
            CallRecord::apply_event(None, "t1", &event("in-progress"), &roster(), now()).unwrap();
        first.sync_state = SyncState::Frozen;
        let (second, outcome) =
            CallRecord::apply_event(Some(&first), "t1", &event("completed"), &roster(), now())
                .unwrap();
        assert_eq!(outcome, UpsertOutcome::FrozenAnomaly);
        assert_eq!(second.sync_state, SyncState::Frozen);
    }

    #[test]
    fn counterparty_follows_direction() {
        let (record, _) =
            CallRecord::apply_event(None, "t1", &event("completed"), &roster(), now()).unwrap();
        assert_eq!(record.counterparty(), "+15551234567");
    }

    #[test]
    fn status_and_direction_parse_back() {
        for status in [
            CanonicalStatus::Completed,
            CanonicalStatus::Busy,
            CanonicalStatus::Failed,
            CanonicalStatus::NoAnswer,
            CanonicalStatus::InProgress,
        ] {
            assert_eq!(status.as_str().parse::<CanonicalStatus>().unwrap(), status);
        }
        assert!("sideways".parse::<CanonicalDirection>().is_err());
    }
}

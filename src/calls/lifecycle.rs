//! Call record sync-state machine.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::model::CallRecord;

/// Whether a record is still part of ongoing reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Still reconciled against the provider.
    #[default]
    Active,
    /// Settled and excluded from reconciliation polling.
    Frozen,
}

impl SyncState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: SyncState) -> bool {
        use SyncState::*;

        matches!((self, target), (Active, Frozen))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Frozen)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Frozen => "frozen",
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SyncState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "frozen" => Ok(Self::Frozen),
            _ => Err(format!("Unknown sync state: {}", s)),
        }
    }
}

/// Finalization time before which a record is old enough to freeze.
///
/// A cooldown reaching past the earliest representable time yields
/// `MIN_UTC`, so nothing qualifies.
pub fn freeze_cutoff(cooldown_hours: u32, now: DateTime<Utc>) -> DateTime<Utc> {
    Duration::try_hours(i64::from(cooldown_hours))
        .and_then(|cooldown| now.checked_sub_signed(cooldown))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Freeze guard on the fields that decide it.
pub fn is_freeze_eligible(
    state: SyncState,
    finalized_at: Option<DateTime<Utc>>,
    cooldown_hours: u32,
    now: DateTime<Utc>,
) -> bool {
    let Some(finalized_at) = finalized_at else {
        return false;
    };
    state.can_transition_to(SyncState::Frozen) && finalized_at < freeze_cutoff(cooldown_hours, now)
}

/// Freeze guard: finalized, strictly older than the cooldown, and still active.
pub fn should_freeze(record: &CallRecord, cooldown_hours: u32, now: DateTime<Utc>) -> bool {
    is_freeze_eligible(record.sync_state, record.finalized_at, cooldown_hours, now)
}

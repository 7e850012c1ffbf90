//! Event normalizer: maps leg-local provider fields onto canonical
//! direction and status.
//!
//! Providers report direction and status from the perspective of a single
//! leg. A child leg spawned by a forwarded inbound call, for example, is
//! reported as "outbound-dial" even though the customer called us. The
//! normalizer resolves that by checking which endpoint is one of our own
//! business lines.
//!
//! Everything here is pure: the same leg and roster always produce the same
//! result, so records can be re-normalized at any time.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::model::{CanonicalDirection, CanonicalStatus};
use crate::error::ValidationError;

/// Set of phone numbers owned by the business, stored as canonical digits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusinessLineRoster {
    lines: BTreeSet<String>,
}

impl BusinessLineRoster {
    pub fn new<I, S>(numbers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let lines = numbers
            .into_iter()
            .map(|n| canonical_digits(n.as_ref()))
            .filter(|d| !d.is_empty())
            .collect();
        Self { lines }
    }

    /// Parse a comma-separated list, as used in configuration.
    pub fn parse_list(list: &str) -> Self {
        Self::new(list.split(',').map(str::trim).filter(|s| !s.is_empty()))
    }

    pub fn owns(&self, number: &str) -> bool {
        let digits = canonical_digits(number);
        !digits.is_empty() && self.lines.contains(&digits)
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }
}

/// Reduce a phone number to comparable digits.
///
/// Formatting characters are dropped and a leading North American country
/// code is removed, so `+1 (555) 000-1000` and `5550001000` compare equal.
pub fn canonical_digits(number: &str) -> String {
    let digits: String = number.chars().filter(char::is_ascii_digit).collect();
    if digits.len() == 11 && digits.starts_with('1') {
        digits[1..].to_string()
    } else {
        digits
    }
}

/// Raw fields of one leg, borrowed from an event or a stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawLeg<'a> {
    pub leg_id: &'a str,
    pub parent_id: Option<&'a str>,
    pub raw_direction: &'a str,
    pub raw_status: &'a str,
    pub from: &'a str,
    pub to: &'a str,
}

impl RawLeg<'_> {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.leg_id.trim().is_empty() {
            return Err(ValidationError::MissingField("leg_id"));
        }
        if self.from.trim().is_empty() {
            return Err(ValidationError::MissingField("from"));
        }
        if self.to.trim().is_empty() {
            return Err(ValidationError::MissingField("to"));
        }
        if self.parent_id.map(str::trim) == Some(self.leg_id.trim()) {
            return Err(ValidationError::SelfParent(self.leg_id.to_string()));
        }
        Ok(())
    }
}

/// Something the normalizer had to guess or override.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NormalizationWarning {
    /// Raw status was not recognized and was folded into `failed`.
    UnknownStatus { raw: String },
    /// Raw direction was not recognized; direction came from the roster.
    UnknownDirection { raw: String },
    /// Raw direction contradicted the roster and was overridden.
    DirectionOverridden {
        raw: String,
        derived: CanonicalDirection,
    },
}

/// Output of [`normalize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub direction: CanonicalDirection,
    pub status: CanonicalStatus,
    pub warnings: Vec<NormalizationWarning>,
}

/// Derive canonical direction and status for one leg.
pub fn normalize(
    leg: &RawLeg<'_>,
    roster: &BusinessLineRoster,
) -> Result<Normalized, ValidationError> {
    leg.validate()?;

    let mut warnings = Vec::new();
    let direction = derive_direction(leg, roster, &mut warnings);
    let status = match parse_status(leg.raw_status) {
        Some(status) => status,
        None => {
            warnings.push(NormalizationWarning::UnknownStatus {
                raw: leg.raw_status.to_string(),
            });
            CanonicalStatus::Failed
        }
    };

    Ok(Normalized {
        direction,
        status,
        warnings,
    })
}

/// Map a provider direction string. `None` for anything unrecognized.
pub fn parse_direction(raw: &str) -> Option<CanonicalDirection> {
    let raw = raw.trim().to_ascii_lowercase();
    match raw.as_str() {
        "inbound" | "incoming" => Some(CanonicalDirection::Inbound),
        "outgoing" => Some(CanonicalDirection::Outgoing),
        "internal" => Some(CanonicalDirection::Internal),
        other if other.starts_with("outbound") => Some(CanonicalDirection::Outgoing),
        _ => None,
    }
}

/// Map a provider status string. `None` for anything unrecognized.
pub fn parse_status(raw: &str) -> Option<CanonicalStatus> {
    let raw = raw.trim().to_ascii_lowercase();
    match raw.as_str() {
        "completed" => Some(CanonicalStatus::Completed),
        "busy" => Some(CanonicalStatus::Busy),
        "failed" => Some(CanonicalStatus::Failed),
        "no-answer" | "no_answer" | "noanswer" | "canceled" | "cancelled" => {
            Some(CanonicalStatus::NoAnswer)
        }
        "in-progress" | "in_progress" | "ringing" | "queued" | "initiated" | "answered" => {
            Some(CanonicalStatus::InProgress)
        }
        _ => None,
    }
}

fn derive_direction(
    leg: &RawLeg<'_>,
    roster: &BusinessLineRoster,
    warnings: &mut Vec<NormalizationWarning>,
) -> CanonicalDirection {
    let raw = parse_direction(leg.raw_direction);
    let from_owned = roster.owns(leg.from);
    let to_owned = roster.owns(leg.to);

    if leg.parent_id.is_some() {
        // Child legs: the owned endpoint decides, raw direction is leg-local noise.
        if to_owned {
            return CanonicalDirection::Outgoing;
        }
        if from_owned {
            return CanonicalDirection::Inbound;
        }
        return raw_or_default(leg, raw, warnings);
    }

    if roster.is_empty() {
        return raw_or_default(leg, raw, warnings);
    }

    let derived = match (from_owned, to_owned) {
        (true, true) => Some(CanonicalDirection::Internal),
        (true, false) => Some(CanonicalDirection::Outgoing),
        (false, true) => Some(CanonicalDirection::Inbound),
        (false, false) => None,
    };

    match (raw, derived) {
        (Some(raw_dir), Some(derived)) if raw_dir != derived => {
            warnings.push(NormalizationWarning::DirectionOverridden {
                raw: leg.raw_direction.to_string(),
                derived,
            });
            derived
        }
        (Some(raw_dir), _) => raw_dir,
        (None, Some(derived)) => {
            warnings.push(NormalizationWarning::UnknownDirection {
                raw: leg.raw_direction.to_string(),
            });
            derived
        }
        (None, None) => raw_or_default(leg, None, warnings),
    }
}

fn raw_or_default(
    leg: &RawLeg<'_>,
    raw: Option<CanonicalDirection>,
    warnings: &mut Vec<NormalizationWarning>,
) -> CanonicalDirection {
    raw.unwrap_or_else(|| {
        warnings.push(NormalizationWarning::UnknownDirection {
            raw: leg.raw_direction.to_string(),
        });
        CanonicalDirection::Inbound
    })
}

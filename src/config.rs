//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::calls::normalizer::BusinessLineRoster;
use crate::error::ConfigError;

/// Freeze tick parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreezeConfig {
    /// Hours a record must stay finalized before it may be frozen.
    pub cooldown_hours: u32,
    /// Maximum records frozen per tick.
    pub batch_size: usize,
}

impl FreezeConfig {
    pub fn new(cooldown_hours: u32, batch_size: usize) -> Result<Self, ConfigError> {
        if batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "batch_size".into(),
                message: "must be greater than zero".into(),
            });
        }
        Ok(Self {
            cooldown_hours,
            batch_size,
        })
    }
}

impl Default for FreezeConfig {
    fn default() -> Self {
        Self {
            cooldown_hours: 6,
            batch_size: 100,
        }
    }
}

/// Backfill pass parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillConfig {
    /// Records read per page.
    pub batch_size: usize,
}

impl BackfillConfig {
    pub fn new(batch_size: usize) -> Result<Self, ConfigError> {
        if batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "batch_size".into(),
                message: "must be greater than zero".into(),
            });
        }
        Ok(Self { batch_size })
    }
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self { batch_size: 500 }
    }
}

/// Everything the binary needs to run.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub db_path: PathBuf,
    pub tenant_id: String,
    /// Owned numbers, used when an event carries no roster of its own.
    pub business_lines: BusinessLineRoster,
    pub freeze: FreezeConfig,
    /// How often the `run` loop fires a freeze tick.
    pub freeze_interval: Duration,
    pub backfill: BackfillConfig,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/call-ledger.db"),
            tenant_id: "default".to_string(),
            business_lines: BusinessLineRoster::default(),
            freeze: FreezeConfig::default(),
            freeze_interval: Duration::from_secs(900), // 15 minutes
            backfill: BackfillConfig::default(),
        }
    }
}

impl LedgerConfig {
    /// Load from `CALL_LEDGER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key/value source; missing keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let db_path = lookup("CALL_LEDGER_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);
        let tenant_id = lookup("CALL_LEDGER_TENANT")
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or(defaults.tenant_id);
        let business_lines = lookup("CALL_LEDGER_BUSINESS_LINES")
            .map(|list| BusinessLineRoster::parse_list(&list))
            .unwrap_or_default();

        let cooldown_hours = parse_var(
            &lookup,
            "CALL_LEDGER_COOLDOWN_HOURS",
            defaults.freeze.cooldown_hours,
        )?;
        let batch_size = parse_var(&lookup, "CALL_LEDGER_BATCH_SIZE", defaults.freeze.batch_size)?;
        let freeze = FreezeConfig::new(cooldown_hours, batch_size).map_err(|_| {
            ConfigError::InvalidValue {
                key: "CALL_LEDGER_BATCH_SIZE".into(),
                message: "must be greater than zero".into(),
            }
        })?;

        let interval_secs = parse_var(
            &lookup,
            "CALL_LEDGER_FREEZE_INTERVAL_SECS",
            defaults.freeze_interval.as_secs(),
        )?;
        if interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CALL_LEDGER_FREEZE_INTERVAL_SECS".into(),
                message: "must be greater than zero".into(),
            });
        }

        let backfill_batch = parse_var(
            &lookup,
            "CALL_LEDGER_BACKFILL_BATCH_SIZE",
            defaults.backfill.batch_size,
        )?;
        let backfill =
            BackfillConfig::new(backfill_batch).map_err(|_| ConfigError::InvalidValue {
                key: "CALL_LEDGER_BACKFILL_BATCH_SIZE".into(),
                message: "must be greater than zero".into(),
            })?;

        Ok(Self {
            db_path,
            tenant_id,
            business_lines,
            freeze,
            freeze_interval: Duration::from_secs(interval_secs),
            backfill,
        })
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("cannot parse {raw:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<LedgerConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        LedgerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.freeze, FreezeConfig::default());
        assert_eq!(config.freeze.cooldown_hours, 6);
        assert_eq!(config.freeze.batch_size, 100);
        assert_eq!(config.tenant_id, "default");
        assert!(config.business_lines.is_empty());
    }

    #[test]
    fn overrides() {
        let config = load(&[
            ("CALL_LEDGER_COOLDOWN_HOURS", "0"),
            ("CALL_LEDGER_BATCH_SIZE", "25"),
            ("CALL_LEDGER_TENANT", "acme"),
            ("CALL_LEDGER_BUSINESS_LINES", "+15550001000, +15550002000"),
        ])
        .unwrap();
        assert_eq!(config.freeze.cooldown_hours, 0);
        assert_eq!(config.freeze.batch_size, 25);
        assert_eq!(config.tenant_id, "acme");
        assert_eq!(config.business_lines.len(), 2);
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(load(&[("CALL_LEDGER_BATCH_SIZE", "0")]).is_err());
        assert!(load(&[("CALL_LEDGER_COOLDOWN_HOURS", "-1")]).is_err());
        assert!(load(&[("CALL_LEDGER_FREEZE_INTERVAL_SECS", "soon")]).is_err());
        assert!(FreezeConfig::new(6, 0).is_err());
        assert!(BackfillConfig::new(0).is_err());
    }
}

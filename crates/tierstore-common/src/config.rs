//! Configuration types for TierStore
//!
//! This module defines configuration structures used across components.
//! The daemon loads an `EngineConfig` from a JSON file at startup; tiers
//! are bootstrapped once from it and never deleted at runtime.

use crate::error::Result;
use crate::types::{TierId, TierKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root configuration for the lifecycle engine
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory for engine state (config documents, staging areas)
    pub data_dir: PathBuf,
    /// Storage tiers to register at startup
    pub tiers: Vec<TierConfig>,
    /// Periodic scheduler intervals
    pub scheduler: SchedulerConfig,
    /// Monitoring thresholds
    pub monitor: MonitorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/tierstore"),
            tiers: Vec::new(),
            scheduler: SchedulerConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Static configuration for a single storage tier.
///
/// Current usage is tracked by the tier registry, not stored here; the
/// registry enforces `used <= capacity_bytes` after every committed
/// mutation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TierConfig {
    /// Tier identifier (hot/warm/cold/archive or a site-specific name)
    pub id: TierId,
    /// Performance/cost class
    pub kind: TierKind,
    /// Root directory holding this tier's objects
    pub root: PathBuf,
    /// Storage medium description (e.g. "ssd", "hdd", "object", "tape")
    pub medium: String,
    /// Total capacity in bytes
    pub capacity_bytes: u64,
    /// Cost per GB-month, used by cost-optimized tiering
    pub cost_per_gb_month: f64,
    /// Typical access latency in milliseconds
    pub access_latency_ms: u64,
    /// Default retention in days for objects landing in this tier
    pub default_retention_days: u32,
    /// Whether objects in this tier should be stored compressed
    pub compression: bool,
    /// Whether objects in this tier should be stored encrypted
    pub encryption: bool,
}

impl TierConfig {
    /// Convenience constructor with sensible defaults for tests and
    /// bootstrap code
    #[must_use]
    pub fn new(id: TierId, kind: TierKind, root: PathBuf, capacity_bytes: u64) -> Self {
        Self {
            id,
            kind,
            root,
            medium: match kind {
                TierKind::Hot => "ssd".to_string(),
                TierKind::Warm => "hdd".to_string(),
                TierKind::Cold | TierKind::Archive => "object".to_string(),
            },
            capacity_bytes,
            cost_per_gb_month: match kind {
                TierKind::Hot => 0.10,
                TierKind::Warm => 0.05,
                TierKind::Cold => 0.01,
                TierKind::Archive => 0.004,
            },
            access_latency_ms: match kind {
                TierKind::Hot => 1,
                TierKind::Warm => 10,
                TierKind::Cold => 100,
                TierKind::Archive => 3_600_000,
            },
            default_retention_days: 90,
            compression: matches!(kind, TierKind::Cold | TierKind::Archive),
            encryption: false,
        }
    }
}

/// Intervals for the per-subsystem periodic schedulers
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub retention_interval_secs: u64,
    pub tiering_interval_secs: u64,
    pub monitor_interval_secs: u64,
    pub backup_interval_secs: u64,
    /// Fraction of the interval applied as random jitter (0.0 - 1.0)
    pub jitter_fraction: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            retention_interval_secs: 3_600,
            tiering_interval_secs: 1_800,
            monitor_interval_secs: 60,
            backup_interval_secs: 21_600,
            jitter_fraction: 0.1,
        }
    }
}

/// Thresholds and windows for the storage monitor
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Utilization percentage that raises a warning alert
    pub warning_utilization_pct: f64,
    /// Utilization percentage that raises a critical alert
    pub critical_utilization_pct: f64,
    /// Error rate (errors per operation) warning threshold
    pub warning_error_rate: f64,
    /// Error rate critical threshold
    pub critical_error_rate: f64,
    /// Window during which repeated breaches of the same metric+tier are
    /// deduplicated into one unresolved alert
    pub alert_cooldown_secs: u64,
    /// Usage history samples retained per tier for forecasting
    pub history_samples: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            warning_utilization_pct: 80.0,
            critical_utilization_pct: 95.0,
            warning_error_rate: 0.01,
            critical_error_rate: 0.05,
            alert_cooldown_secs: 900,
            history_samples: 288,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_roundtrip() {
        let mut config = EngineConfig::default();
        config.tiers.push(TierConfig::new(
            TierId::new_unchecked("hot"),
            TierKind::Hot,
            PathBuf::from("/tmp/hot"),
            1 << 30,
        ));

        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.tiers.len(), 1);
        assert_eq!(parsed.tiers[0].id.as_str(), "hot");
        assert_eq!(parsed.tiers[0].kind, TierKind::Hot);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = EngineConfig::default();
        std::fs::write(&path, serde_json::to_vec(&config).unwrap()).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.scheduler.monitor_interval_secs, 60);
    }

    #[test]
    fn test_tier_defaults_by_kind() {
        let t = TierConfig::new(
            TierId::new_unchecked("archive"),
            TierKind::Archive,
            PathBuf::from("/tmp/archive"),
            1 << 40,
        );
        assert!(t.compression);
        assert!(t.cost_per_gb_month < 0.01);
    }
}

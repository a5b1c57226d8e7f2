//! Backup policy model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tierstore_common::{Error, PolicyId, Result, TierId};

/// How much of the source a backup run copies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    /// Copy everything
    Full,
    /// Copy objects changed since the policy's last backup of any type
    Incremental,
    /// Copy objects changed since the policy's last full backup
    Differential,
    /// Record a point-in-time manifest without bulk copy
    Snapshot,
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Incremental => write!(f, "incremental"),
            Self::Differential => write!(f, "differential"),
            Self::Snapshot => write!(f, "snapshot"),
        }
    }
}

/// Scheduled backup configuration for a set of source tiers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupPolicy {
    pub id: PolicyId,
    pub name: String,
    pub backup_type: BackupType,
    pub source_tiers: Vec<TierId>,
    /// Root directory receiving `backup_<timestamp>/` artifacts
    pub location: PathBuf,
    pub interval_secs: u64,
    /// Retention of the backup artifacts themselves, in days
    pub retention_days: u32,
    /// Pruning never drops below this many valid backups
    pub min_retained: u32,
    pub compression: bool,
    pub verification: bool,
    pub enabled: bool,
    /// Watermark of the last full backup (differential baseline)
    pub last_full: Option<DateTime<Utc>>,
    /// Watermark of the last backup of any type (incremental baseline)
    pub last_any: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BackupPolicy {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        backup_type: BackupType,
        source_tiers: Vec<TierId>,
        location: PathBuf,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: PolicyId::new(),
            name: name.into(),
            backup_type,
            source_tiers,
            location,
            interval_secs: 21_600,
            retention_days: 30,
            min_retained: 1,
            compression: true,
            verification: true,
            enabled: true,
            last_full: None,
            last_any: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Validate the policy; fails closed
    pub fn validate(&self) -> Result<()> {
        if self.source_tiers.is_empty() {
            return Err(Error::configuration(
                "backup policy requires at least one source tier",
            ));
        }
        if self.location.as_os_str().is_empty() {
            return Err(Error::configuration(
                "backup policy requires a backup location",
            ));
        }
        if self.retention_days == 0 {
            return Err(Error::configuration(
                "backup policy retention_days must be at least 1",
            ));
        }
        Ok(())
    }

    /// Whether this policy backs up the given tier
    #[must_use]
    pub fn covers(&self, tier: &TierId) -> bool {
        self.source_tiers.contains(tier)
    }

    /// Modification-time cutoff for object selection, per backup type
    #[must_use]
    pub fn selection_cutoff(&self) -> Option<DateTime<Utc>> {
        match self.backup_type {
            BackupType::Full | BackupType::Snapshot => None,
            BackupType::Incremental => self.last_any,
            BackupType::Differential => self.last_full,
        }
    }
}

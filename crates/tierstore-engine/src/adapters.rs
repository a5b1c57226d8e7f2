//! Cross-subsystem seams
//!
//! The tiering and integrity crates define traits for what they need
//! from the outside (durability evidence, an alert sink, a repair
//! source) without depending on the crates that provide it. These
//! adapters close the loop.

use std::path::Path;
use std::sync::Arc;
use tierstore_backup::{BackupCatalog, RecoveryEngine};
use tierstore_common::{Result, Severity, TierId};
use tierstore_integrity::RepairSource;
use tierstore_monitor::{AlertManager, MetricKind};
use tierstore_tiering::{AlertSink, DurabilityGuard};

/// Backup catalog as the migration durability guard: a source object
/// may only be deleted once a verified backup copy of it exists.
pub struct CatalogGuard(pub Arc<BackupCatalog>);

impl DurabilityGuard for CatalogGuard {
    fn covers(&self, tier: &TierId) -> bool {
        self.0.covers(tier)
    }

    fn has_verified_copy(&self, tier: &TierId, path: &Path, sha256_hex: &str) -> bool {
        self.0.has_verified_copy(tier, path, sha256_hex)
    }
}

/// Alert manager as the migration capacity alert sink
pub struct MonitorAlertSink(pub Arc<AlertManager>);

impl AlertSink for MonitorAlertSink {
    fn capacity_alert(&self, tier: &TierId, required: u64, available: u64) {
        self.0.raise(
            tier.clone(),
            MetricKind::UsedBytes,
            Severity::Warning,
            available as f64,
            required as f64,
            format!(
                "migration into tier {tier} needs {required} bytes but only {available} are free"
            ),
        );
    }
}

/// Recovery engine as the integrity repair source
pub struct RecoveryRepairSource(pub Arc<RecoveryEngine>);

impl RepairSource for RecoveryRepairSource {
    fn recover(
        &self,
        tier: &TierId,
        path: &Path,
        expected_sha256: Option<&str>,
    ) -> Result<Vec<u8>> {
        match expected_sha256 {
            Some(sha) => self.0.recover_object(tier, path, sha),
            None => self.0.recover_latest(tier, path),
        }
    }
}

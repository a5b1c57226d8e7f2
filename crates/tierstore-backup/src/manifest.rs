//! Backup manifests
//!
//! Every backup artifact is self-describing: its manifest lists the
//! contained objects with checksums and original tier/path, so
//! restoration never depends on the source tier still existing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tierstore_common::{BackupId, PolicyId, Result, TierId};

use crate::policy::BackupType;

pub const MANIFEST_FILE: &str = "manifest.json";

/// One object captured by a backup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Original path relative to the tier root
    pub path: PathBuf,
    /// Tier the object lived in when backed up
    pub tier: TierId,
    /// Original (uncompressed) size in bytes
    pub size: u64,
    pub crc32c: u32,
    /// SHA-256 of the original content, lowercase hex
    pub sha256: String,
    /// Path of the stored artifact relative to the backup directory;
    /// `None` for snapshot entries (manifest-only)
    pub stored_as: Option<PathBuf>,
    pub compressed: bool,
}

/// Self-describing manifest of one backup artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    pub backup_id: BackupId,
    pub policy_id: PolicyId,
    pub backup_type: BackupType,
    pub created_at: DateTime<Utc>,
    pub entries: Vec<ManifestEntry>,
    /// `None` when verification was not requested; `Some(false)` marks
    /// the backup unrestorable.
    pub verification_passed: Option<bool>,
}

impl BackupManifest {
    #[must_use]
    pub fn new(policy_id: PolicyId, backup_type: BackupType) -> Self {
        Self {
            backup_id: BackupId::new(),
            policy_id,
            backup_type,
            created_at: Utc::now(),
            entries: Vec::new(),
            verification_passed: None,
        }
    }

    /// Load a manifest from a backup directory
    pub fn load(backup_dir: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(backup_dir.join(MANIFEST_FILE))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Persist the manifest into a backup directory (atomic write)
    pub fn store(&self, backup_dir: &Path) -> Result<()> {
        tierstore_registry::config_store::write_atomic(
            &backup_dir.join(MANIFEST_FILE),
            &serde_json::to_vec_pretty(self)?,
        )
    }

    /// Whether this backup may be used as a restore source
    #[must_use]
    pub fn is_restorable(&self) -> bool {
        self.verification_passed != Some(false)
    }

    /// Find the entry for a given tier and original path
    #[must_use]
    pub fn find(&self, tier: &TierId, path: &Path) -> Option<&ManifestEntry> {
        self.entries
            .iter()
            .find(|e| &e.tier == tier && e.path == path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_store_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let mut manifest = BackupManifest::new(PolicyId::new(), BackupType::Full);
        manifest.entries.push(ManifestEntry {
            path: PathBuf::from("a.json"),
            tier: TierId::new_unchecked("hot"),
            size: 42,
            crc32c: 7,
            sha256: "ab".repeat(32),
            stored_as: Some(PathBuf::from("data/hot/a.json.zst")),
            compressed: true,
        });
        manifest.store(dir.path()).unwrap();

        let loaded = BackupManifest::load(dir.path()).unwrap();
        assert_eq!(loaded.backup_id, manifest.backup_id);
        assert_eq!(loaded.entries.len(), 1);
        assert!(loaded.is_restorable());
    }

    #[test]
    fn test_failed_verification_blocks_restore() {
        let mut manifest = BackupManifest::new(PolicyId::new(), BackupType::Full);
        manifest.verification_passed = Some(false);
        assert!(!manifest.is_restorable());
    }
}

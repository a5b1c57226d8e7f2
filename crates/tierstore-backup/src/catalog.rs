//! Backup catalog
//!
//! Read-side view over every backup location known through the policy
//! repository. Other subsystems consult the catalog to answer "does a
//! verified copy of this object exist anywhere" without knowing how
//! backups are laid out on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tierstore_common::{BackupId, PolicyId, Result, TierId};
use tierstore_registry::Repository;

use crate::engine::list_backup_dirs;
use crate::manifest::BackupManifest;
use crate::policy::BackupPolicy;

/// Lookup across all backup artifacts of all policies
pub struct BackupCatalog {
    policies: Arc<dyn Repository<PolicyId, BackupPolicy>>,
}

impl BackupCatalog {
    #[must_use]
    pub fn new(policies: Arc<dyn Repository<PolicyId, BackupPolicy>>) -> Self {
        Self { policies }
    }

    /// Whether any enabled policy backs up the given tier
    #[must_use]
    pub fn covers(&self, tier: &TierId) -> bool {
        self.policies
            .list()
            .iter()
            .any(|p| p.enabled && p.covers(tier))
    }

    /// Whether a verified backup holds this exact object content.
    /// The match is by SHA-256, so a stale copy of a since-modified
    /// object does not count. Unverified backups do not count either:
    /// as durability evidence a backup must have passed verification,
    /// not merely not have failed it.
    #[must_use]
    pub fn has_verified_copy(&self, tier: &TierId, path: &Path, sha256: &str) -> bool {
        for manifest in self.manifests() {
            if manifest.verification_passed != Some(true) {
                continue;
            }
            if let Some(entry) = manifest.find(tier, path) {
                if entry.sha256 == sha256 && entry.stored_as.is_some() {
                    return true;
                }
            }
        }
        false
    }

    /// Locate a backup by id across all policy locations
    pub fn find_backup(&self, backup_id: BackupId) -> Result<Option<(PathBuf, BackupManifest)>> {
        for policy in self.policies.list() {
            for (dir, manifest) in list_backup_dirs(&policy.location, None)? {
                if manifest.backup_id == backup_id {
                    return Ok(Some((dir, manifest)));
                }
            }
        }
        Ok(None)
    }

    /// All readable manifests, newest first
    #[must_use]
    pub fn manifests(&self) -> Vec<BackupManifest> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for policy in self.policies.list() {
            if !seen.insert(policy.location.clone()) {
                continue;
            }
            if let Ok(found) = list_backup_dirs(&policy.location, None) {
                out.extend(found.into_iter().map(|(_, m)| m));
            }
        }
        out.sort_by_key(|m| std::cmp::Reverse(m.created_at));
        out
    }
}

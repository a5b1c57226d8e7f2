//! Backup engine
//!
//! Snapshots source tiers under `location/backup_<timestamp>/` with a
//! self-describing manifest. When verification is enabled the written
//! artifacts are re-read and compared against source checksums; a
//! verification failure marks the result FAILED even though bytes were
//! written, because a backup is never implicitly trusted.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tierstore_common::checksum::{sha256_hex, Checksum};
use tierstore_common::{BackupId, Error, ObjectMeta, PolicyId, Result, TaskState, TierId};
use tierstore_registry::{ConfigEntry, ConfigManager, Repository, TierRegistry};
use tracing::{debug, info, warn};

use crate::manifest::{BackupManifest, ManifestEntry, MANIFEST_FILE};
use crate::policy::{BackupPolicy, BackupType};

const SUBSYSTEM: &str = "backup";
const COMPRESS_LEVEL: i32 = 3;

/// Outcome of one backup run
#[derive(Debug, Clone)]
pub struct BackupResult {
    pub backup_id: BackupId,
    pub policy_id: PolicyId,
    pub backup_type: BackupType,
    pub state: TaskState,
    pub directory: PathBuf,
    pub entries: u64,
    pub total_bytes: u64,
    pub stored_bytes: u64,
    /// `1 - stored/total` for copying backup types
    pub compression_ratio: f64,
    pub verification_passed: Option<bool>,
    pub errors: Vec<String>,
    pub duration: Duration,
}

/// Outcome of pruning a policy's backup artifacts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneResult {
    pub removed: usize,
    pub retained: usize,
}

/// Policy-driven backup of tier contents
pub struct BackupEngine {
    registry: Arc<TierRegistry>,
    policies: Arc<dyn Repository<PolicyId, BackupPolicy>>,
    results: Arc<dyn Repository<BackupId, BackupResult>>,
    config: Option<Arc<ConfigManager>>,
}

impl BackupEngine {
    #[must_use]
    pub fn new(
        registry: Arc<TierRegistry>,
        policies: Arc<dyn Repository<PolicyId, BackupPolicy>>,
        results: Arc<dyn Repository<BackupId, BackupResult>>,
        config: Option<Arc<ConfigManager>>,
    ) -> Self {
        Self {
            registry,
            policies,
            results,
            config,
        }
    }

    /// Create a backup policy. Validation fails closed.
    pub fn create_policy(&self, policy: BackupPolicy) -> Result<PolicyId> {
        policy.validate()?;
        for tier in &policy.source_tiers {
            if !self.registry.has_tier(tier) {
                return Err(Error::configuration(format!(
                    "unknown source tier in backup policy: {tier}"
                )));
            }
        }
        std::fs::create_dir_all(&policy.location)?;
        let id = policy.id;
        self.persist(&policy)?;
        self.policies.put(id, policy);
        debug!(policy = %id, "created backup policy");
        Ok(id)
    }

    /// Update a policy in place
    pub fn update_policy(
        &self,
        id: PolicyId,
        mutate: impl FnOnce(&mut BackupPolicy),
    ) -> Result<()> {
        let mut policy = self.get_policy(id)?;
        mutate(&mut policy);
        policy.id = id;
        policy.updated_at = Utc::now();
        policy.validate()?;
        self.persist(&policy)?;
        self.policies.put(id, policy);
        Ok(())
    }

    /// Enable or disable a policy
    pub fn set_enabled(&self, id: PolicyId, enabled: bool) -> Result<()> {
        self.update_policy(id, |p| p.enabled = enabled)
    }

    /// Delete a policy (artifacts already written stay on disk)
    pub fn delete_policy(&self, id: PolicyId) -> Result<()> {
        self.policies
            .remove(&id)
            .ok_or_else(|| Error::not_found("backup policy", id.to_string()))?;
        if let Some(config) = &self.config {
            config.remove(SUBSYSTEM, &id.to_string())?;
        }
        Ok(())
    }

    /// Fetch one policy
    pub fn get_policy(&self, id: PolicyId) -> Result<BackupPolicy> {
        self.policies
            .get(&id)
            .ok_or_else(|| Error::not_found("backup policy", id.to_string()))
    }

    /// Snapshot all policies
    #[must_use]
    pub fn list_policies(&self) -> Vec<BackupPolicy> {
        self.policies.list()
    }

    /// Fetch one stored backup result
    pub fn get_result(&self, id: BackupId) -> Result<BackupResult> {
        self.results
            .get(&id)
            .ok_or_else(|| Error::not_found("backup result", id.to_string()))
    }

    /// Restore policies persisted through the config manager (startup)
    pub fn load_persisted(&self) -> Result<usize> {
        let Some(config) = &self.config else {
            return Ok(0);
        };
        let mut loaded = 0;
        for entry in config.export(SUBSYSTEM).configurations {
            match serde_json::from_value::<BackupPolicy>(entry.settings.clone()) {
                Ok(policy) => {
                    self.policies.put(policy.id, policy);
                    loaded += 1;
                }
                Err(e) => warn!(config_id = %entry.config_id, error = %e,
                    "skipping unparseable backup policy"),
            }
        }
        Ok(loaded)
    }

    /// Execute one backup per the policy's type. Per-object failures
    /// are accumulated; configuration-level failures raise.
    pub fn execute_backup(&self, policy_id: PolicyId) -> Result<BackupResult> {
        let policy = self.get_policy(policy_id)?;
        if !policy.enabled {
            return Err(Error::disabled("backup policy", policy_id.to_string()));
        }
        let start = Instant::now();
        let started_at = Utc::now();

        let cutoff = policy.selection_cutoff().map(datetime_to_system);
        let mut selected: Vec<(TierId, ObjectMeta)> = Vec::new();
        for tier in &policy.source_tiers {
            for meta in self.registry.list_objects(tier)? {
                if cutoff.is_none_or(|c| meta.modified > c) {
                    selected.push((tier.clone(), meta));
                }
            }
        }

        let backup_dir = unique_backup_dir(&policy.location, started_at)?;
        std::fs::create_dir_all(&backup_dir)?;

        let mut manifest = BackupManifest::new(policy_id, policy.backup_type);
        let mut errors = Vec::new();
        let mut total_bytes = 0u64;
        let mut stored_bytes = 0u64;

        for (tier, meta) in &selected {
            match self.capture_object(&policy, &backup_dir, tier, meta) {
                Ok(entry) => {
                    total_bytes += entry.size;
                    if let Some(stored_as) = &entry.stored_as {
                        stored_bytes += std::fs::metadata(backup_dir.join(stored_as))
                            .map(|m| m.len())
                            .unwrap_or(0);
                    }
                    manifest.entries.push(entry);
                }
                Err(e) => errors.push(format!("{}/{}: {e}", tier, meta.path.display())),
            }
        }

        // Verification re-reads every written artifact and compares it
        // against the source checksum captured in the manifest.
        let verification_passed = if policy.verification
            && policy.backup_type != BackupType::Snapshot
        {
            Some(self.verify_backup(&backup_dir, &manifest))
        } else {
            None
        };
        manifest.verification_passed = verification_passed;
        manifest.store(&backup_dir)?;

        let state = if verification_passed == Some(false) || !errors.is_empty() {
            TaskState::Failed
        } else {
            TaskState::Completed
        };

        // Advance watermarks only for a successful run so the next
        // incremental/differential does not skip unbacked data.
        if state == TaskState::Completed {
            let is_full = policy.backup_type == BackupType::Full;
            self.policies.modify(&policy_id, &mut |p| {
                p.last_any = Some(started_at);
                if is_full {
                    p.last_full = Some(started_at);
                }
            });
            if let Ok(updated) = self.get_policy(policy_id) {
                let _ = self.persist(&updated);
            }
        }

        let result = BackupResult {
            backup_id: manifest.backup_id,
            policy_id,
            backup_type: policy.backup_type,
            state,
            directory: backup_dir,
            entries: manifest.entries.len() as u64,
            total_bytes,
            stored_bytes,
            compression_ratio: if total_bytes > 0 && policy.backup_type != BackupType::Snapshot {
                1.0 - (stored_bytes as f64 / total_bytes as f64)
            } else {
                0.0
            },
            verification_passed,
            errors,
            duration: start.elapsed(),
        };
        info!(
            backup = %result.backup_id,
            policy = %policy_id,
            backup_type = %result.backup_type,
            entries = result.entries,
            total_bytes = result.total_bytes,
            stored_bytes = result.stored_bytes,
            verified = ?result.verification_passed,
            errors = result.errors.len(),
            duration_ms = result.duration.as_millis() as u64,
            success = result.state == TaskState::Completed,
            "backup finished"
        );
        self.results.put(result.backup_id, result.clone());
        Ok(result)
    }

    /// Prune a policy's backup artifacts oldest-first per
    /// `retention_days`, never dropping below the `min_retained` floor
    /// of valid backups.
    pub fn prune_backups(&self, policy_id: PolicyId) -> Result<PruneResult> {
        let policy = self.get_policy(policy_id)?;
        let mut backups = list_backup_dirs(&policy.location, Some(policy_id))?;
        backups.sort_by_key(|(_, m)| m.created_at);

        let cutoff = Utc::now() - chrono::Duration::days(i64::from(policy.retention_days));
        let mut valid_remaining = backups
            .iter()
            .filter(|(_, m)| m.is_restorable())
            .count();

        let mut removed = 0;
        for (dir, manifest) in &backups {
            if manifest.created_at >= cutoff {
                continue;
            }
            if manifest.is_restorable() {
                if valid_remaining <= policy.min_retained as usize {
                    // Never remove the last valid backups for a policy.
                    continue;
                }
                valid_remaining -= 1;
            }
            std::fs::remove_dir_all(dir)?;
            removed += 1;
            debug!(policy = %policy_id, dir = %dir.display(), "pruned expired backup");
        }
        Ok(PruneResult {
            removed,
            retained: backups.len() - removed,
        })
    }

    /// Capture one object into the backup directory and produce its
    /// manifest entry. Snapshot backups record the entry only.
    fn capture_object(
        &self,
        policy: &BackupPolicy,
        backup_dir: &Path,
        tier: &TierId,
        meta: &ObjectMeta,
    ) -> Result<ManifestEntry> {
        let src_abs = self.registry.abs_path(tier, &meta.path)?;
        let data = std::fs::read(&src_abs)?;
        let checksum = Checksum::compute_full(&data);
        let sha256 = checksum.sha256_hex().unwrap_or_default();

        let mut entry = ManifestEntry {
            path: meta.path.clone(),
            tier: tier.clone(),
            size: data.len() as u64,
            crc32c: checksum.crc32c,
            sha256,
            stored_as: None,
            compressed: false,
        };
        if policy.backup_type == BackupType::Snapshot {
            return Ok(entry);
        }

        let mut stored_rel = PathBuf::from("data").join(tier.as_str()).join(&meta.path);
        let out = if policy.compression {
            stored_rel = append_ext(&stored_rel, "zst");
            zstd::encode_all(data.as_slice(), COMPRESS_LEVEL)
                .map_err(|e| Error::internal(format!("zstd encode: {e}")))?
        } else {
            data
        };
        let stored_abs = backup_dir.join(&stored_rel);
        if let Some(parent) = stored_abs.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = append_ext(&stored_abs, "tmp");
        std::fs::write(&tmp, &out)?;
        std::fs::rename(&tmp, &stored_abs)?;

        entry.stored_as = Some(stored_rel);
        entry.compressed = policy.compression;
        Ok(entry)
    }

    /// Re-read every stored artifact and compare against the manifest
    fn verify_backup(&self, backup_dir: &Path, manifest: &BackupManifest) -> bool {
        for entry in &manifest.entries {
            let Some(stored_as) = &entry.stored_as else {
                continue;
            };
            let stored = match std::fs::read(backup_dir.join(stored_as)) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(path = %stored_as.display(), error = %e, "backup artifact unreadable");
                    return false;
                }
            };
            let original = if entry.compressed {
                match zstd::decode_all(stored.as_slice()) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(path = %stored_as.display(), error = %e,
                            "backup artifact undecodable");
                        return false;
                    }
                }
            } else {
                stored
            };
            if sha256_hex(&original) != entry.sha256 {
                warn!(path = %stored_as.display(), "backup artifact checksum mismatch");
                return false;
            }
        }
        true
    }

    fn persist(&self, policy: &BackupPolicy) -> Result<()> {
        if let Some(config) = &self.config {
            config.upsert(
                SUBSYSTEM,
                ConfigEntry::new(
                    policy.id.to_string(),
                    "backup_policy",
                    policy.name.clone(),
                    serde_json::to_value(policy)?,
                    policy.enabled,
                ),
            )?;
        }
        Ok(())
    }
}

/// Scan a backup location for backup directories with readable
/// manifests, optionally filtered by owning policy.
pub fn list_backup_dirs(
    location: &Path,
    policy: Option<PolicyId>,
) -> Result<Vec<(PathBuf, BackupManifest)>> {
    let mut out = Vec::new();
    if !location.exists() {
        return Ok(out);
    }
    for entry in std::fs::read_dir(location)? {
        let entry = entry?;
        let dir = entry.path();
        if !dir.is_dir() || !dir.join(MANIFEST_FILE).is_file() {
            continue;
        }
        match BackupManifest::load(&dir) {
            Ok(manifest) => {
                if policy.is_none_or(|p| manifest.policy_id == p) {
                    out.push((dir, manifest));
                }
            }
            Err(e) => warn!(dir = %dir.display(), error = %e, "skipping unreadable manifest"),
        }
    }
    Ok(out)
}

/// `location/backup_<YYYYMMDD_HHMMSS>/`, suffixed on collision
fn unique_backup_dir(location: &Path, ts: DateTime<Utc>) -> Result<PathBuf> {
    let base = location.join(format!("backup_{}", ts.format("%Y%m%d_%H%M%S")));
    if !base.exists() {
        return Ok(base);
    }
    for n in 1..1_000 {
        let candidate = location.join(format!(
            "backup_{}_{n}",
            ts.format("%Y%m%d_%H%M%S")
        ));
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(Error::internal("could not allocate a backup directory"))
}

fn datetime_to_system(dt: DateTime<Utc>) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(dt.timestamp_millis().max(0) as u64)
}

/// Append an extension after the existing one
fn append_ext(path: &Path, ext: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map_or_else(String::new, |n| n.to_string_lossy().into_owned());
    name.push('.');
    name.push_str(ext);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tierstore_common::config::TierConfig;
    use tierstore_common::TierKind;
    use tierstore_registry::MemoryRepository;

    struct Fixture {
        _dir: TempDir,
        engine: BackupEngine,
        hot: TierId,
        hot_root: PathBuf,
        location: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(TierRegistry::new());
        let hot = TierId::new_unchecked("hot");
        let hot_root = dir.path().join("hot");
        registry
            .register(TierConfig::new(
                hot.clone(),
                TierKind::Hot,
                hot_root.clone(),
                1 << 30,
            ))
            .unwrap();
        let engine = BackupEngine::new(
            registry,
            Arc::new(MemoryRepository::new()),
            Arc::new(MemoryRepository::new()),
            None,
        );
        Fixture {
            location: dir.path().join("backups"),
            _dir: dir,
            engine,
            hot,
            hot_root,
        }
    }

    fn policy(fx: &Fixture, backup_type: BackupType) -> BackupPolicy {
        BackupPolicy::new(
            "nightly",
            backup_type,
            vec![fx.hot.clone()],
            fx.location.clone(),
        )
    }

    #[test]
    fn test_full_backup_with_verification() {
        let fx = fixture();
        std::fs::write(fx.hot_root.join("a.json"), b"{\"event\":\"click\"}").unwrap();
        std::fs::create_dir_all(fx.hot_root.join("scroll")).unwrap();
        std::fs::write(fx.hot_root.join("scroll/b.json"), b"{\"event\":\"scroll\"}").unwrap();

        let id = fx.engine.create_policy(policy(&fx, BackupType::Full)).unwrap();
        let result = fx.engine.execute_backup(id).unwrap();

        assert_eq!(result.state, TaskState::Completed);
        assert_eq!(result.entries, 2);
        assert_eq!(result.verification_passed, Some(true));
        assert!(result.errors.is_empty());
        assert!(result.directory.join(MANIFEST_FILE).is_file());

        let manifest = BackupManifest::load(&result.directory).unwrap();
        assert_eq!(manifest.entries.len(), 2);
        assert!(manifest.is_restorable());
        for entry in &manifest.entries {
            assert!(entry.stored_as.is_some());
            assert!(result
                .directory
                .join(entry.stored_as.as_ref().unwrap())
                .is_file());
        }
    }

    #[test]
    fn test_snapshot_records_manifest_only() {
        let fx = fixture();
        std::fs::write(fx.hot_root.join("a.json"), b"data").unwrap();

        let id = fx
            .engine
            .create_policy(policy(&fx, BackupType::Snapshot))
            .unwrap();
        let result = fx.engine.execute_backup(id).unwrap();

        assert_eq!(result.state, TaskState::Completed);
        assert_eq!(result.entries, 1);
        assert_eq!(result.stored_bytes, 0);
        let manifest = BackupManifest::load(&result.directory).unwrap();
        assert!(manifest.entries[0].stored_as.is_none());
        assert!(!result.directory.join("data").exists());
    }

    #[test]
    fn test_incremental_copies_only_changes() {
        let fx = fixture();
        std::fs::write(fx.hot_root.join("old.json"), b"before").unwrap();

        let id = fx
            .engine
            .create_policy(policy(&fx, BackupType::Incremental))
            .unwrap();

        // First run has no watermark and captures everything.
        let first = fx.engine.execute_backup(id).unwrap();
        assert_eq!(first.entries, 1);

        // Age the existing object behind the watermark, add a new one.
        let past = SystemTime::now() - Duration::from_secs(3_600);
        std::fs::File::options()
            .write(true)
            .open(fx.hot_root.join("old.json"))
            .unwrap()
            .set_modified(past)
            .unwrap();
        std::fs::write(fx.hot_root.join("new.json"), b"after").unwrap();

        let second = fx.engine.execute_backup(id).unwrap();
        assert_eq!(second.entries, 1);
        let manifest = BackupManifest::load(&second.directory).unwrap();
        assert_eq!(manifest.entries[0].path, PathBuf::from("new.json"));
    }

    #[test]
    fn test_execute_disabled_policy_raises() {
        let fx = fixture();
        let id = fx.engine.create_policy(policy(&fx, BackupType::Full)).unwrap();
        fx.engine.set_enabled(id, false).unwrap();
        assert!(matches!(
            fx.engine.execute_backup(id),
            Err(Error::Disabled { .. })
        ));
        assert!(fx
            .engine
            .execute_backup(PolicyId::new())
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_prune_respects_min_retained_floor() {
        let fx = fixture();
        std::fs::write(fx.hot_root.join("a.json"), b"data").unwrap();
        let id = fx.engine.create_policy(policy(&fx, BackupType::Full)).unwrap();

        for _ in 0..3 {
            fx.engine.execute_backup(id).unwrap();
        }
        // Age every manifest past the retention window.
        for (dir, mut manifest) in list_backup_dirs(&fx.location, Some(id)).unwrap() {
            manifest.created_at = Utc::now() - chrono::Duration::days(90);
            manifest.store(&dir).unwrap();
        }

        fx.engine
            .update_policy(id, |p| {
                p.retention_days = 30;
                p.min_retained = 1;
            })
            .unwrap();
        let pruned = fx.engine.prune_backups(id).unwrap();
        assert_eq!(pruned.removed, 2);
        assert_eq!(pruned.retained, 1);
        assert_eq!(list_backup_dirs(&fx.location, Some(id)).unwrap().len(), 1);
    }

    #[test]
    fn test_compression_ratio_reported() {
        let fx = fixture();
        std::fs::write(fx.hot_root.join("big.json"), "event ".repeat(10_000)).unwrap();

        let id = fx.engine.create_policy(policy(&fx, BackupType::Full)).unwrap();
        let result = fx.engine.execute_backup(id).unwrap();
        assert!(result.compression_ratio > 0.5);
        assert!(result.stored_bytes < result.total_bytes);
    }
}

//! Migration executor
//!
//! Executes pending migrations with verify-before-delete semantics: the
//! object set is copied to the target tier, each copy's checksum is
//! compared to its source, and only on a full match are the sources
//! removed and both tiers' usage counters adjusted. Any failure, in
//! the copy phase or the delete phase, leaves both tiers' contents and
//! usage counters at their pre-migration values: already-deleted
//! sources are restored from their verified target copies before the
//! target side is rolled back.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tierstore_common::checksum::checksum_file;
use tierstore_common::{Error, Result, TaskId, TaskState, TierId};
use tierstore_registry::{Repository, TierRegistry};
use tracing::{info, warn};

use crate::migration::{DataMigration, RequeueReason};

/// Write-ahead durability check consulted before any source delete.
///
/// For a tier covered by an enabled backup policy, the migration's
/// source-delete step must only happen after a verified backup of the
/// object exists.
pub trait DurabilityGuard: Send + Sync {
    /// Whether an enabled backup policy covers this tier
    fn covers(&self, tier: &TierId) -> bool;

    /// Whether a verified backup holds this object with this content
    fn has_verified_copy(&self, tier: &TierId, path: &Path, sha256_hex: &str) -> bool;
}

/// Sink for capacity alerts raised when a migration cannot fit
pub trait AlertSink: Send + Sync {
    fn capacity_alert(&self, tier: &TierId, required: u64, available: u64);
}

/// Executes and cancels data migrations
pub struct MigrationExecutor {
    registry: Arc<TierRegistry>,
    migrations: Arc<dyn Repository<TaskId, DataMigration>>,
    guard: Option<Arc<dyn DurabilityGuard>>,
    alerts: Option<Arc<dyn AlertSink>>,
    cancel_requests: Mutex<HashSet<TaskId>>,
}

impl MigrationExecutor {
    #[must_use]
    pub fn new(
        registry: Arc<TierRegistry>,
        migrations: Arc<dyn Repository<TaskId, DataMigration>>,
        guard: Option<Arc<dyn DurabilityGuard>>,
        alerts: Option<Arc<dyn AlertSink>>,
    ) -> Self {
        Self {
            registry,
            migrations,
            guard,
            alerts,
            cancel_requests: Mutex::new(HashSet::new()),
        }
    }

    /// Execute one pending migration and return its final record.
    ///
    /// Capacity shortfalls and missing write-ahead backups do not fail
    /// the migration: it stays queued with a requeue reason (and a
    /// capacity alert is raised) for a later cycle. Unknown ids and
    /// non-pending states raise.
    pub fn execute_migration(&self, id: TaskId) -> Result<DataMigration> {
        let migration = self
            .migrations
            .get(&id)
            .ok_or_else(|| Error::not_found("migration", id.to_string()))?;
        if migration.state != TaskState::Pending {
            return Err(Error::configuration(format!(
                "migration {id} is not pending (state: {})",
                migration.state
            )));
        }

        // Size up the object set before touching anything. A vanished
        // source object fails the migration with zero mutation.
        let mut sized: Vec<(PathBuf, u64)> = Vec::with_capacity(migration.paths.len());
        for rel in &migration.paths {
            let abs = self.registry.abs_path(&migration.source_tier, rel)?;
            match std::fs::metadata(&abs) {
                Ok(meta) => sized.push((rel.clone(), meta.len())),
                Err(e) => {
                    return self.finish(id, TaskState::Failed, 0, 0, vec![format!(
                        "{}: {e}",
                        rel.display()
                    )]);
                }
            }
        }
        let total_bytes: u64 = sized.iter().map(|(_, s)| s).sum();

        // Capacity precheck: insufficient room leaves the migration
        // queued and raises an alert, never a partial write.
        let available = self.registry.available(&migration.target_tier)?;
        if total_bytes > available {
            if let Some(alerts) = &self.alerts {
                alerts.capacity_alert(&migration.target_tier, total_bytes, available);
            }
            warn!(
                migration = %id,
                target = %migration.target_tier,
                required = total_bytes,
                available,
                "migration requeued: insufficient target capacity"
            );
            self.migrations.modify(&id, &mut |m| {
                m.requeue_reason = Some(RequeueReason::InsufficientCapacity);
            });
            return self
                .migrations
                .get(&id)
                .ok_or_else(|| Error::not_found("migration", id.to_string()));
        }

        // Write-ahead durability: never delete the only copy of an
        // object from a backup-covered tier.
        if let Some(guard) = &self.guard {
            if guard.covers(&migration.source_tier) {
                for (rel, _) in &sized {
                    let abs = self.registry.abs_path(&migration.source_tier, rel)?;
                    let sha = checksum_file(&abs)?.sha256_hex().unwrap_or_default();
                    if !guard.has_verified_copy(&migration.source_tier, rel, &sha) {
                        info!(migration = %id, path = %rel.display(),
                            "migration requeued: awaiting verified backup");
                        self.migrations.modify(&id, &mut |m| {
                            m.requeue_reason = Some(RequeueReason::AwaitingBackup);
                        });
                        return self
                            .migrations
                            .get(&id)
                            .ok_or_else(|| Error::not_found("migration", id.to_string()));
                    }
                }
            }
        }

        self.migrations.modify(&id, &mut |m| {
            let _ = m.transition(TaskState::Running);
            m.requeue_reason = None;
        });

        // Copy phase: everything lands in the target tier and is
        // verified before any source byte is deleted.
        let mut copied: Vec<(PathBuf, u64)> = Vec::new();
        for (rel, size) in &sized {
            if self.cancel_requests.lock().remove(&id) {
                self.rollback_copies(&migration.target_tier, &copied);
                info!(migration = %id, "migration cancelled between object steps");
                return self.finish(id, TaskState::Cancelled, 0, 0, Vec::new());
            }
            if let Err(e) = self.copy_object(&migration, rel) {
                self.rollback_copies(&migration.target_tier, &copied);
                return self.finish(id, TaskState::Failed, 0, 0, vec![format!(
                    "{}: {e}",
                    rel.display()
                )]);
            }
            copied.push((rel.clone(), *size));
        }

        // Commit phase: adjust usage, then drop the sources. The target
        // charge is the atomic commit point; a crash after it is healed
        // by the reconciliation pass.
        if let Err(e) = self.registry.charge(&migration.target_tier, total_bytes) {
            self.rollback_copies(&migration.target_tier, &copied);
            if let Some(alerts) = &self.alerts {
                if let Error::Capacity {
                    required,
                    available,
                    ..
                } = &e
                {
                    alerts.capacity_alert(&migration.target_tier, *required, *available);
                }
            }
            return self.finish(id, TaskState::Failed, 0, 0, vec![e.to_string()]);
        }

        let mut errors = Vec::new();
        let mut deleted: Vec<PathBuf> = Vec::new();
        for (rel, _) in &copied {
            let abs = self.registry.abs_path(&migration.source_tier, rel)?;
            match std::fs::remove_file(&abs) {
                Ok(()) => deleted.push(rel.clone()),
                Err(e) => {
                    errors.push(format!("{}: source delete failed: {e}", rel.display()));
                    break;
                }
            }
        }
        if !errors.is_empty() {
            // Restore already-deleted sources from their verified
            // target copies, then undo the target side so a Failed
            // record leaves both tiers at pre-migration state. A target
            // copy whose restore failed is the only copy left; it stays
            // in place (and stays charged) rather than being removed.
            let mut kept: HashSet<PathBuf> = HashSet::new();
            for rel in &deleted {
                if let Err(e) = self.restore_source(&migration, rel) {
                    errors.push(format!("{}: source restore failed: {e}", rel.display()));
                    kept.insert(rel.clone());
                }
            }
            let removable: Vec<(PathBuf, u64)> = copied
                .iter()
                .filter(|(rel, _)| !kept.contains(rel))
                .cloned()
                .collect();
            self.rollback_copies(&migration.target_tier, &removable);
            let kept_bytes: u64 = copied
                .iter()
                .filter(|(rel, _)| kept.contains(rel))
                .map(|(_, size)| size)
                .sum();
            self.registry
                .credit(&migration.target_tier, total_bytes - kept_bytes)?;
            return self.finish(id, TaskState::Failed, 0, 0, errors);
        }
        self.registry.credit(&migration.source_tier, total_bytes)?;

        let result = self.finish(
            id,
            TaskState::Completed,
            total_bytes,
            deleted.len() as u64,
            Vec::new(),
        )?;
        info!(
            migration = %id,
            source = %result.source_tier,
            target = %result.target_tier,
            state = %result.state,
            bytes_moved = result.bytes_moved,
            objects_moved = result.objects_moved,
            success = result.state == TaskState::Completed,
            "migration finished"
        );
        Ok(result)
    }

    /// Execute every pending migration, isolating failures per task
    pub fn execute_pending(&self) -> Vec<DataMigration> {
        let pending: Vec<TaskId> = self
            .migrations
            .list()
            .into_iter()
            .filter(|m| m.state == TaskState::Pending)
            .map(|m| m.id)
            .collect();
        let mut results = Vec::new();
        for id in pending {
            match self.execute_migration(id) {
                Ok(m) => results.push(m),
                Err(e) => warn!(migration = %id, error = %e, "migration execution failed"),
            }
        }
        results
    }

    /// Request cancellation. Pending migrations cancel immediately;
    /// running ones cancel between object-level steps, never
    /// mid-single-object copy, and always leave the source tier in full
    /// possession of its data.
    pub fn cancel_migration(&self, id: TaskId) -> Result<()> {
        let migration = self
            .migrations
            .get(&id)
            .ok_or_else(|| Error::not_found("migration", id.to_string()))?;
        match migration.state {
            TaskState::Pending => {
                self.migrations.modify(&id, &mut |m| {
                    let _ = m.transition(TaskState::Cancelled);
                });
                Ok(())
            }
            TaskState::Running => {
                self.cancel_requests.lock().insert(id);
                Ok(())
            }
            state => Err(Error::configuration(format!(
                "migration {id} cannot be cancelled from state {state}"
            ))),
        }
    }

    /// Recompute usage for every registered tier from actual contents.
    /// Recovers from a crash between copy-confirm and the usage-counter
    /// update.
    pub fn reconcile_all(&self) -> Result<Vec<(TierId, i64)>> {
        let mut corrections = Vec::new();
        for tier in self.registry.list() {
            let delta = self.registry.reconcile(&tier.id)?;
            corrections.push((tier.id, delta));
        }
        Ok(corrections)
    }

    /// Copy one object to the target tier and verify the written copy
    /// against the source checksum.
    fn copy_object(&self, migration: &DataMigration, rel: &Path) -> Result<()> {
        let src_abs = self.registry.abs_path(&migration.source_tier, rel)?;
        let dest_abs = self.registry.abs_path(&migration.target_tier, rel)?;
        if let Some(parent) = dest_abs.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let src_sum = checksum_file(&src_abs)?;
        let tmp = dest_abs.with_extension(format!(
            "{}.tmp",
            dest_abs
                .extension()
                .map(|e| e.to_string_lossy().into_owned())
                .unwrap_or_default()
        ));
        std::fs::copy(&src_abs, &tmp)?;
        let copy_sum = checksum_file(&tmp)?;
        if copy_sum != src_sum {
            let _ = std::fs::remove_file(&tmp);
            return Err(Error::ChecksumMismatch {
                expected: src_sum.sha256_hex().unwrap_or_default(),
                actual: copy_sum.sha256_hex().unwrap_or_default(),
            });
        }
        std::fs::rename(&tmp, &dest_abs)?;
        Ok(())
    }

    /// Put a deleted source object back from its verified target copy
    fn restore_source(&self, migration: &DataMigration, rel: &Path) -> Result<()> {
        let target_abs = self.registry.abs_path(&migration.target_tier, rel)?;
        let source_abs = self.registry.abs_path(&migration.source_tier, rel)?;
        std::fs::copy(&target_abs, &source_abs)?;
        Ok(())
    }

    /// Remove already-copied target objects after a failure so no
    /// partial mutation stays visible.
    fn rollback_copies(&self, target: &TierId, copied: &[(PathBuf, u64)]) {
        for (rel, _) in copied {
            if let Ok(abs) = self.registry.abs_path(target, rel) {
                let _ = std::fs::remove_file(abs);
            }
        }
    }

    fn finish(
        &self,
        id: TaskId,
        state: TaskState,
        bytes_moved: u64,
        objects_moved: u64,
        errors: Vec<String>,
    ) -> Result<DataMigration> {
        self.migrations.modify(&id, &mut |m| {
            if m.state == TaskState::Pending && state != TaskState::Pending {
                // Failed before the running transition was recorded.
                let _ = m.transition(TaskState::Running);
            }
            let _ = m.transition(state);
            m.bytes_moved = bytes_moved;
            m.objects_moved = objects_moved;
            m.errors.extend(errors.iter().cloned());
        });
        self.migrations
            .get(&id)
            .ok_or_else(|| Error::not_found("migration", id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::DataMigration;
    use parking_lot::Mutex as PlMutex;
    use tempfile::TempDir;
    use tierstore_common::config::TierConfig;
    use tierstore_common::{RuleId, TierKind};
    use tierstore_registry::MemoryRepository;

    struct RecordingAlerts {
        capacity_alerts: PlMutex<Vec<(TierId, u64, u64)>>,
    }

    impl AlertSink for RecordingAlerts {
        fn capacity_alert(&self, tier: &TierId, required: u64, available: u64) {
            self.capacity_alerts
                .lock()
                .push((tier.clone(), required, available));
        }
    }

    struct DenyAllGuard;

    impl DurabilityGuard for DenyAllGuard {
        fn covers(&self, _tier: &TierId) -> bool {
            true
        }
        fn has_verified_copy(&self, _tier: &TierId, _path: &Path, _sha: &str) -> bool {
            false
        }
    }

    struct Fixture {
        _dir: TempDir,
        registry: Arc<TierRegistry>,
        migrations: Arc<MemoryRepository<TaskId, DataMigration>>,
        hot: TierId,
        warm: TierId,
        hot_root: PathBuf,
        warm_root: PathBuf,
    }

    fn fixture(warm_capacity: u64) -> Fixture {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(TierRegistry::new());
        let hot = TierId::new_unchecked("hot");
        let warm = TierId::new_unchecked("warm");
        let hot_root = dir.path().join("hot");
        let warm_root = dir.path().join("warm");
        registry
            .register(TierConfig::new(
                hot.clone(),
                TierKind::Hot,
                hot_root.clone(),
                1 << 30,
            ))
            .unwrap();
        registry
            .register(TierConfig::new(
                warm.clone(),
                TierKind::Warm,
                warm_root.clone(),
                warm_capacity,
            ))
            .unwrap();
        Fixture {
            _dir: dir,
            registry,
            migrations: Arc::new(MemoryRepository::new()),
            hot,
            warm,
            hot_root,
            warm_root,
        }
    }

    fn executor(fx: &Fixture) -> MigrationExecutor {
        MigrationExecutor::new(fx.registry.clone(), fx.migrations.clone(), None, None)
    }

    fn queue_migration(fx: &Fixture, paths: &[&str]) -> TaskId {
        let migration = DataMigration::new(
            RuleId::new(),
            fx.hot.clone(),
            fx.warm.clone(),
            paths.iter().map(PathBuf::from).collect(),
        );
        let id = migration.id;
        fx.migrations.put(id, migration);
        id
    }

    #[test]
    fn test_successful_migration_moves_usage_exactly() {
        let fx = fixture(1 << 30);
        std::fs::write(fx.hot_root.join("a.json"), vec![b'a'; 100]).unwrap();
        std::fs::write(fx.hot_root.join("b.json"), vec![b'b'; 150]).unwrap();
        fx.registry.reconcile(&fx.hot).unwrap();

        let hot_before = fx.registry.used(&fx.hot).unwrap();
        let warm_before = fx.registry.used(&fx.warm).unwrap();

        let id = queue_migration(&fx, &["a.json", "b.json"]);
        let result = executor(&fx).execute_migration(id).unwrap();

        assert_eq!(result.state, TaskState::Completed);
        assert_eq!(result.bytes_moved, 250);
        assert_eq!(result.objects_moved, 2);
        assert_eq!(fx.registry.used(&fx.warm).unwrap(), warm_before + 250);
        assert_eq!(fx.registry.used(&fx.hot).unwrap(), hot_before - 250);
        assert!(fx.warm_root.join("a.json").is_file());
        assert!(!fx.hot_root.join("a.json").exists());
    }

    #[test]
    fn test_failed_migration_leaves_no_partial_mutation() {
        let fx = fixture(1 << 30);
        std::fs::write(fx.hot_root.join("a.json"), vec![b'a'; 100]).unwrap();
        fx.registry.reconcile(&fx.hot).unwrap();

        let hot_before = fx.registry.used(&fx.hot).unwrap();
        let warm_before = fx.registry.used(&fx.warm).unwrap();

        // Second path does not exist; sizing fails before any mutation.
        let id = queue_migration(&fx, &["a.json", "missing.json"]);
        let result = executor(&fx).execute_migration(id).unwrap();

        assert_eq!(result.state, TaskState::Failed);
        assert!(!result.errors.is_empty());
        assert_eq!(fx.registry.used(&fx.hot).unwrap(), hot_before);
        assert_eq!(fx.registry.used(&fx.warm).unwrap(), warm_before);
        assert!(fx.hot_root.join("a.json").is_file());
        assert!(!fx.warm_root.join("a.json").exists());
    }

    #[test]
    fn test_delete_phase_failure_restores_both_tiers() {
        let fx = fixture(1 << 30);
        std::fs::write(fx.hot_root.join("a.json"), vec![b'a'; 100]).unwrap();
        fx.registry.reconcile(&fx.hot).unwrap();

        let hot_before = fx.registry.used(&fx.hot).unwrap();
        let warm_before = fx.registry.used(&fx.warm).unwrap();

        // Duplicate path: the second source delete hits a missing file
        // after the first one succeeded.
        let id = queue_migration(&fx, &["a.json", "a.json"]);
        let result = executor(&fx).execute_migration(id).unwrap();

        assert_eq!(result.state, TaskState::Failed);
        assert_eq!(result.bytes_moved, 0);
        assert_eq!(result.objects_moved, 0);
        assert!(!result.errors.is_empty());
        assert_eq!(fx.registry.used(&fx.hot).unwrap(), hot_before);
        assert_eq!(fx.registry.used(&fx.warm).unwrap(), warm_before);
        assert!(fx.hot_root.join("a.json").is_file());
        assert!(!fx.warm_root.join("a.json").exists());
    }

    #[test]
    fn test_insufficient_capacity_requeues_and_alerts() {
        let fx = fixture(10);
        std::fs::write(fx.hot_root.join("big.json"), vec![b'x'; 500]).unwrap();
        fx.registry.reconcile(&fx.hot).unwrap();

        let alerts = Arc::new(RecordingAlerts {
            capacity_alerts: PlMutex::new(Vec::new()),
        });
        let exec = MigrationExecutor::new(
            fx.registry.clone(),
            fx.migrations.clone(),
            None,
            Some(alerts.clone()),
        );

        let id = queue_migration(&fx, &["big.json"]);
        let result = exec.execute_migration(id).unwrap();

        assert_eq!(result.state, TaskState::Pending);
        assert_eq!(
            result.requeue_reason,
            Some(RequeueReason::InsufficientCapacity)
        );
        let raised = alerts.capacity_alerts.lock();
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].1, 500);
        assert!(fx.hot_root.join("big.json").is_file());
    }

    #[test]
    fn test_durability_guard_defers_delete() {
        let fx = fixture(1 << 30);
        std::fs::write(fx.hot_root.join("a.json"), b"covered").unwrap();
        fx.registry.reconcile(&fx.hot).unwrap();

        let exec = MigrationExecutor::new(
            fx.registry.clone(),
            fx.migrations.clone(),
            Some(Arc::new(DenyAllGuard)),
            None,
        );
        let id = queue_migration(&fx, &["a.json"]);
        let result = exec.execute_migration(id).unwrap();

        assert_eq!(result.state, TaskState::Pending);
        assert_eq!(result.requeue_reason, Some(RequeueReason::AwaitingBackup));
        assert!(fx.hot_root.join("a.json").is_file());
    }

    #[test]
    fn test_cancel_pending_migration() {
        let fx = fixture(1 << 30);
        std::fs::write(fx.hot_root.join("a.json"), b"x").unwrap();
        let id = queue_migration(&fx, &["a.json"]);
        let exec = executor(&fx);

        exec.cancel_migration(id).unwrap();
        let migration = fx.migrations.get(&id).unwrap();
        assert_eq!(migration.state, TaskState::Cancelled);
        // A cancelled migration cannot be executed.
        assert!(exec.execute_migration(id).is_err());
    }

    #[test]
    fn test_execute_requires_pending_state() {
        let fx = fixture(1 << 30);
        std::fs::write(fx.hot_root.join("a.json"), b"x").unwrap();
        fx.registry.reconcile(&fx.hot).unwrap();
        let id = queue_migration(&fx, &["a.json"]);
        let exec = executor(&fx);

        exec.execute_migration(id).unwrap();
        assert!(exec.execute_migration(id).is_err());
        assert!(exec.execute_migration(TaskId::new()).unwrap_err().is_not_found());
    }

    #[test]
    fn test_reconcile_all_heals_counters() {
        let fx = fixture(1 << 30);
        std::fs::write(fx.hot_root.join("a.json"), vec![b'x'; 64]).unwrap();
        // Simulate counter drift from a crash.
        fx.registry.charge(&fx.hot, 1_000).unwrap();

        let corrections = executor(&fx).reconcile_all().unwrap();
        let hot_fix = corrections.iter().find(|(t, _)| t == &fx.hot).unwrap();
        assert_eq!(hot_fix.1, -936);
        assert_eq!(fx.registry.used(&fx.hot).unwrap(), 64);
    }

    #[test]
    fn test_nested_paths_preserved() {
        let fx = fixture(1 << 30);
        std::fs::create_dir_all(fx.hot_root.join("click/2024")).unwrap();
        std::fs::write(fx.hot_root.join("click/2024/a.json"), b"nested").unwrap();
        fx.registry.reconcile(&fx.hot).unwrap();

        let id = queue_migration(&fx, &["click/2024/a.json"]);
        let result = executor(&fx).execute_migration(id).unwrap();
        assert_eq!(result.state, TaskState::Completed);
        assert!(fx.warm_root.join("click/2024/a.json").is_file());
    }
}

//! Engine context
//!
//! Every subsystem is constructed exactly once here from one
//! configuration and handed its dependencies explicitly. There are no
//! process-wide singletons; tests build a context over a temp dir and
//! get the full wired engine.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tierstore_archive::ArchivalEngine;
use tierstore_backup::{BackupCatalog, BackupEngine, RecoveryEngine};
use tierstore_common::config::EngineConfig;
use tierstore_common::{Result, TaskState};
use tierstore_integrity::IntegrityChecker;
use tierstore_monitor::{StorageMonitor, StorageOptimizer};
use tierstore_registry::{ConfigManager, MemoryRepository, TierRegistry};
use tierstore_retention::RetentionEngine;
use tierstore_tiering::{MigrationExecutor, TieringEngine};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::adapters::{CatalogGuard, MonitorAlertSink, RecoveryRepairSource};
use crate::scheduler::PeriodicTask;

/// Counts exposed for status surfaces and tests
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub tiers: usize,
    pub retention_policies: usize,
    pub tiering_rules: usize,
    pub pending_migrations: usize,
    pub running_migrations: usize,
    pub backup_policies: usize,
    pub archive_policies: usize,
    pub integrity_checks: usize,
    pub open_issues: usize,
    pub unresolved_alerts: usize,
    pub last_runs: BTreeMap<&'static str, DateTime<Utc>>,
}

/// The fully wired engine
pub struct EngineContext {
    pub config: EngineConfig,
    pub registry: Arc<TierRegistry>,
    pub config_manager: Arc<ConfigManager>,
    pub retention: Arc<RetentionEngine>,
    pub tiering: Arc<TieringEngine>,
    pub executor: Arc<MigrationExecutor>,
    pub backup: Arc<BackupEngine>,
    pub catalog: Arc<BackupCatalog>,
    pub recovery: Arc<RecoveryEngine>,
    pub archival: Arc<ArchivalEngine>,
    pub integrity: Arc<IntegrityChecker>,
    pub monitor: Arc<StorageMonitor>,
    pub optimizer: Arc<StorageOptimizer>,
    last_runs: RwLock<BTreeMap<&'static str, DateTime<Utc>>>,
}

impl EngineContext {
    /// Build and wire every subsystem. Tiers are registered (and their
    /// roots created) up front; previously persisted configuration is
    /// loaded into the repositories.
    pub fn new(config: EngineConfig) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.data_dir)?;
        let config_manager = Arc::new(ConfigManager::open(config.data_dir.join("config"))?);

        let registry = Arc::new(TierRegistry::new());
        for tier in &config.tiers {
            registry.register(tier.clone())?;
        }

        let monitor = Arc::new(StorageMonitor::new(
            Arc::clone(&registry),
            config.monitor.clone(),
        ));

        let retention = Arc::new(RetentionEngine::new(
            Arc::clone(&registry),
            Arc::new(MemoryRepository::new()),
            Some(Arc::clone(&config_manager)),
        ));

        let backup_policies = Arc::new(MemoryRepository::new());
        let backup = Arc::new(BackupEngine::new(
            Arc::clone(&registry),
            backup_policies.clone(),
            Arc::new(MemoryRepository::new()),
            Some(Arc::clone(&config_manager)),
        ));
        let catalog = Arc::new(BackupCatalog::new(backup_policies));
        let recovery = Arc::new(RecoveryEngine::new(Arc::clone(&catalog)));

        let migrations = Arc::new(MemoryRepository::new());
        let tiering = Arc::new(TieringEngine::new(
            Arc::clone(&registry),
            Arc::new(MemoryRepository::new()),
            migrations.clone(),
            Some(Arc::clone(&config_manager)),
        ));
        let executor = Arc::new(MigrationExecutor::new(
            Arc::clone(&registry),
            migrations,
            Some(Arc::new(CatalogGuard(Arc::clone(&catalog)))),
            Some(Arc::new(MonitorAlertSink(monitor.alerts()))),
        ));

        let archival = Arc::new(ArchivalEngine::new(
            Arc::clone(&registry),
            Arc::new(MemoryRepository::new()),
            Some(Arc::clone(&config_manager)),
        ));

        let integrity = Arc::new(IntegrityChecker::new(
            Arc::clone(&registry),
            Arc::new(MemoryRepository::new()),
            Arc::new(MemoryRepository::new()),
            Arc::new(MemoryRepository::new()),
            Some(Arc::new(RecoveryRepairSource(Arc::clone(&recovery)))),
            Some(Arc::clone(&config_manager)),
        ));

        let optimizer = Arc::new(StorageOptimizer::new(Arc::clone(&registry)));

        let ctx = Arc::new(Self {
            config,
            registry,
            config_manager,
            retention,
            tiering,
            executor,
            backup,
            catalog,
            recovery,
            archival,
            integrity,
            monitor,
            optimizer,
            last_runs: RwLock::new(BTreeMap::new()),
        });
        ctx.load_persisted()?;
        Ok(ctx)
    }

    /// Load persisted policies/rules/checks into the repositories
    fn load_persisted(&self) -> Result<()> {
        let counts = [
            ("retention", self.retention.load_persisted()?),
            ("tiering", self.tiering.load_persisted()?),
            ("backup", self.backup.load_persisted()?),
            ("archive", self.archival.load_persisted()?),
            ("integrity", self.integrity.load_persisted()?),
        ];
        for (subsystem, loaded) in counts {
            if loaded > 0 {
                info!(subsystem, loaded, "restored persisted configuration");
            }
        }
        Ok(())
    }

    /// One retention cycle: apply every enabled policy
    pub fn run_retention_cycle(&self) {
        let results = self.retention.apply_all_policies();
        let disposed: u64 = results.iter().map(|r| r.records_disposed()).sum();
        let errors: usize = results.iter().map(|r| r.errors.len()).sum();
        info!(policies = results.len(), disposed, errors, "retention cycle finished");
        self.mark_cycle("retention");
    }

    /// One tiering cycle: evaluate rules, execute pending migrations,
    /// and retry requeued ones.
    pub fn run_tiering_cycle(&self) {
        match self.tiering.evaluate_rules() {
            Ok(created) => {
                let executed = self.executor.execute_pending();
                let completed = executed
                    .iter()
                    .filter(|m| m.state == TaskState::Completed)
                    .count();
                info!(
                    created = created.len(),
                    executed = executed.len(),
                    completed,
                    "tiering cycle finished"
                );
            }
            Err(e) => warn!(error = %e, "tiering rule evaluation failed"),
        }
        self.mark_cycle("tiering");
    }

    /// One backup cycle: execute every due policy and prune its
    /// expired artifacts.
    pub fn run_backup_cycle(&self) {
        for policy in self.backup.list_policies() {
            if !policy.enabled {
                continue;
            }
            let due = policy.last_any.is_none_or(|last| {
                Utc::now().signed_duration_since(last).num_seconds()
                    >= policy.interval_secs as i64
            });
            if !due {
                continue;
            }
            match self.backup.execute_backup(policy.id) {
                Ok(result) => {
                    for tier in &policy.source_tiers {
                        self.monitor
                            .record_operation(tier, result.state == TaskState::Completed);
                    }
                }
                Err(e) => warn!(policy = %policy.id, error = %e, "scheduled backup failed"),
            }
            if let Err(e) = self.backup.prune_backups(policy.id) {
                warn!(policy = %policy.id, error = %e, "backup pruning failed");
            }
        }
        self.mark_cycle("backup");
    }

    /// One monitoring cycle: sample metrics, then run enabled
    /// integrity checks against the sampled state.
    pub fn run_monitor_cycle(&self) {
        if let Err(e) = self.monitor.collect_metrics(None) {
            warn!(error = %e, "metric collection failed");
        }
        let results = self.integrity.run_all_checks();
        let findings = results.iter().filter(|r| !r.status.is_valid()).count();
        if findings > 0 {
            info!(checks = results.len(), findings, "integrity findings this cycle");
        }
        self.mark_cycle("monitor");
    }

    fn mark_cycle(&self, name: &'static str) {
        self.last_runs.write().insert(name, Utc::now());
    }

    /// Spawn the four subsystem schedulers
    pub fn spawn_schedulers(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let sched = &self.config.scheduler;
        let jitter = sched.jitter_fraction;
        let secs = std::time::Duration::from_secs;
        let mut handles = Vec::new();

        let ctx = Arc::clone(self);
        handles.push(
            PeriodicTask::new("retention", secs(sched.retention_interval_secs), jitter)
                .spawn(shutdown.clone(), move || ctx.run_retention_cycle()),
        );
        let ctx = Arc::clone(self);
        handles.push(
            PeriodicTask::new("tiering", secs(sched.tiering_interval_secs), jitter)
                .spawn(shutdown.clone(), move || ctx.run_tiering_cycle()),
        );
        let ctx = Arc::clone(self);
        handles.push(
            PeriodicTask::new("backup", secs(sched.backup_interval_secs), jitter)
                .spawn(shutdown.clone(), move || ctx.run_backup_cycle()),
        );
        let ctx = Arc::clone(self);
        handles.push(
            PeriodicTask::new("monitor", secs(sched.monitor_interval_secs), jitter)
                .spawn(shutdown, move || ctx.run_monitor_cycle()),
        );
        handles
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            tiers: self.registry.list().len(),
            retention_policies: self.retention.list_policies().len(),
            tiering_rules: self.tiering.list_rules().len(),
            pending_migrations: self.tiering.migrations_in_state(TaskState::Pending).len(),
            running_migrations: self.tiering.migrations_in_state(TaskState::Running).len(),
            backup_policies: self.backup.list_policies().len(),
            archive_policies: self.archival.list_policies().len(),
            integrity_checks: self.integrity.list_checks().len(),
            open_issues: self.integrity.list_issues().len(),
            unresolved_alerts: self.monitor.alerts().unresolved().len(),
            last_runs: self.last_runs.read().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;
    use tierstore_backup::{BackupPolicy, BackupType};
    use tierstore_common::config::TierConfig;
    use tierstore_common::{TierId, TierKind};
    use tierstore_tiering::{RequeueReason, RuleKind, TieringRule};

    fn config(dir: &Path) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.data_dir = dir.join("data");
        config.tiers = vec![
            TierConfig::new(
                TierId::new_unchecked("hot"),
                TierKind::Hot,
                dir.join("hot"),
                1 << 30,
            ),
            TierConfig::new(
                TierId::new_unchecked("warm"),
                TierKind::Warm,
                dir.join("warm"),
                1 << 30,
            ),
        ];
        config
    }

    fn write_aged(path: &Path, content: &[u8], days: u64) {
        std::fs::write(path, content).unwrap();
        let past = SystemTime::now() - Duration::from_secs(days * 86_400 + 60);
        std::fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(past)
            .unwrap();
    }

    #[test]
    fn test_context_builds_and_reports_stats() {
        let dir = TempDir::new().unwrap();
        let ctx = EngineContext::new(config(dir.path())).unwrap();
        let stats = ctx.stats();
        assert_eq!(stats.tiers, 2);
        assert_eq!(stats.retention_policies, 0);
        assert_eq!(stats.unresolved_alerts, 0);
        assert!(dir.path().join("hot").is_dir());
        assert!(dir.path().join("data/config").is_dir());
    }

    #[test]
    fn test_configuration_survives_restart() {
        let dir = TempDir::new().unwrap();
        let rule_id;
        {
            let ctx = EngineContext::new(config(dir.path())).unwrap();
            rule_id = ctx
                .tiering
                .create_rule(
                    TieringRule::new(
                        "age-out",
                        RuleKind::AgeBased,
                        TierId::new_unchecked("hot"),
                        TierId::new_unchecked("warm"),
                    )
                    .with_option_u64("age_days", 30),
                )
                .unwrap();
        }
        let ctx = EngineContext::new(config(dir.path())).unwrap();
        assert_eq!(ctx.stats().tiering_rules, 1);
        assert_eq!(ctx.tiering.get_rule(rule_id).unwrap().name, "age-out");
    }

    #[test]
    fn test_migration_waits_for_backup_then_moves() {
        let dir = TempDir::new().unwrap();
        let ctx = EngineContext::new(config(dir.path())).unwrap();
        let hot = TierId::new_unchecked("hot");

        write_aged(&dir.path().join("hot/old.json"), b"{\"n\":1}", 45);
        ctx.registry.reconcile(&hot).unwrap();

        // A backup policy covers the hot tier, so migrations must wait
        // for a verified copy.
        let backup_id = ctx
            .backup
            .create_policy(BackupPolicy::new(
                "hot-backup",
                BackupType::Full,
                vec![hot.clone()],
                dir.path().join("backups"),
            ))
            .unwrap();

        ctx.tiering
            .create_rule(
                TieringRule::new(
                    "age-out",
                    RuleKind::AgeBased,
                    hot.clone(),
                    TierId::new_unchecked("warm"),
                )
                .with_option_u64("age_days", 30),
            )
            .unwrap();

        // First cycle: migration created but deferred behind backup.
        ctx.run_tiering_cycle();
        let deferred = ctx.tiering.migrations_in_state(TaskState::Pending);
        assert_eq!(deferred.len(), 1);
        assert_eq!(
            deferred[0].requeue_reason,
            Some(RequeueReason::AwaitingBackup)
        );
        assert!(dir.path().join("hot/old.json").is_file());

        // Back up, then the next cycle completes the move.
        ctx.backup.execute_backup(backup_id).unwrap();
        ctx.run_tiering_cycle();
        assert!(dir.path().join("warm/old.json").is_file());
        assert!(!dir.path().join("hot/old.json").exists());
        assert_eq!(
            ctx.tiering
                .migrations_in_state(TaskState::Completed)
                .len(),
            1
        );
    }

    #[test]
    fn test_repair_path_uses_backup_copy() {
        let dir = TempDir::new().unwrap();
        let ctx = EngineContext::new(config(dir.path())).unwrap();
        let hot = TierId::new_unchecked("hot");
        let good = b"{\"event\":\"click\"}";

        std::fs::write(dir.path().join("hot/a.json"), good).unwrap();
        ctx.registry.reconcile(&hot).unwrap();
        let backup_id = ctx
            .backup
            .create_policy(BackupPolicy::new(
                "hot-backup",
                BackupType::Full,
                vec![hot.clone()],
                dir.path().join("backups"),
            ))
            .unwrap();
        ctx.backup.execute_backup(backup_id).unwrap();

        // Corrupt the live object, detect it, repair from backup.
        std::fs::write(dir.path().join("hot/a.json"), b"bitrot").unwrap();
        ctx.registry.reconcile(&hot).unwrap();
        let check_id = ctx
            .integrity
            .create_check(
                tierstore_integrity::IntegrityCheck::new(
                    "a-sum",
                    tierstore_integrity::CheckKind::Checksum,
                    hot.clone(),
                )
                .with_path("a.json")
                .with_option_str(
                    "expected_sha256",
                    tierstore_common::checksum::sha256_hex(good),
                ),
            )
            .unwrap();
        ctx.integrity.run_integrity_check(check_id).unwrap();
        let issues = ctx.integrity.list_issues();
        assert_eq!(issues.len(), 1);

        let outcome = ctx.integrity.repair_issue(issues[0].id).unwrap();
        assert_eq!(outcome, tierstore_integrity::RepairOutcome::Succeeded);
        assert_eq!(
            std::fs::read(dir.path().join("hot/a.json")).unwrap(),
            good
        );
    }

    #[test]
    fn test_backup_cycle_runs_due_policies_only() {
        let dir = TempDir::new().unwrap();
        let ctx = EngineContext::new(config(dir.path())).unwrap();
        let hot = TierId::new_unchecked("hot");
        std::fs::write(dir.path().join("hot/a.json"), b"data").unwrap();
        ctx.registry.reconcile(&hot).unwrap();

        let id = ctx
            .backup
            .create_policy(BackupPolicy::new(
                "hot-backup",
                BackupType::Full,
                vec![hot],
                dir.path().join("backups"),
            ))
            .unwrap();

        ctx.run_backup_cycle();
        let first = ctx.backup.get_policy(id).unwrap().last_any;
        assert!(first.is_some());

        // Immediately re-running finds nothing due.
        ctx.run_backup_cycle();
        assert_eq!(ctx.backup.get_policy(id).unwrap().last_any, first);
    }
}

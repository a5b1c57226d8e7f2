//! Integrity checker
//!
//! Runs configured checks under per-check timeouts, opens issues for
//! non-valid findings, and repairs eligible issues at most once from a
//! verified backup copy.

use chrono::Utc;
use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Instant;
use tierstore_common::checksum::sha256_hex;
use tierstore_common::{CheckId, Error, IssueId, Result, TierId};
use tierstore_registry::{ConfigEntry, ConfigManager, Repository, TierRegistry};
use tracing::{debug, info, warn};

use crate::check::{CheckKind, CheckStatus, IntegrityCheck, IntegrityResult};
use crate::issue::{IntegrityIssue, RepairOutcome};
use crate::validators;

const SUBSYSTEM: &str = "integrity";

/// Source of known-good object content for repairs. Implemented over
/// the backup catalog; injected to keep this crate storage-agnostic.
pub trait RepairSource: Send + Sync {
    /// Recover an object's content, optionally pinned to an exact
    /// SHA-256. The returned bytes must already be verified.
    fn recover(&self, tier: &TierId, path: &Path, expected_sha256: Option<&str>)
        -> Result<Vec<u8>>;
}

/// Validates tier contents and tracks findings
pub struct IntegrityChecker {
    registry: Arc<TierRegistry>,
    checks: Arc<dyn Repository<CheckId, IntegrityCheck>>,
    issues: Arc<dyn Repository<IssueId, IntegrityIssue>>,
    results: Arc<dyn Repository<CheckId, IntegrityResult>>,
    repair: Option<Arc<dyn RepairSource>>,
    config: Option<Arc<ConfigManager>>,
}

impl IntegrityChecker {
    #[must_use]
    pub fn new(
        registry: Arc<TierRegistry>,
        checks: Arc<dyn Repository<CheckId, IntegrityCheck>>,
        issues: Arc<dyn Repository<IssueId, IntegrityIssue>>,
        results: Arc<dyn Repository<CheckId, IntegrityResult>>,
        repair: Option<Arc<dyn RepairSource>>,
        config: Option<Arc<ConfigManager>>,
    ) -> Self {
        Self {
            registry,
            checks,
            issues,
            results,
            repair,
            config,
        }
    }

    pub fn create_check(&self, check: IntegrityCheck) -> Result<CheckId> {
        check.validate()?;
        if !self.registry.has_tier(&check.tier) {
            return Err(Error::configuration(format!(
                "unknown tier in integrity check: {}",
                check.tier
            )));
        }
        let id = check.id;
        self.persist(&check)?;
        self.checks.put(id, check);
        debug!(check = %id, "created integrity check");
        Ok(id)
    }

    pub fn update_check(&self, id: CheckId, mutate: impl FnOnce(&mut IntegrityCheck)) -> Result<()> {
        let mut check = self.get_check(id)?;
        mutate(&mut check);
        check.id = id;
        check.updated_at = Utc::now();
        check.validate()?;
        self.persist(&check)?;
        self.checks.put(id, check);
        Ok(())
    }

    pub fn set_enabled(&self, id: CheckId, enabled: bool) -> Result<()> {
        self.update_check(id, |c| c.enabled = enabled)
    }

    pub fn delete_check(&self, id: CheckId) -> Result<()> {
        self.checks
            .remove(&id)
            .ok_or_else(|| Error::not_found("integrity check", id.to_string()))?;
        if let Some(config) = &self.config {
            config.remove(SUBSYSTEM, &id.to_string())?;
        }
        Ok(())
    }

    pub fn get_check(&self, id: CheckId) -> Result<IntegrityCheck> {
        self.checks
            .get(&id)
            .ok_or_else(|| Error::not_found("integrity check", id.to_string()))
    }

    #[must_use]
    pub fn list_checks(&self) -> Vec<IntegrityCheck> {
        self.checks.list()
    }

    pub fn get_issue(&self, id: IssueId) -> Result<IntegrityIssue> {
        self.issues
            .get(&id)
            .ok_or_else(|| Error::not_found("integrity issue", id.to_string()))
    }

    #[must_use]
    pub fn list_issues(&self) -> Vec<IntegrityIssue> {
        self.issues.list()
    }

    /// Last result per check, for status surfaces
    #[must_use]
    pub fn last_result(&self, id: CheckId) -> Option<IntegrityResult> {
        self.results.get(&id)
    }

    /// Restore checks persisted through the config manager (startup)
    pub fn load_persisted(&self) -> Result<usize> {
        let Some(config) = &self.config else {
            return Ok(0);
        };
        let mut loaded = 0;
        for entry in config.export(SUBSYSTEM).configurations {
            match serde_json::from_value::<IntegrityCheck>(entry.settings.clone()) {
                Ok(check) => {
                    self.checks.put(check.id, check);
                    loaded += 1;
                }
                Err(e) => warn!(config_id = %entry.config_id, error = %e,
                    "skipping unparseable integrity check"),
            }
        }
        Ok(loaded)
    }

    /// Run one check under its timeout. A non-valid finding opens an
    /// issue; a timeout or validator failure classifies as Unknown.
    pub fn run_integrity_check(&self, id: CheckId) -> Result<IntegrityResult> {
        let check = self.get_check(id)?;
        if !check.enabled {
            return Err(Error::disabled("integrity check", id.to_string()));
        }
        let start = Instant::now();
        let (status, details) = self.run_with_timeout(&check);

        let result = IntegrityResult {
            check_id: id,
            status,
            details: details.clone(),
            checked_at: Utc::now(),
            duration: start.elapsed(),
        };
        self.results.put(id, result.clone());

        if !status.is_valid() && status != CheckStatus::Unknown {
            let issue = IntegrityIssue::new(
                id,
                check.kind,
                check.tier.clone(),
                check.path.clone(),
                status,
                details,
            );
            info!(
                check = %id,
                issue = %issue.id,
                status = %status,
                severity = %issue.severity,
                repairable = issue.auto_repairable,
                "integrity check found an issue"
            );
            self.issues.put(issue.id, issue);
        }
        Ok(result)
    }

    /// Run every enabled check, isolating failures so one broken check
    /// never aborts the batch.
    pub fn run_all_checks(&self) -> Vec<IntegrityResult> {
        let mut out = Vec::new();
        for check in self.checks.list() {
            if !check.enabled {
                continue;
            }
            match self.run_integrity_check(check.id) {
                Ok(result) => out.push(result),
                Err(e) => {
                    warn!(check = %check.id, error = %e, "integrity check failed to run");
                    out.push(IntegrityResult {
                        check_id: check.id,
                        status: CheckStatus::Unknown,
                        details: e.to_string(),
                        checked_at: Utc::now(),
                        duration: std::time::Duration::ZERO,
                    });
                }
            }
        }
        out
    }

    /// Repair an issue by restoring a known-good copy over the damaged
    /// object. Runs at most once per issue; the recorded outcome is
    /// returned on repeat calls.
    pub fn repair_issue(&self, id: IssueId) -> Result<RepairOutcome> {
        let issue = self.get_issue(id)?;
        if issue.repair_outcome != RepairOutcome::NotAttempted {
            return Ok(issue.repair_outcome);
        }
        if !issue.auto_repairable {
            return Ok(RepairOutcome::NotAttempted);
        }
        let outcome = match self.attempt_repair(&issue) {
            Ok(()) => RepairOutcome::Succeeded,
            Err(e) => {
                warn!(issue = %id, error = %e, "repair failed");
                RepairOutcome::Failed
            }
        };
        self.issues.modify(&id, &mut |i| i.repair_outcome = outcome);
        info!(issue = %id, outcome = ?outcome, "repair attempted");
        Ok(outcome)
    }

    fn attempt_repair(&self, issue: &IntegrityIssue) -> Result<()> {
        let repair = self
            .repair
            .as_ref()
            .ok_or_else(|| Error::configuration("no repair source is configured"))?;
        let path = issue
            .path
            .as_deref()
            .ok_or_else(|| Error::configuration("tier-level issues are not repairable"))?;

        // A checksum check pins the expected content exactly.
        let expected_sha256 = self
            .checks
            .get(&issue.check_id)
            .filter(|c| c.kind == CheckKind::Checksum)
            .and_then(|c| c.option_str("expected_sha256").map(str::to_ascii_lowercase));

        let data = repair.recover(&issue.tier, path, expected_sha256.as_deref())?;
        if let Some(expected) = &expected_sha256 {
            let actual = sha256_hex(&data);
            if &actual != expected {
                return Err(Error::ChecksumMismatch {
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        let abs = self.registry.abs_path(&issue.tier, path)?;
        let old_size = std::fs::metadata(&abs).map(|m| m.len()).unwrap_or(0);
        let new_size = data.len() as u64;
        if new_size > old_size {
            self.registry.charge(&issue.tier, new_size - old_size)?;
        }

        let tmp = abs.with_file_name(format!(
            "{}.tmp",
            abs.file_name().map_or_else(
                || "repair".to_string(),
                |n| n.to_string_lossy().into_owned()
            )
        ));
        if let Some(parent) = abs.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&tmp, &data)?;
        std::fs::rename(&tmp, &abs)?;

        if old_size > new_size {
            self.registry.credit(&issue.tier, old_size - new_size)?;
        }
        Ok(())
    }

    /// Validators run on a worker thread; exceeding the check's timeout
    /// yields Unknown rather than blocking the batch.
    fn run_with_timeout(&self, check: &IntegrityCheck) -> (CheckStatus, String) {
        let (tx, rx) = mpsc::channel();
        let registry = Arc::clone(&self.registry);
        let check_clone = check.clone();
        std::thread::spawn(move || {
            let _ = tx.send(validators::run(&registry, &check_clone));
        });
        match rx.recv_timeout(check.timeout()) {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => (CheckStatus::Unknown, format!("validator failed: {e}")),
            Err(_) => (
                CheckStatus::Unknown,
                format!("check timed out after {}s", check.timeout_secs),
            ),
        }
    }

    fn persist(&self, check: &IntegrityCheck) -> Result<()> {
        if let Some(config) = &self.config {
            config.upsert(
                SUBSYSTEM,
                ConfigEntry::new(
                    check.id.to_string(),
                    "integrity_check",
                    check.name.clone(),
                    serde_json::to_value(check)?,
                    check.enabled,
                ),
            )?;
        }
        Ok(())
    }
}

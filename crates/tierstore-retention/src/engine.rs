//! Retention policy engine
//!
//! Applies retention policies to tier contents. Dispositions follow
//! write-before-delete ordering: for archive/move/compress the
//! destination artifact is durably written and verified before the
//! source object is removed, so a crash mid-operation never loses data.
//! Per-object failures are accumulated into the run result; partial
//! success is a valid outcome.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tierstore_common::checksum::{checksum_file, Checksum};
use tierstore_common::{Error, ObjectMeta, PolicyId, Result, TierId};
use tierstore_registry::{ConfigEntry, ConfigManager, Repository, TierRegistry};
use tracing::{debug, info, warn};

use crate::policy::{DispositionAction, RetentionPolicy};

const SUBSYSTEM: &str = "retention";
const COMPRESS_LEVEL: i32 = 3;

/// Outcome of one policy application
#[derive(Debug, Clone)]
pub struct RetentionRunResult {
    pub policy_id: PolicyId,
    pub records_processed: u64,
    pub records_retained: u64,
    pub records_deleted: u64,
    pub records_archived: u64,
    pub records_moved: u64,
    pub records_compressed: u64,
    pub bytes_freed: u64,
    pub errors: Vec<String>,
    pub duration: Duration,
}

impl RetentionRunResult {
    fn new(policy_id: PolicyId) -> Self {
        Self {
            policy_id,
            records_processed: 0,
            records_retained: 0,
            records_deleted: 0,
            records_archived: 0,
            records_moved: 0,
            records_compressed: 0,
            bytes_freed: 0,
            errors: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    /// Number of objects successfully disposed this run
    #[must_use]
    pub fn records_disposed(&self) -> u64 {
        self.records_deleted + self.records_archived + self.records_moved + self.records_compressed
    }
}

/// Policy-driven retention over tier contents
pub struct RetentionEngine {
    registry: Arc<TierRegistry>,
    policies: Arc<dyn Repository<PolicyId, RetentionPolicy>>,
    config: Option<Arc<ConfigManager>>,
    /// Policies referenced by an in-flight application; immutable while
    /// present here.
    in_flight: Mutex<HashSet<PolicyId>>,
}

impl RetentionEngine {
    #[must_use]
    pub fn new(
        registry: Arc<TierRegistry>,
        policies: Arc<dyn Repository<PolicyId, RetentionPolicy>>,
        config: Option<Arc<ConfigManager>>,
    ) -> Self {
        Self {
            registry,
            policies,
            config,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Create a policy. Validation fails closed; nothing is stored on
    /// error.
    pub fn create_policy(&self, policy: RetentionPolicy) -> Result<PolicyId> {
        policy.validate()?;
        if !self.registry.has_tier(&policy.tier) {
            return Err(Error::configuration(format!(
                "unknown tier in policy: {}",
                policy.tier
            )));
        }
        if let Some(target) = &policy.target_tier {
            if !self.registry.has_tier(target) {
                return Err(Error::configuration(format!(
                    "unknown target tier in policy: {target}"
                )));
            }
        }
        let id = policy.id;
        self.persist(&policy)?;
        self.policies.put(id, policy);
        debug!(policy = %id, "created retention policy");
        Ok(id)
    }

    /// Update a policy in place. Refused while the policy is referenced
    /// by an in-flight application.
    pub fn update_policy(
        &self,
        id: PolicyId,
        mutate: impl FnOnce(&mut RetentionPolicy),
    ) -> Result<()> {
        self.ensure_not_in_flight(id)?;
        let mut policy = self
            .policies
            .get(&id)
            .ok_or_else(|| Error::not_found("retention policy", id.to_string()))?;
        mutate(&mut policy);
        policy.id = id;
        policy.updated_at = chrono::Utc::now();
        policy.validate()?;
        self.persist(&policy)?;
        self.policies.put(id, policy);
        Ok(())
    }

    /// Enable or disable a policy
    pub fn set_enabled(&self, id: PolicyId, enabled: bool) -> Result<()> {
        self.update_policy(id, |p| p.enabled = enabled)
    }

    /// Delete a policy. Refused while referenced by an in-flight
    /// application.
    pub fn delete_policy(&self, id: PolicyId) -> Result<()> {
        self.ensure_not_in_flight(id)?;
        self.policies
            .remove(&id)
            .ok_or_else(|| Error::not_found("retention policy", id.to_string()))?;
        if let Some(config) = &self.config {
            config.remove(SUBSYSTEM, &id.to_string())?;
        }
        Ok(())
    }

    /// Fetch one policy
    pub fn get_policy(&self, id: PolicyId) -> Result<RetentionPolicy> {
        self.policies
            .get(&id)
            .ok_or_else(|| Error::not_found("retention policy", id.to_string()))
    }

    /// Snapshot all policies
    #[must_use]
    pub fn list_policies(&self) -> Vec<RetentionPolicy> {
        self.policies.list()
    }

    /// Restore policies persisted through the config manager (startup)
    pub fn load_persisted(&self) -> Result<usize> {
        let Some(config) = &self.config else {
            return Ok(0);
        };
        let doc = config.export(SUBSYSTEM);
        let mut loaded = 0;
        for entry in doc.configurations {
            match serde_json::from_value::<RetentionPolicy>(entry.settings.clone()) {
                Ok(policy) => {
                    self.policies.put(policy.id, policy);
                    loaded += 1;
                }
                Err(e) => warn!(config_id = %entry.config_id, error = %e,
                    "skipping unparseable retention policy"),
            }
        }
        Ok(loaded)
    }

    /// Apply one policy: snapshot matching objects, partition into
    /// retained/expired, dispose of expired objects. Idempotent against
    /// an unchanged tier; already-disposed objects are never recounted.
    pub fn apply_policy(&self, id: PolicyId) -> Result<RetentionRunResult> {
        let policy = self.get_policy(id)?;
        if !policy.enabled {
            return Err(Error::disabled("retention policy", id.to_string()));
        }
        if !self.in_flight.lock().insert(id) {
            return Err(Error::Transient(format!(
                "policy application already in progress: {id}"
            )));
        }
        let result = self.apply_inner(&policy);
        self.in_flight.lock().remove(&id);

        if let Ok(run) = &result {
            let disposed = run.records_disposed();
            let freed = run.bytes_freed;
            self.policies.modify(&id, &mut |p| {
                p.stats.runs += 1;
                p.stats.objects_disposed += disposed;
                p.stats.bytes_freed += freed;
                p.stats.last_run = Some(chrono::Utc::now());
            });
        }
        result
    }

    /// Run every enabled policy independently; one policy's failure never
    /// aborts the rest.
    pub fn apply_all_policies(&self) -> Vec<RetentionRunResult> {
        let mut results = Vec::new();
        for policy in self.policies.list() {
            if !policy.enabled {
                continue;
            }
            match self.apply_policy(policy.id) {
                Ok(run) => results.push(run),
                Err(e) => {
                    warn!(policy = %policy.id, error = %e, "retention policy run failed");
                    let mut run = RetentionRunResult::new(policy.id);
                    run.errors.push(e.to_string());
                    results.push(run);
                }
            }
        }
        results
    }

    fn apply_inner(&self, policy: &RetentionPolicy) -> Result<RetentionRunResult> {
        let start = Instant::now();
        let now = SystemTime::now();
        let mut run = RetentionRunResult::new(policy.id);

        // Consistent snapshot at invocation time.
        let snapshot: Vec<ObjectMeta> = self
            .registry
            .list_objects(&policy.tier)?
            .into_iter()
            .filter(|m| policy.selects(m))
            .collect();
        run.records_processed = snapshot.len() as u64;

        let expired = policy.select_expired(&snapshot, now);
        for meta in &expired {
            match self.dispose(policy, meta) {
                Ok(freed) => {
                    run.bytes_freed += freed;
                    match policy.action {
                        DispositionAction::Delete => run.records_deleted += 1,
                        DispositionAction::Archive => run.records_archived += 1,
                        DispositionAction::Move => run.records_moved += 1,
                        DispositionAction::Compress => run.records_compressed += 1,
                    }
                }
                Err(e) => run
                    .errors
                    .push(format!("{}: {e}", meta.path.display())),
            }
        }
        run.records_retained = run.records_processed - run.records_disposed();
        run.duration = start.elapsed();

        info!(
            policy = %policy.id,
            kind = %policy.kind,
            action = %policy.action,
            processed = run.records_processed,
            disposed = run.records_disposed(),
            bytes_freed = run.bytes_freed,
            errors = run.errors.len(),
            duration_ms = run.duration.as_millis() as u64,
            success = run.errors.is_empty(),
            "applied retention policy"
        );
        Ok(run)
    }

    /// Dispose of one expired object, returning bytes freed on the
    /// policy's tier.
    fn dispose(&self, policy: &RetentionPolicy, meta: &ObjectMeta) -> Result<u64> {
        let src_abs = self.registry.abs_path(&policy.tier, &meta.path)?;
        if !src_abs.is_file() {
            return Err(Error::Transient(format!(
                "source object vanished: {}",
                meta.path.display()
            )));
        }
        match policy.action {
            DispositionAction::Delete => {
                std::fs::remove_file(&src_abs)?;
                self.registry.credit(&policy.tier, meta.size)?;
                Ok(meta.size)
            }
            DispositionAction::Archive => {
                let target = policy
                    .target_tier
                    .clone()
                    .ok_or_else(|| Error::internal("archive disposition without target tier"))?;
                let compress = self.registry.config(&target)?.compression;
                self.relocate(policy, meta, &src_abs, &target, compress)
            }
            DispositionAction::Move => {
                let target = policy
                    .target_tier
                    .clone()
                    .ok_or_else(|| Error::internal("move disposition without target tier"))?;
                self.relocate(policy, meta, &src_abs, &target, false)
            }
            DispositionAction::Compress => self.compress_in_place(policy, meta, &src_abs),
        }
    }

    /// Copy an object into the target tier (optionally compressed),
    /// verify the written artifact, then remove the source.
    fn relocate(
        &self,
        policy: &RetentionPolicy,
        meta: &ObjectMeta,
        src_abs: &Path,
        target: &TierId,
        compress: bool,
    ) -> Result<u64> {
        let data = std::fs::read(src_abs)?;
        let src_sum = Checksum::compute_full(&data);

        let (out, dest_rel) = if compress {
            (
                zstd::encode_all(data.as_slice(), COMPRESS_LEVEL)
                    .map_err(|e| Error::internal(format!("zstd encode: {e}")))?,
                append_ext(&meta.path, "zst"),
            )
        } else {
            (data, meta.path.clone())
        };

        let dest_abs = self.registry.abs_path(target, &dest_rel)?;
        if let Some(parent) = dest_abs.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Reserve target capacity before writing anything.
        self.registry.charge(target, out.len() as u64)?;
        let tmp = tmp_path(&dest_abs);
        if let Err(e) = self.write_and_verify(&tmp, &out, &src_sum, compress) {
            let _ = std::fs::remove_file(&tmp);
            self.registry.credit(target, out.len() as u64)?;
            return Err(e);
        }
        std::fs::rename(&tmp, &dest_abs)?;

        // Destination is durable and verified; the source may go.
        std::fs::remove_file(src_abs)?;
        self.registry.credit(&policy.tier, meta.size)?;
        Ok(meta.size)
    }

    /// Replace an object with its zstd-compressed form in the same tier
    fn compress_in_place(
        &self,
        policy: &RetentionPolicy,
        meta: &ObjectMeta,
        src_abs: &Path,
    ) -> Result<u64> {
        if meta.extension().as_deref() == Some("zst") {
            // Already compressed; re-applying is a no-op.
            return Ok(0);
        }
        let data = std::fs::read(src_abs)?;
        let src_sum = Checksum::compute_full(&data);
        let out = zstd::encode_all(data.as_slice(), COMPRESS_LEVEL)
            .map_err(|e| Error::internal(format!("zstd encode: {e}")))?;
        if out.len() as u64 >= meta.size {
            debug!(path = %meta.path.display(), "compression would not shrink object, skipping");
            return Ok(0);
        }

        let dest_abs = self
            .registry
            .abs_path(&policy.tier, &append_ext(&meta.path, "zst"))?;
        self.registry.charge(&policy.tier, out.len() as u64)?;
        let tmp = tmp_path(&dest_abs);
        if let Err(e) = self.write_and_verify(&tmp, &out, &src_sum, true) {
            let _ = std::fs::remove_file(&tmp);
            self.registry.credit(&policy.tier, out.len() as u64)?;
            return Err(e);
        }
        std::fs::rename(&tmp, &dest_abs)?;

        std::fs::remove_file(src_abs)?;
        self.registry.credit(&policy.tier, meta.size)?;
        Ok(meta.size - out.len() as u64)
    }

    /// Write bytes to a temp path and verify the durable copy matches
    /// the source checksum before the caller commits it.
    fn write_and_verify(
        &self,
        tmp: &Path,
        out: &[u8],
        src_sum: &Checksum,
        compressed: bool,
    ) -> Result<()> {
        std::fs::write(tmp, out)?;
        let ok = if compressed {
            let written = std::fs::read(tmp)?;
            let decoded = zstd::decode_all(written.as_slice())
                .map_err(|e| Error::integrity(format!("zstd decode during verify: {e}")))?;
            src_sum.verify_full(&decoded)
        } else {
            checksum_file(tmp)? == *src_sum
        };
        if ok {
            Ok(())
        } else {
            Err(Error::ChecksumMismatch {
                expected: src_sum.sha256_hex().unwrap_or_default(),
                actual: "written artifact differs".to_string(),
            })
        }
    }

    fn ensure_not_in_flight(&self, id: PolicyId) -> Result<()> {
        if self.in_flight.lock().contains(&id) {
            return Err(Error::configuration(format!(
                "policy is referenced by an in-flight task: {id}"
            )));
        }
        Ok(())
    }

    fn persist(&self, policy: &RetentionPolicy) -> Result<()> {
        if let Some(config) = &self.config {
            config.upsert(
                SUBSYSTEM,
                ConfigEntry::new(
                    policy.id.to_string(),
                    "retention_policy",
                    policy.name.clone(),
                    serde_json::to_value(policy)?,
                    policy.enabled,
                ),
            )?;
        }
        Ok(())
    }
}

/// Append an extension after the existing one (`a.json` -> `a.json.zst`)
fn append_ext(path: &Path, ext: &str) -> PathBuf {
    let mut name = path.file_name().map_or_else(String::new, |n| {
        n.to_string_lossy().into_owned()
    });
    name.push('.');
    name.push_str(ext);
    path.with_file_name(name)
}

/// Sibling temp path for an in-flight write (`a.json` -> `a.json.tmp`)
fn tmp_path(path: &Path) -> PathBuf {
    append_ext(path, "tmp")
}

//! Archival engine
//!
//! Batches tier objects into archive files bounded by the policy's
//! per-file size budget, and retrieves them with checksum validation
//! before any byte reaches the extraction target.

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tierstore_common::{Error, PolicyId, Result, TaskId, TaskState, TierId};
use tierstore_registry::{config_store::write_atomic, ConfigEntry, ConfigManager, Repository, TierRegistry};
use tracing::{debug, info, warn};

use crate::envelope::{ArchiveEnvelope, ArchiveRecord};
use crate::policy::{ArchiveFormat, ArchivePolicy};

const SUBSYSTEM: &str = "archive";

/// Outcome of one archival run
#[derive(Debug, Clone)]
pub struct ArchiveResult {
    pub archive_id: TaskId,
    pub policy_id: PolicyId,
    pub state: TaskState,
    pub records_processed: u64,
    pub files_created: u64,
    /// Archive files written, in creation order
    pub files: Vec<PathBuf>,
    pub original_bytes: u64,
    pub archived_bytes: u64,
    /// `1 - archived/original`; negative when the format expands
    pub compression_ratio: f64,
    pub errors: Vec<String>,
    pub duration: Duration,
}

/// Outcome of one retrieval run
#[derive(Debug, Clone)]
pub struct RetrieveResult {
    pub records_extracted: u64,
    pub bytes_extracted: u64,
    pub duration: Duration,
}

/// Long-term export of tier contents into self-verifying archive files
pub struct ArchivalEngine {
    registry: Arc<TierRegistry>,
    policies: Arc<dyn Repository<PolicyId, ArchivePolicy>>,
    config: Option<Arc<ConfigManager>>,
}

impl ArchivalEngine {
    #[must_use]
    pub fn new(
        registry: Arc<TierRegistry>,
        policies: Arc<dyn Repository<PolicyId, ArchivePolicy>>,
        config: Option<Arc<ConfigManager>>,
    ) -> Self {
        Self {
            registry,
            policies,
            config,
        }
    }

    pub fn create_policy(&self, policy: ArchivePolicy) -> Result<PolicyId> {
        policy.validate()?;
        std::fs::create_dir_all(&policy.location)?;
        let id = policy.id;
        self.persist(&policy)?;
        self.policies.put(id, policy);
        debug!(policy = %id, "created archive policy");
        Ok(id)
    }

    pub fn update_policy(
        &self,
        id: PolicyId,
        mutate: impl FnOnce(&mut ArchivePolicy),
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

    pub fn delete_policy(&self, id: PolicyId) -> Result<()> {
        self.policies
            .remove(&id)
            .ok_or_else(|| Error::not_found("archive policy", id.to_string()))?;
        if let Some(config) = &self.config {
            config.remove(SUBSYSTEM, &id.to_string())?;
        }
        Ok(())
    }

    pub fn get_policy(&self, id: PolicyId) -> Result<ArchivePolicy> {
        self.policies
            .get(&id)
            .ok_or_else(|| Error::not_found("archive policy", id.to_string()))
    }

    #[must_use]
    pub fn list_policies(&self) -> Vec<ArchivePolicy> {
        self.policies.list()
    }

    /// Restore policies persisted through the config manager (startup)
    pub fn load_persisted(&self) -> Result<usize> {
        let Some(config) = &self.config else {
            return Ok(0);
        };
        let mut loaded = 0;
        for entry in config.export(SUBSYSTEM).configurations {
            match serde_json::from_value::<ArchivePolicy>(entry.settings.clone()) {
                Ok(policy) => {
                    self.policies.put(policy.id, policy);
                    loaded += 1;
                }
                Err(e) => warn!(config_id = %entry.config_id, error = %e,
                    "skipping unparseable archive policy"),
            }
        }
        Ok(loaded)
    }

    /// Archive objects from a tier. `paths` of `None` archives every
    /// object. Sources are exported, not removed. Per-object read
    /// failures are accumulated; an unwritable archive file fails the
    /// whole run.
    pub fn archive_data(
        &self,
        policy_id: PolicyId,
        tier: &TierId,
        paths: Option<&[PathBuf]>,
    ) -> Result<ArchiveResult> {
        let policy = self.get_policy(policy_id)?;
        if !policy.enabled {
            return Err(Error::disabled("archive policy", policy_id.to_string()));
        }
        let start = Instant::now();
        let archive_id = TaskId::new();

        let selected: Vec<PathBuf> = match paths {
            Some(wanted) => wanted.to_vec(),
            None => self
                .registry
                .list_objects(tier)?
                .into_iter()
                .map(|m| m.path)
                .collect(),
        };

        let mut errors = Vec::new();
        let mut records_processed = 0u64;
        let mut original_bytes = 0u64;
        let mut archived_bytes = 0u64;
        let mut files = Vec::new();

        let mut batch = ArchiveEnvelope::new(archive_id, policy_id);
        for path in &selected {
            let data = match self
                .registry
                .abs_path(tier, path)
                .and_then(|abs| std::fs::read(abs).map_err(Error::from))
            {
                Ok(data) => data,
                Err(e) => {
                    errors.push(format!("{}: {e}", path.display()));
                    continue;
                }
            };
            // Close the batch when the next record would push it past
            // the per-file budget; a batch always takes one record.
            let would_hold = batch.original_bytes() + data.len() as u64;
            if !batch.records.is_empty()
                && (would_hold > policy.max_file_bytes() || batch.records.len() >= policy.batch_size)
            {
                archived_bytes +=
                    self.flush_batch(&policy, archive_id, &batch, files.len(), &mut files)?;
                batch = ArchiveEnvelope::new(archive_id, policy_id);
            }
            original_bytes += data.len() as u64;
            records_processed += 1;
            batch.records.push(ArchiveRecord::new(path.clone(), &data));
        }
        if !batch.records.is_empty() {
            archived_bytes +=
                self.flush_batch(&policy, archive_id, &batch, files.len(), &mut files)?;
        }

        let result = ArchiveResult {
            archive_id,
            policy_id,
            state: if errors.is_empty() {
                TaskState::Completed
            } else {
                TaskState::Failed
            },
            records_processed,
            files_created: files.len() as u64,
            files,
            original_bytes,
            archived_bytes,
            compression_ratio: if original_bytes > 0 {
                1.0 - (archived_bytes as f64 / original_bytes as f64)
            } else {
                0.0
            },
            errors,
            duration: start.elapsed(),
        };
        info!(
            archive = %archive_id,
            policy = %policy_id,
            tier = %tier,
            records = result.records_processed,
            files = result.files_created,
            original_bytes = result.original_bytes,
            archived_bytes = result.archived_bytes,
            errors = result.errors.len(),
            duration_ms = result.duration.as_millis() as u64,
            success = result.state == TaskState::Completed,
            "archival finished"
        );
        Ok(result)
    }

    /// Extract an archive file into `target`, preserving record paths.
    /// Every embedded checksum is validated before anything is written,
    /// and files land via a staging dir + rename, so a corrupt archive
    /// leaves no partial output.
    pub fn retrieve_archive(
        &self,
        archive_path: &Path,
        target: &Path,
        decompress: bool,
    ) -> Result<RetrieveResult> {
        let start = Instant::now();
        let envelope = self.read_envelope(archive_path)?;
        envelope.verify_all()?;

        // Re-encoding without decompression honors the originating
        // policy's level; a since-deleted policy falls back to the
        // default.
        let level = self
            .policies
            .get(&envelope.policy_id)
            .map_or(ArchivePolicy::DEFAULT_COMPRESSION_LEVEL, |p| {
                p.compression_level
            });

        std::fs::create_dir_all(target)?;
        let staging = target.join(format!(".retrieve_{}.tmp", envelope.archive_id));
        std::fs::create_dir_all(&staging)?;

        let staged = (|| -> Result<Vec<(PathBuf, PathBuf, u64)>> {
            let mut staged = Vec::new();
            for record in &envelope.records {
                let data = record.decode_verified()?;
                let (rel, out) = if decompress {
                    (record.path.clone(), data)
                } else {
                    let compressed = zstd::encode_all(data.as_slice(), level)
                        .map_err(|e| Error::internal(format!("zstd encode: {e}")))?;
                    (append_ext(&record.path, "zst"), compressed)
                };
                let stage_path = staging.join(&rel);
                if let Some(parent) = stage_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&stage_path, &out)?;
                staged.push((stage_path, target.join(&rel), out.len() as u64));
            }
            Ok(staged)
        })();

        let staged = match staged {
            Ok(staged) => staged,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&staging);
                return Err(e);
            }
        };

        let mut records_extracted = 0;
        let mut bytes_extracted = 0;
        for (stage_path, dest, bytes) in staged {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::rename(&stage_path, &dest)?;
            records_extracted += 1;
            bytes_extracted += bytes;
        }
        std::fs::remove_dir_all(&staging)?;

        info!(
            archive = %archive_path.display(),
            records = records_extracted,
            bytes = bytes_extracted,
            "archive retrieved"
        );
        Ok(RetrieveResult {
            records_extracted,
            bytes_extracted,
            duration: start.elapsed(),
        })
    }

    /// List an archive's contents without extracting. Entries are
    /// `(path, original size)` pairs in archive order.
    pub fn list_archive(&self, archive_path: &Path) -> Result<Vec<(PathBuf, u64)>> {
        let envelope = self.read_envelope(archive_path)?;
        Ok(envelope
            .records
            .iter()
            .map(|r| (r.path.clone(), r.size))
            .collect())
    }

    fn read_envelope(&self, archive_path: &Path) -> Result<ArchiveEnvelope> {
        let name = archive_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let format = ArchiveFormat::from_file_name(&name).ok_or_else(|| {
            Error::configuration(format!("unrecognized archive file name: {name}"))
        })?;
        let raw = std::fs::read(archive_path)?;
        ArchiveEnvelope::decode(&raw, format)
    }

    /// Encode and atomically write one batch, returning its size
    fn flush_batch(
        &self,
        policy: &ArchivePolicy,
        archive_id: TaskId,
        batch: &ArchiveEnvelope,
        seq: usize,
        files: &mut Vec<PathBuf>,
    ) -> Result<u64> {
        let encoded = batch.encode(policy.format, policy.compression_level)?;
        let file = policy.location.join(format!(
            "archive_{}_{archive_id}_{seq:04}.{}",
            batch.created_at.format("%Y%m%d_%H%M%S"),
            policy.format.extension()
        ));
        write_atomic(&file, &encoded)?;
        debug!(file = %file.display(), records = batch.records.len(), "wrote archive file");
        files.push(file);
        Ok(encoded.len() as u64)
    }

    fn persist(&self, policy: &ArchivePolicy) -> Result<()> {
        if let Some(config) = &self.config {
            config.upsert(
                SUBSYSTEM,
                ConfigEntry::new(
                    policy.id.to_string(),
                    "archive_policy",
                    policy.name.clone(),
                    serde_json::to_value(policy)?,
                    policy.enabled,
                ),
            )?;
        }
        Ok(())
    }
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

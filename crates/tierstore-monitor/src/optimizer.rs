//! Storage optimizer
//!
//! Low-priority maintenance jobs over tier contents. Every job is
//! idempotent, runs under the shared task state machine, and honors a
//! cooperative cancellation token checked between objects, never
//! mid-object.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tierstore_common::{Result, TaskId, TaskState, TierId};
use tierstore_registry::TierRegistry;
use tracing::{debug, info};

const COMPRESS_LEVEL: i32 = 3;
const DEFAULT_COLD_AGE_DAYS: u64 = 7;

/// Maintenance job families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizationJob {
    /// Contiguous rewrite of every object
    Defragmentation,
    /// zstd-compress cold objects in place
    Compression,
    /// Rebuild the access-statistics index from disk
    IndexRebuild,
    /// Remove leftover temp files and empty directories
    SpaceReclamation,
    /// Remove retrieval staging directories
    CacheReclamation,
}

impl fmt::Display for OptimizationJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Defragmentation => "defragmentation",
            Self::Compression => "compression",
            Self::IndexRebuild => "index_rebuild",
            Self::SpaceReclamation => "space_reclamation",
            Self::CacheReclamation => "cache_reclamation",
        };
        write!(f, "{s}")
    }
}

/// Outcome of one maintenance job run
#[derive(Debug, Clone)]
pub struct OptimizationResult {
    pub task_id: TaskId,
    pub job: OptimizationJob,
    pub tier: TierId,
    pub state: TaskState,
    pub objects_processed: u64,
    pub bytes_freed: u64,
    pub errors: Vec<String>,
    pub duration: Duration,
}

/// Runs maintenance jobs against registered tiers
pub struct StorageOptimizer {
    registry: Arc<TierRegistry>,
    cancel: AtomicBool,
    /// Cold threshold for the compression job, in days
    pub cold_age_days: u64,
}

impl StorageOptimizer {
    #[must_use]
    pub fn new(registry: Arc<TierRegistry>) -> Self {
        Self {
            registry,
            cancel: AtomicBool::new(false),
            cold_age_days: DEFAULT_COLD_AGE_DAYS,
        }
    }

    /// Request cancellation of the job in flight. Observed between
    /// objects on the next boundary.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Run one job against one tier. Per-object failures accumulate;
    /// the job keeps going.
    pub fn run_job(&self, job: OptimizationJob, tier: &TierId) -> Result<OptimizationResult> {
        let task_id = TaskId::new();
        let start = Instant::now();
        let mut objects_processed = 0u64;
        let mut bytes_freed = 0u64;
        let mut errors = Vec::new();
        let mut cancelled = false;

        debug!(task = %task_id, job = %job, tier = %tier, "maintenance job starting");
        match job {
            OptimizationJob::Defragmentation => {
                for meta in self.registry.list_objects(tier)? {
                    if self.take_cancel() {
                        cancelled = true;
                        break;
                    }
                    match self.rewrite_contiguous(tier, &meta.path) {
                        Ok(()) => objects_processed += 1,
                        Err(e) => errors.push(format!("{}: {e}", meta.path.display())),
                    }
                }
            }
            OptimizationJob::Compression => {
                for meta in self.registry.list_objects(tier)? {
                    if self.take_cancel() {
                        cancelled = true;
                        break;
                    }
                    if meta.extension().as_deref() == Some("zst")
                        || meta.age_days(std::time::SystemTime::now()) < self.cold_age_days
                    {
                        continue;
                    }
                    match self.compress_in_place(tier, &meta.path) {
                        Ok(saved) => {
                            objects_processed += 1;
                            bytes_freed += saved;
                        }
                        Err(e) => errors.push(format!("{}: {e}", meta.path.display())),
                    }
                }
            }
            OptimizationJob::IndexRebuild => {
                objects_processed = self.registry.rebuild_access_index(tier)? as u64;
            }
            OptimizationJob::SpaceReclamation => {
                let root = self.registry.config(tier)?.root;
                let (removed, freed) = reclaim_dir(&root, &|name| name.ends_with(".tmp"))?;
                objects_processed = removed;
                bytes_freed = freed;
            }
            OptimizationJob::CacheReclamation => {
                let root = self.registry.config(tier)?.root;
                let (removed, freed) = reclaim_staging(&root)?;
                objects_processed = removed;
                bytes_freed = freed;
            }
        }

        let result = OptimizationResult {
            task_id,
            job,
            tier: tier.clone(),
            state: if cancelled {
                TaskState::Cancelled
            } else if errors.is_empty() {
                TaskState::Completed
            } else {
                TaskState::Failed
            },
            objects_processed,
            bytes_freed,
            errors,
            duration: start.elapsed(),
        };
        info!(
            task = %task_id,
            job = %job,
            tier = %tier,
            objects = result.objects_processed,
            bytes_freed = result.bytes_freed,
            errors = result.errors.len(),
            state = %result.state,
            "maintenance job finished"
        );
        Ok(result)
    }

    fn take_cancel(&self) -> bool {
        self.cancel.swap(false, Ordering::SeqCst)
    }

    /// Rewrite an object through a temp file so its content lands in
    /// freshly allocated, contiguous blocks. Usage is unchanged.
    fn rewrite_contiguous(&self, tier: &TierId, path: &Path) -> Result<()> {
        let abs = self.registry.abs_path(tier, path)?;
        let data = std::fs::read(&abs)?;
        let tmp = sibling_tmp(&abs);
        std::fs::write(&tmp, &data)?;
        std::fs::rename(&tmp, &abs)?;
        Ok(())
    }

    /// Compress one cold object to `<path>.zst`, keeping the original
    /// when compression does not shrink it. Returns bytes saved.
    fn compress_in_place(&self, tier: &TierId, path: &Path) -> Result<u64> {
        let abs = self.registry.abs_path(tier, path)?;
        let data = std::fs::read(&abs)?;
        let compressed = zstd::encode_all(data.as_slice(), COMPRESS_LEVEL)
            .map_err(|e| tierstore_common::Error::internal(format!("zstd encode: {e}")))?;
        if compressed.len() >= data.len() {
            return Ok(0);
        }
        let dest = abs.with_file_name(format!(
            "{}.zst",
            abs.file_name().map_or_else(
                || "object".to_string(),
                |n| n.to_string_lossy().into_owned()
            )
        ));
        let tmp = sibling_tmp(&dest);
        std::fs::write(&tmp, &compressed)?;
        std::fs::rename(&tmp, &dest)?;
        std::fs::remove_file(&abs)?;
        let saved = data.len() as u64 - compressed.len() as u64;
        self.registry.credit(tier, saved)?;
        Ok(saved)
    }
}

fn sibling_tmp(path: &Path) -> PathBuf {
    path.with_file_name(format!(
        "{}.tmp",
        path.file_name().map_or_else(
            || "work".to_string(),
            |n| n.to_string_lossy().into_owned()
        )
    ))
}

/// Remove files matching the predicate, then empty directories,
/// bottom-up. Returns (entries removed, bytes freed).
fn reclaim_dir(dir: &Path, matcher: &dyn Fn(&str) -> bool) -> Result<(u64, u64)> {
    let mut removed = 0;
    let mut freed = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if path.is_dir() {
            let (r, f) = reclaim_dir(&path, matcher)?;
            removed += r;
            freed += f;
            if std::fs::read_dir(&path)?.next().is_none() {
                std::fs::remove_dir(&path)?;
                removed += 1;
            }
        } else if matcher(&name) {
            freed += entry.metadata().map(|m| m.len()).unwrap_or(0);
            std::fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok((removed, freed))
}

/// Remove dot-prefixed staging directories left by interrupted
/// retrievals.
fn reclaim_staging(root: &Path) -> Result<(u64, u64)> {
    let mut removed = 0;
    let mut freed = 0;
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if path.is_dir() && name.starts_with('.') {
            freed += dir_size(&path)?;
            std::fs::remove_dir_all(&path)?;
            removed += 1;
        }
    }
    Ok((removed, freed))
}

fn dir_size(dir: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            total += dir_size(&path)?;
        } else {
            total += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;
    use tempfile::TempDir;
    use tierstore_common::config::TierConfig;
    use tierstore_common::TierKind;

    struct Fixture {
        _dir: TempDir,
        optimizer: StorageOptimizer,
        registry: Arc<TierRegistry>,
        cold: TierId,
        cold_root: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(TierRegistry::new());
        let cold = TierId::new_unchecked("cold");
        let cold_root = dir.path().join("cold");
        registry
            .register(TierConfig::new(
                cold.clone(),
                TierKind::Cold,
                cold_root.clone(),
                1 << 30,
            ))
            .unwrap();
        Fixture {
            _dir: dir,
            optimizer: StorageOptimizer::new(registry.clone()),
            registry,
            cold,
            cold_root,
        }
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
    fn test_compression_job_is_idempotent() {
        let fx = fixture();
        let payload = "event ".repeat(5_000);
        write_aged(&fx.cold_root.join("old.json"), payload.as_bytes(), 30);
        std::fs::write(fx.cold_root.join("young.json"), payload.as_bytes()).unwrap();
        fx.registry
            .charge(&fx.cold, 2 * payload.len() as u64)
            .unwrap();

        let first = fx
            .optimizer
            .run_job(OptimizationJob::Compression, &fx.cold)
            .unwrap();
        assert_eq!(first.state, TaskState::Completed);
        assert_eq!(first.objects_processed, 1);
        assert!(first.bytes_freed > 0);
        assert!(fx.cold_root.join("old.json.zst").is_file());
        assert!(!fx.cold_root.join("old.json").exists());
        assert!(fx.cold_root.join("young.json").is_file());
        assert_eq!(
            fx.registry.used(&fx.cold).unwrap(),
            2 * payload.len() as u64 - first.bytes_freed
        );

        // Second run finds nothing cold and uncompressed.
        let second = fx
            .optimizer
            .run_job(OptimizationJob::Compression, &fx.cold)
            .unwrap();
        assert_eq!(second.objects_processed, 0);
        assert_eq!(second.bytes_freed, 0);
    }

    #[test]
    fn test_defragmentation_preserves_content_and_usage() {
        let fx = fixture();
        std::fs::write(fx.cold_root.join("a.json"), b"alpha").unwrap();
        std::fs::write(fx.cold_root.join("b.json"), b"bravo").unwrap();
        fx.registry.charge(&fx.cold, 10).unwrap();

        let result = fx
            .optimizer
            .run_job(OptimizationJob::Defragmentation, &fx.cold)
            .unwrap();
        assert_eq!(result.state, TaskState::Completed);
        assert_eq!(result.objects_processed, 2);
        assert_eq!(std::fs::read(fx.cold_root.join("a.json")).unwrap(), b"alpha");
        assert_eq!(fx.registry.used(&fx.cold).unwrap(), 10);
    }

    #[test]
    fn test_space_and_cache_reclamation() {
        let fx = fixture();
        std::fs::write(fx.cold_root.join("keep.json"), b"keep").unwrap();
        std::fs::write(fx.cold_root.join("orphan.json.tmp"), b"leftover").unwrap();
        std::fs::create_dir_all(fx.cold_root.join("empty/nested")).unwrap();
        std::fs::create_dir_all(fx.cold_root.join(".retrieve_abc.tmp")).unwrap();
        std::fs::write(fx.cold_root.join(".retrieve_abc.tmp/partial"), b"half").unwrap();

        let space = fx
            .optimizer
            .run_job(OptimizationJob::SpaceReclamation, &fx.cold)
            .unwrap();
        assert!(space.objects_processed >= 3);
        assert_eq!(space.bytes_freed, 8);
        assert!(!fx.cold_root.join("orphan.json.tmp").exists());
        assert!(!fx.cold_root.join("empty").exists());
        assert!(fx.cold_root.join("keep.json").is_file());

        let cache = fx
            .optimizer
            .run_job(OptimizationJob::CacheReclamation, &fx.cold)
            .unwrap();
        assert_eq!(cache.objects_processed, 1);
        assert_eq!(cache.bytes_freed, 4);
        assert!(!fx.cold_root.join(".retrieve_abc.tmp").exists());
    }

    #[test]
    fn test_cancellation_between_objects() {
        let fx = fixture();
        let payload = "event ".repeat(5_000);
        write_aged(&fx.cold_root.join("a.json"), payload.as_bytes(), 30);
        write_aged(&fx.cold_root.join("b.json"), payload.as_bytes(), 30);

        fx.optimizer.request_cancel();
        let result = fx
            .optimizer
            .run_job(OptimizationJob::Compression, &fx.cold)
            .unwrap();
        assert_eq!(result.state, TaskState::Cancelled);
        assert_eq!(result.objects_processed, 0);
        assert!(fx.cold_root.join("a.json").is_file());
        assert!(fx.cold_root.join("b.json").is_file());
    }

    #[test]
    fn test_index_rebuild_counts_objects() {
        let fx = fixture();
        std::fs::write(fx.cold_root.join("a.json"), b"a").unwrap();
        std::fs::write(fx.cold_root.join("b.json"), b"b").unwrap();
        for _ in 0..3 {
            fx.registry.record_access(&fx.cold, Path::new("a.json"));
        }
        let result = fx
            .optimizer
            .run_job(OptimizationJob::IndexRebuild, &fx.cold)
            .unwrap();
        assert_eq!(result.state, TaskState::Completed);
        assert_eq!(fx.registry.access_count(&fx.cold, Path::new("a.json")), 3);
    }
}

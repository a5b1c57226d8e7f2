//! Tier registry: per-tier configuration and usage accounting
//!
//! The registry is bootstrapped once at startup and mutated only by the
//! migration executor / disposition code (usage) and the storage monitor
//! (telemetry); tiers are never deleted at runtime. The invariant
//! `used <= capacity` holds after every committed mutation; `charge`
//! fails closed with a capacity error instead of overflowing.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tierstore_common::config::TierConfig;
use tierstore_common::{Error, ObjectMeta, Result, TierId};
use tracing::{debug, warn};

struct TierState {
    config: TierConfig,
    used_bytes: u64,
}

/// Registry of storage tiers with usage accounting and object listing
pub struct TierRegistry {
    tiers: RwLock<BTreeMap<TierId, TierState>>,
    /// Access counts per (tier, relative path), fed by the read path and
    /// consumed by access-frequency tiering and the optimizer
    access: RwLock<HashMap<(TierId, PathBuf), u64>>,
}

impl TierRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tiers: RwLock::new(BTreeMap::new()),
            access: RwLock::new(HashMap::new()),
        }
    }

    /// Register a tier, creating its root directory. Usage starts from a
    /// scan of existing contents so restarts pick up where they left off.
    pub fn register(&self, config: TierConfig) -> Result<()> {
        if self.tiers.read().contains_key(&config.id) {
            return Err(Error::configuration(format!(
                "tier already registered: {}",
                config.id
            )));
        }
        std::fs::create_dir_all(&config.root)?;
        let used_bytes = scan_used_bytes(&config.root)?;
        debug!(tier = %config.id, used_bytes, "registered tier");
        self.tiers.write().insert(
            config.id.clone(),
            TierState { config, used_bytes },
        );
        Ok(())
    }

    /// Whether a tier is registered
    #[must_use]
    pub fn has_tier(&self, id: &TierId) -> bool {
        self.tiers.read().contains_key(id)
    }

    /// Fetch a tier's configuration
    pub fn config(&self, id: &TierId) -> Result<TierConfig> {
        self.tiers
            .read()
            .get(id)
            .map(|s| s.config.clone())
            .ok_or_else(|| Error::not_found("tier", id.to_string()))
    }

    /// Snapshot all tier configurations
    #[must_use]
    pub fn list(&self) -> Vec<TierConfig> {
        self.tiers.read().values().map(|s| s.config.clone()).collect()
    }

    /// Current used bytes for a tier
    pub fn used(&self, id: &TierId) -> Result<u64> {
        self.tiers
            .read()
            .get(id)
            .map(|s| s.used_bytes)
            .ok_or_else(|| Error::not_found("tier", id.to_string()))
    }

    /// Remaining capacity for a tier
    pub fn available(&self, id: &TierId) -> Result<u64> {
        self.tiers
            .read()
            .get(id)
            .map(|s| s.config.capacity_bytes.saturating_sub(s.used_bytes))
            .ok_or_else(|| Error::not_found("tier", id.to_string()))
    }

    /// Charge bytes against a tier's usage. Fails with a capacity error
    /// if the charge would exceed the tier's capacity; usage is unchanged
    /// on failure.
    pub fn charge(&self, id: &TierId, bytes: u64) -> Result<()> {
        let mut tiers = self.tiers.write();
        let state = tiers
            .get_mut(id)
            .ok_or_else(|| Error::not_found("tier", id.to_string()))?;
        let available = state.config.capacity_bytes.saturating_sub(state.used_bytes);
        if bytes > available {
            return Err(Error::Capacity {
                tier: id.to_string(),
                required: bytes,
                available,
            });
        }
        state.used_bytes += bytes;
        Ok(())
    }

    /// Credit bytes back to a tier (saturating at zero)
    pub fn credit(&self, id: &TierId, bytes: u64) -> Result<()> {
        let mut tiers = self.tiers.write();
        let state = tiers
            .get_mut(id)
            .ok_or_else(|| Error::not_found("tier", id.to_string()))?;
        state.used_bytes = state.used_bytes.saturating_sub(bytes);
        Ok(())
    }

    /// Recompute a tier's usage from its actual contents. Recovers the
    /// usage counter after a crash between a copy-confirm and the counter
    /// update. Returns the signed correction that was applied.
    pub fn reconcile(&self, id: &TierId) -> Result<i64> {
        let root = self.config(id)?.root;
        // Walk outside the lock; long scans must not block other readers.
        let actual = scan_used_bytes(&root)?;
        let mut tiers = self.tiers.write();
        let state = tiers
            .get_mut(id)
            .ok_or_else(|| Error::not_found("tier", id.to_string()))?;
        let delta = actual as i64 - state.used_bytes as i64;
        if delta != 0 {
            warn!(tier = %id, delta, "reconciled tier usage");
        }
        state.used_bytes = actual;
        Ok(delta)
    }

    /// List objects in a tier as metadata records, paths relative to the
    /// tier root. In-flight temp files (`*.tmp`) and hidden files are
    /// skipped.
    pub fn list_objects(&self, id: &TierId) -> Result<Vec<ObjectMeta>> {
        let root = self.config(id)?.root;
        let mut out = Vec::new();
        walk_objects(&root, &root, &mut out)?;
        let access = self.access.read();
        for meta in &mut out {
            meta.access_count = access
                .get(&(id.clone(), meta.path.clone()))
                .copied()
                .unwrap_or(0);
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    /// Absolute path of an object within a tier
    pub fn abs_path(&self, id: &TierId, rel: &Path) -> Result<PathBuf> {
        Ok(self.config(id)?.root.join(rel))
    }

    /// Record one access to an object (read path instrumentation)
    pub fn record_access(&self, id: &TierId, rel: &Path) {
        *self
            .access
            .write()
            .entry((id.clone(), rel.to_path_buf()))
            .or_insert(0) += 1;
    }

    /// Access count recorded for an object since the last index rebuild
    #[must_use]
    pub fn access_count(&self, id: &TierId, rel: &Path) -> u64 {
        self.access
            .read()
            .get(&(id.clone(), rel.to_path_buf()))
            .copied()
            .unwrap_or(0)
    }

    /// Drop access entries for a tier that no longer resolve to an
    /// existing object; returns the number of entries removed. Used by
    /// the optimizer's index rebuild job.
    pub fn rebuild_access_index(&self, id: &TierId) -> Result<usize> {
        let root = self.config(id)?.root;
        let mut access = self.access.write();
        let before = access.len();
        access.retain(|(tier, rel), _| tier != id || root.join(rel).is_file());
        Ok(before - access.len())
    }
}

impl Default for TierRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Sum of file sizes under a directory, skipping temp files
fn scan_used_bytes(root: &Path) -> Result<u64> {
    let mut objects = Vec::new();
    walk_objects(root, root, &mut objects)?;
    Ok(objects.iter().map(|o| o.size).sum())
}

fn walk_objects(root: &Path, dir: &Path, out: &mut Vec<ObjectMeta>) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') {
            continue;
        }
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk_objects(root, &path, out)?;
        } else if file_type.is_file() {
            if name.ends_with(".tmp") {
                continue;
            }
            let metadata = entry.metadata()?;
            let rel = path
                .strip_prefix(root)
                .map_err(|e| Error::internal(e.to_string()))?
                .to_path_buf();
            out.push(ObjectMeta {
                path: rel,
                size: metadata.len(),
                modified: metadata.modified()?,
                access_count: 0,
            });
        }
    }
    Ok(())
}

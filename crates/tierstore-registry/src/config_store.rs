//! Versioned configuration document store
//!
//! Every subsystem persists its policy/rule configuration as one
//! versioned document. Documents are written atomically (temp file then
//! rename) so a crash mid-write never corrupts the stored copy, and the
//! full document can be exported/imported for operator workflows.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tierstore_common::{Error, Result};
use tracing::{debug, info};

/// One configuration record inside a subsystem document
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub config_id: String,
    pub config_type: String,
    pub name: String,
    pub settings: serde_json::Value,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u32,
}

impl ConfigEntry {
    /// Create a fresh entry at version 1
    #[must_use]
    pub fn new(
        config_id: impl Into<String>,
        config_type: impl Into<String>,
        name: impl Into<String>,
        settings: serde_json::Value,
        enabled: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            config_id: config_id.into(),
            config_type: config_type.into(),
            name: name.into(),
            settings,
            enabled,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }
}

/// Versioned configuration document, one per subsystem
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigDocument {
    pub version: u32,
    pub last_updated: DateTime<Utc>,
    pub configurations: Vec<ConfigEntry>,
}

impl Default for ConfigDocument {
    fn default() -> Self {
        Self {
            version: 0,
            last_updated: Utc::now(),
            configurations: Vec::new(),
        }
    }
}

/// Durable store of per-subsystem configuration documents
pub struct ConfigManager {
    dir: PathBuf,
    docs: RwLock<BTreeMap<String, ConfigDocument>>,
}

impl ConfigManager {
    /// Open the store, loading any documents already on disk
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let mut docs = BTreeMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "json") {
                let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().into_owned())
                else {
                    continue;
                };
                let raw = std::fs::read_to_string(&path)?;
                let doc: ConfigDocument = serde_json::from_str(&raw)?;
                debug!(subsystem = %stem, version = doc.version, "loaded config document");
                docs.insert(stem, doc);
            }
        }
        Ok(Self {
            dir,
            docs: RwLock::new(docs),
        })
    }

    /// Insert or replace one entry in a subsystem's document. Replacing
    /// bumps the entry version and preserves its creation time.
    pub fn upsert(&self, subsystem: &str, mut entry: ConfigEntry) -> Result<()> {
        let doc = {
            let mut docs = self.docs.write();
            let doc = docs.entry(subsystem.to_string()).or_default();
            if let Some(existing) = doc
                .configurations
                .iter_mut()
                .find(|e| e.config_id == entry.config_id)
            {
                entry.created_at = existing.created_at;
                entry.version = existing.version + 1;
                entry.updated_at = Utc::now();
                *existing = entry;
            } else {
                doc.configurations.push(entry);
            }
            doc.version += 1;
            doc.last_updated = Utc::now();
            doc.clone()
        };
        self.persist(subsystem, &doc)
    }

    /// Remove one entry; returns whether it existed
    pub fn remove(&self, subsystem: &str, config_id: &str) -> Result<bool> {
        let doc = {
            let mut docs = self.docs.write();
            let Some(doc) = docs.get_mut(subsystem) else {
                return Ok(false);
            };
            let before = doc.configurations.len();
            doc.configurations.retain(|e| e.config_id != config_id);
            if doc.configurations.len() == before {
                return Ok(false);
            }
            doc.version += 1;
            doc.last_updated = Utc::now();
            doc.clone()
        };
        self.persist(subsystem, &doc)?;
        Ok(true)
    }

    /// Fetch one entry
    #[must_use]
    pub fn get(&self, subsystem: &str, config_id: &str) -> Option<ConfigEntry> {
        self.docs
            .read()
            .get(subsystem)?
            .configurations
            .iter()
            .find(|e| e.config_id == config_id)
            .cloned()
    }

    /// Export a subsystem's full document (empty document if the
    /// subsystem has never been written)
    #[must_use]
    pub fn export(&self, subsystem: &str) -> ConfigDocument {
        self.docs.read().get(subsystem).cloned().unwrap_or_default()
    }

    /// Import a document, replacing the subsystem's configuration
    /// wholesale. The stored version never moves backwards.
    pub fn import(&self, subsystem: &str, mut doc: ConfigDocument) -> Result<()> {
        let doc = {
            let mut docs = self.docs.write();
            let current_version = docs.get(subsystem).map_or(0, |d| d.version);
            doc.version = doc.version.max(current_version + 1);
            doc.last_updated = Utc::now();
            docs.insert(subsystem.to_string(), doc.clone());
            doc
        };
        info!(subsystem, version = doc.version, entries = doc.configurations.len(),
            "imported config document");
        self.persist(subsystem, &doc)
    }

    fn doc_path(&self, subsystem: &str) -> PathBuf {
        self.dir.join(format!("{subsystem}.json"))
    }

    fn persist(&self, subsystem: &str, doc: &ConfigDocument) -> Result<()> {
        let path = self.doc_path(subsystem);
        write_atomic(&path, &serde_json::to_vec_pretty(doc)?)
    }
}

/// Write a file via temp-then-rename so readers never see a partial copy
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path).map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(id: &str, enabled: bool) -> ConfigEntry {
        ConfigEntry::new(
            id,
            "retention_policy",
            format!("policy {id}"),
            serde_json::json!({"retention_days": 7}),
            enabled,
        )
    }

    #[test]
    fn test_upsert_bumps_versions() {
        let dir = tempdir().unwrap();
        let manager = ConfigManager::open(dir.path()).unwrap();

        manager.upsert("retention", entry("p1", true)).unwrap();
        manager.upsert("retention", entry("p1", false)).unwrap();

        let stored = manager.get("retention", "p1").unwrap();
        assert_eq!(stored.version, 2);
        assert!(!stored.enabled);
        assert_eq!(manager.export("retention").version, 2);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        {
            let manager = ConfigManager::open(dir.path()).unwrap();
            manager.upsert("tiering", entry("r1", true)).unwrap();
        }
        let reopened = ConfigManager::open(dir.path()).unwrap();
        assert!(reopened.get("tiering", "r1").is_some());
        assert_eq!(reopened.export("tiering").version, 1);
    }

    #[test]
    fn test_remove() {
        let dir = tempdir().unwrap();
        let manager = ConfigManager::open(dir.path()).unwrap();
        manager.upsert("backup", entry("b1", true)).unwrap();

        assert!(manager.remove("backup", "b1").unwrap());
        assert!(!manager.remove("backup", "b1").unwrap());
        assert!(manager.get("backup", "b1").is_none());
    }

    #[test]
    fn test_import_never_regresses_version() {
        let dir = tempdir().unwrap();
        let manager = ConfigManager::open(dir.path()).unwrap();
        for i in 0..5 {
            manager.upsert("retention", entry(&format!("p{i}"), true)).unwrap();
        }

        let mut doc = ConfigDocument::default();
        doc.configurations.push(entry("imported", true));
        doc.version = 1; // stale export
        manager.import("retention", doc).unwrap();

        let exported = manager.export("retention");
        assert_eq!(exported.configurations.len(), 1);
        assert!(exported.version >= 6);
    }
}

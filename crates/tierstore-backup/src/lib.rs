//! TierStore Backup - backup and recovery engines
//!
//! Full/incremental/differential/snapshot backups with self-describing
//! manifests, post-write verification, oldest-first pruning with a
//! minimum-retained floor, and manifest-verified restoration.

pub mod catalog;
pub mod engine;
pub mod manifest;
pub mod policy;
pub mod recovery;

pub use catalog::BackupCatalog;
pub use engine::{BackupEngine, BackupResult, PruneResult};
pub use manifest::{BackupManifest, ManifestEntry};
pub use policy::{BackupPolicy, BackupType};
pub use recovery::{RecoveryEngine, RestoreResult};

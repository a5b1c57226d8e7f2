//! TierStore Registry - shared state for the lifecycle engine
//!
//! Holds the tier registry (per-tier configuration plus usage
//! accounting), the generic repository abstraction used by every
//! subsystem for its policies/rules/tasks, and the versioned
//! configuration document store.

pub mod config_store;
pub mod repository;
pub mod tiers;

pub use config_store::{ConfigDocument, ConfigEntry, ConfigManager};
pub use repository::{MemoryRepository, Repository};
pub use tiers::TierRegistry;

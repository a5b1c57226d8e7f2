//! TierStore Tiering - rule evaluation and data migration
//!
//! Evaluates condition-based tiering rules against tier contents,
//! producing pending migrations, and executes those migrations with
//! verify-before-delete semantics and exact usage accounting.

pub mod engine;
pub mod executor;
pub mod migration;
pub mod rule;

pub use engine::TieringEngine;
pub use executor::{AlertSink, DurabilityGuard, MigrationExecutor};
pub use migration::{DataMigration, RequeueReason};
pub use rule::{RuleKind, TieringRule};

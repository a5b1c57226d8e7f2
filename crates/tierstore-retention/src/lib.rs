//! TierStore Retention - policy-driven data disposal
//!
//! Evaluates time/size/count/event-type/severity-based retention
//! policies against tier contents and disposes of expired objects
//! (delete/archive/compress/move) with mandatory write-before-delete
//! ordering.

pub mod engine;
pub mod policy;

pub use engine::{RetentionEngine, RetentionRunResult};
pub use policy::{DispositionAction, PolicyFilter, PolicyKind, PolicyStats, RetentionPolicy};

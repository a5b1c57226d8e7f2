//! TierStore Integrity - data validation, issue tracking, and repair
//!
//! Eight validator families (checksum, hash, size, format, schema,
//! consistency, reference, duplicate) run against real tier contents
//! under per-check timeouts. Non-valid outcomes open issues with
//! severity derived from the finding; deterministically-recoverable
//! issues can be repaired once from a verified backup copy.

pub mod check;
pub mod engine;
pub mod issue;
mod validators;

pub use check::{CheckKind, CheckStatus, IntegrityCheck, IntegrityResult};
pub use engine::{IntegrityChecker, RepairSource};
pub use issue::{IntegrityIssue, RepairOutcome};

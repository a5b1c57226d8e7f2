//! TierStore Archive - long-term compressed export and retrieval
//!
//! Objects are batched into self-verifying archive files (JSON or CSV
//! envelopes, plain or zstd) with per-record checksums. Retrieval
//! validates every embedded checksum before extraction and never
//! leaves partially-extracted output.

pub mod engine;
pub mod envelope;
pub mod policy;

pub use engine::{ArchivalEngine, ArchiveResult, RetrieveResult};
pub use envelope::{ArchiveEnvelope, ArchiveRecord};
pub use policy::{ArchiveFormat, ArchivePolicy};

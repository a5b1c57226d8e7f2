//! TierStore Common - Shared types and utilities
//!
//! This crate provides common types, error definitions, checksums, and
//! configuration structures used across all TierStore components.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::{Checksum, ChecksumCalculator};
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use types::*;

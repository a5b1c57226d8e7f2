//! Checksum utilities for TierStore
//!
//! Provides multi-algorithm checksum calculation and verification for
//! data integrity: CRC32C for fast inline checks, xxHash64 for duplicate
//! comparison, SHA-256 for verification-grade content comparison.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Checksum values computed for one object
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    /// CRC32C checksum (fast, for inline verification)
    pub crc32c: u32,
    /// xxHash64 (fast, for duplicate detection)
    pub xxhash64: u64,
    /// SHA-256 hash (optional, for verification-grade comparison)
    pub sha256: Option<[u8; 32]>,
}

impl Checksum {
    /// Compute checksum from data (without SHA-256)
    #[must_use]
    pub fn compute_fast(data: &[u8]) -> Self {
        Self {
            crc32c: crc32c::crc32c(data),
            xxhash64: xxhash_rust::xxh64::xxh64(data, 0),
            sha256: None,
        }
    }

    /// Compute checksum from data (with SHA-256)
    #[must_use]
    pub fn compute_full(data: &[u8]) -> Self {
        Self {
            crc32c: crc32c::crc32c(data),
            xxhash64: xxhash_rust::xxh64::xxh64(data, 0),
            sha256: Some(Sha256::digest(data).into()),
        }
    }

    /// Verify data against this checksum (fast check using CRC32C)
    #[must_use]
    pub fn verify_fast(&self, data: &[u8]) -> bool {
        crc32c::crc32c(data) == self.crc32c
    }

    /// Verify data against this checksum (full check)
    #[must_use]
    pub fn verify_full(&self, data: &[u8]) -> bool {
        if !self.verify_fast(data) {
            return false;
        }
        if xxhash_rust::xxh64::xxh64(data, 0) != self.xxhash64 {
            return false;
        }
        if let Some(expected) = &self.sha256 {
            let actual: [u8; 32] = Sha256::digest(data).into();
            if &actual != expected {
                return false;
            }
        }
        true
    }

    /// SHA-256 digest rendered as lowercase hex, if present
    #[must_use]
    pub fn sha256_hex(&self) -> Option<String> {
        self.sha256.as_ref().map(hex::encode)
    }
}

/// Streaming checksum calculator
pub struct ChecksumCalculator {
    crc32c: u32,
    xxhash_state: xxhash_rust::xxh64::Xxh64,
    sha256: Option<Sha256>,
}

impl ChecksumCalculator {
    /// Create a new calculator (without SHA-256)
    #[must_use]
    pub fn new() -> Self {
        Self {
            crc32c: 0,
            xxhash_state: xxhash_rust::xxh64::Xxh64::new(0),
            sha256: None,
        }
    }

    /// Create a new calculator with SHA-256
    #[must_use]
    pub fn with_sha256() -> Self {
        Self {
            crc32c: 0,
            xxhash_state: xxhash_rust::xxh64::Xxh64::new(0),
            sha256: Some(Sha256::new()),
        }
    }

    /// Update the calculator with more data
    pub fn update(&mut self, data: &[u8]) {
        self.crc32c = crc32c::crc32c_append(self.crc32c, data);
        self.xxhash_state.update(data);
        if let Some(ref mut sha256) = self.sha256 {
            sha256.update(data);
        }
    }

    /// Finalize and return the computed checksum
    #[must_use]
    pub fn finalize(self) -> Checksum {
        Checksum {
            crc32c: self.crc32c,
            xxhash64: self.xxhash_state.digest(),
            sha256: self.sha256.map(|h| h.finalize().into()),
        }
    }
}

impl Default for ChecksumCalculator {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute a full checksum of a file's contents by streaming it
pub fn checksum_file(path: impl AsRef<Path>) -> Result<Checksum> {
    let mut file = std::fs::File::open(path)?;
    let mut calc = ChecksumCalculator::with_sha256();
    let mut buf = vec![0u8; 256 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        calc.update(&buf[..n]);
    }
    Ok(calc.finalize())
}

/// Quick CRC32C computation
#[inline]
#[must_use]
pub fn compute_crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// SHA-256 of a byte slice, rendered as lowercase hex
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_checksum_compute_and_verify() {
        let data = b"telemetry batch 0001";
        let checksum = Checksum::compute_full(data);
        assert!(checksum.verify_fast(data));
        assert!(checksum.verify_full(data));
        assert!(checksum.sha256.is_some());

        let corrupted = b"telemetry batch 0002";
        assert!(!checksum.verify_fast(corrupted));
        assert!(!checksum.verify_full(corrupted));
    }

    #[test]
    fn test_streaming_matches_oneshot() {
        let data = b"hello, tiered world!";
        let expected = Checksum::compute_full(data);

        let mut calc = ChecksumCalculator::with_sha256();
        calc.update(b"hello, ");
        calc.update(b"tiered world!");
        assert_eq!(calc.finalize(), expected);
    }

    #[test]
    fn test_checksum_file_matches_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obj.bin");
        let data: Vec<u8> = (0..100_000u32).flat_map(u32::to_le_bytes).collect();
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&data)
            .unwrap();

        let from_file = checksum_file(&path).unwrap();
        assert_eq!(from_file, Checksum::compute_full(&data));
    }

    #[test]
    fn test_sha256_hex() {
        // Known digest of the empty string
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}

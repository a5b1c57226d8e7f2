//! Archive policy model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tierstore_common::{Error, PolicyId, Result};

/// On-disk representation of an archive file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveFormat {
    Json,
    JsonZstd,
    Csv,
    CsvZstd,
}

impl ArchiveFormat {
    #[must_use]
    pub const fn is_compressed(self) -> bool {
        matches!(self, Self::JsonZstd | Self::CsvZstd)
    }

    /// File extension including the compression suffix
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::JsonZstd => "json.zst",
            Self::Csv => "csv",
            Self::CsvZstd => "csv.zst",
        }
    }

    /// Infer the format from an archive file name
    #[must_use]
    pub fn from_file_name(name: &str) -> Option<Self> {
        if name.ends_with(".json.zst") {
            Some(Self::JsonZstd)
        } else if name.ends_with(".csv.zst") {
            Some(Self::CsvZstd)
        } else if name.ends_with(".json") {
            Some(Self::Json)
        } else if name.ends_with(".csv") {
            Some(Self::Csv)
        } else {
            None
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::JsonZstd => write!(f, "json+zstd"),
            Self::Csv => write!(f, "csv"),
            Self::CsvZstd => write!(f, "csv+zstd"),
        }
    }
}

/// Configuration for one archival job family
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivePolicy {
    pub id: PolicyId,
    pub name: String,
    pub format: ArchiveFormat,
    /// Soft cap on records per archive file
    pub batch_size: usize,
    /// A file closes when the next record's original bytes would push
    /// it past this bound; a file always accepts at least one record.
    pub max_file_size_mb: u64,
    /// zstd level for compressed formats
    pub compression_level: i32,
    /// Directory receiving the archive files
    pub location: PathBuf,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ArchivePolicy {
    pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

    #[must_use]
    pub fn new(name: impl Into<String>, format: ArchiveFormat, location: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id: PolicyId::new(),
            name: name.into(),
            format,
            batch_size: 10_000,
            max_file_size_mb: 64,
            compression_level: Self::DEFAULT_COMPRESSION_LEVEL,
            location,
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.location.as_os_str().is_empty() {
            return Err(Error::configuration(
                "archive policy requires an archive location",
            ));
        }
        if self.batch_size == 0 {
            return Err(Error::configuration(
                "archive policy batch_size must be at least 1",
            ));
        }
        if self.max_file_size_mb == 0 {
            return Err(Error::configuration(
                "archive policy max_file_size_mb must be at least 1",
            ));
        }
        if !(1..=19).contains(&self.compression_level) {
            return Err(Error::configuration(
                "archive policy compression_level must be in 1..=19",
            ));
        }
        Ok(())
    }

    /// Per-file budget of original bytes
    #[must_use]
    pub const fn max_file_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }
}

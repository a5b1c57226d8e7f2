//! Integrity check model
//!
//! Severity derives from the finding: corrupted content is critical,
//! invalid content is an error, everything else is a warning. A
//! checksum mismatch is classified as invalid content (the stored
//! bytes are not the expected bytes) and therefore reports at error
//! severity, not warning.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tierstore_common::{CheckId, Error, Result, Severity, TierId};

/// Validator family a check dispatches to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    /// Compare a file's SHA-256 against an expected digest
    Checksum,
    /// Compare a file's digest under a chosen algorithm
    Hash,
    /// Bound a file's size
    Size,
    /// Validate that content parses per its extension
    Format,
    /// Require fields in a JSON document
    Schema,
    /// Compare a tier's recorded usage against its disk contents
    Consistency,
    /// Require referenced paths to exist in the tier
    Reference,
    /// Scan a tier for duplicate content
    Duplicate,
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Checksum => "checksum",
            Self::Hash => "hash",
            Self::Size => "size",
            Self::Format => "format",
            Self::Schema => "schema",
            Self::Consistency => "consistency",
            Self::Reference => "reference",
            Self::Duplicate => "duplicate",
        };
        write!(f, "{s}")
    }
}

/// Outcome classification of one check run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Valid,
    Invalid,
    Corrupted,
    Missing,
    Inconsistent,
    ChecksumMismatch,
    /// The check could not be completed (timeout, validator error)
    Unknown,
}

impl CheckStatus {
    #[must_use]
    pub const fn is_valid(self) -> bool {
        matches!(self, Self::Valid)
    }

    /// Issue severity implied by a non-valid finding
    #[must_use]
    pub const fn severity(self) -> Severity {
        match self {
            Self::Corrupted => Severity::Critical,
            Self::Invalid | Self::ChecksumMismatch => Severity::Error,
            _ => Severity::Warning,
        }
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::Corrupted => "corrupted",
            Self::Missing => "missing",
            Self::Inconsistent => "inconsistent",
            Self::ChecksumMismatch => "checksum_mismatch",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// One configured integrity check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityCheck {
    pub id: CheckId,
    pub name: String,
    pub kind: CheckKind,
    pub tier: TierId,
    /// Target object; `None` for tier-level checks
    pub path: Option<PathBuf>,
    /// Kind-specific options, validated by `validate`
    pub options: BTreeMap<String, serde_json::Value>,
    pub timeout_secs: u64,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IntegrityCheck {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: CheckKind, tier: TierId) -> Self {
        let now = Utc::now();
        Self {
            id: CheckId::new(),
            name: name.into(),
            kind,
            tier,
            path: None,
            options: BTreeMap::new(),
            timeout_secs: 30,
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_option_str(mut self, key: &str, value: impl Into<String>) -> Self {
        self.options
            .insert(key.to_string(), serde_json::Value::String(value.into()));
        self
    }

    #[must_use]
    pub fn with_option_u64(mut self, key: &str, value: u64) -> Self {
        self.options.insert(key.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn with_option_strings(mut self, key: &str, values: &[&str]) -> Self {
        self.options.insert(
            key.to_string(),
            serde_json::Value::Array(
                values
                    .iter()
                    .map(|v| serde_json::Value::String((*v).to_string()))
                    .collect(),
            ),
        );
        self
    }

    pub(crate) fn option_u64(&self, key: &str) -> Option<u64> {
        self.options.get(key).and_then(serde_json::Value::as_u64)
    }

    pub(crate) fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(serde_json::Value::as_str)
    }

    pub(crate) fn option_strings(&self, key: &str) -> Vec<String> {
        self.options
            .get(key)
            .and_then(serde_json::Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(ToString::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Validate kind-specific requirements; fails closed
    pub fn validate(&self) -> Result<()> {
        let need_path = |ok: bool| {
            if ok {
                Ok(())
            } else {
                Err(Error::configuration(format!(
                    "{} check requires a target path",
                    self.kind
                )))
            }
        };
        match self.kind {
            CheckKind::Checksum => {
                need_path(self.path.is_some())?;
                match self.option_str("expected_sha256") {
                    Some(hex) if hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()) => {
                        Ok(())
                    }
                    _ => Err(Error::configuration(
                        "checksum check requires a 64-char hex expected_sha256 option",
                    )),
                }
            }
            CheckKind::Hash => {
                need_path(self.path.is_some())?;
                match self.option_str("algorithm") {
                    Some("crc32c" | "xxhash64" | "sha256") => {}
                    _ => {
                        return Err(Error::configuration(
                            "hash check requires an algorithm option of crc32c, xxhash64, or sha256",
                        ))
                    }
                }
                if self.option_str("expected").is_none() {
                    return Err(Error::configuration(
                        "hash check requires an expected option",
                    ));
                }
                Ok(())
            }
            CheckKind::Size => {
                need_path(self.path.is_some())?;
                if self.option_u64("min_bytes").is_none() && self.option_u64("max_bytes").is_none()
                {
                    return Err(Error::configuration(
                        "size check requires min_bytes or max_bytes",
                    ));
                }
                Ok(())
            }
            CheckKind::Format | CheckKind::Schema => {
                need_path(self.path.is_some())?;
                if self.kind == CheckKind::Schema && self.option_strings("required_fields").is_empty()
                {
                    return Err(Error::configuration(
                        "schema check requires a non-empty required_fields option",
                    ));
                }
                Ok(())
            }
            CheckKind::Reference => {
                if self.option_strings("references").is_empty() {
                    return Err(Error::configuration(
                        "reference check requires a non-empty references option",
                    ));
                }
                Ok(())
            }
            CheckKind::Consistency | CheckKind::Duplicate => Ok(()),
        }
    }
}

/// Outcome of one check run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityResult {
    pub check_id: CheckId,
    pub status: CheckStatus,
    pub details: String,
    pub checked_at: DateTime<Utc>,
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier() -> TierId {
        TierId::new_unchecked("hot")
    }

    #[test]
    fn test_kind_specific_validation() {
        assert!(IntegrityCheck::new("c", CheckKind::Checksum, tier())
            .with_path("a.json")
            .validate()
            .is_err());
        assert!(IntegrityCheck::new("c", CheckKind::Checksum, tier())
            .with_path("a.json")
            .with_option_str("expected_sha256", "ab".repeat(32))
            .validate()
            .is_ok());

        assert!(IntegrityCheck::new("h", CheckKind::Hash, tier())
            .with_path("a.json")
            .with_option_str("algorithm", "md5")
            .with_option_str("expected", "x")
            .validate()
            .is_err());

        assert!(IntegrityCheck::new("s", CheckKind::Size, tier())
            .with_path("a.json")
            .validate()
            .is_err());
        assert!(IntegrityCheck::new("s", CheckKind::Size, tier())
            .with_path("a.json")
            .with_option_u64("max_bytes", 1024)
            .validate()
            .is_ok());

        assert!(IntegrityCheck::new("d", CheckKind::Duplicate, tier())
            .validate()
            .is_ok());
    }

    #[test]
    fn test_status_severity_mapping() {
        assert_eq!(CheckStatus::Corrupted.severity(), Severity::Critical);
        assert_eq!(CheckStatus::Invalid.severity(), Severity::Error);
        assert_eq!(CheckStatus::ChecksumMismatch.severity(), Severity::Error);
        assert_eq!(CheckStatus::Missing.severity(), Severity::Warning);
        assert_eq!(CheckStatus::Inconsistent.severity(), Severity::Warning);
    }
}

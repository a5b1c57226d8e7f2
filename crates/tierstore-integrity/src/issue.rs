//! Integrity issues

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tierstore_common::{CheckId, IssueId, Severity, TierId};

use crate::check::{CheckKind, CheckStatus};

/// Tri-state outcome of a repair attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairOutcome {
    Succeeded,
    Failed,
    NotAttempted,
}

/// A non-valid finding from an integrity check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityIssue {
    pub id: IssueId,
    pub check_id: CheckId,
    pub tier: TierId,
    /// Affected object; `None` for tier-level findings
    pub path: Option<PathBuf>,
    pub status: CheckStatus,
    pub severity: Severity,
    pub details: String,
    /// Only deterministically-recoverable findings qualify
    pub auto_repairable: bool,
    /// A repair runs at most once per issue
    pub repair_outcome: RepairOutcome,
    pub detected_at: DateTime<Utc>,
}

impl IntegrityIssue {
    #[must_use]
    pub fn new(
        check_id: CheckId,
        kind: CheckKind,
        tier: TierId,
        path: Option<PathBuf>,
        status: CheckStatus,
        details: impl Into<String>,
    ) -> Self {
        Self {
            id: IssueId::new(),
            check_id,
            tier,
            path,
            status,
            severity: status.severity(),
            details: details.into(),
            auto_repairable: Self::repairable(kind, status),
            repair_outcome: RepairOutcome::NotAttempted,
            detected_at: Utc::now(),
        }
    }

    /// Repair restores a known-good copy, so it only applies where the
    /// expected content is determined: checksum and size mismatches on
    /// a concrete object.
    fn repairable(kind: CheckKind, status: CheckStatus) -> bool {
        match kind {
            CheckKind::Checksum => matches!(status, CheckStatus::ChecksumMismatch),
            CheckKind::Size => matches!(status, CheckStatus::Invalid),
            _ => false,
        }
    }
}

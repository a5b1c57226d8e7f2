//! Core type definitions for TierStore
//!
//! This module defines the fundamental types used throughout the system:
//! identifiers, the shared task state machine, and object metadata.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// Defines a UUID-backed identifier newtype.
macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a new random identifier
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create from an existing UUID
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the underlying UUID
            #[must_use]
            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a retention policy
    PolicyId
);
uuid_id!(
    /// Unique identifier for a tiering rule
    RuleId
);
uuid_id!(
    /// Unique identifier for a task (migration/backup/archive/optimization)
    TaskId
);
uuid_id!(
    /// Unique identifier for an integrity check definition
    CheckId
);
uuid_id!(
    /// Unique identifier for an integrity issue
    IssueId
);
uuid_id!(
    /// Unique identifier for a storage alert
    AlertId
);
uuid_id!(
    /// Unique identifier for a backup artifact
    BackupId
);

/// Error returned when a tier name fails validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TierIdError {
    #[error("tier name must not be empty")]
    Empty,
    #[error("tier name too long (max 64 characters)")]
    TooLong,
    #[error("tier name contains invalid character: {0}")]
    InvalidChar(char),
}

/// Validated name of a storage tier (e.g. "hot", "warm-eu-1")
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TierId(String);

impl TierId {
    /// Create a new tier id, validating the name
    pub fn new(name: impl Into<String>) -> Result<Self, TierIdError> {
        let name = name.into();
        if name.is_empty() {
            return Err(TierIdError::Empty);
        }
        if name.len() > 64 {
            return Err(TierIdError::TooLong);
        }
        for c in name.chars() {
            if !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-' && c != '_' {
                return Err(TierIdError::InvalidChar(c));
            }
        }
        Ok(Self(name))
    }

    /// Create without validation (internal use only)
    #[must_use]
    pub fn new_unchecked(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the tier name as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for TierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TierId({})", self.0)
    }
}

impl fmt::Display for TierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Performance/cost class of a storage tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
    Hot,
    Warm,
    Cold,
    Archive,
}

impl TierKind {
    /// Numeric coldness rank (higher = colder)
    #[must_use]
    pub const fn coldness(self) -> u8 {
        match self {
            Self::Hot => 0,
            Self::Warm => 1,
            Self::Cold => 2,
            Self::Archive => 3,
        }
    }
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hot => write!(f, "hot"),
            Self::Warm => write!(f, "warm"),
            Self::Cold => write!(f, "cold"),
            Self::Archive => write!(f, "archive"),
        }
    }
}

/// State machine shared by migration, backup, restore, archive,
/// optimization, and cleanup tasks.
///
/// `Pending -> Running -> {Completed | Failed | Cancelled}`; the three
/// outcome states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    /// Whether this state admits no further transitions
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a transition to `next` is legal
    #[must_use]
    pub const fn can_transition(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Cancelled)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Severity of a telemetry record, derived from its filename
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    /// Parse a severity token, case-insensitive
    #[must_use]
    pub fn parse(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warning" | "warn" => Some(Self::Warning),
            "error" => Some(Self::Error),
            "critical" | "fatal" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Metadata for one opaque telemetry object stored in a tier.
///
/// The path is relative to the tier root. Event type and severity are
/// derived from path conventions laid down by the instrumentation layer:
/// the first path component names the event type (falling back to the
/// filename prefix up to the first `_`), and a severity token anywhere in
/// the filename marks the severity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Path relative to the tier root
    pub path: PathBuf,
    /// Object size in bytes
    pub size: u64,
    /// Last modification time
    pub modified: SystemTime,
    /// Access count recorded by the registry since last index rebuild
    pub access_count: u64,
}

impl ObjectMeta {
    /// Age of the object relative to `now`
    #[must_use]
    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.modified).unwrap_or(Duration::ZERO)
    }

    /// Age of the object in whole days relative to `now`
    #[must_use]
    pub fn age_days(&self, now: SystemTime) -> u64 {
        self.age(now).as_secs() / 86_400
    }

    /// Event type derived from the path
    #[must_use]
    pub fn event_type(&self) -> Option<String> {
        let mut components = self.path.components();
        let first = components.next()?;
        // A nested path means the leading directory names the event type.
        if components.next().is_some() {
            return Some(first.as_os_str().to_string_lossy().into_owned());
        }
        let stem = self.path.file_stem()?.to_string_lossy();
        stem.split('_').next().map(str::to_owned)
    }

    /// Severity derived from filename tokens, if any
    #[must_use]
    pub fn severity(&self) -> Option<Severity> {
        let stem = self.path.file_stem()?.to_string_lossy().into_owned();
        stem.split(|c: char| !c.is_ascii_alphanumeric())
            .find_map(Severity::parse)
    }

    /// File extension, lowercased
    #[must_use]
    pub fn extension(&self) -> Option<String> {
        self.path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
    }

    /// Whether the relative path starts with the given prefix
    #[must_use]
    pub fn has_prefix(&self, prefix: &Path) -> bool {
        self.path.starts_with(prefix)
    }
}

//! Retention policy model
//!
//! Policies are a single record with a kind discriminant plus a validated
//! options map; only the selection logic differs per kind, so no variant
//! types are needed. Validation fails closed at creation time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;
use tierstore_common::{Error, ObjectMeta, PolicyId, Result, Severity, TierId};

/// Discriminant for the retention predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    TimeBased,
    SizeBased,
    CountBased,
    EventType,
    Severity,
    Custom,
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimeBased => write!(f, "time_based"),
            Self::SizeBased => write!(f, "size_based"),
            Self::CountBased => write!(f, "count_based"),
            Self::EventType => write!(f, "event_type"),
            Self::Severity => write!(f, "severity"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

/// What happens to an expired object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispositionAction {
    Delete,
    Archive,
    Compress,
    Move,
}

impl fmt::Display for DispositionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delete => write!(f, "delete"),
            Self::Archive => write!(f, "archive"),
            Self::Compress => write!(f, "compress"),
            Self::Move => write!(f, "move"),
        }
    }
}

/// Optional object filters applied before the retention predicate
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyFilter {
    pub path_prefix: Option<PathBuf>,
    pub path_contains: Option<String>,
    pub extension: Option<String>,
    pub min_size_bytes: Option<u64>,
    pub max_size_bytes: Option<u64>,
}

impl PolicyFilter {
    /// Whether an object passes this filter
    #[must_use]
    pub fn matches(&self, meta: &ObjectMeta) -> bool {
        if let Some(prefix) = &self.path_prefix {
            if !meta.has_prefix(prefix) {
                return false;
            }
        }
        if let Some(fragment) = &self.path_contains {
            if !meta.path.to_string_lossy().contains(fragment.as_str()) {
                return false;
            }
        }
        if let Some(ext) = &self.extension {
            if meta.extension().as_deref() != Some(ext.as_str()) {
                return false;
            }
        }
        if let Some(min) = self.min_size_bytes {
            if meta.size < min {
                return false;
            }
        }
        if let Some(max) = self.max_size_bytes {
            if meta.size > max {
                return false;
            }
        }
        true
    }
}

/// Run counters accumulated across policy applications
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyStats {
    pub runs: u64,
    pub objects_disposed: u64,
    pub bytes_freed: u64,
    pub last_run: Option<DateTime<Utc>>,
}

/// A retention policy over one tier's contents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub id: PolicyId,
    pub name: String,
    pub kind: PolicyKind,
    /// Tier whose contents this policy scans
    pub tier: TierId,
    /// Target data type (matched against derived event type), if any
    pub data_type: Option<String>,
    /// Kind-specific thresholds, validated on creation
    pub options: BTreeMap<String, serde_json::Value>,
    pub filter: Option<PolicyFilter>,
    pub action: DispositionAction,
    /// Destination tier for archive/move dispositions
    pub target_tier: Option<TierId>,
    pub enabled: bool,
    pub stats: PolicyStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RetentionPolicy {
    /// Create a draft policy; call the option setters, then let the
    /// engine validate it on creation.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        kind: PolicyKind,
        tier: TierId,
        action: DispositionAction,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: PolicyId::new(),
            name: name.into(),
            kind,
            tier,
            data_type: None,
            options: BTreeMap::new(),
            filter: None,
            action,
            target_tier: None,
            enabled: true,
            stats: PolicyStats::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Set a numeric option
    #[must_use]
    pub fn with_option_u64(mut self, key: &str, value: u64) -> Self {
        self.options.insert(key.to_string(), value.into());
        self
    }

    /// Set a string-list option
    #[must_use]
    pub fn with_option_strings(mut self, key: &str, values: &[&str]) -> Self {
        self.options.insert(key.to_string(), serde_json::json!(values));
        self
    }

    /// Set the destination tier for archive/move dispositions
    #[must_use]
    pub fn with_target_tier(mut self, tier: TierId) -> Self {
        self.target_tier = Some(tier);
        self
    }

    /// Set the object filter
    #[must_use]
    pub fn with_filter(mut self, filter: PolicyFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Read a numeric option
    #[must_use]
    pub fn option_u64(&self, key: &str) -> Option<u64> {
        self.options.get(key).and_then(serde_json::Value::as_u64)
    }

    /// Read a string-list option
    #[must_use]
    pub fn option_strings(&self, key: &str) -> Option<Vec<String>> {
        let values = self.options.get(key)?.as_array()?;
        Some(
            values
                .iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect(),
        )
    }

    /// Validate kind-specific requirements; fails closed with a
    /// configuration error so a policy is never partially created.
    pub fn validate(&self) -> Result<()> {
        match self.kind {
            PolicyKind::TimeBased => {
                if self.option_u64("retention_days").is_none() {
                    return Err(Error::configuration(
                        "time-based policy requires a retention_days option",
                    ));
                }
            }
            PolicyKind::SizeBased => {
                if self.option_u64("max_total_bytes").is_none() {
                    return Err(Error::configuration(
                        "size-based policy requires a max_total_bytes option",
                    ));
                }
            }
            PolicyKind::CountBased => {
                if self.option_u64("max_count").is_none_or(|n| n == 0) {
                    return Err(Error::configuration(
                        "count-based policy requires a max_count option >= 1",
                    ));
                }
            }
            PolicyKind::EventType => {
                if self
                    .option_strings("event_types")
                    .is_none_or(|v| v.is_empty())
                {
                    return Err(Error::configuration(
                        "event-type policy requires a non-empty event_types option",
                    ));
                }
                if self.option_u64("retention_days").is_none() {
                    return Err(Error::configuration(
                        "event-type policy requires a retention_days option",
                    ));
                }
            }
            PolicyKind::Severity => {
                let severities = self
                    .option_strings("severities")
                    .unwrap_or_default();
                if severities.is_empty() {
                    return Err(Error::configuration(
                        "severity policy requires a non-empty severities option",
                    ));
                }
                for s in &severities {
                    if Severity::parse(s).is_none() {
                        return Err(Error::configuration(format!(
                            "unknown severity in policy options: {s}"
                        )));
                    }
                }
                if self.option_u64("retention_days").is_none() {
                    return Err(Error::configuration(
                        "severity policy requires a retention_days option",
                    ));
                }
            }
            PolicyKind::Custom => {
                let has_predicate = self.option_u64("max_age_days").is_some()
                    || self.option_u64("min_size_bytes").is_some()
                    || self.option_u64("unused_days").is_some();
                if !has_predicate {
                    return Err(Error::configuration(
                        "custom policy requires at least one of max_age_days, min_size_bytes, unused_days",
                    ));
                }
            }
        }

        match self.action {
            DispositionAction::Archive | DispositionAction::Move => {
                if self.target_tier.is_none() {
                    return Err(Error::configuration(format!(
                        "{} disposition requires a target tier",
                        self.action
                    )));
                }
            }
            DispositionAction::Delete | DispositionAction::Compress => {}
        }
        Ok(())
    }

    /// Whether an object belongs to this policy's snapshot (target data
    /// type plus filters)
    #[must_use]
    pub fn selects(&self, meta: &ObjectMeta) -> bool {
        if let Some(data_type) = &self.data_type {
            if meta.event_type().as_deref() != Some(data_type.as_str()) {
                return false;
            }
        }
        self.filter.as_ref().is_none_or(|f| f.matches(meta))
    }

    /// Partition a consistent snapshot of matching objects into those
    /// past the retention threshold. Input must already be filtered
    /// through [`Self::selects`].
    #[must_use]
    pub fn select_expired(&self, snapshot: &[ObjectMeta], now: SystemTime) -> Vec<ObjectMeta> {
        match self.kind {
            PolicyKind::TimeBased => {
                let days = self.option_u64("retention_days").unwrap_or(u64::MAX);
                snapshot
                    .iter()
                    .filter(|m| m.age_days(now) > days)
                    .cloned()
                    .collect()
            }
            PolicyKind::EventType => {
                let types = self.option_strings("event_types").unwrap_or_default();
                let days = self.option_u64("retention_days").unwrap_or(u64::MAX);
                snapshot
                    .iter()
                    .filter(|m| {
                        m.event_type()
                            .is_some_and(|t| types.iter().any(|x| x == &t))
                            && m.age_days(now) > days
                    })
                    .cloned()
                    .collect()
            }
            PolicyKind::Severity => {
                let severities: Vec<Severity> = self
                    .option_strings("severities")
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|s| Severity::parse(s))
                    .collect();
                let days = self.option_u64("retention_days").unwrap_or(u64::MAX);
                snapshot
                    .iter()
                    .filter(|m| {
                        m.severity().is_some_and(|s| severities.contains(&s))
                            && m.age_days(now) > days
                    })
                    .cloned()
                    .collect()
            }
            PolicyKind::SizeBased => {
                let max_total = self.option_u64("max_total_bytes").unwrap_or(u64::MAX);
                let mut total: u64 = snapshot.iter().map(|m| m.size).sum();
                if total <= max_total {
                    return Vec::new();
                }
                // Expire oldest first until the remainder fits.
                let mut by_age: Vec<&ObjectMeta> = snapshot.iter().collect();
                by_age.sort_by_key(|m| m.modified);
                let mut expired = Vec::new();
                for meta in by_age {
                    if total <= max_total {
                        break;
                    }
                    total = total.saturating_sub(meta.size);
                    expired.push(meta.clone());
                }
                expired
            }
            PolicyKind::CountBased => {
                let max_count = self.option_u64("max_count").unwrap_or(u64::MAX) as usize;
                if snapshot.len() <= max_count {
                    return Vec::new();
                }
                let mut by_age: Vec<&ObjectMeta> = snapshot.iter().collect();
                by_age.sort_by_key(|m| m.modified);
                by_age[..snapshot.len() - max_count]
                    .iter()
                    .map(|m| (*m).clone())
                    .collect()
            }
            PolicyKind::Custom => snapshot
                .iter()
                .filter(|m| {
                    let age_ok = self
                        .option_u64("max_age_days")
                        .is_none_or(|d| m.age_days(now) > d);
                    let size_ok = self
                        .option_u64("min_size_bytes")
                        .is_none_or(|s| m.size >= s);
                    let unused_ok = self
                        .option_u64("unused_days")
                        .is_none_or(|d| m.access_count == 0 && m.age_days(now) > d);
                    age_ok && size_ok && unused_ok
                })
                .cloned()
                .collect(),
        }
    }
}

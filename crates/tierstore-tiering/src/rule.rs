//! Tiering rule model
//!
//! Rules are a single record with a kind discriminant plus a validated
//! options map. A rule relocates matching objects from its source tier
//! to its target tier without disposing of them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;
use tierstore_common::{Error, ObjectMeta, Result, RuleId, Severity, TierId};

/// Discriminant for the tiering predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    AgeBased,
    AccessFrequency,
    SizeBased,
    Importance,
    CostOptimized,
    Performance,
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AgeBased => write!(f, "age_based"),
            Self::AccessFrequency => write!(f, "access_frequency"),
            Self::SizeBased => write!(f, "size_based"),
            Self::Importance => write!(f, "importance"),
            Self::CostOptimized => write!(f, "cost_optimized"),
            Self::Performance => write!(f, "performance"),
        }
    }
}

/// A condition-based rule relocating objects between tiers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TieringRule {
    pub id: RuleId,
    pub name: String,
    pub kind: RuleKind,
    pub source_tier: TierId,
    pub target_tier: TierId,
    /// Kind-specific thresholds, validated on creation
    pub options: BTreeMap<String, serde_json::Value>,
    /// Rules evaluate in ascending priority order
    pub priority: u32,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TieringRule {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        kind: RuleKind,
        source_tier: TierId,
        target_tier: TierId,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RuleId::new(),
            name: name.into(),
            kind,
            source_tier,
            target_tier,
            options: BTreeMap::new(),
            priority: 100,
            enabled: true,
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

    /// Set the evaluation priority (lower runs first)
    #[must_use]
    pub const fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
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

    /// Validate kind-specific requirements; fails closed
    pub fn validate(&self) -> Result<()> {
        if self.source_tier == self.target_tier {
            return Err(Error::configuration(
                "tiering rule source and target tiers must differ",
            ));
        }
        match self.kind {
            RuleKind::AgeBased => {
                if self.option_u64("age_days").is_none() {
                    return Err(Error::configuration(
                        "age-based rule requires an age_days option",
                    ));
                }
            }
            RuleKind::AccessFrequency => {
                if self.option_u64("max_access_count").is_none()
                    || self.option_u64("window_days").is_none()
                {
                    return Err(Error::configuration(
                        "access-frequency rule requires max_access_count and window_days options",
                    ));
                }
            }
            RuleKind::SizeBased => {
                if self.option_u64("min_size_bytes").is_none() {
                    return Err(Error::configuration(
                        "size-based rule requires a min_size_bytes option",
                    ));
                }
            }
            RuleKind::Importance => {
                let severities = self.option_strings("severities").unwrap_or_default();
                if severities.is_empty() {
                    return Err(Error::configuration(
                        "importance rule requires a non-empty severities option",
                    ));
                }
                for s in &severities {
                    if Severity::parse(s).is_none() {
                        return Err(Error::configuration(format!(
                            "unknown severity in rule options: {s}"
                        )));
                    }
                }
            }
            RuleKind::CostOptimized => {
                if self.option_u64("min_age_days").is_none() {
                    return Err(Error::configuration(
                        "cost-optimized rule requires a min_age_days option",
                    ));
                }
            }
            RuleKind::Performance => {
                if self.option_u64("min_access_count").is_none() {
                    return Err(Error::configuration(
                        "performance rule requires a min_access_count option",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Whether an object matches this rule's condition predicate
    #[must_use]
    pub fn matches(&self, meta: &ObjectMeta, now: SystemTime) -> bool {
        match self.kind {
            RuleKind::AgeBased => {
                let days = self.option_u64("age_days").unwrap_or(u64::MAX);
                meta.age_days(now) > days
            }
            RuleKind::AccessFrequency => {
                // Rarely-touched objects older than the observation
                // window move colder.
                let max_access = self.option_u64("max_access_count").unwrap_or(0);
                let window = self.option_u64("window_days").unwrap_or(u64::MAX);
                meta.access_count <= max_access && meta.age_days(now) >= window
            }
            RuleKind::SizeBased => {
                let min_size = self.option_u64("min_size_bytes").unwrap_or(u64::MAX);
                meta.size >= min_size
            }
            RuleKind::Importance => {
                let severities: Vec<Severity> = self
                    .option_strings("severities")
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|s| Severity::parse(s))
                    .collect();
                meta.severity().is_some_and(|s| severities.contains(&s))
            }
            RuleKind::CostOptimized => {
                let days = self.option_u64("min_age_days").unwrap_or(u64::MAX);
                meta.age_days(now) >= days
            }
            RuleKind::Performance => {
                // Frequently-read objects are promoted toward the faster
                // target tier.
                let min_access = self.option_u64("min_access_count").unwrap_or(u64::MAX);
                meta.access_count >= min_access
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn meta(path: &str, size: u64, age_days: u64, access_count: u64) -> ObjectMeta {
        ObjectMeta {
            path: PathBuf::from(path),
            size,
            modified: SystemTime::now() - Duration::from_secs(age_days * 86_400 + 60),
            access_count,
        }
    }

    fn rule(kind: RuleKind) -> TieringRule {
        TieringRule::new(
            "r",
            kind,
            TierId::new_unchecked("hot"),
            TierId::new_unchecked("warm"),
        )
    }

    #[test]
    fn test_validation_requires_kind_options() {
        assert!(rule(RuleKind::AgeBased).validate().is_err());
        assert!(rule(RuleKind::AgeBased)
            .with_option_u64("age_days", 30)
            .validate()
            .is_ok());
        assert!(rule(RuleKind::AccessFrequency)
            .with_option_u64("max_access_count", 2)
            .validate()
            .is_err());
    }

    #[test]
    fn test_same_tier_rejected() {
        let r = TieringRule::new(
            "r",
            RuleKind::AgeBased,
            TierId::new_unchecked("hot"),
            TierId::new_unchecked("hot"),
        )
        .with_option_u64("age_days", 30);
        assert!(r.validate().is_err());
    }

    #[test]
    fn test_age_based_matching() {
        let r = rule(RuleKind::AgeBased).with_option_u64("age_days", 30);
        let now = SystemTime::now();
        assert!(r.matches(&meta("a.json", 1, 45, 0), now));
        assert!(!r.matches(&meta("b.json", 1, 10, 0), now));
    }

    #[test]
    fn test_access_frequency_matching() {
        let r = rule(RuleKind::AccessFrequency)
            .with_option_u64("max_access_count", 1)
            .with_option_u64("window_days", 7);
        let now = SystemTime::now();
        assert!(r.matches(&meta("cold.json", 1, 10, 0), now));
        assert!(!r.matches(&meta("busy.json", 1, 10, 50), now));
        assert!(!r.matches(&meta("fresh.json", 1, 2, 0), now));
    }

    #[test]
    fn test_importance_matching() {
        let r = rule(RuleKind::Importance).with_option_strings("severities", &["critical"]);
        let now = SystemTime::now();
        assert!(r.matches(&meta("scrape_critical_001.json", 1, 0, 0), now));
        assert!(!r.matches(&meta("scrape_info_001.json", 1, 0, 0), now));
    }
}

//! Metric model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tierstore_common::TierId;

/// Sampled metric families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// used/capacity, 0..=1
    Utilization,
    UsedBytes,
    ObjectCount,
    /// bytes/day derived from usage history
    GrowthRate,
    /// round-trip probe latency, milliseconds
    Latency,
    /// failed/total operations, 0..=1
    ErrorRate,
    /// probe success, 1.0 or 0.0
    Availability,
}

impl MetricKind {
    pub const ALL: [Self; 7] = [
        Self::Utilization,
        Self::UsedBytes,
        Self::ObjectCount,
        Self::GrowthRate,
        Self::Latency,
        Self::ErrorRate,
        Self::Availability,
    ];

    #[must_use]
    pub const fn unit(self) -> &'static str {
        match self {
            Self::Utilization | Self::ErrorRate | Self::Availability => "ratio",
            Self::UsedBytes => "bytes",
            Self::ObjectCount => "objects",
            Self::GrowthRate => "bytes/day",
            Self::Latency => "ms",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Utilization => "utilization",
            Self::UsedBytes => "used_bytes",
            Self::ObjectCount => "object_count",
            Self::GrowthRate => "growth_rate",
            Self::Latency => "latency",
            Self::ErrorRate => "error_rate",
            Self::Availability => "availability",
        };
        write!(f, "{s}")
    }
}

/// One sampled value
#[derive(Debug, Clone, Serialize)]
pub struct StorageMetric {
    pub kind: MetricKind,
    pub tier: TierId,
    pub value: f64,
    pub unit: &'static str,
    pub sampled_at: DateTime<Utc>,
}

impl StorageMetric {
    #[must_use]
    pub fn new(kind: MetricKind, tier: TierId, value: f64) -> Self {
        Self {
            kind,
            tier,
            value,
            unit: kind.unit(),
            sampled_at: Utc::now(),
        }
    }
}

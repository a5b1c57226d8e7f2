//! Storage monitor
//!
//! Samples per-tier metrics against live registry state and probe I/O,
//! keeps a bounded history per metric+tier, compares samples against
//! two-level thresholds, and projects capacity exhaustion from the
//! usage history.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use std::sync::Arc;
use tierstore_common::config::MonitorConfig;
use tierstore_common::{Result, Severity, TierId};
use tierstore_registry::TierRegistry;
use tracing::{debug, warn};

use crate::alerts::AlertManager;
use crate::metrics::{MetricKind, StorageMetric};

const PROBE_FILE: &str = ".probe.tmp";
const PROBE_PAYLOAD: &[u8] = b"tierstore-probe";

/// Linear projection of a tier's usage
#[derive(Debug, Clone, Serialize)]
pub struct CapacityForecast {
    pub tier: TierId,
    pub horizon_days: u32,
    pub current_bytes: u64,
    pub capacity_bytes: u64,
    pub projected_bytes: u64,
    /// Fitted growth in bytes per day; negative when shrinking
    pub growth_per_day: f64,
    /// Days until usage reaches capacity at the fitted rate
    pub days_until_full: Option<f64>,
    /// Fit quality (coefficient of determination), 0..=1
    pub confidence: f64,
    pub recommendations: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

/// Per-tier telemetry sampling and alerting
pub struct StorageMonitor {
    registry: Arc<TierRegistry>,
    config: MonitorConfig,
    alerts: Arc<AlertManager>,
    history: RwLock<HashMap<(TierId, MetricKind), VecDeque<(DateTime<Utc>, f64)>>>,
    /// (operations, failures) since the last collection cycle
    ops: RwLock<HashMap<TierId, (u64, u64)>>,
}

impl StorageMonitor {
    #[must_use]
    pub fn new(registry: Arc<TierRegistry>, config: MonitorConfig) -> Self {
        let alerts = Arc::new(AlertManager::new(Duration::from_secs(
            config.alert_cooldown_secs,
        )));
        Self {
            registry,
            config,
            alerts,
            history: RwLock::new(HashMap::new()),
            ops: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn alerts(&self) -> Arc<AlertManager> {
        Arc::clone(&self.alerts)
    }

    /// Record an operation outcome against a tier. Subsystems report
    /// here; the next collection cycle turns it into an error rate.
    pub fn record_operation(&self, tier: &TierId, success: bool) {
        let mut ops = self.ops.write();
        let entry = ops.entry(tier.clone()).or_insert((0, 0));
        entry.0 += 1;
        if !success {
            entry.1 += 1;
        }
    }

    /// Sample the requested metric kinds (all when `None`) for every
    /// registered tier, record history, and raise threshold alerts.
    pub fn collect_metrics(&self, kinds: Option<&[MetricKind]>) -> Result<Vec<StorageMetric>> {
        let kinds = kinds.unwrap_or(&MetricKind::ALL);
        let cycle_ops = std::mem::take(&mut *self.ops.write());
        let mut samples = Vec::new();

        for tier_config in self.registry.list() {
            let tier = tier_config.id.clone();
            let used = self.registry.used(&tier)?;
            let capacity = tier_config.capacity_bytes;

            let probe = if kinds.contains(&MetricKind::Latency)
                || kinds.contains(&MetricKind::Availability)
            {
                Some(self.probe(&tier))
            } else {
                None
            };

            for kind in kinds {
                let value = match kind {
                    MetricKind::Utilization => {
                        if capacity == 0 {
                            0.0
                        } else {
                            used as f64 / capacity as f64
                        }
                    }
                    MetricKind::UsedBytes => used as f64,
                    MetricKind::ObjectCount => self.registry.list_objects(&tier)?.len() as f64,
                    MetricKind::GrowthRate => self.growth_per_day(&tier),
                    MetricKind::Latency => match &probe {
                        Some(Ok(latency)) => latency.as_secs_f64() * 1_000.0,
                        _ => f64::NAN,
                    },
                    MetricKind::ErrorRate => {
                        let (ops, failures) = cycle_ops.get(&tier).copied().unwrap_or((0, 0));
                        if ops == 0 {
                            0.0
                        } else {
                            failures as f64 / ops as f64
                        }
                    }
                    MetricKind::Availability => match &probe {
                        Some(Ok(_)) => 1.0,
                        Some(Err(e)) => {
                            warn!(tier = %tier, error = %e, "tier probe failed");
                            0.0
                        }
                        None => continue,
                    },
                };
                if value.is_nan() {
                    continue;
                }
                let metric = StorageMetric::new(*kind, tier.clone(), value);
                self.push_sample(&metric);
                self.check_thresholds(&metric);
                samples.push(metric);
            }
        }
        debug!(samples = samples.len(), "metrics collected");
        Ok(samples)
    }

    /// Project a tier's usage `days` ahead via a least-squares fit of
    /// its usage history.
    pub fn generate_capacity_forecast(&self, tier: &TierId, days: u32) -> Result<CapacityForecast> {
        let config = self.registry.config(tier)?;
        let current = self.registry.used(tier)?;
        let capacity = config.capacity_bytes;

        let history = self.history.read();
        let samples = history
            .get(&(tier.clone(), MetricKind::UsedBytes))
            .map(|h| h.iter().copied().collect::<Vec<_>>())
            .unwrap_or_default();
        let (growth_per_day, confidence) = fit_growth(&samples);

        let projected = (current as f64 + growth_per_day * f64::from(days)).max(0.0);
        let days_until_full = if growth_per_day > 0.0 && capacity > current {
            Some((capacity - current) as f64 / growth_per_day)
        } else {
            None
        };

        let utilization = if capacity == 0 {
            0.0
        } else {
            current as f64 / capacity as f64
        };
        let mut recommendations = Vec::new();
        if utilization >= self.config.critical_utilization_pct / 100.0 {
            recommendations
                .push(format!("tier {tier} is critically full; expand capacity or tighten retention now"));
        } else if utilization >= self.config.warning_utilization_pct / 100.0 {
            recommendations.push(format!(
                "tier {tier} is over {:.0}% utilized; review retention policies",
                self.config.warning_utilization_pct
            ));
        }
        if let Some(d) = days_until_full {
            if d <= f64::from(days) {
                recommendations.push(format!(
                    "at the current growth rate tier {tier} fills in {d:.0} days; add tiering rules to colder tiers"
                ));
            }
        }
        if projected as u64 > capacity {
            recommendations.push(format!(
                "projected usage exceeds capacity within {days} days"
            ));
        }
        if recommendations.is_empty() {
            recommendations.push(format!("tier {tier} capacity is healthy"));
        }

        Ok(CapacityForecast {
            tier: tier.clone(),
            horizon_days: days,
            current_bytes: current,
            capacity_bytes: capacity,
            projected_bytes: projected as u64,
            growth_per_day,
            days_until_full,
            confidence,
            recommendations,
            generated_at: Utc::now(),
        })
    }

    /// Append a sample to the bounded history. Exposed so tests can
    /// seed history at controlled timestamps.
    pub fn push_sample(&self, metric: &StorageMetric) {
        let mut history = self.history.write();
        let series = history
            .entry((metric.tier.clone(), metric.kind))
            .or_default();
        series.push_back((metric.sampled_at, metric.value));
        while series.len() > self.config.history_samples {
            series.pop_front();
        }
    }

    fn growth_per_day(&self, tier: &TierId) -> f64 {
        let history = self.history.read();
        let samples = history
            .get(&(tier.clone(), MetricKind::UsedBytes))
            .map(|h| h.iter().copied().collect::<Vec<_>>())
            .unwrap_or_default();
        fit_growth(&samples).0
    }

    /// Round-trip write/read/delete probe against the tier root
    fn probe(&self, tier: &TierId) -> Result<Duration> {
        let path = self.registry.abs_path(tier, std::path::Path::new(PROBE_FILE))?;
        let start = Instant::now();
        std::fs::write(&path, PROBE_PAYLOAD)?;
        let read_back = std::fs::read(&path)?;
        std::fs::remove_file(&path)?;
        if read_back != PROBE_PAYLOAD {
            return Err(tierstore_common::Error::integrity(format!(
                "probe read-back mismatch on tier {tier}"
            )));
        }
        Ok(start.elapsed())
    }

    fn check_thresholds(&self, metric: &StorageMetric) {
        let (warning, critical) = match metric.kind {
            MetricKind::Utilization => (
                self.config.warning_utilization_pct / 100.0,
                self.config.critical_utilization_pct / 100.0,
            ),
            MetricKind::ErrorRate => (
                self.config.warning_error_rate,
                self.config.critical_error_rate,
            ),
            MetricKind::Availability => {
                if metric.value < 1.0 {
                    self.alerts.raise(
                        metric.tier.clone(),
                        metric.kind,
                        Severity::Critical,
                        1.0,
                        metric.value,
                        format!("tier {} failed its availability probe", metric.tier),
                    );
                }
                return;
            }
            _ => return,
        };
        if metric.value >= critical {
            self.alerts.raise(
                metric.tier.clone(),
                metric.kind,
                Severity::Critical,
                critical,
                metric.value,
                format!(
                    "{} on tier {} is {:.3}, over the critical threshold {critical}",
                    metric.kind, metric.tier, metric.value
                ),
            );
        } else if metric.value >= warning {
            self.alerts.raise(
                metric.tier.clone(),
                metric.kind,
                Severity::Warning,
                warning,
                metric.value,
                format!(
                    "{} on tier {} is {:.3}, over the warning threshold {warning}",
                    metric.kind, metric.tier, metric.value
                ),
            );
        }
    }
}

/// Least-squares fit of usage over time. Returns (bytes/day, R²).
fn fit_growth(samples: &[(DateTime<Utc>, f64)]) -> (f64, f64) {
    if samples.len() < 2 {
        return (0.0, 0.0);
    }
    let t0 = samples[0].0;
    let points: Vec<(f64, f64)> = samples
        .iter()
        .map(|(t, v)| {
            let days = t.signed_duration_since(t0).num_milliseconds() as f64 / 86_400_000.0;
            (days, *v)
        })
        .collect();
    let n = points.len() as f64;
    let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;
    let ss_xy: f64 = points
        .iter()
        .map(|(x, y)| (x - mean_x) * (y - mean_y))
        .sum();
    let ss_xx: f64 = points.iter().map(|(x, _)| (x - mean_x).powi(2)).sum();
    let ss_yy: f64 = points.iter().map(|(_, y)| (y - mean_y).powi(2)).sum();
    if ss_xx == 0.0 {
        return (0.0, 0.0);
    }
    let slope = ss_xy / ss_xx;
    let r2 = if ss_yy == 0.0 {
        // A perfectly flat series is a perfect fit.
        1.0
    } else {
        (ss_xy * ss_xy) / (ss_xx * ss_yy)
    };
    (slope, r2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use tierstore_common::config::TierConfig;
    use tierstore_common::TierKind;

    struct Fixture {
        _dir: TempDir,
        monitor: StorageMonitor,
        registry: Arc<TierRegistry>,
        hot: TierId,
        hot_root: PathBuf,
    }

    fn fixture(capacity: u64) -> Fixture {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(TierRegistry::new());
        let hot = TierId::new_unchecked("hot");
        let hot_root = dir.path().join("hot");
        registry
            .register(TierConfig::new(
                hot.clone(),
                TierKind::Hot,
                hot_root.clone(),
                capacity,
            ))
            .unwrap();
        let monitor = StorageMonitor::new(registry.clone(), MonitorConfig::default());
        Fixture {
            _dir: dir,
            monitor,
            registry,
            hot,
            hot_root,
        }
    }

    #[test]
    fn test_collect_samples_all_kinds() {
        let fx = fixture(1_000);
        std::fs::write(fx.hot_root.join("a.json"), vec![0u8; 100]).unwrap();
        fx.registry.charge(&fx.hot, 100).unwrap();
        fx.monitor.record_operation(&fx.hot, true);
        fx.monitor.record_operation(&fx.hot, true);

        let samples = fx.monitor.collect_metrics(None).unwrap();
        let find = |kind| {
            samples
                .iter()
                .find(|m| m.kind == kind)
                .map(|m| m.value)
                .unwrap()
        };
        assert!((find(MetricKind::Utilization) - 0.1).abs() < 1e-9);
        assert!((find(MetricKind::UsedBytes) - 100.0).abs() < f64::EPSILON);
        assert!((find(MetricKind::ObjectCount) - 1.0).abs() < f64::EPSILON);
        assert!((find(MetricKind::ErrorRate)).abs() < f64::EPSILON);
        assert!((find(MetricKind::Availability) - 1.0).abs() < f64::EPSILON);
        assert!(find(MetricKind::Latency) >= 0.0);
        // The probe file never lingers in the tier.
        assert!(!fx.hot_root.join(PROBE_FILE).exists());
        assert!(fx.monitor.alerts().unresolved().is_empty());
    }

    #[test]
    fn test_critical_utilization_raises_once_within_cooldown() {
        let fx = fixture(1_000);
        fx.registry.charge(&fx.hot, 970).unwrap();

        for _ in 0..3 {
            fx.monitor
                .collect_metrics(Some(&[MetricKind::Utilization]))
                .unwrap();
        }
        let unresolved = fx.monitor.alerts().unresolved();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].severity, Severity::Critical);
        assert_eq!(unresolved[0].metric, MetricKind::Utilization);
    }

    #[test]
    fn test_error_rate_thresholds_and_reset() {
        let fx = fixture(1_000_000);
        for _ in 0..97 {
            fx.monitor.record_operation(&fx.hot, true);
        }
        for _ in 0..3 {
            fx.monitor.record_operation(&fx.hot, false);
        }
        let samples = fx
            .monitor
            .collect_metrics(Some(&[MetricKind::ErrorRate]))
            .unwrap();
        assert!((samples[0].value - 0.03).abs() < 1e-9);
        let unresolved = fx.monitor.alerts().unresolved();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].severity, Severity::Warning);

        // Counters reset each cycle.
        let samples = fx
            .monitor
            .collect_metrics(Some(&[MetricKind::ErrorRate]))
            .unwrap();
        assert!(samples[0].value.abs() < f64::EPSILON);
    }

    #[test]
    fn test_forecast_projects_linear_growth() {
        let fx = fixture(10_000);
        fx.registry.charge(&fx.hot, 5_000).unwrap();

        // Seed ten days of perfectly linear history: 500 bytes/day
        // ending at the current 5000.
        let now = Utc::now();
        for day in 0..10i64 {
            let mut metric = StorageMetric::new(
                MetricKind::UsedBytes,
                fx.hot.clone(),
                (500 * (day + 1)) as f64,
            );
            metric.sampled_at = now - chrono::Duration::days(10 - day);
            fx.monitor.push_sample(&metric);
        }

        let forecast = fx.monitor.generate_capacity_forecast(&fx.hot, 30).unwrap();
        assert!((forecast.growth_per_day - 500.0).abs() < 1.0);
        assert!(forecast.confidence > 0.99);
        // 5000 headroom at 500/day.
        let days = forecast.days_until_full.unwrap();
        assert!((days - 10.0).abs() < 0.1);
        assert_eq!(forecast.projected_bytes, 20_000);
        assert!(forecast
            .recommendations
            .iter()
            .any(|r| r.contains("fills in")));
    }

    #[test]
    fn test_forecast_flat_usage_has_no_fill_date() {
        let fx = fixture(10_000);
        fx.registry.charge(&fx.hot, 1_000).unwrap();
        let forecast = fx.monitor.generate_capacity_forecast(&fx.hot, 30).unwrap();
        assert!(forecast.days_until_full.is_none());
        assert_eq!(forecast.projected_bytes, 1_000);
        assert!(forecast.recommendations[0].contains("healthy"));
    }
}

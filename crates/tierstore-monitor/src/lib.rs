//! TierStore Monitor - telemetry sampling, alerting, and maintenance
//!
//! The monitor samples capacity, usage, performance, and error-rate
//! metrics per tier, raises deduplicated two-level alerts, and projects
//! capacity exhaustion. The optimizer runs idempotent, cancellable
//! maintenance jobs (defragmentation, cold compression, index rebuild,
//! space and cache reclamation).

pub mod alerts;
pub mod metrics;
pub mod monitor;
pub mod optimizer;

pub use alerts::{AlertManager, StorageAlert};
pub use metrics::{MetricKind, StorageMetric};
pub use monitor::{CapacityForecast, StorageMonitor};
pub use optimizer::{OptimizationJob, OptimizationResult, StorageOptimizer};

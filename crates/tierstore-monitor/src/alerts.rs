//! Alerting with cooldown deduplication
//!
//! A breach raises at most one unresolved alert per metric+tier pair
//! within the cooldown window, so a metric stuck over its threshold
//! does not flood the alert stream on every sampling cycle.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tierstore_common::{AlertId, Error, Result, Severity, TierId};
use tracing::info;

use crate::metrics::MetricKind;

#[derive(Debug, Clone, Serialize)]
pub struct StorageAlert {
    pub id: AlertId,
    pub tier: TierId,
    pub metric: MetricKind,
    pub severity: Severity,
    pub threshold: f64,
    pub actual: f64,
    pub message: String,
    pub raised_at: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// In-memory alert registry with per-pair cooldown
pub struct AlertManager {
    cooldown: Duration,
    alerts: RwLock<Vec<StorageAlert>>,
    last_raised: RwLock<HashMap<(TierId, MetricKind), DateTime<Utc>>>,
}

impl AlertManager {
    #[must_use]
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            alerts: RwLock::new(Vec::new()),
            last_raised: RwLock::new(HashMap::new()),
        }
    }

    /// Raise an alert unless the metric+tier pair already has an
    /// unresolved alert or fired within the cooldown window. Returns
    /// the alert id when one was actually raised.
    pub fn raise(
        &self,
        tier: TierId,
        metric: MetricKind,
        severity: Severity,
        threshold: f64,
        actual: f64,
        message: impl Into<String>,
    ) -> Option<AlertId> {
        let key = (tier.clone(), metric);
        {
            let alerts = self.alerts.read();
            if alerts
                .iter()
                .any(|a| !a.resolved && a.tier == tier && a.metric == metric)
            {
                return None;
            }
            let last = self.last_raised.read();
            if let Some(at) = last.get(&key) {
                let elapsed = Utc::now().signed_duration_since(*at);
                if elapsed.to_std().map(|e| e < self.cooldown).unwrap_or(true) {
                    return None;
                }
            }
        }
        let alert = StorageAlert {
            id: AlertId::new(),
            tier: tier.clone(),
            metric,
            severity,
            threshold,
            actual,
            message: message.into(),
            raised_at: Utc::now(),
            resolved: false,
            resolved_at: None,
        };
        let id = alert.id;
        info!(
            alert = %id,
            tier = %tier,
            metric = %metric,
            severity = %severity,
            threshold,
            actual,
            "alert raised"
        );
        self.last_raised.write().insert(key, alert.raised_at);
        self.alerts.write().push(alert);
        Some(id)
    }

    pub fn resolve(&self, id: AlertId) -> Result<()> {
        let mut alerts = self.alerts.write();
        let alert = alerts
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| Error::not_found("alert", id.to_string()))?;
        if !alert.resolved {
            alert.resolved = true;
            alert.resolved_at = Some(Utc::now());
            info!(alert = %id, "alert resolved");
        }
        Ok(())
    }

    #[must_use]
    pub fn unresolved(&self) -> Vec<StorageAlert> {
        self.alerts
            .read()
            .iter()
            .filter(|a| !a.resolved)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn all(&self) -> Vec<StorageAlert> {
        self.alerts.read().clone()
    }
}

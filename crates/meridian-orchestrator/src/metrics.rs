//! Read-only seam to the external time-series store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use meridian_proto::ServiceId;

use crate::error::OrchestratorResult;

/// A windowed, aggregated metric query.
#[derive(Debug, Clone)]
pub struct MetricQuery {
    /// Service scope, if any.
    pub service_id: Option<ServiceId>,
    /// Metric name.
    pub metric: String,
    /// Window start.
    pub start: DateTime<Utc>,
    /// Window end.
    pub end: DateTime<Utc>,
}

/// Read dependency on the metrics backend.
///
/// The core never writes metrics; it only asks for aggregated values to
/// drive alerting, autoscaling, and canary analysis.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Aggregated value for the query window, or `None` when the backend has
    /// no data (which callers treat as "skip", not as an error).
    async fn aggregate(&self, query: &MetricQuery) -> OrchestratorResult<Option<f64>>;

    /// Current values of every metric tracked for a service.
    async fn snapshot(&self, service_id: &ServiceId) -> OrchestratorResult<HashMap<String, f64>>;
}

/// Fixed in-memory metrics, for tests and embedded setups.
#[derive(Debug, Default)]
pub struct StaticMetrics {
    values: RwLock<HashMap<(Option<String>, String), f64>>,
}

impl StaticMetrics {
    /// An empty metrics source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a service-scoped metric value.
    pub fn set(&self, service_id: &ServiceId, metric: impl Into<String>, value: f64) {
        self.values.write().insert(
            (Some(service_id.as_str().to_owned()), metric.into()),
            value,
        );
    }

    /// Set a global (service-less) metric value.
    pub fn set_global(&self, metric: impl Into<String>, value: f64) {
        self.values.write().insert((None, metric.into()), value);
    }

    /// Remove a service-scoped metric value.
    pub fn clear(&self, service_id: &ServiceId, metric: &str) {
        self.values
            .write()
            .remove(&(Some(service_id.as_str().to_owned()), metric.to_owned()));
    }
}

#[async_trait]
impl MetricsSource for StaticMetrics {
    async fn aggregate(&self, query: &MetricQuery) -> OrchestratorResult<Option<f64>> {
        let key = (
            query.service_id.as_ref().map(|s| s.as_str().to_owned()),
            query.metric.clone(),
        );
        Ok(self.values.read().get(&key).copied())
    }

    async fn snapshot(&self, service_id: &ServiceId) -> OrchestratorResult<HashMap<String, f64>> {
        let values = self.values.read();
        Ok(values
            .iter()
            .filter(|((scope, _), _)| scope.as_deref() == Some(service_id.as_str()))
            .map(|((_, metric), value)| (metric.clone(), *value))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn aggregate_and_snapshot() {
        let metrics = StaticMetrics::new();
        let service = ServiceId::new("svc-1");
        metrics.set(&service, "cpu_percent", 85.0);
        metrics.set_global("fleet_load", 0.4);

        let query = MetricQuery {
            service_id: Some(service.clone()),
            metric: "cpu_percent".to_owned(),
            start: Utc::now(),
            end: Utc::now(),
        };
        assert_eq!(metrics.aggregate(&query).await.unwrap(), Some(85.0));

        let missing = MetricQuery {
            service_id: Some(service.clone()),
            metric: "latency_ms".to_owned(),
            start: Utc::now(),
            end: Utc::now(),
        };
        assert_eq!(metrics.aggregate(&missing).await.unwrap(), None);

        let snapshot = metrics.snapshot(&service).await.unwrap();
        assert_eq!(snapshot.get("cpu_percent"), Some(&85.0));
        assert!(!snapshot.contains_key("fleet_load"));
    }
}

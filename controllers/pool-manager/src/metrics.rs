//! Prometheus metrics for node reconciliation outcomes.

use chrono::Utc;
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};

/// Metric name of the per node, per pool match status
pub const NODE_POOL_STATUS: &str = "poolmanager_node_pool_status";

/// Metric name of the last successful apply time per node
pub const NODE_APPLIED: &str = "poolmanager_node_applied";

/// Receives reconciliation outcomes.
pub trait MetricsSink: Send + Sync {
    /// Records whether `pool` is currently applied to `node`.
    fn pool_status(&self, node: &str, pool: &str, applied: bool);

    /// Records that a patch was successfully applied to `node` now.
    fn node_applied(&self, node: &str);
}

/// Metrics sink backed by Prometheus gauges.
#[derive(Clone)]
pub struct PrometheusMetrics {
    node_pool_status: GaugeVec,
    node_applied: GaugeVec,
}

impl PrometheusMetrics {
    /// Creates the gauges and registers them in `registry`.
    ///
    /// # Errors
    ///
    /// Returns [`prometheus::Error`] if a metric with the same name is
    /// already registered.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let node_pool_status = GaugeVec::new(
            Opts::new(NODE_POOL_STATUS, "kube-pool-manager node pool config status"),
            &["nodeName", "pool"],
        )?;
        let node_applied = GaugeVec::new(
            Opts::new(NODE_APPLIED, "kube-pool-manager node applied time"),
            &["nodeName"],
        )?;

        registry.register(Box::new(node_pool_status.clone()))?;
        registry.register(Box::new(node_applied.clone()))?;

        Ok(Self {
            node_pool_status,
            node_applied,
        })
    }
}

impl MetricsSink for PrometheusMetrics {
    fn pool_status(&self, node: &str, pool: &str, applied: bool) {
        self.node_pool_status
            .with_label_values(&[node, pool])
            .set(if applied { 1.0 } else { 0.0 });
    }

    fn node_applied(&self, node: &str) {
        #[allow(clippy::cast_precision_loss, reason = "unix seconds stay far below 2^52")]
        let now = Utc::now().timestamp() as f64;
        self.node_applied.with_label_values(&[node]).set(now);
    }
}

/// Renders every metric of `registry` in the Prometheus text format.
///
/// # Errors
///
/// Returns [`prometheus::Error`] if encoding fails.
pub fn render(registry: &Registry) -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

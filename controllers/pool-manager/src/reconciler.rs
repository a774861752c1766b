//! Reconciliation logic for individual nodes.
//!
//! The reconciler evaluates the pool templates in order against one node,
//! merges the patch sets of the matching pools and submits the result as a
//! single JSON patch.

use crate::cluster::NodeApi;
use crate::error::ControllerError;
use crate::metrics::MetricsSink;
use k8s_openapi::api::core::v1::Node;
use pool_config::{NodeView, PatchSet, PoolTemplate};
use std::sync::Arc;
use tracing::{debug, info};

/// Result of a successful reconciliation of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// No pool selected the node; nothing was submitted
    NoMatch,
    /// Pools matched but produced no operations
    Unchanged { pools: Vec<String> },
    /// Patch logged but not submitted
    DryRun { pools: Vec<String> },
    /// Patch submitted to the cluster
    Applied { pools: Vec<String> },
}

impl ApplyOutcome {
    /// Names of the pools applied to the node.
    #[must_use]
    pub fn pools(&self) -> &[String] {
        match self {
            Self::NoMatch => &[],
            Self::Unchanged { pools } | Self::DryRun { pools } | Self::Applied { pools } => pools,
        }
    }
}

/// Applies pool templates to nodes.
pub struct Reconciler {
    api: Arc<dyn NodeApi>,
    metrics: Arc<dyn MetricsSink>,
    pools: Arc<[PoolTemplate]>,
    dry_run: bool,
}

impl Reconciler {
    /// Creates a new reconciler.
    pub fn new(
        api: Arc<dyn NodeApi>,
        metrics: Arc<dyn MetricsSink>,
        pools: Arc<[PoolTemplate]>,
        dry_run: bool,
    ) -> Self {
        Self {
            api,
            metrics,
            pools,
            dry_run,
        }
    }

    /// Node API used for patches, shared with the watch loop.
    pub fn api(&self) -> &Arc<dyn NodeApi> {
        &self.api
    }

    /// Reconciles one node against the pool templates.
    ///
    /// Every pool's status gauge is reset to 0 before it is evaluated and set
    /// to 1 only after the combined patch succeeded.
    ///
    /// # Errors
    ///
    /// Returns an error if the node cannot be rendered for selector
    /// evaluation or if the patch submission fails.
    pub async fn apply(&self, node: &Node) -> Result<ApplyOutcome, ControllerError> {
        let name = node.metadata.name.clone().unwrap_or_default();
        let view = NodeView::new(node).map_err(|source| ControllerError::SelectorEvaluation {
            node: name.clone(),
            pool: self.pools.first().map(|p| p.name.clone()).unwrap_or_default(),
            source,
        })?;

        let mut combined = PatchSet::new();
        let mut matched = Vec::new();
        for pool in self.pools.iter() {
            self.metrics.pool_status(&name, &pool.name, false);

            if !pool.matches_view(&view) {
                debug!(node = %name, pool = %pool.name, "Node does not match pool");
                continue;
            }

            info!(node = %name, pool = %pool.name, "Applying pool to node");
            combined.merge(pool.patch_set(node));
            matched.push(pool.name.clone());

            if !pool.continue_on_match {
                break;
            }
        }

        if matched.is_empty() {
            return Ok(ApplyOutcome::NoMatch);
        }

        let outcome = if combined.is_empty() {
            debug!(node = %name, pools = ?matched, "Pools produced no patch operations");
            ApplyOutcome::Unchanged { pools: matched }
        } else if self.dry_run {
            let patch = combined
                .to_json()
                .map_err(|source| ControllerError::PatchSerialization {
                    node: name.clone(),
                    source,
                })?;
            info!(node = %name, pools = ?matched, %patch, "Not applying pool config, dry-run active");
            ApplyOutcome::DryRun { pools: matched }
        } else {
            self.api.patch(&name, &combined).await?;
            info!(node = %name, pools = ?matched, operations = combined.len(), "Node patched");
            ApplyOutcome::Applied { pools: matched }
        };

        for pool in outcome.pools() {
            self.metrics.pool_status(&name, pool, true);
        }
        self.metrics.node_applied(&name);

        Ok(outcome)
    }
}

/// Returns true when the kubelet reports the node ready.
#[must_use]
pub fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions.iter().any(|c| {
                c.type_ == "Ready" && c.status == "True" && c.reason.as_deref() == Some("KubeletReady")
            })
        })
}

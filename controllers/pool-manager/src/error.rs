//! Controller-specific error types.
//!
//! Per-node failures (`SelectorEvaluation`, `PatchSerialization`,
//! `ClusterApply`) are logged and contained to the node being reconciled.
//! Configuration, leader election and server failures end the process.

use kube::Error as KubeError;
use pool_config::{SelectorError, TemplateError};
use thiserror::Error;

/// Errors that can occur in the Pool Manager Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Invalid command line or environment configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Pool templates could not be loaded
    #[error("Pool configuration error: {0}")]
    Template(#[from] TemplateError),

    /// Selector evaluation failed for a node
    #[error("Selector evaluation failed for node {node} (pool {pool}): {source}")]
    SelectorEvaluation {
        node: String,
        pool: String,
        #[source]
        source: SelectorError,
    },

    /// Patch payload could not be encoded
    #[error("Failed to encode JSON patch for node {node}: {source}")]
    PatchSerialization {
        node: String,
        #[source]
        source: serde_json::Error,
    },

    /// Patch submission was rejected or failed
    #[error("Failed to apply JSON patch to node {node}: {message}")]
    ClusterApply { node: String, message: String },

    /// Node watch stream closed or failed
    #[error("Node watch terminated: {0}")]
    Watch(String),

    /// Leadership could not be acquired or was lost
    #[error("Leader election failed: {0}")]
    LeaderElection(String),

    /// Metrics registration failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// HTTP server failure
    #[error("Server error: {0}")]
    Server(#[from] std::io::Error),
}

//! Node access on the Kubernetes API.
//!
//! The controller only talks to the cluster through [`NodeApi`], which keeps
//! the reconciliation loop testable against an in-memory implementation.

use crate::error::ControllerError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Node;
use kube::api::{ListParams, Patch, PatchParams, WatchEvent, WatchParams};
use kube::{Api, Client};
use pool_config::PatchSet;
use std::time::Duration;
use tracing::debug;

/// Longest server-side timeout accepted for one watch request.
///
/// Longer watch sessions are stitched together by the controller.
pub const MAX_WATCH_TIMEOUT: Duration = Duration::from_secs(290);

/// One change notification of the node watch.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    Added(Node),
    Modified(Node),
    Deleted(Node),
    Bookmark,
    /// Error object delivered inside the stream
    Error(String),
}

/// Stream of watch events; an `Err` item is a read failure and ends the session.
pub type NodeEventStream = BoxStream<'static, Result<NodeEvent, ControllerError>>;

/// Cluster operations needed by the reconciliation loop.
#[async_trait]
pub trait NodeApi: Send + Sync {
    /// Lists all nodes, optionally restricted by a label selector.
    async fn list(&self, label_selector: Option<&str>) -> Result<Vec<Node>, ControllerError>;

    /// Opens a node watch that the server closes after `timeout`.
    async fn watch(
        &self,
        label_selector: Option<&str>,
        timeout: Duration,
    ) -> Result<NodeEventStream, ControllerError>;

    /// Submits `patch` as one RFC 6902 JSON patch against node `name`.
    async fn patch(&self, name: &str, patch: &PatchSet) -> Result<(), ControllerError>;
}

/// [`NodeApi`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeNodeApi {
    api: Api<Node>,
}

impl KubeNodeApi {
    /// Cluster-scoped node API on `client`.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl NodeApi for KubeNodeApi {
    async fn list(&self, label_selector: Option<&str>) -> Result<Vec<Node>, ControllerError> {
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        let nodes = self.api.list(&params).await?;
        Ok(nodes.items)
    }

    async fn watch(
        &self,
        label_selector: Option<&str>,
        timeout: Duration,
    ) -> Result<NodeEventStream, ControllerError> {
        let secs = timeout.clamp(Duration::from_secs(1), MAX_WATCH_TIMEOUT).as_secs();
        let mut params = WatchParams::default().timeout(u32::try_from(secs).unwrap_or(u32::MAX));
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }

        debug!(timeout_secs = secs, selector = ?label_selector, "Opening node watch");
        let stream = self.api.watch(&params, "0").await?;

        Ok(stream
            .map_err(|e| ControllerError::Watch(e.to_string()))
            .map_ok(|event| match event {
                WatchEvent::Added(node) => NodeEvent::Added(node),
                WatchEvent::Modified(node) => NodeEvent::Modified(node),
                WatchEvent::Deleted(node) => NodeEvent::Deleted(node),
                WatchEvent::Bookmark(_) => NodeEvent::Bookmark,
                WatchEvent::Error(status) => NodeEvent::Error(format!("{status:?}")),
            })
            .boxed())
    }

    async fn patch(&self, name: &str, patch: &PatchSet) -> Result<(), ControllerError> {
        let json_patch = patch
            .to_json_patch()
            .map_err(|source| ControllerError::PatchSerialization {
                node: name.to_string(),
                source,
            })?;

        self.api
            .patch(name, &PatchParams::default(), &Patch::Json::<()>(json_patch))
            .await
            .map_err(|e| ControllerError::ClusterApply {
                node: name.to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }
}

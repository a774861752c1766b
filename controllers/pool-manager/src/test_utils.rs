//! Test utilities for unit testing the controller and reconciler
//!
//! This module provides in-memory implementations of the cluster, leader
//! election and metrics seams together with node builders.

use crate::cluster::{NodeApi, NodeEvent, NodeEventStream};
use crate::error::ControllerError;
use crate::leader::{LeaderElector, Leadership};
use crate::metrics::MetricsSink;
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, NodeCondition, NodeStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use pool_config::PatchSet;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Helper to create a test node without status
pub fn create_test_node(name: &str, labels: &[(&str, &str)], annotations: &[(&str, &str)]) -> Node {
    let to_map = |pairs: &[(&str, &str)]| {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect::<BTreeMap<_, _>>()
    };
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(to_map(labels)),
            annotations: Some(to_map(annotations)),
            ..Default::default()
        },
        spec: None,
        status: None,
    }
}

/// Helper to create a node whose kubelet reports it ready
pub fn ready_node(name: &str, labels: &[(&str, &str)]) -> Node {
    let mut node = create_test_node(name, labels, &[]);
    node.status = Some(NodeStatus {
        conditions: Some(vec![NodeCondition {
            type_: "Ready".to_string(),
            status: "True".to_string(),
            reason: Some("KubeletReady".to_string()),
            ..Default::default()
        }]),
        ..Default::default()
    });
    node
}

/// One scripted watch request
#[derive(Debug, Clone)]
pub enum WatchScript {
    /// Opening the watch fails
    OpenError(String),
    /// The watch delivers these items then closes; an `Err` item is a read failure
    Events(Vec<Result<NodeEvent, String>>),
}

/// Mock NodeApi for testing
///
/// Watch requests consume the scripts in order. Once the scripts are
/// exhausted the `exhausted` token is cancelled and the watch stays open
/// forever, which lets tests stop the controller deterministically.
#[derive(Clone, Default)]
pub struct MockNodeApi {
    nodes: Arc<Mutex<Vec<Node>>>,
    fail_list: Arc<Mutex<bool>>,
    scripts: Arc<Mutex<VecDeque<WatchScript>>>,
    patches: Arc<Mutex<Vec<(String, PatchSet)>>>,
    failing_nodes: Arc<Mutex<HashSet<String>>>,
    calls: Arc<Mutex<HashMap<&'static str, usize>>>,
    watch_timeouts: Arc<Mutex<Vec<Duration>>>,
    exhausted: CancellationToken,
}

impl MockNodeApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nodes returned by `list`
    pub fn with_nodes(self, nodes: Vec<Node>) -> Self {
        *self.nodes.lock().unwrap() = nodes;
        self
    }

    /// Queue a watch script
    pub fn with_watch(self, script: WatchScript) -> Self {
        self.scripts.lock().unwrap().push_back(script);
        self
    }

    pub fn fail_list(&self) {
        *self.fail_list.lock().unwrap() = true;
    }

    pub fn fail_patches_for(&self, node: &str) {
        self.failing_nodes.lock().unwrap().insert(node.to_string());
    }

    /// Token cancelled once every watch script has been consumed
    pub fn exhausted(&self) -> CancellationToken {
        self.exhausted.clone()
    }

    pub fn patches(&self) -> Vec<(String, PatchSet)> {
        self.patches.lock().unwrap().clone()
    }

    pub fn patched_nodes(&self) -> Vec<String> {
        self.patches().into_iter().map(|(name, _)| name).collect()
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.calls.lock().unwrap().get(operation).copied().unwrap_or(0)
    }

    pub fn watch_timeouts(&self) -> Vec<Duration> {
        self.watch_timeouts.lock().unwrap().clone()
    }

    fn record(&self, operation: &'static str) {
        *self.calls.lock().unwrap().entry(operation).or_default() += 1;
    }
}

#[async_trait]
impl NodeApi for MockNodeApi {
    async fn list(&self, _label_selector: Option<&str>) -> Result<Vec<Node>, ControllerError> {
        self.record("list");
        if *self.fail_list.lock().unwrap() {
            return Err(ControllerError::Watch("list unavailable".to_string()));
        }
        Ok(self.nodes.lock().unwrap().clone())
    }

    async fn watch(
        &self,
        _label_selector: Option<&str>,
        timeout: Duration,
    ) -> Result<NodeEventStream, ControllerError> {
        self.record("watch");
        self.watch_timeouts.lock().unwrap().push(timeout);
        let next = self.scripts.lock().unwrap().pop_front();
        match next {
            Some(WatchScript::OpenError(message)) => Err(ControllerError::Watch(message)),
            Some(WatchScript::Events(items)) => Ok(futures::stream::iter(
                items.into_iter().map(|item| item.map_err(ControllerError::Watch)),
            )
            .boxed()),
            None => {
                self.exhausted.cancel();
                Ok(futures::stream::pending::<Result<NodeEvent, ControllerError>>().boxed())
            }
        }
    }

    async fn patch(&self, name: &str, patch: &PatchSet) -> Result<(), ControllerError> {
        self.record("patch");
        if self.failing_nodes.lock().unwrap().contains(name) {
            return Err(ControllerError::ClusterApply {
                node: name.to_string(),
                message: "admission webhook denied the request".to_string(),
            });
        }
        self.patches
            .lock()
            .unwrap()
            .push((name.to_string(), patch.clone()));
        Ok(())
    }
}

/// MetricsSink that records the latest values
#[derive(Default)]
pub struct RecordingMetrics {
    status: Mutex<HashMap<(String, String), bool>>,
    applied: Mutex<HashMap<String, usize>>,
}

impl RecordingMetrics {
    pub fn status(&self, node: &str, pool: &str) -> Option<bool> {
        self.status
            .lock()
            .unwrap()
            .get(&(node.to_string(), pool.to_string()))
            .copied()
    }

    pub fn applied_count(&self, node: &str) -> usize {
        self.applied.lock().unwrap().get(node).copied().unwrap_or(0)
    }
}

impl MetricsSink for RecordingMetrics {
    fn pool_status(&self, node: &str, pool: &str, applied: bool) {
        self.status
            .lock()
            .unwrap()
            .insert((node.to_string(), pool.to_string()), applied);
    }

    fn node_applied(&self, node: &str) {
        *self.applied.lock().unwrap().entry(node.to_string()).or_default() += 1;
    }
}

/// LeaderElector that grants leadership immediately, or refuses it
pub struct StaticLeader {
    lost: CancellationToken,
    refuse: bool,
}

impl StaticLeader {
    /// Grants leadership; cancelling `lost` revokes it
    pub fn granting(lost: CancellationToken) -> Self {
        Self { lost, refuse: false }
    }

    pub fn refusing() -> Self {
        Self {
            lost: CancellationToken::new(),
            refuse: true,
        }
    }
}

#[async_trait]
impl LeaderElector for StaticLeader {
    async fn become_leader(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<Option<Leadership>, ControllerError> {
        if self.refuse {
            return Err(ControllerError::LeaderElection("lease forbidden".to_string()));
        }
        Ok(Some(Leadership::new(self.lost.clone(), None)))
    }
}

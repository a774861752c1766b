//! Main controller implementation.
//!
//! The controller drives the whole lifecycle on a single task:
//! - optional leader election after a settling delay
//! - bulk apply of every listed node
//! - node watch with readiness gating and per-node dedup
//! - resync when a watch session times out, backoff when it fails
//!
//! Events are processed strictly in order; each patch completes before the
//! next event is read.

use crate::backoff::ExponentialBackoff;
use crate::cluster::NodeEvent;
use crate::config::Opts;
use crate::error::ControllerError;
use crate::leader::{LeaderElector, Leadership};
use crate::reconciler::{is_node_ready, Reconciler};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Delay before competing for the lease.
pub const LEADER_SETTLE_DELAY: Duration = Duration::from_secs(15);

/// A watch closed without events sooner than this counts as a failed open.
pub const MIN_HEALTHY_WATCH: Duration = Duration::from_secs(5);

/// Tracks which nodes were reconciled since the last full resync.
#[derive(Debug, Default)]
pub struct NodeApplyState {
    applied: HashMap<String, bool>,
}

impl NodeApplyState {
    /// Replaces the state with every listed node marked as applied.
    pub fn reset_from(&mut self, names: impl IntoIterator<Item = String>) {
        self.applied = names.into_iter().map(|name| (name, true)).collect();
    }

    /// Registers `name` if unknown and returns whether it was already applied.
    pub fn observe(&mut self, name: &str) -> bool {
        *self.applied.entry(name.to_string()).or_insert(false)
    }

    /// Marks `name` as reconciled.
    pub fn mark_applied(&mut self, name: &str) {
        self.applied.insert(name.to_string(), true);
    }

    /// Drops `name`, so it is reconciled again when it reappears.
    pub fn forget(&mut self, name: &str) {
        self.applied.remove(name);
    }

    /// Whether `name` is applied, `None` when unknown.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<bool> {
        self.applied.get(name).copied()
    }

    /// Number of tracked nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.applied.len()
    }

    /// True when no node is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }
}

/// Tunables of the control loop.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Label selector for list and watch
    pub label_selector: Option<String>,
    /// Length of one watch session; a resync may follow each session
    pub watch_timeout: Duration,
    /// Bulk apply again after every session
    pub reapply_on_watch_timeout: bool,
    /// Wait before competing for the lease
    pub settle_delay: Duration,
    /// Delay policy for failed or empty watches
    pub backoff: ExponentialBackoff,
}

impl ControllerSettings {
    /// Settings taken from the command line.
    #[must_use]
    pub fn from_opts(opts: &Opts) -> Self {
        Self {
            label_selector: opts.label_selector().map(str::to_string),
            watch_timeout: opts.kube.watch_timeout,
            reapply_on_watch_timeout: opts.kube.reapply_on_watch_timeout,
            settle_delay: LEADER_SETTLE_DELAY,
            backoff: ExponentialBackoff::default(),
        }
    }
}

/// How a watch session ended.
#[derive(Debug)]
enum SessionEnd {
    /// The session ran for the configured timeout
    Expired,
    /// Opening or reading the watch failed
    Failed(ControllerError),
}

/// Main controller for node pool reconciliation.
pub struct Controller {
    reconciler: Reconciler,
    elector: Option<Arc<dyn LeaderElector>>,
    settings: ControllerSettings,
    state: NodeApplyState,
}

impl Controller {
    /// Creates a new controller. Without an elector, leadership is assumed.
    pub fn new(
        reconciler: Reconciler,
        elector: Option<Arc<dyn LeaderElector>>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            reconciler,
            elector,
            settings,
            state: NodeApplyState::default(),
        }
    }

    /// Per-node apply state.
    #[must_use]
    pub fn state(&self) -> &NodeApplyState {
        &self.state
    }

    /// Runs until `cancel` fires or a fatal error occurs.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::LeaderElection`] if leadership cannot be
    /// acquired or is lost. All other failures are logged and retried.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), ControllerError> {
        info!("Starting pool manager controller");

        let Some(leadership) = self.elect(&cancel).await? else {
            info!("Shutdown requested before leadership was acquired");
            return Ok(());
        };

        let mut backoff = self.settings.backoff.clone();
        let mut resync = true;
        loop {
            if resync {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Ok(()),
                    () = leadership.lost() => return Err(leadership_lost()),
                    () = self.bulk_apply() => {}
                }
            }

            let end = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(()),
                () = leadership.lost() => return Err(leadership_lost()),
                end = self.watch_session(&mut backoff) => end,
            };

            resync = self.settings.reapply_on_watch_timeout;
            match end {
                SessionEnd::Expired => {
                    info!(reapply = resync, "Node watch session timed out");
                }
                SessionEnd::Failed(e) => {
                    let delay = backoff.next_backoff();
                    error!(error = %e, retry_in = ?delay, "Node watcher stopped");
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return Ok(()),
                        () = leadership.lost() => return Err(leadership_lost()),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn elect(&self, cancel: &CancellationToken) -> Result<Option<Leadership>, ControllerError> {
        let Some(elector) = &self.elector else {
            return Ok(Some(Leadership::unconditional()));
        };

        info!(delay = ?self.settings.settle_delay, "Waiting before leader election");
        tokio::select! {
            () = cancel.cancelled() => return Ok(None),
            () = tokio::time::sleep(self.settings.settle_delay) => {}
        }
        elector.become_leader(cancel).await
    }

    /// Applies the pools to every listed node, ignoring readiness.
    async fn bulk_apply(&mut self) {
        let selector = self.settings.label_selector.as_deref();
        let nodes = match self.reconciler.api().list(selector).await {
            Ok(nodes) => nodes,
            Err(e) => {
                error!(error = %e, "Failed to list nodes, continuing with watch");
                return;
            }
        };

        info!(count = nodes.len(), "Applying pool configuration to all nodes");
        self.state
            .reset_from(nodes.iter().filter_map(|n| n.metadata.name.clone()));

        for node in &nodes {
            if let Err(e) = self.reconciler.apply(node).await {
                error!(node = ?node.metadata.name, error = %e, "Failed to apply pools to node");
            }
        }
    }

    /// Watches nodes until the session timeout elapses or the watch fails.
    ///
    /// The server may close a watch before the session timeout; such a
    /// clean close reopens the watch within the same session. A close that
    /// delivered nothing and came sooner than [`MIN_HEALTHY_WATCH`] waits
    /// for the next backoff delay before reopening.
    async fn watch_session(&mut self, backoff: &mut ExponentialBackoff) -> SessionEnd {
        let deadline = Instant::now() + self.settings.watch_timeout;
        loop {
            let opened_at = Instant::now();
            let remaining = deadline.saturating_duration_since(opened_at);
            info!("(Re)starting node watch");
            let mut stream = match self
                .reconciler
                .api()
                .watch(self.settings.label_selector.as_deref(), remaining)
                .await
            {
                Ok(stream) => stream,
                Err(e) => return SessionEnd::Failed(e),
            };

            let mut delivered = false;
            while let Some(item) = stream.next().await {
                match item {
                    Ok(event) => {
                        delivered = true;
                        self.handle_event(event).await;
                    }
                    Err(e) => return SessionEnd::Failed(e),
                }
            }

            let healthy = delivered || opened_at.elapsed() >= MIN_HEALTHY_WATCH;
            if healthy {
                backoff.reset();
            }
            if Instant::now() >= deadline {
                return SessionEnd::Expired;
            }
            if healthy {
                debug!("Node watch closed by server, reopening");
            } else {
                let delay = backoff.next_backoff();
                warn!(retry_in = ?delay, "Node watch closed immediately without events");
                tokio::time::sleep(delay).await;
            }
        }
    }

    async fn handle_event(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::Added(node) | NodeEvent::Modified(node) => self.on_node_changed(&node).await,
            NodeEvent::Deleted(node) => {
                if let Some(name) = node.metadata.name.as_deref() {
                    debug!(node = %name, "Node deleted");
                    self.state.forget(name);
                }
            }
            NodeEvent::Bookmark => {}
            NodeEvent::Error(message) => {
                error!(%message, "Got watch error event");
            }
        }
    }

    async fn on_node_changed(&mut self, node: &Node) {
        let Some(name) = node.metadata.name.as_deref() else {
            warn!("Ignoring node event without a name");
            return;
        };

        if self.state.observe(name) {
            return;
        }
        if !is_node_ready(node) {
            debug!(node = %name, "Node not ready yet");
            return;
        }

        match self.reconciler.apply(node).await {
            Ok(outcome) => {
                debug!(node = %name, ?outcome, "Node reconciled");
                self.state.mark_applied(name);
            }
            Err(e) => error!(node = %name, error = %e, "Failed to apply pools to node"),
        }
    }
}

fn leadership_lost() -> ControllerError {
    ControllerError::LeaderElection("leadership lost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_node, ready_node, MockNodeApi, RecordingMetrics, StaticLeader, WatchScript};
    use pool_config::{PoolConfig, PoolTemplate};

    const WORKER_POOL: &str = r#"
pools:
  - pool: P1
    selector:
      - path: "{.metadata.labels.role}"
        match: worker
    node:
      labels:
        env: prod
"#;

    fn pools() -> Arc<[PoolTemplate]> {
        PoolConfig::from_yaml(WORKER_POOL).unwrap().compile().unwrap()
    }

    fn settings(watch_timeout: Duration, reapply: bool) -> ControllerSettings {
        ControllerSettings {
            label_selector: None,
            watch_timeout,
            reapply_on_watch_timeout: reapply,
            settle_delay: Duration::ZERO,
            backoff: ExponentialBackoff::new(Duration::ZERO, Duration::ZERO),
        }
    }

    fn controller(
        api: &Arc<MockNodeApi>,
        metrics: &Arc<RecordingMetrics>,
        elector: Option<Arc<dyn LeaderElector>>,
        settings: ControllerSettings,
    ) -> Controller {
        let reconciler = Reconciler::new(api.clone(), metrics.clone(), pools(), false);
        Controller::new(reconciler, elector, settings)
    }

    fn worker(name: &str) -> Node {
        ready_node(name, &[("role", "worker")])
    }

    #[test]
    fn test_node_apply_state() {
        let mut state = NodeApplyState::default();
        assert!(!state.observe("a"));
        assert_eq!(state.get("a"), Some(false));
        state.mark_applied("a");
        assert!(state.observe("a"));

        state.reset_from(vec!["b".to_string(), "c".to_string()]);
        assert_eq!(state.len(), 2);
        assert_eq!(state.get("a"), None);
        assert_eq!(state.get("b"), Some(true));

        state.forget("b");
        assert_eq!(state.get("b"), None);
    }

    #[tokio::test]
    async fn test_modified_event_applies_once() {
        let api = Arc::new(MockNodeApi::new().with_watch(WatchScript::Events(vec![
            Ok(NodeEvent::Added(worker("n1"))),
            Ok(NodeEvent::Modified(worker("n1"))),
        ])));
        let metrics = Arc::new(RecordingMetrics::default());
        let mut controller = controller(&api, &metrics, None, settings(Duration::from_secs(3600), false));

        controller.run(api.exhausted()).await.unwrap();

        let patches = api.patches();
        assert_eq!(patches.len(), 1);
        assert_eq!(
            patches[0].1.to_json().unwrap(),
            serde_json::json!([{"op": "replace", "path": "/metadata/labels/env", "value": "prod"}])
        );
        assert_eq!(controller.state().get("n1"), Some(true));
        assert_eq!(metrics.status("n1", "P1"), Some(true));
    }

    #[tokio::test]
    async fn test_deleted_node_is_reconciled_again_when_readded() {
        let api = Arc::new(MockNodeApi::new().with_watch(WatchScript::Events(vec![
            Ok(NodeEvent::Modified(worker("n1"))),
            Ok(NodeEvent::Deleted(worker("n1"))),
            Ok(NodeEvent::Added(worker("n1"))),
        ])));
        let metrics = Arc::new(RecordingMetrics::default());
        let mut controller = controller(&api, &metrics, None, settings(Duration::from_secs(3600), false));

        controller.run(api.exhausted()).await.unwrap();

        assert_eq!(api.patched_nodes(), vec!["n1", "n1"]);
    }

    #[tokio::test]
    async fn test_unready_node_waits_for_readiness() {
        let unready = create_test_node("n1", &[("role", "worker")], &[]);
        let api = Arc::new(MockNodeApi::new().with_watch(WatchScript::Events(vec![
            Ok(NodeEvent::Added(unready)),
            Ok(NodeEvent::Modified(worker("n1"))),
        ])));
        let metrics = Arc::new(RecordingMetrics::default());
        let mut controller = controller(&api, &metrics, None, settings(Duration::from_secs(3600), false));

        controller.run(api.exhausted()).await.unwrap();

        assert_eq!(api.patched_nodes(), vec!["n1"]);
    }

    #[tokio::test]
    async fn test_bulk_apply_ignores_readiness_and_seeds_state() {
        let unready = create_test_node("n1", &[("role", "worker")], &[]);
        let api = Arc::new(
            MockNodeApi::new()
                .with_nodes(vec![unready, worker("n2")])
                .with_watch(WatchScript::Events(vec![Ok(NodeEvent::Modified(worker("n2")))])),
        );
        let metrics = Arc::new(RecordingMetrics::default());
        let mut controller = controller(&api, &metrics, None, settings(Duration::from_secs(3600), false));

        controller.run(api.exhausted()).await.unwrap();

        // n2 was marked applied by the bulk pass, so the watch event is a no-op
        assert_eq!(api.patched_nodes(), vec!["n1", "n2"]);
        assert_eq!(controller.state().get("n1"), Some(true));
    }

    #[tokio::test]
    async fn test_failed_patch_is_retried_on_next_event() {
        let api = Arc::new(MockNodeApi::new().with_watch(WatchScript::Events(vec![
            Ok(NodeEvent::Modified(worker("n1"))),
            Ok(NodeEvent::Modified(worker("n1"))),
        ])));
        api.fail_patches_for("n1");
        let metrics = Arc::new(RecordingMetrics::default());
        let mut controller = controller(&api, &metrics, None, settings(Duration::from_secs(3600), false));

        controller.run(api.exhausted()).await.unwrap();

        assert_eq!(api.calls("patch"), 2);
        assert_eq!(controller.state().get("n1"), Some(false));
    }

    #[tokio::test]
    async fn test_list_failure_still_watches() {
        let api = Arc::new(
            MockNodeApi::new().with_watch(WatchScript::Events(vec![Ok(NodeEvent::Modified(worker("n1")))])),
        );
        api.fail_list();
        let metrics = Arc::new(RecordingMetrics::default());
        let mut controller = controller(&api, &metrics, None, settings(Duration::from_secs(3600), false));

        controller.run(api.exhausted()).await.unwrap();

        assert_eq!(api.calls("list"), 1);
        assert_eq!(api.patched_nodes(), vec!["n1"]);
    }

    #[tokio::test]
    async fn test_error_and_bookmark_events_are_skipped() {
        let api = Arc::new(MockNodeApi::new().with_watch(WatchScript::Events(vec![
            Ok(NodeEvent::Error("too old resource version".to_string())),
            Ok(NodeEvent::Bookmark),
            Ok(NodeEvent::Modified(worker("n1"))),
        ])));
        let metrics = Arc::new(RecordingMetrics::default());
        let mut controller = controller(&api, &metrics, None, settings(Duration::from_secs(3600), false));

        controller.run(api.exhausted()).await.unwrap();

        assert_eq!(api.patched_nodes(), vec!["n1"]);
    }

    #[tokio::test]
    async fn test_failures_reopen_watch_without_resync() {
        let api = Arc::new(
            MockNodeApi::new()
                .with_nodes(vec![worker("n1")])
                .with_watch(WatchScript::OpenError("connection refused".to_string()))
                .with_watch(WatchScript::Events(vec![Err("stream reset".to_string())]))
                .with_watch(WatchScript::Events(vec![Ok(NodeEvent::Modified(worker("n2")))])),
        );
        let metrics = Arc::new(RecordingMetrics::default());
        let mut controller = controller(&api, &metrics, None, settings(Duration::from_secs(3600), false));

        controller.run(api.exhausted()).await.unwrap();

        assert_eq!(api.calls("list"), 1);
        assert_eq!(api.calls("watch"), 4);
        assert_eq!(api.patched_nodes(), vec!["n1", "n2"]);
    }

    #[tokio::test]
    async fn test_clean_close_within_session_reopens_without_resync() {
        let api = Arc::new(
            MockNodeApi::new()
                .with_nodes(vec![worker("n1")])
                .with_watch(WatchScript::Events(vec![]))
                .with_watch(WatchScript::Events(vec![])),
        );
        let metrics = Arc::new(RecordingMetrics::default());
        let mut controller = controller(&api, &metrics, None, settings(Duration::from_secs(3600), true));

        controller.run(api.exhausted()).await.unwrap();

        assert_eq!(api.calls("list"), 1);
        assert_eq!(api.calls("watch"), 3);
        // the remaining session time is passed on to each request
        assert!(api.watch_timeouts().iter().all(|t| *t <= Duration::from_secs(3600)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_closes_back_off_before_reopening() {
        let mut api = MockNodeApi::new();
        for _ in 0..5 {
            api = api.with_watch(WatchScript::Events(vec![]));
        }
        let api = Arc::new(api);
        let metrics = Arc::new(RecordingMetrics::default());
        let mut settings = settings(Duration::from_secs(3600), false);
        settings.backoff = ExponentialBackoff::default();
        let mut controller = controller(&api, &metrics, None, settings);

        let started = Instant::now();
        controller.run(api.exhausted()).await.unwrap();

        assert_eq!(api.calls("watch"), 6);
        // 1s + 2s + 4s + 8s + 16s between the six opens
        assert!(started.elapsed() >= Duration::from_secs(31));
        assert_eq!(api.calls("list"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closes_after_events_reopen_immediately() {
        let mut api = MockNodeApi::new();
        for name in ["n1", "n2", "n3"] {
            api = api.with_watch(WatchScript::Events(vec![Ok(NodeEvent::Modified(worker(name)))]));
        }
        let api = Arc::new(api);
        let metrics = Arc::new(RecordingMetrics::default());
        let mut settings = settings(Duration::from_secs(3600), false);
        settings.backoff = ExponentialBackoff::default();
        let mut controller = controller(&api, &metrics, None, settings);

        let started = Instant::now();
        controller.run(api.exhausted()).await.unwrap();

        assert_eq!(api.patched_nodes(), vec!["n1", "n2", "n3"]);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_session_timeout_triggers_resync_when_enabled() {
        let api = Arc::new(
            MockNodeApi::new()
                .with_nodes(vec![worker("n1")])
                .with_watch(WatchScript::Events(vec![])),
        );
        let metrics = Arc::new(RecordingMetrics::default());
        let mut controller = controller(&api, &metrics, None, settings(Duration::ZERO, true));

        controller.run(api.exhausted()).await.unwrap();

        assert_eq!(api.calls("list"), 2);
        assert_eq!(api.patched_nodes(), vec!["n1", "n1"]);
    }

    #[tokio::test]
    async fn test_session_timeout_without_reapply_only_rewatches() {
        let api = Arc::new(
            MockNodeApi::new()
                .with_nodes(vec![worker("n1")])
                .with_watch(WatchScript::Events(vec![])),
        );
        let metrics = Arc::new(RecordingMetrics::default());
        let mut controller = controller(&api, &metrics, None, settings(Duration::ZERO, false));

        controller.run(api.exhausted()).await.unwrap();

        assert_eq!(api.calls("list"), 1);
        assert_eq!(api.calls("watch"), 2);
    }

    #[tokio::test]
    async fn test_leader_election_failure_is_fatal() {
        let api = Arc::new(MockNodeApi::new());
        let metrics = Arc::new(RecordingMetrics::default());
        let elector: Arc<dyn LeaderElector> = Arc::new(StaticLeader::refusing());
        let mut controller = controller(&api, &metrics, Some(elector), settings(Duration::from_secs(3600), false));

        let err = controller.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ControllerError::LeaderElection(_)));
        assert_eq!(api.calls("list"), 0);
    }

    #[tokio::test]
    async fn test_leadership_loss_is_fatal() {
        let lost = CancellationToken::new();
        lost.cancel();
        let api = Arc::new(MockNodeApi::new().with_nodes(vec![worker("n1")]));
        let metrics = Arc::new(RecordingMetrics::default());
        let elector: Arc<dyn LeaderElector> = Arc::new(StaticLeader::granting(lost));
        let mut controller = controller(&api, &metrics, Some(elector), settings(Duration::from_secs(3600), false));

        let err = controller.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ControllerError::LeaderElection(_)));
        assert!(api.patches().is_empty());
    }

    #[tokio::test]
    async fn test_leader_applies_after_election() {
        let api = Arc::new(
            MockNodeApi::new()
                .with_nodes(vec![worker("n1")])
                .with_watch(WatchScript::Events(vec![])),
        );
        let metrics = Arc::new(RecordingMetrics::default());
        let elector: Arc<dyn LeaderElector> = Arc::new(StaticLeader::granting(CancellationToken::new()));
        let mut controller = controller(&api, &metrics, Some(elector), settings(Duration::from_secs(3600), false));

        controller.run(api.exhausted()).await.unwrap();

        assert_eq!(api.patched_nodes(), vec!["n1"]);
    }

    #[tokio::test]
    async fn test_cancel_during_settle_delay() {
        let api = Arc::new(MockNodeApi::new());
        let metrics = Arc::new(RecordingMetrics::default());
        let elector: Arc<dyn LeaderElector> = Arc::new(StaticLeader::granting(CancellationToken::new()));
        let mut settings = settings(Duration::from_secs(3600), false);
        settings.settle_delay = Duration::from_secs(3600);
        let mut controller = controller(&api, &metrics, Some(elector), settings);

        let cancel = CancellationToken::new();
        cancel.cancel();
        controller.run(cancel).await.unwrap();
        assert_eq!(api.calls("list"), 0);
    }
}

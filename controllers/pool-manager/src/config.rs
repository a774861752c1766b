//! Command line and environment options.
//!
//! Every flag can also be supplied through the environment variable named in
//! its `env` attribute. Durations use the Go syntax (`90s`, `1h30m`, `24h`).

use crate::error::ControllerError;
use clap::Parser;
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime options of the pool manager.
#[derive(Parser, Debug, Clone, Serialize)]
#[command(name = "kube-pool-manager", version, about = "Applies pool templates to Kubernetes nodes")]
pub struct Opts {
    /// Logging options
    #[command(flatten)]
    pub log: LogOpts,

    /// Identity of the running instance
    #[command(flatten)]
    pub instance: InstanceOpts,

    /// Node selection and watch options
    #[command(flatten)]
    pub kube: KubeOpts,

    /// Leader election options
    #[command(flatten)]
    pub lease: LeaseOpts,

    /// HTTP server options
    #[command(flatten)]
    pub server: ServerOpts,

    /// Dry run (do not apply to nodes)
    #[arg(long = "dry-run", env = "DRY_RUN")]
    pub dry_run: bool,

    /// Path of the pool configuration file
    #[arg(long = "config", env = "CONFIG", value_hint = clap::ValueHint::FilePath)]
    pub config: PathBuf,
}

/// Logging options
#[derive(clap::Args, Debug, Clone, Serialize)]
pub struct LogOpts {
    /// Debug mode (trace level with source locations)
    #[arg(long = "log.debug", env = "LOG_DEBUG")]
    pub debug: bool,

    /// Development mode (human readable multi-line output)
    #[arg(long = "log.devel", env = "LOG_DEVEL")]
    pub devel: bool,

    /// Switch log output to json format
    #[arg(long = "log.json", env = "LOG_JSON")]
    pub json: bool,
}

/// Where this instance runs
#[derive(clap::Args, Debug, Clone, Serialize)]
pub struct InstanceOpts {
    /// Name of node where the manager is running
    #[arg(long = "instance.nodename", env = "INSTANCE_NODENAME")]
    pub nodename: Option<String>,

    /// Name of namespace where the manager is running (lease namespace)
    #[arg(long = "instance.namespace", env = "INSTANCE_NAMESPACE")]
    pub namespace: Option<String>,

    /// Name of pod where the manager is running (lease holder identity)
    #[arg(long = "instance.pod", env = "INSTANCE_POD")]
    pub pod: Option<String>,
}

/// Node selection and watch options
#[derive(clap::Args, Debug, Clone, Serialize)]
pub struct KubeOpts {
    /// Label selector restricting which nodes are managed
    #[arg(long = "kube.node.labelselector", env = "KUBE_NODE_LABELSELECTOR", default_value = "")]
    pub node_label_selector: String,

    /// Timeout and full resync interval of the node watch
    #[arg(
        long = "kube.watch.timeout",
        env = "KUBE_WATCH_TIMEOUT",
        default_value = "24h",
        value_parser = parse_go_duration
    )]
    pub watch_timeout: Duration,

    /// Reapply node settings on watch timeout
    #[arg(long = "kube.watch.reapply", env = "KUBE_WATCH_REAPPLY")]
    pub reapply_on_watch_timeout: bool,
}

/// Leader election options
#[derive(clap::Args, Debug, Clone, Serialize)]
pub struct LeaseOpts {
    /// Enable leader election through a coordination lease
    #[arg(long = "lease.enable", env = "LEASE_ENABLE")]
    pub enabled: bool,

    /// Name of the lease lock
    #[arg(long = "lease.name", env = "LEASE_NAME", default_value = "kube-pool-manager-leader")]
    pub name: String,
}

/// HTTP server options
#[derive(clap::Args, Debug, Clone, Serialize)]
pub struct ServerOpts {
    /// Server address (`:8080` binds every interface)
    #[arg(long = "server.bind", env = "SERVER_BIND", default_value = ":8080")]
    pub bind: String,

    /// Server read timeout, bounds reading the request body
    #[arg(
        long = "server.timeout.read",
        env = "SERVER_TIMEOUT_READ",
        default_value = "5s",
        value_parser = parse_go_duration
    )]
    pub read_timeout: Duration,

    /// Server write timeout, bounds producing the response
    #[arg(
        long = "server.timeout.write",
        env = "SERVER_TIMEOUT_WRITE",
        default_value = "10s",
        value_parser = parse_go_duration
    )]
    pub write_timeout: Duration,
}

impl Opts {
    /// Node label selector, `None` when unset.
    #[must_use]
    pub fn label_selector(&self) -> Option<&str> {
        Some(self.kube.node_label_selector.trim()).filter(|s| !s.is_empty())
    }

    /// Options rendered as a single JSON line for the startup log.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
    }
}

impl ServerOpts {
    /// Resolves the bind address. A missing host binds every interface.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::InvalidConfig`] if the address cannot be parsed.
    pub fn bind_addr(&self) -> Result<SocketAddr, ControllerError> {
        let bind = self.bind.trim();
        let full = if bind.starts_with(':') {
            format!("0.0.0.0{bind}")
        } else {
            bind.to_string()
        };
        full.parse().map_err(|e| {
            ControllerError::InvalidConfig(format!("invalid server bind address '{}': {e}", self.bind))
        })
    }
}

/// Parses a Go duration string (`300ms`, `1h30m`) into a [`Duration`].
fn parse_go_duration(s: &str) -> Result<Duration, String> {
    let nanos = go_parse_duration::parse_duration(s.trim())
        .map_err(|e| format!("invalid duration '{s}': {e:?}"))?;
    let nanos = u64::try_from(nanos).map_err(|_| format!("duration '{s}' must not be negative"))?;
    if nanos == 0 {
        return Err(format!("duration '{s}' must be greater than zero"));
    }
    Ok(Duration::from_nanos(nanos))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Opts {
        let mut argv = vec!["kube-pool-manager"];
        argv.extend_from_slice(args);
        Opts::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let opts = parse(&["--config", "/etc/pools.yaml"]);
        assert_eq!(opts.config, PathBuf::from("/etc/pools.yaml"));
        assert_eq!(opts.kube.watch_timeout, Duration::from_secs(24 * 3600));
        assert_eq!(opts.server.read_timeout, Duration::from_secs(5));
        assert_eq!(opts.server.write_timeout, Duration::from_secs(10));
        assert_eq!(opts.lease.name, "kube-pool-manager-leader");
        assert_eq!(opts.server.bind, ":8080");
        assert!(!opts.dry_run);
        assert!(!opts.lease.enabled);
        assert!(opts.label_selector().is_none());
    }

    #[test]
    fn test_dotted_flags() {
        let opts = parse(&[
            "--config=pools.yaml",
            "--dry-run",
            "--log.json",
            "--lease.enable",
            "--lease.name=pools",
            "--instance.pod=manager-0",
            "--kube.node.labelselector=kubernetes.io/os=linux",
            "--kube.watch.timeout=1h30m",
            "--kube.watch.reapply",
            "--server.timeout.read=2s",
            "--server.timeout.write=30s",
        ]);
        assert!(opts.dry_run);
        assert!(opts.log.json);
        assert!(opts.lease.enabled);
        assert_eq!(opts.lease.name, "pools");
        assert_eq!(opts.instance.pod.as_deref(), Some("manager-0"));
        assert_eq!(opts.label_selector(), Some("kubernetes.io/os=linux"));
        assert_eq!(opts.kube.watch_timeout, Duration::from_secs(90 * 60));
        assert!(opts.kube.reapply_on_watch_timeout);
        assert_eq!(opts.server.read_timeout, Duration::from_secs(2));
        assert_eq!(opts.server.write_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_config_is_required() {
        assert!(Opts::try_parse_from(["kube-pool-manager"]).is_err());
    }

    #[test]
    fn test_invalid_durations_rejected() {
        assert!(parse_go_duration("soon").is_err());
        assert!(parse_go_duration("0s").is_err());
        assert_eq!(parse_go_duration("300ms").unwrap(), Duration::from_millis(300));
    }

    #[test]
    fn test_bind_addr() {
        let mut opts = parse(&["--config", "c.yaml"]);
        assert_eq!(opts.server.bind_addr().unwrap(), "0.0.0.0:8080".parse().unwrap());

        opts.server.bind = "127.0.0.1:9000".to_string();
        assert_eq!(opts.server.bind_addr().unwrap(), "127.0.0.1:9000".parse().unwrap());

        opts.server.bind = "nonsense".to_string();
        assert!(matches!(opts.server.bind_addr(), Err(ControllerError::InvalidConfig(_))));
    }

    #[test]
    fn test_options_render_as_json() {
        let opts = parse(&["--config", "c.yaml", "--lease.enable"]);
        let json: serde_json::Value = serde_json::from_str(&opts.to_json()).unwrap();
        assert_eq!(json["lease"]["enabled"], true);
        assert_eq!(json["config"], "c.yaml");
    }
}

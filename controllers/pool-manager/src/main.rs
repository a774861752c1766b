//! Kube Pool Manager
//!
//! Applies declarative node pool templates to Kubernetes nodes:
//! - selects nodes by JSONPath predicates on the node object
//! - enforces labels, annotations, roles and the kubelet config source
//! - reacts to node changes and optionally resyncs on watch timeout
//!
//! Only the lease holder patches nodes when leader election is enabled.

mod backoff;
mod cluster;
mod config;
mod controller;
mod error;
mod leader;
mod logging;
mod metrics;
mod reconciler;
mod server;
#[cfg(test)]
mod test_utils;

use crate::cluster::KubeNodeApi;
use crate::config::Opts;
use crate::controller::{Controller, ControllerSettings};
use crate::error::ControllerError;
use crate::leader::{LeaderElector, LeaseElector};
use crate::metrics::PrometheusMetrics;
use crate::reconciler::Reconciler;
use clap::Parser;
use kube::Client;
use pool_config::PoolConfig;
use prometheus::Registry;
use std::sync::Arc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    let opts = Opts::parse();
    logging::init(&opts.log);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting kube-pool-manager");
    info!("{}", opts.to_json());

    info!(path = %opts.config.display(), "Reading pool configuration");
    let pools = PoolConfig::from_file(&opts.config)?.compile()?;
    info!(pools = pools.len(), "Pool configuration loaded");
    let bind = opts.server.bind_addr()?;

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        info!("Rustls crypto provider already installed");
    }
    let client = Client::try_default().await?;

    let registry = Registry::new();
    let metrics = Arc::new(PrometheusMetrics::new(&registry)?);
    let api = Arc::new(KubeNodeApi::new(client.clone()));
    let elector = if opts.lease.enabled {
        Some(lease_elector(&opts, client)?)
    } else {
        None
    };

    let reconciler = Reconciler::new(api, metrics, pools, opts.dry_run);
    let mut controller = Controller::new(reconciler, elector, ControllerSettings::from_opts(&opts));

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    let router = server::router(registry, opts.server.read_timeout, opts.server.write_timeout);
    let mut server = tokio::spawn(server::serve(bind, router, cancel.clone()));

    let (result, server_done) = tokio::select! {
        result = controller.run(cancel.clone()) => (result, false),
        joined = &mut server => (flatten(joined), true),
    };
    cancel.cancel();

    if !server_done {
        if let Err(e) = flatten(server.await) {
            error!(error = %e, "Http server failed during shutdown");
        }
    }

    if let Err(e) = &result {
        error!(error = %e, "Pool manager stopped");
    } else {
        info!("Pool manager stopped");
    }
    result
}

/// Builds the lease elector; the pod name is the holder identity.
fn lease_elector(opts: &Opts, client: Client) -> Result<Arc<dyn LeaderElector>, ControllerError> {
    let identity = opts
        .instance
        .pod
        .clone()
        .or_else(|| std::env::var("POD_NAME").ok())
        .filter(|pod| !pod.is_empty())
        .ok_or_else(|| {
            ControllerError::InvalidConfig(
                "--instance.pod (or POD_NAME) is required when --lease.enable is set".to_string(),
            )
        })?;
    let namespace = opts
        .instance
        .namespace
        .clone()
        .unwrap_or_else(|| client.default_namespace().to_string());

    Ok(Arc::new(LeaseElector::new(client, &opts.lease.name, &namespace, &identity)))
}

fn flatten(joined: Result<Result<(), ControllerError>, JoinError>) -> Result<(), ControllerError> {
    joined.map_err(|e| ControllerError::Server(std::io::Error::other(e)))?
}

/// Cancels `cancel` on SIGTERM or SIGINT.
async fn shutdown_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (Ok(mut sigterm), Ok(mut sigint)) = (signal(SignalKind::terminate()), signal(SignalKind::interrupt()))
        else {
            error!("Failed to install signal handlers");
            return;
        };
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            return;
        }
        info!("Received Ctrl+C, initiating graceful shutdown");
    }
    cancel.cancel();
}

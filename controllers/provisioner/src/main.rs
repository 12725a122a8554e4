//! VM Provisioning Controller
//!
//! Deploys vSphere-backed virtual machines to serve as Kubernetes cluster
//! nodes. Each VM goes through a strictly phased pipeline (controller
//! shell creation, controller key resolution, disk attachment, descriptor
//! re-registration, power-on with retry); batches fan out across a
//! bounded pool of concurrent pipelines.

mod coordinator;
mod deployment;
mod error;
mod pipeline;
mod power;
mod spec_builder;
#[cfg(test)]
mod coordinator_test;
#[cfg(test)]
mod pipeline_test;
#[cfg(test)]
mod test_utils;

use crate::coordinator::{DeploymentCoordinator, DEFAULT_MAX_CONCURRENCY};
use crate::deployment::DeploymentSpec;
use crate::pipeline::PipelineSettings;
use crate::spec_builder::VmRequest;
use anyhow::Context;
use node_profiles::{resolve_secret, ProfileError, ProfileStore};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use vsphere_client::VsphereClient;

fn env_secs(name: &str, default: u64) -> Duration {
    Duration::from_secs(
        env::var(name)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    info!("Starting VM Provisioning Controller");

    // Load configuration from environment variables
    let vsphere_url =
        env::var("VSPHERE_URL").unwrap_or_else(|_| "https://vcenter.lab".to_string());
    let username = env::var("VSPHERE_USERNAME")
        .unwrap_or_else(|_| "administrator@vsphere.local".to_string());
    let password_ref = env::var("VSPHERE_PASSWORD")
        .context("VSPHERE_PASSWORD environment variable is required (env:NAME, file:/path, or literal)")?;
    let password = resolve_secret(&password_ref)?;
    let profiles_path =
        env::var("NODE_PROFILES").unwrap_or_else(|_| "config/node-profiles.yaml".to_string());
    let deployment_path =
        env::var("DEPLOYMENT").unwrap_or_else(|_| "config/deployment.yaml".to_string());

    let settings = PipelineSettings {
        task_timeout: env_secs("TASK_TIMEOUT_SECS", 120),
        disk_settle_delay: env_secs("DISK_SETTLE_SECS", 10),
        ..PipelineSettings::default()
    };

    info!("Configuration:");
    info!("  vCenter URL: {}", vsphere_url);
    info!("  Node profiles: {}", profiles_path);
    info!("  Deployment: {}", deployment_path);
    info!("  Task timeout: {:?}", settings.task_timeout);
    info!("  Disk settle delay: {:?}", settings.disk_settle_delay);

    let profiles = ProfileStore::from_yaml_file(&profiles_path)
        .with_context(|| format!("loading node profiles from {}", profiles_path))?;
    let deployment = DeploymentSpec::from_yaml_file(&deployment_path)
        .with_context(|| format!("loading deployment from {}", deployment_path))?;

    let max_concurrency = env::var("MAX_CONCURRENCY")
        .ok()
        .and_then(|v| v.parse().ok())
        .or(deployment.max_concurrency)
        .unwrap_or(DEFAULT_MAX_CONCURRENCY);

    let requests = deployment
        .nodes
        .iter()
        .map(|node| Ok(node.into_request(profiles.get(&node.name)?)))
        .collect::<Result<Vec<VmRequest>, ProfileError>>()?;

    let client = VsphereClient::new(vsphere_url, username, password)?;
    client.login().await?;

    // Ctrl-C stops issuing further phases; partially created VMs are
    // left in place for operator inspection
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Shutdown requested; in-flight remote waits are being abandoned");
            let _ = shutdown_tx.send(true);
        }
    });

    let coordinator =
        DeploymentCoordinator::new(Arc::new(client), Arc::new(settings), shutdown_rx);
    let batch = coordinator.run_batch(&requests, max_concurrency).await;

    for outcome in &batch.outcomes {
        match &outcome.result {
            Ok(vm) => info!("{}: provisioned as {}", outcome.name, vm.vm_id),
            Err(err) => error!("{}: {}", outcome.name, err),
        }
    }
    if batch.failed() > 0 {
        anyhow::bail!(
            "{} of {} VM(s) failed to provision",
            batch.failed(),
            batch.outcomes.len()
        );
    }
    Ok(())
}

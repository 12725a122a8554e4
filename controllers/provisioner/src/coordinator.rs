//! Deployment coordinator
//!
//! Fans a batch of independent VM requests out across a bounded pool of
//! concurrent pipeline executions. The bound is an admission limit on
//! in-flight pipelines protecting the hypervisor API, not a cap on batch
//! size. Phases within one pipeline stay strictly sequential; across
//! pipelines no ordering is guaranteed or required.

use crate::error::PipelineError;
use crate::pipeline::{PipelineSettings, ProvisionedVm, ProvisioningPipeline};
use crate::spec_builder::VmRequest;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tracing::{error, info};
use vsphere_client::HypervisorBackend;

/// Default admission limit for concurrently executing pipelines
pub const DEFAULT_MAX_CONCURRENCY: usize = 3;

/// Terminal outcome for one request in a batch
#[derive(Debug)]
pub struct VmOutcome {
    /// Name from the originating request
    pub name: String,
    pub result: Result<ProvisionedVm, PipelineError>,
}

/// Aggregated outcomes of one batch, one entry per request
#[derive(Debug)]
pub struct BatchResult {
    pub outcomes: Vec<VmOutcome>,
}

impl BatchResult {
    /// Number of successfully provisioned VMs
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    /// Number of failed requests
    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}

/// Runs provisioning pipelines for whole deployments
#[derive(Debug, Clone)]
pub struct DeploymentCoordinator {
    pipeline: ProvisioningPipeline,
}

impl DeploymentCoordinator {
    /// Create a coordinator over a backend
    pub fn new(
        backend: Arc<dyn HypervisorBackend>,
        settings: Arc<PipelineSettings>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            pipeline: ProvisioningPipeline::new(backend, settings, shutdown),
        }
    }

    /// Run the pipeline once per request, at most `max_concurrency`
    /// pipelines in flight simultaneously.
    ///
    /// Returns only after every request reached a terminal outcome. One
    /// VM's failure never aborts another's pipeline; outcomes keep the
    /// request order.
    pub async fn run_batch(
        &self,
        requests: &[VmRequest],
        max_concurrency: usize,
    ) -> BatchResult {
        let limit = max_concurrency.max(1);
        info!(
            "Deploying {} VM(s) with at most {} concurrent pipeline(s)",
            requests.len(),
            limit
        );
        let admission = Arc::new(Semaphore::new(limit));

        let pipelines = requests.iter().map(|req| {
            let admission = Arc::clone(&admission);
            let pipeline = self.pipeline.clone();
            async move {
                // The semaphore is never closed, so acquisition only ends
                // by granting a permit
                let _permit = admission.acquire_owned().await.ok();
                let result = pipeline.run(req).await;
                if let Err(err) = &result {
                    error!("VM {} failed: {}", req.name, err);
                }
                VmOutcome {
                    name: req.name.clone(),
                    result,
                }
            }
        });

        let outcomes = futures::future::join_all(pipelines).await;
        let batch = BatchResult { outcomes };
        info!(
            "Batch finished: {} succeeded, {} failed",
            batch.succeeded(),
            batch.failed()
        );
        batch
    }
}

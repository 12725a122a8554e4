//! Scenario tests for the deployment coordinator

use crate::coordinator::DeploymentCoordinator;
use crate::error::PipelinePhase;
use crate::test_utils::{fast_settings, request, shutdown_channel};
use std::sync::Arc;
use std::time::Duration;
use vsphere_client::MockVsphereClient;

fn coordinator_over(mock: &MockVsphereClient) -> DeploymentCoordinator {
    let (_tx, rx) = shutdown_channel();
    DeploymentCoordinator::new(Arc::new(mock.clone()), Arc::new(fast_settings()), rx)
}

#[tokio::test]
async fn admission_limit_bounds_in_flight_remote_calls() {
    let mock = MockVsphereClient::new();
    // Stretch every backend call so overlapping pipelines are observable
    mock.set_op_latency(Duration::from_millis(10));
    let coordinator = coordinator_over(&mock);

    let requests: Vec<_> = (0..5).map(|i| request(&format!("node-{}", i))).collect();
    let batch = coordinator.run_batch(&requests, 2).await;

    assert_eq!(batch.outcomes.len(), 5);
    assert_eq!(batch.succeeded(), 5);
    // Each pipeline issues remote calls strictly sequentially, so the
    // backend's concurrency high-water mark is the number of concurrently
    // admitted pipelines
    assert!(
        mock.max_in_flight() <= 2,
        "observed {} concurrent backend calls",
        mock.max_in_flight()
    );
}

#[tokio::test]
async fn one_failure_never_aborts_the_rest_of_the_batch() {
    let mock = MockVsphereClient::new();
    let coordinator = coordinator_over(&mock);

    let mut requests: Vec<_> = (0..5).map(|i| request(&format!("node-{}", i))).collect();
    requests[2].cpus = 0;

    let batch = coordinator.run_batch(&requests, 3).await;

    assert_eq!(batch.outcomes.len(), 5);
    assert_eq!(batch.succeeded(), 4);
    assert_eq!(batch.failed(), 1);

    // Outcomes keep request order and carry the failing phase
    assert_eq!(batch.outcomes[2].name, "node-2");
    let err = batch.outcomes[2].result.as_ref().unwrap_err();
    assert_eq!(err.phase, PipelinePhase::Validate);
    for (i, outcome) in batch.outcomes.iter().enumerate() {
        if i != 2 {
            assert!(outcome.result.is_ok(), "node-{} unexpectedly failed", i);
        }
    }
}

#[tokio::test]
async fn fully_shaped_node_lands_in_the_batch_without_error() {
    let mock = MockVsphereClient::new();
    let coordinator = coordinator_over(&mock);

    let mut req = request("node-a");
    req.data_disk_gb = Some(500);
    req.iso = Some("isos/os.iso".to_string());

    let batch = coordinator.run_batch(std::slice::from_ref(&req), 1).await;
    assert_eq!(batch.outcomes.len(), 1);

    let vm = batch.outcomes[0].result.as_ref().unwrap();
    assert_eq!(vm.phase, crate::pipeline::VmPhase::PoweredOn);
    assert_eq!(vm.count_of(vsphere_client::DeviceKind::Disk), 2);
    assert_eq!(vm.count_of(vsphere_client::DeviceKind::Ethernet), 1);
    assert_eq!(vm.count_of(vsphere_client::DeviceKind::Cdrom), 1);
}

#[tokio::test]
async fn zero_concurrency_is_clamped_to_serial_execution() {
    let mock = MockVsphereClient::new();
    mock.set_op_latency(Duration::from_millis(5));
    let coordinator = coordinator_over(&mock);

    let requests: Vec<_> = (0..3).map(|i| request(&format!("node-{}", i))).collect();
    let batch = coordinator.run_batch(&requests, 0).await;

    assert_eq!(batch.succeeded(), 3);
    assert_eq!(mock.max_in_flight(), 1);
}

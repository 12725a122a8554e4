//! Scenario tests for the provisioning pipeline

use crate::error::{PipelinePhase, ProvisionError};
use crate::pipeline::{
    ControllerAllocation, DeviceKey, PipelineSettings, ProvisioningPipeline, VmPhase,
};
use crate::spec_builder::BusRole;
use crate::test_utils::{fast_settings, request, shutdown_channel};
use std::sync::Arc;
use std::time::Duration;
use vsphere_client::{DeviceKind, HypervisorBackend, MockVsphereClient};

fn pipeline_over(mock: &MockVsphereClient, settings: PipelineSettings) -> ProvisioningPipeline {
    // Dropping the sender must never read as a cancellation
    let (_tx, rx) = shutdown_channel();
    ProvisioningPipeline::new(Arc::new(mock.clone()), Arc::new(settings), rx)
}

#[tokio::test]
async fn end_to_end_provisions_a_two_disk_node() {
    let mock = MockVsphereClient::new();
    let pipeline = pipeline_over(&mock, fast_settings());

    let mut req = request("node-a");
    req.data_disk_gb = Some(500);
    req.iso = Some("isos/os.iso".to_string());

    let vm = pipeline.run(&req).await.unwrap();

    assert_eq!(vm.phase, VmPhase::PoweredOn);
    assert_eq!(vm.name, "node-a");
    assert_eq!(vm.count_of(DeviceKind::ScsiController), 2);
    assert_eq!(vm.count_of(DeviceKind::Disk), 2);
    assert_eq!(vm.count_of(DeviceKind::Ethernet), 1);
    assert_eq!(vm.count_of(DeviceKind::Cdrom), 1);

    // Controllers carry resolved keys; matching was by bus number
    for record in vm.devices.iter().filter(|d| d.kind == DeviceKind::ScsiController) {
        assert!(matches!(record.key, DeviceKey::Resolved(key) if key >= 0));
    }

    // The remote VM agrees, and went through exactly one unregister,
    // register cycle that repaired the disk descriptors
    let devices = mock.list_devices(&vm.vm_id).await.unwrap();
    assert_eq!(devices.len(), 6);
    assert_eq!(mock.unregister_count(), 1);
    assert_eq!(mock.register_count(), 1);
    assert!(mock.descriptors_synced(&vm.vm_id));
    assert_eq!(mock.reconfigure_count(), 1);
}

#[tokio::test]
async fn validation_failure_issues_no_remote_calls() {
    let mock = MockVsphereClient::new();
    let pipeline = pipeline_over(&mock, fast_settings());

    let mut req = request("node-a");
    req.cpus = 0;

    let err = pipeline.run(&req).await.unwrap_err();
    assert_eq!(err.phase, PipelinePhase::Validate);
    assert!(matches!(err.error, ProvisionError::Validation(_)));
    assert_eq!(mock.reconfigure_count(), 0);
    assert_eq!(mock.power_on_attempts(), 0);
}

#[test]
fn allocation_require_is_a_pure_precondition() {
    let mut allocation = ControllerAllocation::default();
    allocation.insert(BusRole::Boot, 1000);

    assert_eq!(allocation.require(BusRole::Boot).unwrap(), 1000);
    // A disk against an unresolved role is refused before any remote call
    assert!(matches!(
        allocation.require(BusRole::Data),
        Err(ProvisionError::StructuralInvariant(_))
    ));
}

#[tokio::test]
async fn missing_controller_after_creation_is_a_structural_invariant_error() {
    let mock = MockVsphereClient::new();
    // The data-bus controller vanishes from the read-back, as if phase 1
    // only partially took effect
    mock.drop_controller_on_readback(1);
    let pipeline = pipeline_over(&mock, fast_settings());

    let mut req = request("node-a");
    req.data_disk_gb = Some(500);

    let err = pipeline.run(&req).await.unwrap_err();
    assert_eq!(err.phase, PipelinePhase::ResolveControllers);
    match &err.error {
        ProvisionError::StructuralInvariant(message) => {
            assert!(message.contains("data-bus"), "got: {}", message);
        }
        other => panic!("expected StructuralInvariant, got {}", other),
    }
    // The malformed VM was never reconfigured or powered on
    assert_eq!(mock.reconfigure_count(), 0);
    assert_eq!(mock.power_on_attempts(), 0);
}

#[tokio::test]
async fn remote_rejection_is_tagged_with_the_creation_phase() {
    let mock = MockVsphereClient::new();
    mock.fail_create("InvalidArgument: unsupported guest id");
    let pipeline = pipeline_over(&mock, fast_settings());

    let err = pipeline.run(&request("node-a")).await.unwrap_err();
    assert_eq!(err.phase, PipelinePhase::CreateShell);
    assert!(matches!(err.error, ProvisionError::Remote(_)));
    assert!(!err.error.is_timeout());
}

#[tokio::test(start_paused = true)]
async fn task_wait_timeout_reads_as_unknown_state() {
    let mock = MockVsphereClient::new();
    mock.hang_create();

    let settings = PipelineSettings {
        task_poll_interval: Duration::from_millis(100),
        task_timeout: Duration::from_secs(5),
        ..fast_settings()
    };
    let pipeline = pipeline_over(&mock, settings);

    let err = pipeline.run(&request("node-a")).await.unwrap_err();
    assert_eq!(err.phase, PipelinePhase::CreateShell);
    assert!(err.error.is_timeout());
    match err.error {
        ProvisionError::Timeout { waited, .. } => assert!(waited >= Duration::from_secs(5)),
        other => panic!("expected Timeout, got {}", other),
    }
}

#[tokio::test]
async fn backend_without_descriptor_defect_skips_reregistration() {
    let mock = MockVsphereClient::new();
    mock.set_descriptor_defect(false);
    let pipeline = pipeline_over(&mock, fast_settings());

    let vm = pipeline.run(&request("node-a")).await.unwrap();
    assert_eq!(vm.phase, VmPhase::PoweredOn);
    assert_eq!(mock.unregister_count(), 0);
    assert_eq!(mock.register_count(), 0);
}

#[tokio::test]
async fn reregistration_adopts_the_new_inventory_id() {
    let mock = MockVsphereClient::new();
    let pipeline = pipeline_over(&mock, fast_settings());

    let vm = pipeline.run(&request("node-a")).await.unwrap();

    // The adopted id is live on the remote side; the mock re-registered
    // the VM under a fresh id, so the record must be reachable there
    let info = mock.vm_info(&vm.vm_id).await.unwrap();
    assert_eq!(info.name, "node-a");
    assert_eq!(mock.register_count(), 1);
    assert!(mock.descriptors_synced(&vm.vm_id));
}

#[tokio::test(start_paused = true)]
async fn quiescence_interval_is_respected_before_reregistration() {
    let mock = MockVsphereClient::new();
    let settings = PipelineSettings {
        disk_settle_delay: Duration::from_secs(10),
        ..fast_settings()
    };
    let pipeline = pipeline_over(&mock, settings);

    let started = tokio::time::Instant::now();
    let vm = pipeline.run(&request("node-a")).await.unwrap();
    assert_eq!(vm.phase, VmPhase::PoweredOn);
    assert!(started.elapsed() >= Duration::from_secs(10));
}

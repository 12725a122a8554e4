//! Test utilities for unit testing the provisioning pipeline
//!
//! This module provides helpers for creating test requests and setting up
//! mock backend scenarios.

use crate::pipeline::PipelineSettings;
use crate::power::RetrySchedule;
use crate::spec_builder::VmRequest;
use std::time::Duration;
use tokio::sync::watch;
use vsphere_client::{
    DeviceChange, DeviceKind, Firmware, HypervisorBackend, MockVsphereClient, Placement,
    VirtualDevice, VmCreateRequest,
};

/// A valid request for the node `name` with a boot disk only
pub fn request(name: &str) -> VmRequest {
    VmRequest {
        name: name.to_string(),
        cpus: 4,
        memory_mib: 8192,
        boot_disk_gb: 100,
        data_disk_gb: None,
        datastore: "datastore1".to_string(),
        portgroup: "VM Network".to_string(),
        mac: None,
        iso: None,
        iommu: false,
        precision_clock: false,
        watchdog: false,
        thin_provision: true,
        cpu_affinity: None,
        resource_pool: None,
        folder: None,
    }
}

/// Fresh shutdown channel in the not-cancelled state
pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Pipeline settings with no quiescence delay and no power-on retries,
/// so tests that don't exercise those paths finish immediately
pub fn fast_settings() -> PipelineSettings {
    PipelineSettings {
        task_poll_interval: Duration::from_millis(10),
        task_timeout: Duration::from_secs(120),
        disk_settle_delay: Duration::ZERO,
        power_retry: RetrySchedule::none(),
        ..PipelineSettings::default()
    }
}

/// Create a bare VM shell (one boot controller) directly on the mock and
/// return its id, for tests that start beyond phase 1
pub async fn provisioned_shell(mock: &MockVsphereClient, name: &str) -> String {
    let spec = VmCreateRequest {
        name: name.to_string(),
        guest_id: "OTHER_LINUX_64".to_string(),
        cpu_count: 2,
        memory_mib: 2048,
        firmware: Firmware::Efi,
        iommu: false,
        cpu_affinity: None,
        placement: Placement {
            datastore: "datastore1".to_string(),
            folder: "vm".to_string(),
            resource_pool: "Resources".to_string(),
        },
        device_changes: vec![DeviceChange::add(VirtualDevice {
            key: -100,
            kind: DeviceKind::ScsiController,
            controller_key: None,
            unit_number: None,
            bus_number: Some(0),
            capacity_gb: None,
            mac_address: None,
            backing: None,
        })],
    };
    let task = mock.create_vm(&spec).await.unwrap();
    let outcome = mock
        .wait_for_task(&task, Duration::from_millis(10), Duration::from_secs(10))
        .await
        .unwrap();
    outcome.entity_id.unwrap()
}

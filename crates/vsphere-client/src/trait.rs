//! HypervisorBackend trait for mocking
//!
//! This trait abstracts the hypervisor control API so that controllers can
//! run against the concrete `VsphereClient` in production and against mock
//! implementations in unit tests. It is also the seam for alternate
//! backends (Proxmox, TrueNAS): a backend whose device model diverges
//! supplies its own implementation of the same capability surface.

use crate::error::VsphereError;
use crate::models::*;
use std::time::Duration;

/// Capability surface of a hypervisor backend
///
/// Every mutation returns a [`RemoteTask`] that must be awaited through
/// [`wait_for_task`](HypervisorBackend::wait_for_task) before the mutated
/// entity may be relied upon. All async methods must be `Send` to work
/// with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait HypervisorBackend: Send + Sync {
    /// Submit a VM creation request
    async fn create_vm(&self, spec: &VmCreateRequest) -> Result<RemoteTask, VsphereError>;

    /// Submit a device reconfiguration against an existing VM
    async fn reconfigure_vm(
        &self,
        vm_id: &str,
        changes: &[DeviceChange],
    ) -> Result<RemoteTask, VsphereError>;

    /// Read back the VM's current device inventory (a property read, not a
    /// mutation)
    async fn list_devices(&self, vm_id: &str) -> Result<Vec<DeviceInfo>, VsphereError>;

    /// Fetch the VM summary, including its descriptor path
    async fn vm_info(&self, vm_id: &str) -> Result<VmInfo, VsphereError>;

    /// Remove the VM from inventory. The on-storage files are untouched.
    async fn unregister_vm(&self, vm_id: &str) -> Result<(), VsphereError>;

    /// Register a VM from its on-disk descriptor path. The task outcome
    /// carries the (possibly new) VM identifier.
    async fn register_vm(&self, request: &RegisterRequest) -> Result<RemoteTask, VsphereError>;

    /// Submit a power-on request
    async fn power_on(&self, vm_id: &str) -> Result<RemoteTask, VsphereError>;

    /// Submit a power-off request
    async fn power_off(&self, vm_id: &str) -> Result<RemoteTask, VsphereError>;

    /// Read the VM's current power state
    async fn power_state(&self, vm_id: &str) -> Result<PowerState, VsphereError>;

    /// Delete the VM from inventory and storage
    async fn delete_vm(&self, vm_id: &str) -> Result<(), VsphereError>;

    /// Upload a local ISO image to a datastore path, returning the
    /// datastore path of the uploaded file
    async fn upload_iso(
        &self,
        datastore: &str,
        ds_path: &str,
        local_path: &std::path::Path,
    ) -> Result<String, VsphereError>;

    /// Block until the task completes or `timeout` elapses, polling every
    /// `poll_interval`
    async fn wait_for_task(
        &self,
        task: &RemoteTask,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<TaskOutcome, VsphereError>;

    /// Whether disks created on this backend can retain stale adapter-type
    /// descriptor metadata that only an inventory re-registration repairs.
    ///
    /// Backends without the defect return `false`, and the descriptor
    /// reconciliation phase becomes a no-op against them.
    fn needs_descriptor_reconcile(&self) -> bool {
        true
    }
}

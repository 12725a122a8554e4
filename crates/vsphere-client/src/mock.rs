//! Mock HypervisorBackend for unit testing
//!
//! This module provides an in-memory implementation of `HypervisorBackend`
//! that can be used in unit tests without a reachable vCenter. Tasks
//! resolve immediately unless scripted otherwise, and the mock records
//! enough telemetry (attempt counters, concurrency high-water mark) for
//! the controller test suite to assert against.

use crate::error::VsphereError;
use crate::models::*;
use crate::vsphere_trait::HypervisorBackend;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
struct MockVm {
    name: String,
    devices: Vec<DeviceInfo>,
    power_state: PowerState,
    config_path: String,
    /// Disk descriptors carry stale adapter-type metadata until the VM is
    /// re-registered from its descriptor path
    descriptors_synced: bool,
}

#[derive(Debug, Clone)]
enum TaskResult {
    Succeed { entity_id: Option<String> },
    Fail { message: String },
    /// Task never leaves the RUNNING state; waiting on it times out
    Hang,
}

/// Mock hypervisor backend for testing
///
/// Stores VMs in memory, assigns hypervisor-style device keys on creation
/// (ignoring submitted placeholder keys), and can be scripted to fail or
/// hang specific operations.
#[derive(Clone)]
pub struct MockVsphereClient {
    vms: Arc<Mutex<HashMap<String, MockVm>>>,
    /// VMs removed from inventory but still present on storage, keyed by
    /// descriptor path
    unregistered: Arc<Mutex<HashMap<String, MockVm>>>,
    tasks: Arc<Mutex<HashMap<String, TaskResult>>>,
    next_id: Arc<AtomicUsize>,
    next_device_key: Arc<AtomicUsize>,

    // Scripted behavior
    fail_create: Arc<Mutex<Option<String>>>,
    fail_reconfigure: Arc<Mutex<Option<String>>>,
    hang_create: Arc<Mutex<bool>>,
    fail_power_on_remaining: Arc<AtomicUsize>,
    hidden_controller_buses: Arc<Mutex<HashSet<i32>>>,
    descriptor_defect: Arc<Mutex<bool>>,
    op_latency: Arc<Mutex<Duration>>,

    // Telemetry
    power_on_attempts: Arc<AtomicUsize>,
    register_count: Arc<AtomicUsize>,
    unregister_count: Arc<AtomicUsize>,
    reconfigure_count: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

/// Decrements the in-flight gauge when a backend call returns
struct InFlightGuard {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for MockVsphereClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockVsphereClient {
    /// Create a new mock backend
    pub fn new() -> Self {
        Self {
            vms: Arc::new(Mutex::new(HashMap::new())),
            unregistered: Arc::new(Mutex::new(HashMap::new())),
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicUsize::new(1)),
            next_device_key: Arc::new(AtomicUsize::new(1000)),
            fail_create: Arc::new(Mutex::new(None)),
            fail_reconfigure: Arc::new(Mutex::new(None)),
            hang_create: Arc::new(Mutex::new(false)),
            fail_power_on_remaining: Arc::new(AtomicUsize::new(0)),
            hidden_controller_buses: Arc::new(Mutex::new(HashSet::new())),
            descriptor_defect: Arc::new(Mutex::new(true)),
            op_latency: Arc::new(Mutex::new(Duration::ZERO)),
            power_on_attempts: Arc::new(AtomicUsize::new(0)),
            register_count: Arc::new(AtomicUsize::new(0)),
            unregister_count: Arc::new(AtomicUsize::new(0)),
            reconfigure_count: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    // Test setup knobs

    /// Script the next creation request to fail with `message`
    pub fn fail_create(&self, message: impl Into<String>) {
        *self.fail_create.lock().unwrap() = Some(message.into());
    }

    /// Script the next reconfiguration request to fail with `message`
    pub fn fail_reconfigure(&self, message: impl Into<String>) {
        *self.fail_reconfigure.lock().unwrap() = Some(message.into());
    }

    /// Script creation tasks to hang until the task wait times out
    pub fn hang_create(&self) {
        *self.hang_create.lock().unwrap() = true;
    }

    /// Script the next `n` power-on tasks to fail
    pub fn fail_next_power_on_tasks(&self, n: usize) {
        self.fail_power_on_remaining.store(n, Ordering::SeqCst);
    }

    /// Hide controllers on the given bus from device read-backs, simulating
    /// a partially failed creation
    pub fn drop_controller_on_readback(&self, bus: i32) {
        self.hidden_controller_buses.lock().unwrap().insert(bus);
    }

    /// Configure whether this backend exhibits the stale-descriptor defect
    pub fn set_descriptor_defect(&self, defect: bool) {
        *self.descriptor_defect.lock().unwrap() = defect;
    }

    /// Simulated latency applied to every backend call, for concurrency
    /// observation in coordinator tests
    pub fn set_op_latency(&self, latency: Duration) {
        *self.op_latency.lock().unwrap() = latency;
    }

    // Telemetry accessors

    /// Number of power-on tasks issued
    pub fn power_on_attempts(&self) -> usize {
        self.power_on_attempts.load(Ordering::SeqCst)
    }

    /// Number of register calls issued
    pub fn register_count(&self) -> usize {
        self.register_count.load(Ordering::SeqCst)
    }

    /// Number of unregister calls issued
    pub fn unregister_count(&self) -> usize {
        self.unregister_count.load(Ordering::SeqCst)
    }

    /// Number of reconfigure calls issued
    pub fn reconfigure_count(&self) -> usize {
        self.reconfigure_count.load(Ordering::SeqCst)
    }

    /// High-water mark of concurrently executing backend calls
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Whether the VM's disk descriptors have been resynchronized by a
    /// re-registration
    pub fn descriptors_synced(&self, vm_id: &str) -> bool {
        self.vms
            .lock()
            .unwrap()
            .get(vm_id)
            .map(|vm| vm.descriptors_synced)
            .unwrap_or(false)
    }

    // Internals

    fn track(&self) -> InFlightGuard {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    async fn simulate_latency(&self) {
        let latency = *self.op_latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn next_device_key(&self) -> i32 {
        self.next_device_key.fetch_add(1, Ordering::SeqCst) as i32
    }

    fn finish_task(&self, result: TaskResult) -> RemoteTask {
        let id = self.next_id("task");
        self.tasks.lock().unwrap().insert(id.clone(), result);
        RemoteTask { id }
    }

    fn label_for(kind: DeviceKind, bus_or_unit: Option<i32>) -> String {
        match kind {
            DeviceKind::ScsiController => {
                format!("SCSI controller {}", bus_or_unit.unwrap_or(0))
            }
            DeviceKind::Disk => format!("Hard disk {}", bus_or_unit.unwrap_or(0) + 1),
            DeviceKind::Ethernet => "Network adapter 1".to_string(),
            DeviceKind::Cdrom => "CD/DVD drive 1".to_string(),
            DeviceKind::PrecisionClock => "Precision clock 1".to_string(),
            DeviceKind::Watchdog => "Watchdog timer 1".to_string(),
        }
    }

    fn realize_device(&self, device: &VirtualDevice) -> DeviceInfo {
        let bus_or_unit = match device.kind {
            DeviceKind::ScsiController => device.bus_number,
            _ => device.unit_number,
        };
        DeviceInfo {
            key: self.next_device_key(),
            kind: device.kind,
            bus_number: device.bus_number,
            controller_key: device.controller_key,
            unit_number: device.unit_number,
            label: Self::label_for(device.kind, bus_or_unit),
        }
    }
}

#[async_trait::async_trait]
impl HypervisorBackend for MockVsphereClient {
    async fn create_vm(&self, spec: &VmCreateRequest) -> Result<RemoteTask, VsphereError> {
        let _guard = self.track();
        self.simulate_latency().await;

        if spec.name.is_empty() {
            return Err(VsphereError::InvalidRequest("VM name is empty".to_string()));
        }
        if let Some(message) = self.fail_create.lock().unwrap().take() {
            return Ok(self.finish_task(TaskResult::Fail { message }));
        }
        if *self.hang_create.lock().unwrap() {
            return Ok(self.finish_task(TaskResult::Hang));
        }

        let vm_id = self.next_id("vm");
        let devices = spec
            .device_changes
            .iter()
            .map(|change| self.realize_device(&change.device))
            .collect();
        let vm = MockVm {
            name: spec.name.clone(),
            devices,
            power_state: PowerState::PoweredOff,
            config_path: format!(
                "[{}] {}/{}.vmx",
                spec.placement.datastore, spec.name, spec.name
            ),
            descriptors_synced: true,
        };
        self.vms.lock().unwrap().insert(vm_id.clone(), vm);
        Ok(self.finish_task(TaskResult::Succeed {
            entity_id: Some(vm_id),
        }))
    }

    async fn reconfigure_vm(
        &self,
        vm_id: &str,
        changes: &[DeviceChange],
    ) -> Result<RemoteTask, VsphereError> {
        let _guard = self.track();
        self.simulate_latency().await;
        self.reconfigure_count.fetch_add(1, Ordering::SeqCst);

        if let Some(message) = self.fail_reconfigure.lock().unwrap().take() {
            return Ok(self.finish_task(TaskResult::Fail { message }));
        }

        let mut vms = self.vms.lock().unwrap();
        let Some(vm) = vms.get_mut(vm_id) else {
            return Err(VsphereError::NotFound(format!("VM {} not found", vm_id)));
        };

        // Reject device additions that reference a controller key absent
        // from the VM, mirroring the hypervisor's InvalidDeviceSpec fault
        let known_keys: HashSet<i32> = vm.devices.iter().map(|d| d.key).collect();
        for change in changes {
            if let Some(controller_key) = change.device.controller_key {
                if !known_keys.contains(&controller_key) {
                    return Ok(self.finish_task(TaskResult::Fail {
                        message: format!(
                            "InvalidDeviceSpec: controller key {} does not exist",
                            controller_key
                        ),
                    }));
                }
            }
        }

        let mut added_disks = false;
        for change in changes {
            match change.operation {
                DeviceOperation::Add => {
                    if change.device.kind == DeviceKind::Disk {
                        added_disks = true;
                    }
                    let realized = self.realize_device(&change.device);
                    vm.devices.push(realized);
                }
                DeviceOperation::Edit | DeviceOperation::Remove => {}
            }
        }
        if added_disks && *self.descriptor_defect.lock().unwrap() {
            // Newly created disk descriptors default to the creation-time
            // adapter type; they stay stale until re-registration
            vm.descriptors_synced = false;
        }
        drop(vms);

        Ok(self.finish_task(TaskResult::Succeed { entity_id: None }))
    }

    async fn list_devices(&self, vm_id: &str) -> Result<Vec<DeviceInfo>, VsphereError> {
        let _guard = self.track();
        self.simulate_latency().await;

        let hidden = self.hidden_controller_buses.lock().unwrap().clone();
        let vms = self.vms.lock().unwrap();
        let Some(vm) = vms.get(vm_id) else {
            return Err(VsphereError::NotFound(format!("VM {} not found", vm_id)));
        };
        Ok(vm
            .devices
            .iter()
            .filter(|d| {
                !(d.kind == DeviceKind::ScsiController
                    && d.bus_number.is_some_and(|bus| hidden.contains(&bus)))
            })
            .cloned()
            .collect())
    }

    async fn vm_info(&self, vm_id: &str) -> Result<VmInfo, VsphereError> {
        let _guard = self.track();
        self.simulate_latency().await;

        let vms = self.vms.lock().unwrap();
        let Some(vm) = vms.get(vm_id) else {
            return Err(VsphereError::NotFound(format!("VM {} not found", vm_id)));
        };
        Ok(VmInfo {
            id: vm_id.to_string(),
            name: vm.name.clone(),
            config_path: vm.config_path.clone(),
            power_state: vm.power_state,
        })
    }

    async fn unregister_vm(&self, vm_id: &str) -> Result<(), VsphereError> {
        let _guard = self.track();
        self.simulate_latency().await;
        self.unregister_count.fetch_add(1, Ordering::SeqCst);

        let Some(vm) = self.vms.lock().unwrap().remove(vm_id) else {
            return Err(VsphereError::NotFound(format!("VM {} not found", vm_id)));
        };
        self.unregistered
            .lock()
            .unwrap()
            .insert(vm.config_path.clone(), vm);
        Ok(())
    }

    async fn register_vm(&self, request: &RegisterRequest) -> Result<RemoteTask, VsphereError> {
        let _guard = self.track();
        self.simulate_latency().await;
        self.register_count.fetch_add(1, Ordering::SeqCst);

        let Some(mut vm) = self.unregistered.lock().unwrap().remove(&request.path) else {
            return Ok(self.finish_task(TaskResult::Fail {
                message: format!("no descriptor at {}", request.path),
            }));
        };
        // Registration recomputes per-disk descriptor metadata from the
        // declared controller types
        vm.descriptors_synced = true;
        vm.name = request.name.clone();

        let new_id = self.next_id("vm");
        self.vms.lock().unwrap().insert(new_id.clone(), vm);
        Ok(self.finish_task(TaskResult::Succeed {
            entity_id: Some(new_id),
        }))
    }

    async fn power_on(&self, vm_id: &str) -> Result<RemoteTask, VsphereError> {
        let _guard = self.track();
        self.simulate_latency().await;
        self.power_on_attempts.fetch_add(1, Ordering::SeqCst);

        let remaining = self.fail_power_on_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_power_on_remaining
                .store(remaining - 1, Ordering::SeqCst);
            return Ok(self.finish_task(TaskResult::Fail {
                message: "GenericVmConfigFault: disk consolidation in progress".to_string(),
            }));
        }

        let mut vms = self.vms.lock().unwrap();
        let Some(vm) = vms.get_mut(vm_id) else {
            return Err(VsphereError::NotFound(format!("VM {} not found", vm_id)));
        };
        vm.power_state = PowerState::PoweredOn;
        drop(vms);
        Ok(self.finish_task(TaskResult::Succeed { entity_id: None }))
    }

    async fn power_off(&self, vm_id: &str) -> Result<RemoteTask, VsphereError> {
        let _guard = self.track();
        self.simulate_latency().await;

        let mut vms = self.vms.lock().unwrap();
        let Some(vm) = vms.get_mut(vm_id) else {
            return Err(VsphereError::NotFound(format!("VM {} not found", vm_id)));
        };
        vm.power_state = PowerState::PoweredOff;
        drop(vms);
        Ok(self.finish_task(TaskResult::Succeed { entity_id: None }))
    }

    async fn power_state(&self, vm_id: &str) -> Result<PowerState, VsphereError> {
        let _guard = self.track();
        self.simulate_latency().await;

        let vms = self.vms.lock().unwrap();
        vms.get(vm_id)
            .map(|vm| vm.power_state)
            .ok_or_else(|| VsphereError::NotFound(format!("VM {} not found", vm_id)))
    }

    async fn delete_vm(&self, vm_id: &str) -> Result<(), VsphereError> {
        let _guard = self.track();
        self.simulate_latency().await;

        self.vms
            .lock()
            .unwrap()
            .remove(vm_id)
            .map(|_| ())
            .ok_or_else(|| VsphereError::NotFound(format!("VM {} not found", vm_id)))
    }

    async fn upload_iso(
        &self,
        datastore: &str,
        ds_path: &str,
        _local_path: &std::path::Path,
    ) -> Result<String, VsphereError> {
        let _guard = self.track();
        self.simulate_latency().await;
        Ok(format!("[{}] {}", datastore, ds_path))
    }

    async fn wait_for_task(
        &self,
        task: &RemoteTask,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<TaskOutcome, VsphereError> {
        let _guard = self.track();
        self.simulate_latency().await;

        let result = self.tasks.lock().unwrap().get(&task.id).cloned();
        match result {
            Some(TaskResult::Succeed { entity_id }) => Ok(TaskOutcome { entity_id }),
            Some(TaskResult::Fail { message }) => Err(VsphereError::Task {
                task_id: task.id.clone(),
                message,
            }),
            Some(TaskResult::Hang) => {
                let started = tokio::time::Instant::now();
                loop {
                    tokio::time::sleep(poll_interval).await;
                    if started.elapsed() >= timeout {
                        return Err(VsphereError::TaskTimeout {
                            task_id: task.id.clone(),
                            waited: started.elapsed(),
                        });
                    }
                }
            }
            None => Err(VsphereError::NotFound(format!("task {} not found", task.id))),
        }
    }

    fn needs_descriptor_reconcile(&self) -> bool {
        *self.descriptor_defect.lock().unwrap()
    }
}

//! Per-VM provisioning pipeline
//!
//! Runs the strictly ordered phases that take one VM request to a powered
//! on node:
//!
//! 1. Create the VM shell with its bus controllers only
//! 2. Read back the hypervisor-assigned controller keys and attach disks
//!    and the remaining devices against them
//! 3. Re-register the VM from its descriptor path so the hypervisor
//!    resynchronizes per-disk adapter-type metadata
//! 4. Power on with bounded retry
//!
//! No phase begins before the prior phase's remote task is confirmed
//! complete. Disks are never submitted in the creation request because
//! the controller keys submitted there are placeholders the hypervisor
//! replaces; referencing one from a disk is undefined behavior remotely.

use crate::error::{PipelineError, PipelinePhase, ProvisionError};
use crate::power::{self, RetrySchedule};
use crate::spec_builder::{self, BusRole, ControllerIntent, DeviceIntent, VmRequest};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};
use vsphere_client::{
    DeviceBacking, DeviceChange, DeviceInfo, DeviceKind, Firmware, HypervisorBackend, Placement,
    RegisterRequest, RemoteTask, TaskOutcome, VirtualDevice, VmCreateRequest, VsphereError,
};

/// Hypervisor-assigned identity of a device, or the fact that none has
/// been assigned yet
///
/// "Not yet known" is a type-level state here; placeholder wire keys never
/// escape request construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKey {
    /// Identity not yet allocated by the hypervisor
    Pending,
    /// Hypervisor-assigned key
    Resolved(i32),
}

impl DeviceKey {
    /// The resolved key, if one has been assigned
    pub fn resolved(self) -> Option<i32> {
        match self {
            Self::Pending => None,
            Self::Resolved(key) => Some(key),
        }
    }
}

/// Provisioning phase a VM has reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmPhase {
    /// Shell exists with controllers; no disks yet
    ControllersCreated,
    /// Disks and deferred devices are attached
    DisksAttached,
    /// Inventory re-registration completed (or was skipped as unneeded)
    Reregistered,
    /// Power-on confirmed
    PoweredOn,
}

/// One device owned by a provisioned VM
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub kind: DeviceKind,
    /// Bus role, for controllers and the disks that attach to them
    pub role: Option<BusRole>,
    pub key: DeviceKey,
}

/// The orchestrator's view of one remote VM
#[derive(Debug, Clone)]
pub struct ProvisionedVm {
    /// Current inventory identifier. Re-registration may replace it.
    pub vm_id: String,
    pub name: String,
    pub phase: VmPhase,
    pub devices: Vec<DeviceRecord>,
}

impl ProvisionedVm {
    /// Count devices of one kind
    pub fn count_of(&self, kind: DeviceKind) -> usize {
        self.devices.iter().filter(|d| d.kind == kind).count()
    }
}

/// Bus role to hypervisor-assigned controller key mapping, derived from
/// the device read-back after shell creation
#[derive(Debug, Clone, Default)]
pub struct ControllerAllocation {
    keys: HashMap<BusRole, i32>,
}

impl ControllerAllocation {
    /// Record a resolved controller key
    pub fn insert(&mut self, role: BusRole, key: i32) {
        self.keys.insert(role, key);
    }

    /// Resolved key for a role, if present
    pub fn get(&self, role: BusRole) -> Option<i32> {
        self.keys.get(&role).copied()
    }

    /// Resolved key for a role, or the precondition violation that a disk
    /// would otherwise trip remotely
    pub fn require(&self, role: BusRole) -> Result<i32, ProvisionError> {
        self.get(role).ok_or_else(|| {
            ProvisionError::StructuralInvariant(format!(
                "no resolved controller for {} role",
                role
            ))
        })
    }
}

/// Tunables for the pipeline's remote waits
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Poll interval for remote task waits
    pub task_poll_interval: Duration,
    /// Bound on any single remote task wait
    pub task_timeout: Duration,
    /// Quiescence interval between disk attachment and re-registration.
    /// Background finalization of new disk backing files is not signaled
    /// by task completion; this is an empirical heuristic, not a
    /// guarantee.
    pub disk_settle_delay: Duration,
    /// Wait schedule for power-on attempts
    pub power_retry: RetrySchedule,
    /// Default resource pool for placement and re-registration
    pub resource_pool: String,
    /// Default inventory folder
    pub folder: String,
    /// Guest OS identifier submitted at creation
    pub guest_id: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            task_poll_interval: Duration::from_secs(2),
            task_timeout: Duration::from_secs(120),
            disk_settle_delay: Duration::from_secs(10),
            power_retry: RetrySchedule::default_power_on(),
            resource_pool: "Resources".to_string(),
            folder: "vm".to_string(),
            guest_id: "OTHER_LINUX_64".to_string(),
        }
    }
}

/// Executes the phased provisioning sequence for single VMs
#[derive(Clone)]
pub struct ProvisioningPipeline {
    backend: Arc<dyn HypervisorBackend>,
    settings: Arc<PipelineSettings>,
    shutdown: watch::Receiver<bool>,
}

impl std::fmt::Debug for ProvisioningPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningPipeline")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ProvisioningPipeline {
    /// Create a pipeline over a backend
    pub fn new(
        backend: Arc<dyn HypervisorBackend>,
        settings: Arc<PipelineSettings>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            backend,
            settings,
            shutdown,
        }
    }

    /// Run all phases for one request
    ///
    /// Halts at the first error; the phase it escaped from is part of the
    /// returned error. Partially created remote state is left as is.
    pub async fn run(&self, req: &VmRequest) -> Result<ProvisionedVm, PipelineError> {
        let tag = |phase: PipelinePhase| move |error: ProvisionError| PipelineError::new(phase, error);

        let (controllers, devices) =
            spec_builder::build(req).map_err(tag(PipelinePhase::Validate))?;

        self.ensure_running().map_err(tag(PipelinePhase::CreateShell))?;
        let mut vm = self
            .create_shell(req, &controllers)
            .await
            .map_err(tag(PipelinePhase::CreateShell))?;

        self.ensure_running().map_err(tag(PipelinePhase::ResolveControllers))?;
        let allocation = self
            .resolve_controllers(&mut vm, &controllers)
            .await
            .map_err(tag(PipelinePhase::ResolveControllers))?;

        self.ensure_running().map_err(tag(PipelinePhase::AttachDisks))?;
        self.attach_disks(&mut vm, &allocation, &devices, req)
            .await
            .map_err(tag(PipelinePhase::AttachDisks))?;

        self.ensure_running().map_err(tag(PipelinePhase::Reregister))?;
        self.reregister(&mut vm, req).await.map_err(tag(PipelinePhase::Reregister))?;

        self.ensure_running().map_err(tag(PipelinePhase::PowerOn))?;
        power::power_on_with_retry(
            self.backend.as_ref(),
            &vm.vm_id,
            &self.settings.power_retry,
            self.settings.task_poll_interval,
            self.settings.task_timeout,
            &self.shutdown,
        )
        .await
        .map_err(tag(PipelinePhase::PowerOn))?;
        vm.phase = VmPhase::PoweredOn;

        info!("VM {} ({}) provisioned and powered on", vm.name, vm.vm_id);
        Ok(vm)
    }

    fn ensure_running(&self) -> Result<(), ProvisionError> {
        if *self.shutdown.borrow() {
            Err(ProvisionError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Await a remote task, racing the shutdown signal
    async fn wait_task(
        &self,
        task: &RemoteTask,
        operation: &str,
    ) -> Result<TaskOutcome, ProvisionError> {
        let wait = self.backend.wait_for_task(
            task,
            self.settings.task_poll_interval,
            self.settings.task_timeout,
        );
        tokio::select! {
            outcome = wait => match outcome {
                Ok(outcome) => Ok(outcome),
                Err(VsphereError::TaskTimeout { waited, .. }) => Err(ProvisionError::Timeout {
                    operation: operation.to_string(),
                    waited,
                }),
                Err(error) => Err(ProvisionError::Remote(error)),
            },
            () = power::wait_cancelled(self.shutdown.clone()) => Err(ProvisionError::Cancelled),
        }
    }

    fn placement(&self, req: &VmRequest) -> Placement {
        Placement {
            datastore: req.datastore.clone(),
            folder: req
                .folder
                .clone()
                .unwrap_or_else(|| self.settings.folder.clone()),
            resource_pool: req
                .resource_pool
                .clone()
                .unwrap_or_else(|| self.settings.resource_pool.clone()),
        }
    }

    /// Phase 1: create the VM shell with controllers only
    async fn create_shell(
        &self,
        req: &VmRequest,
        controllers: &[ControllerIntent],
    ) -> Result<ProvisionedVm, ProvisionError> {
        info!("Creating VM shell {} with {} controller(s)", req.name, controllers.len());

        let device_changes = controllers
            .iter()
            .enumerate()
            .map(|(i, controller)| {
                DeviceChange::add(VirtualDevice {
                    // Placeholder key; the hypervisor assigns the real one
                    key: -(100 + i as i32),
                    kind: DeviceKind::ScsiController,
                    controller_key: None,
                    unit_number: None,
                    bus_number: Some(controller.role.bus_number()),
                    capacity_gb: None,
                    mac_address: None,
                    backing: None,
                })
            })
            .collect();

        let spec = VmCreateRequest {
            name: req.name.clone(),
            guest_id: self.settings.guest_id.clone(),
            cpu_count: req.cpus,
            memory_mib: req.memory_mib,
            firmware: Firmware::Efi,
            iommu: req.iommu,
            cpu_affinity: req.cpu_affinity.clone(),
            placement: self.placement(req),
            device_changes,
        };

        let task = self.backend.create_vm(&spec).await?;
        let outcome = self.wait_task(&task, "VM creation task").await?;
        let vm_id = outcome.entity_id.ok_or_else(|| {
            ProvisionError::Remote(VsphereError::Api(
                "creation task completed without a VM identifier".to_string(),
            ))
        })?;
        debug!("VM shell {} created as {}", req.name, vm_id);

        Ok(ProvisionedVm {
            vm_id,
            name: req.name.clone(),
            phase: VmPhase::ControllersCreated,
            devices: controllers
                .iter()
                .map(|controller| DeviceRecord {
                    kind: DeviceKind::ScsiController,
                    role: Some(controller.role),
                    key: DeviceKey::Pending,
                })
                .collect(),
        })
    }

    /// Phase 1 read-back: map bus roles to hypervisor-assigned keys.
    ///
    /// Matching is by bus number and type, never by submitted key, since
    /// placeholder keys are not guaranteed stable across creation.
    async fn resolve_controllers(
        &self,
        vm: &mut ProvisionedVm,
        expected: &[ControllerIntent],
    ) -> Result<ControllerAllocation, ProvisionError> {
        let devices = self.backend.list_devices(&vm.vm_id).await?;

        let mut allocation = ControllerAllocation::default();
        let mut missing = Vec::new();
        for controller in expected {
            match find_controller(&devices, controller.role) {
                Some(info) => {
                    allocation.insert(controller.role, info.key);
                    if let Some(record) = vm
                        .devices
                        .iter_mut()
                        .find(|r| r.role == Some(controller.role))
                    {
                        record.key = DeviceKey::Resolved(info.key);
                    }
                }
                None => missing.push(controller.role.to_string()),
            }
        }

        if !missing.is_empty() {
            return Err(ProvisionError::StructuralInvariant(format!(
                "VM {} is missing expected controller role(s) after creation: {}",
                vm.vm_id,
                missing.join(", ")
            )));
        }
        debug!("Resolved {} controller key(s) for VM {}", expected.len(), vm.vm_id);
        Ok(allocation)
    }

    /// Phase 2: attach disks and the deferred devices in one request.
    ///
    /// All additions ride in a single reconfiguration so disks on the same
    /// controller cannot race for unit numbers across requests. The
    /// controller references are checked against the allocation before
    /// anything is submitted.
    async fn attach_disks(
        &self,
        vm: &mut ProvisionedVm,
        allocation: &ControllerAllocation,
        intents: &[DeviceIntent],
        req: &VmRequest,
    ) -> Result<(), ProvisionError> {
        let mut changes = Vec::with_capacity(intents.len());
        let mut records = Vec::with_capacity(intents.len());
        let mut units: HashMap<BusRole, i32> = HashMap::new();

        for (i, intent) in intents.iter().enumerate() {
            // Placeholder key for the add request only
            let key = -(200 + i as i32);
            let device = match intent {
                DeviceIntent::Disk {
                    attach_to,
                    capacity_gb,
                    thin,
                } => {
                    let controller_key = allocation.require(*attach_to)?;
                    let unit = units.entry(*attach_to).or_insert(0);
                    let unit_number = *unit;
                    *unit += 1;
                    records.push(DeviceRecord {
                        kind: DeviceKind::Disk,
                        role: Some(*attach_to),
                        key: DeviceKey::Pending,
                    });
                    VirtualDevice {
                        key,
                        kind: DeviceKind::Disk,
                        controller_key: Some(controller_key),
                        unit_number: Some(unit_number),
                        bus_number: None,
                        capacity_gb: Some(*capacity_gb),
                        mac_address: None,
                        backing: Some(DeviceBacking::DatastoreFile {
                            datastore: req.datastore.clone(),
                            path: disk_path(&req.name, *attach_to, unit_number),
                            thin: *thin,
                        }),
                    }
                }
                DeviceIntent::Nic { portgroup, mac } => {
                    records.push(DeviceRecord {
                        kind: DeviceKind::Ethernet,
                        role: None,
                        key: DeviceKey::Pending,
                    });
                    VirtualDevice {
                        key,
                        kind: DeviceKind::Ethernet,
                        controller_key: None,
                        unit_number: None,
                        bus_number: None,
                        capacity_gb: None,
                        mac_address: mac.clone(),
                        backing: Some(DeviceBacking::Portgroup {
                            name: portgroup.clone(),
                        }),
                    }
                }
                DeviceIntent::Cdrom {
                    datastore,
                    iso_path,
                } => {
                    records.push(DeviceRecord {
                        kind: DeviceKind::Cdrom,
                        role: None,
                        key: DeviceKey::Pending,
                    });
                    VirtualDevice {
                        key,
                        kind: DeviceKind::Cdrom,
                        controller_key: None,
                        unit_number: None,
                        bus_number: None,
                        capacity_gb: None,
                        mac_address: None,
                        backing: Some(DeviceBacking::IsoFile {
                            datastore: datastore.clone(),
                            path: iso_path.clone(),
                        }),
                    }
                }
                DeviceIntent::PrecisionClock => {
                    records.push(DeviceRecord {
                        kind: DeviceKind::PrecisionClock,
                        role: None,
                        key: DeviceKey::Pending,
                    });
                    bare_device(key, DeviceKind::PrecisionClock)
                }
                DeviceIntent::Watchdog => {
                    records.push(DeviceRecord {
                        kind: DeviceKind::Watchdog,
                        role: None,
                        key: DeviceKey::Pending,
                    });
                    bare_device(key, DeviceKind::Watchdog)
                }
            };
            changes.push(DeviceChange::add(device));
        }

        info!("Attaching {} device(s) to VM {} in one reconfiguration", changes.len(), vm.vm_id);
        let task = self.backend.reconfigure_vm(&vm.vm_id, &changes).await?;
        self.wait_task(&task, "disk attachment task").await?;

        vm.devices.extend(records);
        vm.phase = VmPhase::DisksAttached;

        // Task completion does not cover background finalization of the
        // new backing files; give the hypervisor a quiescence interval
        // before touching inventory.
        if !self.settings.disk_settle_delay.is_zero() {
            debug!(
                "Waiting {:?} for disk backing finalization on VM {}",
                self.settings.disk_settle_delay, vm.vm_id
            );
            tokio::select! {
                () = tokio::time::sleep(self.settings.disk_settle_delay) => {}
                () = power::wait_cancelled(self.shutdown.clone()) => {
                    return Err(ProvisionError::Cancelled);
                }
            }
        }
        Ok(())
    }

    /// Phase 3: force descriptor resynchronization via unregister and
    /// re-register from the descriptor path.
    ///
    /// Disks attached in phase 2 can retain the creation-time adapter-type
    /// tag in their descriptors; registration recomputes it from the
    /// controller types in the configuration file. A backend without the
    /// defect skips this phase outright.
    async fn reregister(
        &self,
        vm: &mut ProvisionedVm,
        req: &VmRequest,
    ) -> Result<(), ProvisionError> {
        if !self.backend.needs_descriptor_reconcile() {
            debug!("Backend does not need descriptor reconciliation; skipping for VM {}", vm.vm_id);
            vm.phase = VmPhase::Reregistered;
            return Ok(());
        }

        let old_id = vm.vm_id.clone();
        let wrap = |new_id: Option<String>| {
            let old_id = old_id.clone();
            move |error: ProvisionError| ProvisionError::Reregister {
                old_id,
                new_id,
                source: Box::new(error),
            }
        };

        let info = self
            .backend
            .vm_info(&old_id)
            .await
            .map_err(ProvisionError::Remote)
            .map_err(wrap(None))?;

        info!("Re-registering VM {} from {}", old_id, info.config_path);
        self.backend
            .unregister_vm(&old_id)
            .await
            .map_err(ProvisionError::Remote)
            .map_err(wrap(None))?;

        let request = RegisterRequest {
            path: info.config_path,
            name: vm.name.clone(),
            placement: self.placement(req),
        };
        let task = self
            .backend
            .register_vm(&request)
            .await
            .map_err(ProvisionError::Remote)
            .map_err(wrap(None))?;
        let outcome = self
            .wait_task(&task, "VM registration task")
            .await
            .map_err(wrap(None))?;

        let new_id = outcome.entity_id.ok_or_else(|| {
            wrap(None)(ProvisionError::Remote(VsphereError::Api(
                "registration task completed without a VM identifier".to_string(),
            )))
        })?;
        if new_id != old_id {
            debug!("VM {} re-registered as {}", old_id, new_id);
        }
        vm.vm_id = new_id;
        vm.phase = VmPhase::Reregistered;
        Ok(())
    }
}

fn find_controller(devices: &[DeviceInfo], role: BusRole) -> Option<&DeviceInfo> {
    devices.iter().find(|d| {
        d.kind == DeviceKind::ScsiController && d.bus_number == Some(role.bus_number())
    })
}

fn disk_path(vm_name: &str, role: BusRole, unit: i32) -> String {
    match (role, unit) {
        (BusRole::Boot, 0) => format!("{}/{}.vmdk", vm_name, vm_name),
        (BusRole::Data, 0) => format!("{}/{}_data.vmdk", vm_name, vm_name),
        (_, unit) => format!("{}/{}_{}_{}.vmdk", vm_name, vm_name, role, unit),
    }
}

fn bare_device(key: i32, kind: DeviceKind) -> VirtualDevice {
    VirtualDevice {
        key,
        kind,
        controller_key: None,
        unit_number: None,
        bus_number: None,
        capacity_gb: None,
        mac_address: None,
        backing: None,
    }
}

//! VM spec builder
//!
//! Pure translation of a declarative VM request into device-creation
//! intents. Controllers and the devices that hang off them are kept
//! separate because they are submitted in different phases: controllers
//! ride in the creation request, everything else is deferred until the
//! hypervisor-assigned controller keys are known.

use crate::error::ProvisionError;
use serde::Deserialize;

/// Declarative request for one node VM
///
/// Owned by the caller and never mutated by the pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct VmRequest {
    /// VM name, unique within the target vCenter
    pub name: String,
    pub cpus: u32,
    pub memory_mib: u64,
    pub boot_disk_gb: u64,
    /// Secondary data disk; when present it gets its own controller
    #[serde(default)]
    pub data_disk_gb: Option<u64>,
    /// Datastore for the VM home directory and disks
    pub datastore: String,
    /// Portgroup for the network adapter
    pub portgroup: String,
    /// Statically assigned MAC; backend-generated when absent
    #[serde(default)]
    pub mac: Option<String>,
    /// Datastore-relative path of the boot ISO
    #[serde(default)]
    pub iso: Option<String>,
    /// Expose IOMMU to the guest
    #[serde(default)]
    pub iommu: bool,
    /// Add a precision clock device
    #[serde(default)]
    pub precision_clock: bool,
    /// Add a watchdog timer device
    #[serde(default)]
    pub watchdog: bool,
    /// Thin-provision disk backing files
    #[serde(default = "default_thin")]
    pub thin_provision: bool,
    /// Host CPU pinning set
    #[serde(default)]
    pub cpu_affinity: Option<Vec<u32>>,
    /// Resource pool override
    #[serde(default)]
    pub resource_pool: Option<String>,
    /// Inventory folder override
    #[serde(default)]
    pub folder: Option<String>,
}

fn default_thin() -> bool {
    true
}

/// Logical bus slot a controller fills and disks attach to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusRole {
    /// Bus 0, carries the boot disk
    Boot,
    /// Bus 1, carries the data disk
    Data,
}

impl BusRole {
    /// The fixed SCSI bus number backing this role
    pub fn bus_number(self) -> i32 {
        match self {
            Self::Boot => 0,
            Self::Data => 1,
        }
    }
}

impl std::fmt::Display for BusRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Boot => f.write_str("boot-bus"),
            Self::Data => f.write_str("data-bus"),
        }
    }
}

/// Intent to create one bus controller during shell creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerIntent {
    pub role: BusRole,
}

/// Intent to create one non-controller device, deferred to phase 2
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceIntent {
    /// A virtual disk attaching to a bus role. The role is resolved to a
    /// real controller key only after the shell exists; intents never
    /// carry keys.
    Disk {
        attach_to: BusRole,
        capacity_gb: u64,
        thin: bool,
    },
    /// The node's network adapter
    Nic {
        portgroup: String,
        mac: Option<String>,
    },
    /// Optical drive with the boot ISO inserted
    Cdrom { datastore: String, iso_path: String },
    /// Precision clock device
    PrecisionClock,
    /// Watchdog timer device
    Watchdog,
}

/// Build controller and device intents from a request
///
/// Pure function over the request plus static defaults. Fails on the
/// first violated constraint without partially building.
pub fn build(
    req: &VmRequest,
) -> Result<(Vec<ControllerIntent>, Vec<DeviceIntent>), ProvisionError> {
    if req.name.trim().is_empty() {
        return Err(ProvisionError::Validation("name must not be empty".to_string()));
    }
    if req.cpus == 0 {
        return Err(ProvisionError::Validation("cpu count must be positive".to_string()));
    }
    if req.memory_mib == 0 {
        return Err(ProvisionError::Validation("memory must be positive".to_string()));
    }
    if req.boot_disk_gb == 0 {
        return Err(ProvisionError::Validation(
            "boot disk size must be positive".to_string(),
        ));
    }
    if req.data_disk_gb == Some(0) {
        return Err(ProvisionError::Validation(
            "data disk size must be positive when present".to_string(),
        ));
    }
    if req.datastore.trim().is_empty() {
        return Err(ProvisionError::Validation("datastore must not be empty".to_string()));
    }
    if req.portgroup.trim().is_empty() {
        return Err(ProvisionError::Validation("portgroup must not be empty".to_string()));
    }
    if let Some(iso) = &req.iso {
        if iso.trim().is_empty() || !iso.ends_with(".iso") {
            return Err(ProvisionError::Validation(format!(
                "ISO path {:?} is not a datastore-relative .iso path",
                iso
            )));
        }
    }

    let mut controllers = vec![ControllerIntent { role: BusRole::Boot }];
    let mut devices = vec![DeviceIntent::Disk {
        attach_to: BusRole::Boot,
        capacity_gb: req.boot_disk_gb,
        thin: req.thin_provision,
    }];

    if let Some(data_disk_gb) = req.data_disk_gb {
        controllers.push(ControllerIntent { role: BusRole::Data });
        devices.push(DeviceIntent::Disk {
            attach_to: BusRole::Data,
            capacity_gb: data_disk_gb,
            thin: req.thin_provision,
        });
    }

    devices.push(DeviceIntent::Nic {
        portgroup: req.portgroup.clone(),
        mac: req.mac.clone(),
    });

    if let Some(iso) = &req.iso {
        devices.push(DeviceIntent::Cdrom {
            datastore: req.datastore.clone(),
            iso_path: iso.clone(),
        });
    }
    if req.precision_clock {
        devices.push(DeviceIntent::PrecisionClock);
    }
    if req.watchdog {
        devices.push(DeviceIntent::Watchdog);
    }

    Ok((controllers, devices))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::request;

    fn disk_count(devices: &[DeviceIntent]) -> usize {
        devices
            .iter()
            .filter(|d| matches!(d, DeviceIntent::Disk { .. }))
            .count()
    }

    #[test]
    fn single_disk_request_yields_one_controller_one_disk() {
        let mut req = request("node-a");
        req.data_disk_gb = None;
        req.iso = None;

        let (controllers, devices) = build(&req).unwrap();
        assert_eq!(controllers.len(), 1);
        assert_eq!(controllers[0].role, BusRole::Boot);
        assert_eq!(disk_count(&devices), 1);
    }

    #[test]
    fn data_disk_request_yields_two_controllers_two_disks() {
        let mut req = request("node-a");
        req.data_disk_gb = Some(500);

        let (controllers, devices) = build(&req).unwrap();
        assert_eq!(controllers.len(), 2);
        assert_eq!(controllers[1].role, BusRole::Data);
        assert_eq!(disk_count(&devices), 2);
        assert!(devices.iter().any(|d| matches!(
            d,
            DeviceIntent::Disk { attach_to: BusRole::Data, capacity_gb: 500, .. }
        )));
    }

    #[test]
    fn iso_maps_to_exactly_one_optical_drive() {
        let mut req = request("node-a");
        req.iso = Some("isos/talos.iso".to_string());
        let (_, devices) = build(&req).unwrap();
        let cdroms = devices
            .iter()
            .filter(|d| matches!(d, DeviceIntent::Cdrom { .. }))
            .count();
        assert_eq!(cdroms, 1);

        req.iso = None;
        let (_, devices) = build(&req).unwrap();
        assert!(!devices.iter().any(|d| matches!(d, DeviceIntent::Cdrom { .. })));
    }

    #[test]
    fn feature_flags_map_to_one_device_each() {
        let mut req = request("node-a");
        req.precision_clock = true;
        req.watchdog = true;

        let (_, devices) = build(&req).unwrap();
        assert!(devices.contains(&DeviceIntent::PrecisionClock));
        assert!(devices.contains(&DeviceIntent::Watchdog));

        req.precision_clock = false;
        req.watchdog = false;
        let (_, devices) = build(&req).unwrap();
        assert!(!devices.contains(&DeviceIntent::PrecisionClock));
        assert!(!devices.contains(&DeviceIntent::Watchdog));
    }

    #[test]
    fn validation_reports_first_violation_only() {
        let mut req = request("");
        req.cpus = 0;

        match build(&req) {
            Err(ProvisionError::Validation(message)) => {
                assert!(message.contains("name"), "got: {}", message);
            }
            other => panic!("expected validation error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn zero_sized_data_disk_is_rejected() {
        let mut req = request("node-a");
        req.data_disk_gb = Some(0);
        assert!(matches!(build(&req), Err(ProvisionError::Validation(_))));
    }

    #[test]
    fn malformed_iso_path_is_rejected() {
        let mut req = request("node-a");
        req.iso = Some("isos/talos.img".to_string());
        assert!(matches!(build(&req), Err(ProvisionError::Validation(_))));
    }
}

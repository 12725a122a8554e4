//! vSphere API models
//!
//! These models match the vSphere Automation API request/response bodies
//! used by the VMops controllers. Device keys follow the vSphere device
//! config-spec convention: a strictly negative key in a creation request
//! is a client-chosen placeholder that the hypervisor replaces with a real
//! key on commit, so placeholder keys must never be used to address a
//! device after creation.

use serde::{Deserialize, Serialize};

/// Firmware type for a virtual machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Firmware {
    Bios,
    Efi,
}

/// Power state of a virtual machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

/// Kind of virtual device carried in a device change or returned by a
/// hardware read-back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceKind {
    ScsiController,
    Disk,
    Ethernet,
    Cdrom,
    PrecisionClock,
    Watchdog,
}

/// Operation applied by a single device change within a reconfiguration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceOperation {
    Add,
    Edit,
    Remove,
}

/// Backing resource for a virtual device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceBacking {
    /// A (possibly not-yet-existing) VMDK on a datastore
    DatastoreFile {
        /// Datastore name, e.g. "datastore1"
        datastore: String,
        /// Datastore-relative file path, e.g. "node-a/node-a.vmdk"
        path: String,
        /// Thin-provision the backing file on creation
        thin: bool,
    },
    /// An ISO image on a datastore
    IsoFile {
        /// Datastore name
        datastore: String,
        /// Datastore-relative path to the ISO
        path: String,
    },
    /// A network portgroup
    Portgroup {
        /// Portgroup name, e.g. "VM Network"
        name: String,
    },
}

/// One virtual device as submitted in a creation or reconfiguration request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualDevice {
    /// Device key. Negative values are placeholders in requests; the
    /// hypervisor assigns the real key on commit.
    pub key: i32,
    pub kind: DeviceKind,
    /// Key of the controller this device attaches to, if any. Must be a
    /// resolved (non-negative) key outside of a creation request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_key: Option<i32>,
    /// Controller-relative unit number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_number: Option<i32>,
    /// Bus number (controllers only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bus_number: Option<i32>,
    /// Capacity in GiB (disks only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity_gb: Option<u64>,
    /// Manually assigned MAC address (network adapters only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backing: Option<DeviceBacking>,
}

/// A single entry in a device change list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceChange {
    pub operation: DeviceOperation,
    pub device: VirtualDevice,
}

impl DeviceChange {
    /// Convenience constructor for the common add case
    pub fn add(device: VirtualDevice) -> Self {
        Self {
            operation: DeviceOperation::Add,
            device,
        }
    }
}

/// Placement of a virtual machine within the inventory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Placement {
    /// Datastore holding the VM home directory
    pub datastore: String,
    /// Inventory folder
    pub folder: String,
    /// Resource pool
    pub resource_pool: String,
}

/// Request body for creating a virtual machine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmCreateRequest {
    pub name: String,
    /// Guest OS identifier, e.g. "OTHER_LINUX_64"
    pub guest_id: String,
    pub cpu_count: u32,
    pub memory_mib: u64,
    pub firmware: Firmware,
    /// Expose IOMMU to the guest
    #[serde(default)]
    pub iommu: bool,
    /// Host CPU pinning set, if the node profile demands one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_affinity: Option<Vec<u32>>,
    pub placement: Placement,
    /// Devices to create together with the VM
    pub device_changes: Vec<DeviceChange>,
}

/// Request body for registering a VM from its on-disk descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Datastore path of the VMX descriptor, e.g. "[datastore1] node-a/node-a.vmx"
    pub path: String,
    pub name: String,
    pub placement: Placement,
}

/// One hypervisor device as returned by a hardware read-back.
///
/// Keys here are always real, hypervisor-assigned identities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub key: i32,
    pub kind: DeviceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bus_number: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_key: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_number: Option<i32>,
    /// Human-readable device label, e.g. "SCSI controller 0"
    #[serde(default)]
    pub label: String,
}

/// Summary view of a virtual machine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmInfo {
    /// Managed object identifier, e.g. "vm-1042"
    pub id: String,
    pub name: String,
    /// Datastore path of the VMX descriptor
    pub config_path: String,
    pub power_state: PowerState,
}

/// Handle for an asynchronous remote operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteTask {
    /// Task identifier, e.g. "task-5213"
    pub id: String,
}

/// Lifecycle state of a remote task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

/// Task status as returned by `GET /api/cis/tasks/{id}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub state: TaskState,
    /// Failure message, present when `state` is `Failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Managed object produced or mutated by the task (e.g. the VM id of
    /// a create or register task)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    /// Completion percentage, when the backend reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
}

/// Result of a successfully awaited task
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    /// Managed object produced or mutated by the task, when reported
    pub entity_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_change_serializes_wire_names() {
        let change = DeviceChange::add(VirtualDevice {
            key: -101,
            kind: DeviceKind::ScsiController,
            controller_key: None,
            unit_number: None,
            bus_number: Some(0),
            capacity_gb: None,
            mac_address: None,
            backing: None,
        });

        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["operation"], "ADD");
        assert_eq!(json["device"]["kind"], "SCSI_CONTROLLER");
        assert_eq!(json["device"]["key"], -101);
        assert_eq!(json["device"]["bus_number"], 0);
        // Unset optional fields stay off the wire
        assert!(json["device"].get("controller_key").is_none());
    }

    #[test]
    fn backing_uses_tagged_representation() {
        let backing = DeviceBacking::DatastoreFile {
            datastore: "datastore1".to_string(),
            path: "node-a/node-a.vmdk".to_string(),
            thin: true,
        };
        let json = serde_json::to_value(&backing).unwrap();
        assert_eq!(json["type"], "DATASTORE_FILE");
        assert_eq!(json["thin"], true);
    }

    #[test]
    fn task_status_deserializes_failure() {
        let status: TaskStatus = serde_json::from_str(
            r#"{"state":"FAILED","error_message":"InvalidDeviceSpec"}"#,
        )
        .unwrap();
        assert_eq!(status.state, TaskState::Failed);
        assert_eq!(status.error_message.as_deref(), Some("InvalidDeviceSpec"));
        assert!(status.entity_id.is_none());
    }
}

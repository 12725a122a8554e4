//! Node profile model

use serde::{Deserialize, Serialize};

/// Hardware pinning profile for one cluster node
///
/// Profiles carry the per-node facts that are property of the lab
/// topology rather than of the deployment request: where the VM's storage
/// lives, which portgroup its adapter joins, and any pinned MAC address or
/// host CPU set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeProfile {
    /// Node name; must match the deployment document entry
    pub name: String,
    /// Datastore holding the VM home directory and disks
    pub datastore: String,
    /// Portgroup the network adapter attaches to
    pub portgroup: String,
    /// Statically assigned MAC address; backend-generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Host CPU pinning set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_affinity: Option<Vec<u32>>,
    /// Resource pool override; the controller default applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_pool: Option<String>,
    /// Inventory folder override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
}

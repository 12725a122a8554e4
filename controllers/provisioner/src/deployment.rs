//! Deployment document
//!
//! The controller's batch input: a YAML document listing the nodes to
//! provision. Hardware pinning (datastore, portgroup, MAC, CPU affinity)
//! is not part of the document; it is merged in from the node profile
//! store at request-build time.

use crate::spec_builder::VmRequest;
use node_profiles::NodeProfile;
use serde::Deserialize;
use std::path::Path;

/// One node entry in the deployment document
#[derive(Debug, Clone, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    pub cpus: u32,
    pub memory_mib: u64,
    pub boot_disk_gb: u64,
    #[serde(default)]
    pub data_disk_gb: Option<u64>,
    /// Datastore-relative path of the boot ISO
    #[serde(default)]
    pub iso: Option<String>,
    #[serde(default)]
    pub iommu: bool,
    #[serde(default)]
    pub precision_clock: bool,
    #[serde(default)]
    pub watchdog: bool,
    #[serde(default = "default_thin")]
    pub thin_provision: bool,
}

fn default_thin() -> bool {
    true
}

impl NodeSpec {
    /// Merge this entry with the node's hardware profile into a VM request
    pub fn into_request(&self, profile: &NodeProfile) -> VmRequest {
        VmRequest {
            name: self.name.clone(),
            cpus: self.cpus,
            memory_mib: self.memory_mib,
            boot_disk_gb: self.boot_disk_gb,
            data_disk_gb: self.data_disk_gb,
            datastore: profile.datastore.clone(),
            portgroup: profile.portgroup.clone(),
            mac: profile.mac.clone(),
            iso: self.iso.clone(),
            iommu: self.iommu,
            precision_clock: self.precision_clock,
            watchdog: self.watchdog,
            thin_provision: self.thin_provision,
            cpu_affinity: profile.cpu_affinity.clone(),
            resource_pool: profile.resource_pool.clone(),
            folder: profile.folder.clone(),
        }
    }
}

/// The whole deployment document
#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentSpec {
    /// Admission limit override for this deployment
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    pub nodes: Vec<NodeSpec>,
}

impl DeploymentSpec {
    /// Load a deployment document from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_yaml::from_str(&text)?)
    }
}

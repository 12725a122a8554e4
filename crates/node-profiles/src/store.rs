//! Profile store
//!
//! Loads node profiles from a YAML document and serves lookups by node
//! name. The store is immutable after load.

use crate::error::ProfileError;
use crate::profile::NodeProfile;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct ProfileDocument {
    nodes: Vec<NodeProfile>,
}

/// Immutable collection of node profiles keyed by node name
#[derive(Debug, Clone)]
pub struct ProfileStore {
    profiles: HashMap<String, NodeProfile>,
}

impl ProfileStore {
    /// Load profiles from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ProfileError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Load profiles from a YAML document
    ///
    /// The document is a mapping with a single `nodes` list:
    ///
    /// ```yaml
    /// nodes:
    ///   - name: node-a
    ///     datastore: datastore1
    ///     portgroup: VM Network
    ///     mac: "00:50:56:aa:00:01"
    /// ```
    pub fn from_yaml_str(text: &str) -> Result<Self, ProfileError> {
        let document: ProfileDocument = serde_yaml::from_str(text)?;
        let mut profiles = HashMap::with_capacity(document.nodes.len());
        for profile in document.nodes {
            if profiles.contains_key(&profile.name) {
                return Err(ProfileError::DuplicateNode(profile.name));
            }
            profiles.insert(profile.name.clone(), profile);
        }
        Ok(Self { profiles })
    }

    /// Look up the profile for a node
    pub fn get(&self, name: &str) -> Result<&NodeProfile, ProfileError> {
        self.profiles
            .get(name)
            .ok_or_else(|| ProfileError::UnknownNode(name.to_string()))
    }

    /// Number of loaded profiles
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    /// Whether the store holds no profiles
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
nodes:
  - name: node-a
    datastore: datastore1
    portgroup: VM Network
    mac: "00:50:56:aa:00:01"
    cpu_affinity: [0, 1, 2, 3]
  - name: node-b
    datastore: datastore2
    portgroup: VM Network
"#;

    #[test]
    fn loads_and_looks_up_profiles() {
        let store = ProfileStore::from_yaml_str(DOC).unwrap();
        assert_eq!(store.len(), 2);

        let profile = store.get("node-a").unwrap();
        assert_eq!(profile.datastore, "datastore1");
        assert_eq!(profile.mac.as_deref(), Some("00:50:56:aa:00:01"));
        assert_eq!(profile.cpu_affinity.as_deref(), Some(&[0, 1, 2, 3][..]));

        // Optional fields stay empty when the document omits them
        let profile = store.get("node-b").unwrap();
        assert!(profile.mac.is_none());
        assert!(profile.resource_pool.is_none());
    }

    #[test]
    fn unknown_node_is_a_distinct_error() {
        let store = ProfileStore::from_yaml_str(DOC).unwrap();
        match store.get("node-z") {
            Err(ProfileError::UnknownNode(name)) => assert_eq!(name, "node-z"),
            other => panic!("expected UnknownNode, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn duplicate_node_names_are_rejected() {
        let doc = r#"
nodes:
  - name: node-a
    datastore: datastore1
    portgroup: VM Network
  - name: node-a
    datastore: datastore2
    portgroup: VM Network
"#;
        assert!(matches!(
            ProfileStore::from_yaml_str(doc),
            Err(ProfileError::DuplicateNode(_))
        ));
    }
}

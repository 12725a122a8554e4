//! Node profile errors

use thiserror::Error;

/// Errors that can occur while loading profiles or resolving secrets
#[derive(Debug, Error)]
pub enum ProfileError {
    /// Profile document could not be read
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Profile document is not valid YAML
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// No profile exists for the requested node
    #[error("No profile for node: {0}")]
    UnknownNode(String),

    /// A node name appears more than once in the profile document
    #[error("Duplicate profile for node: {0}")]
    DuplicateNode(String),

    /// A secret reference could not be resolved
    #[error("Secret resolution failed: {0}")]
    Secret(String),
}

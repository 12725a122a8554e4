//! Controller-specific error types.
//!
//! This module defines the provisioning error taxonomy. Which phase an
//! error escaped from is part of its identity, so batch results can tell
//! an operator whether a VM was never created, created but not disked, or
//! disked but never powered on.

use node_profiles::ProfileError;
use std::time::Duration;
use thiserror::Error;
use vsphere_client::VsphereError;

/// Errors that can occur while provisioning one VM.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The VM request violated a constraint; nothing was submitted
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The hypervisor rejected a request or a task reported failure
    #[error("Hypervisor error: {0}")]
    Remote(#[from] VsphereError),

    /// A remote task wait exceeded its bound. The remote VM may or may not
    /// have completed the operation; its state is unknown and no automatic
    /// cleanup is attempted.
    #[error("Timed out waiting for {operation} after {waited:?}")]
    Timeout {
        /// Which remote operation was being awaited
        operation: String,
        /// Total time spent waiting
        waited: Duration,
    },

    /// The remote VM exists but its device inventory is malformed
    /// (an expected controller role is missing after creation)
    #[error("Structural invariant violated: {0}")]
    StructuralInvariant(String),

    /// Re-registration failed; the VM may be absent from inventory.
    /// Carries both identifiers for operator diagnosis.
    #[error("Re-registration of {old_id} failed (new id {new_id:?}): {source}")]
    Reregister {
        /// Inventory id before unregistration
        old_id: String,
        /// Inventory id reported by the register task, when one was
        new_id: Option<String>,
        /// Underlying failure
        #[source]
        source: Box<ProvisionError>,
    },

    /// Every attempt in the power-on retry schedule failed
    #[error(
        "Power-on retries exhausted after {attempts} attempts ({total_wait:?} waited): {last}"
    )]
    PowerOnExhausted {
        /// Total attempts issued (schedule length + 1)
        attempts: usize,
        /// Cumulative backoff slept between attempts
        total_wait: Duration,
        /// The failure from the final attempt
        #[source]
        last: Box<ProvisionError>,
    },

    /// Shutdown was requested; remaining phases were not issued.
    /// Partially created remote resources are not rolled back.
    #[error("Cancelled by shutdown signal")]
    Cancelled,

    /// Node profile lookup or secret resolution failed
    #[error("Profile error: {0}")]
    Profile(#[from] ProfileError),
}

impl ProvisionError {
    /// Whether this error (or its task-wait cause) is a timeout, i.e. the
    /// remote state is unknown rather than known-bad
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Remote(VsphereError::TaskTimeout { .. }) => true,
            Self::Reregister { source, .. } => source.is_timeout(),
            Self::PowerOnExhausted { last, .. } => last.is_timeout(),
            _ => false,
        }
    }
}

/// Pipeline phase in which an error surfaced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelinePhase {
    /// Request validation and spec building (no remote calls yet)
    Validate,
    /// Phase 1: VM shell creation with controllers only
    CreateShell,
    /// Phase 1 read-back: mapping bus roles to hypervisor-assigned keys
    ResolveControllers,
    /// Phase 2: disk and deferred device attachment
    AttachDisks,
    /// Phase 3: descriptor reconciliation via unregister/re-register
    Reregister,
    /// Phase 4: power-on with bounded retry
    PowerOn,
}

impl std::fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Validate => "validate",
            Self::CreateShell => "create-shell",
            Self::ResolveControllers => "resolve-controllers",
            Self::AttachDisks => "attach-disks",
            Self::Reregister => "reregister",
            Self::PowerOn => "power-on",
        };
        f.write_str(name)
    }
}

/// A provisioning error tagged with the phase it escaped from
#[derive(Debug, Error)]
#[error("{phase} phase failed: {error}")]
pub struct PipelineError {
    /// Phase in which the pipeline halted
    pub phase: PipelinePhase,
    /// The underlying provisioning error
    #[source]
    pub error: ProvisionError,
}

impl PipelineError {
    pub(crate) fn new(phase: PipelinePhase, error: ProvisionError) -> Self {
        Self { phase, error }
    }
}

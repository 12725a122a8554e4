//! vSphere Automation API Client
//!
//! A Rust client library for the vCenter REST API surface used by the
//! VMops provisioning controllers. Provides type-safe wire models, an
//! asynchronous task-wait primitive, and the `HypervisorBackend`
//! capability trait that the controllers are written against.
//!
//! # Example
//!
//! ```no_run
//! use vsphere_client::{HypervisorBackend, VsphereClient};
//! use std::time::Duration;
//!
//! # async fn example(spec: vsphere_client::VmCreateRequest) -> Result<(), Box<dyn std::error::Error>> {
//! // Create a client and open a session
//! let client = VsphereClient::new(
//!     "https://vcenter.lab".to_string(),
//!     "administrator@vsphere.local".to_string(),
//!     "secret".to_string(),
//! )?;
//! client.login().await?;
//!
//! // Submit a creation request and wait for the task
//! let task = client.create_vm(&spec).await?;
//! let outcome = client
//!     .wait_for_task(&task, Duration::from_secs(2), Duration::from_secs(120))
//!     .await?;
//! println!("created {:?}", outcome.entity_id);
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Task-based mutations**: every mutation returns a [`RemoteTask`]
//!   polled at the CIS task endpoint with a bounded wait
//! - **Capability trait**: [`HypervisorBackend`] abstracts the backend for
//!   mocking and for alternate hypervisors
//! - **Device model**: config-spec style device changes with placeholder
//!   keys on creation and resolved keys on read-back
//! - **`test-util`**: an in-memory mock backend with scriptable failures

pub mod client;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod vsphere_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::VsphereClient;
pub use error::VsphereError;
pub use models::*;
pub use vsphere_trait::HypervisorBackend;
#[cfg(feature = "test-util")]
pub use mock::MockVsphereClient;

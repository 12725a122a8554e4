//! vSphere client errors

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur when interacting with the vSphere Automation API
#[derive(Debug, Error)]
pub enum VsphereError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// vSphere API returned an error
    #[error("vSphere API error: {0}")]
    Api(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Authentication failed (bad credentials, expired session, etc.)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Managed object not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid request (e.g., missing required fields)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A remote task completed with an error
    #[error("Task {task_id} failed: {message}")]
    Task {
        /// Identifier of the failed task
        task_id: String,
        /// Failure message reported by the task
        message: String,
    },

    /// A remote task did not complete within the wait bound.
    ///
    /// The task may still complete on the remote side; the entity it was
    /// mutating is in an unknown state.
    #[error("Task {task_id} did not complete within {waited:?}")]
    TaskTimeout {
        /// Identifier of the task that was being waited on
        task_id: String,
        /// Total time spent waiting before giving up
        waited: Duration,
    },
}

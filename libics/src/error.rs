//! Driver error types.
//!
//! All errors in the `libics` crate are represented by the [`IcsError`] enum,
//! which derives [`thiserror::Error`] for ergonomic error handling and also
//! implements [`Serialize`]/[`Deserialize`] so a failure can be reported as
//! JSON by the CLI and shared between concurrent waiters.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for virtual center, discovery and volume operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum IcsError {
    /// The management-plane host is not known to the registry.
    #[error("virtual center {0} is not registered")]
    NotRegistered(String),

    /// No VM matched the given UUID/name across all searched datacenters.
    #[error("virtual machine wasn't found (name: {name:?}, uuid: {uuid:?})")]
    VmNotFound {
        /// Name the search was issued with (may be empty).
        name: String,
        /// UUID the search was issued with (may be empty).
        uuid: String,
    },

    /// The Kubernetes node name is not present in the node registry.
    #[error("node {0} wasn't found")]
    NodeNotFound(String),

    /// Transport or authentication failure talking to a management plane.
    #[error("connection to virtual center {host} failed: {reason}")]
    Connection {
        /// Management-plane host.
        host: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// A remote task reached the `ERROR` state.
    #[error("task {task_id} failed: {detail}")]
    TaskFailed {
        /// Remote task identifier.
        task_id: String,
        /// Detail reported by the management plane.
        detail: String,
    },

    /// A remote task was still non-terminal when polling gave up.
    #[error("task {task_id} did not complete, last state {state}")]
    TaskIncomplete {
        /// Remote task identifier.
        task_id: String,
        /// Last observed state.
        state: String,
    },

    /// The REST API answered with an error status or an undecodable body.
    #[error("REST request failed (status {status}): {message}")]
    Rest {
        /// HTTP status code, `0` when no response was decoded.
        status: u16,
        /// Response body or decode error.
        message: String,
    },

    /// The Kubernetes API could not provide node information.
    #[error("kubernetes error: {0}")]
    Kubernetes(String),

    /// The caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The driver configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The operation was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl IcsError {
    /// Create an [`IcsError::Connection`] for `host` from anything that
    /// implements [`std::fmt::Display`].
    pub fn connection<E: std::fmt::Display>(host: &str, e: E) -> Self {
        Self::Connection {
            host: host.to_owned(),
            reason: e.to_string(),
        }
    }

    /// Create an [`IcsError::Rest`] with the given status.
    pub fn rest<E: std::fmt::Display>(status: u16, e: E) -> Self {
        Self::Rest {
            status,
            message: e.to_string(),
        }
    }

    /// Create an [`IcsError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Build the not-found error for a VM search.
    pub fn vm_not_found(name: &str, uuid: &str) -> Self {
        Self::VmNotFound {
            name: name.to_owned(),
            uuid: uuid.to_owned(),
        }
    }

    /// `true` for a per-datacenter lookup miss. The resolver treats these as
    /// "keep searching" rather than as failures.
    pub fn is_vm_not_found(&self) -> bool {
        matches!(self, Self::VmNotFound { .. })
    }
}

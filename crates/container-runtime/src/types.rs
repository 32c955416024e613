//! Driver-facing types
//!
//! The driver speaks in terms of an [`InstanceSpec`] (everything needed to
//! create one challenge container) and classifies engine failures into the
//! three categories the callers care about: gone, retryable, fatal.

use deployer_core::config::{ContainerLimits, SecurityConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Labels applied to every container this deployer manages
pub mod labels {
    pub const MANAGED: &str = "ctf.deployer.managed";
    pub const PROJECT: &str = "ctf.deployer.project";
    pub const USER: &str = "ctf.deployer.user";
}

/// Everything needed to create one challenge container
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstanceSpec {
    /// Challenge image
    pub image: String,
    /// Container name, unique per deployment
    pub name: String,
    /// Hostname visible inside the container
    pub hostname: String,
    /// Host-side port, already reserved in the allocation table
    pub host_port: u16,
    /// Port the challenge listens on inside the container
    pub port_in_container: u16,
    /// Environment injected into the container (the flag, at minimum)
    pub env: HashMap<String, String>,
    pub limits: ContainerLimits,
    pub security: SecurityConfig,
    /// Owner identity recorded as a label
    pub user_uuid: String,
    /// Deployment project recorded as a label
    pub project: String,
}

/// Engine-reported state of a container
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Running,
    Exited,
    /// The engine has no record of the container
    NotFound,
    /// Created, paused, restarting or any other non-terminal state
    Other,
}

impl InstanceState {
    pub fn is_running(&self) -> bool {
        matches!(self, InstanceState::Running)
    }
}

/// One-shot resource reading for a container
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct InstanceStats {
    /// CPU usage in percentage points (100 = one core)
    pub cpu_percent: f64,
    /// Resident memory in bytes
    pub memory_bytes: u64,
}

/// Driver errors, classified by how callers should react
#[derive(Error, Debug)]
pub enum DriverError {
    /// The container is already gone; removal paths treat this as success
    #[error("container not found")]
    NotFound,

    /// Transient engine condition, retryable with backoff
    #[error("engine conflict: {0}")]
    Conflict(String),

    /// Non-retryable engine failure
    #[error("engine error: {0}")]
    Fatal(String),
}

impl DriverError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DriverError::Conflict(_))
    }
}

impl From<bollard::errors::Error> for DriverError {
    fn from(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            } => DriverError::NotFound,
            bollard::errors::Error::DockerResponseServerError {
                status_code: 409,
                message,
            } => DriverError::Conflict(message),
            bollard::errors::Error::DockerResponseServerError {
                status_code: 503,
                message,
            } => DriverError::Conflict(message),
            other => DriverError::Fatal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let not_found = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "no such container".to_string(),
        };
        assert!(matches!(DriverError::from(not_found), DriverError::NotFound));

        let conflict = bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message: "removal in progress".to_string(),
        };
        let classified = DriverError::from(conflict);
        assert!(classified.is_retryable());

        let fatal = bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "daemon on fire".to_string(),
        };
        assert!(matches!(DriverError::from(fatal), DriverError::Fatal(_)));
    }

    #[test]
    fn test_instance_state_running() {
        assert!(InstanceState::Running.is_running());
        assert!(!InstanceState::Exited.is_running());
        assert!(!InstanceState::NotFound.is_running());
    }
}

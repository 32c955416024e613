//! Core types for the CTF deployer
//!
//! Shared between the container runtime, the server and the CLI: the
//! validated configuration snapshot, the error taxonomy, the instance lock
//! and the container record types that mirror the store schema.

pub mod config;
pub mod error;
pub mod lock;

pub use config::{ConfigError, DeployerConfig, RESERVED_PORTS};
pub use error::{DeployError, Result};
pub use lock::{instance_id, InstanceLock, LockError};

use serde::{Deserialize, Serialize};

/// Lifecycle state of a challenge instance as recorded in the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Running,
    Stopped,
    Removed,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Running => "running",
            ContainerStatus::Stopped => "stopped",
            ContainerStatus::Removed => "removed",
        }
    }
}

impl std::str::FromStr for ContainerStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "running" => Ok(ContainerStatus::Running),
            "stopped" => Ok(ContainerStatus::Stopped),
            "removed" => Ok(ContainerStatus::Removed),
            other => Err(format!("unknown container status: {}", other)),
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the containers table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Engine-assigned container id
    pub id: String,
    /// Host-side port of the instance
    pub port: u16,
    /// Epoch seconds at creation
    pub start_time: i64,
    /// Epoch seconds at which the instance becomes reclaimable
    pub expiration_time: i64,
    /// Pseudonymous cookie identity of the owner
    pub user_uuid: String,
    /// Source address at creation
    pub ip_address: String,
    pub status: ContainerStatus,
}

impl ContainerRecord {
    /// Seconds until expiration, clamped at zero.
    pub fn time_left(&self, now: i64) -> i64 {
        (self.expiration_time - now).max(0)
    }

    /// Short id used in names and user-facing views.
    pub fn short_id(&self) -> &str {
        let end = self.id.len().min(12);
        &self.id[..end]
    }
}

/// Current epoch seconds.
pub fn epoch_now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            ContainerStatus::Running,
            ContainerStatus::Stopped,
            ContainerStatus::Removed,
        ] {
            let parsed: ContainerStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("exploded".parse::<ContainerStatus>().is_err());
    }

    #[test]
    fn test_time_left_clamps_at_zero() {
        let record = ContainerRecord {
            id: "abcdef0123456789".to_string(),
            port: 9000,
            start_time: 100,
            expiration_time: 160,
            user_uuid: "u".to_string(),
            ip_address: "10.0.0.1".to_string(),
            status: ContainerStatus::Running,
        };
        assert_eq!(record.time_left(150), 10);
        assert_eq!(record.time_left(200), 0);
    }

    #[test]
    fn test_short_id_truncates() {
        let record = ContainerRecord {
            id: "abcdef0123456789deadbeef".to_string(),
            port: 9000,
            start_time: 0,
            expiration_time: 60,
            user_uuid: "u".to_string(),
            ip_address: "10.0.0.1".to_string(),
            status: ContainerStatus::Running,
        };
        assert_eq!(record.short_id(), "abcdef012345");
    }
}

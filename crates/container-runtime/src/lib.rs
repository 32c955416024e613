//! Container runtime for the CTF deployer
//!
//! Thin abstraction over the host container engine. The deployer talks to
//! [`ContainerDriver`]; production wires in [`DockerDriver`] (bollard), tests
//! substitute a mock. Removal paths are idempotent: a container the engine no
//! longer knows about is treated as already removed.

pub mod docker;
pub mod types;

pub use docker::DockerDriver;
pub use types::{labels, DriverError, InstanceSpec, InstanceState, InstanceStats};

use async_trait::async_trait;

/// Capability set the deployer needs from the container engine
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Create the deployment network if it does not exist.
    async fn ensure_network(&self) -> Result<(), DriverError>;

    /// Create a container and return the engine-assigned id.
    async fn create(&self, spec: &InstanceSpec) -> Result<String, DriverError>;

    async fn start(&self, container_id: &str) -> Result<(), DriverError>;

    /// Stop with a grace period. Already-stopped and missing containers are
    /// not errors.
    async fn stop(&self, container_id: &str, timeout_secs: i64) -> Result<(), DriverError>;

    /// Force-remove. A missing container is not an error.
    async fn remove(&self, container_id: &str) -> Result<(), DriverError>;

    async fn status(&self, container_id: &str) -> Result<InstanceState, DriverError>;

    /// Last `tail` log lines, optionally only entries after `since` (epoch
    /// seconds).
    async fn logs(
        &self,
        container_id: &str,
        tail: usize,
        since: Option<i64>,
    ) -> Result<String, DriverError>;

    /// One-shot cpu/memory reading.
    async fn stats(&self, container_id: &str) -> Result<InstanceStats, DriverError>;

    /// Ids of all containers belonging to this deployment: labelled challenge
    /// instances plus the fixed system services.
    async fn list_deployment(&self, project: &str) -> Result<Vec<String>, DriverError>;
}

/// Retry a driver call while it reports retryable conflicts.
///
/// Backoff doubles from 500ms, capped at `max_attempts` tries.
pub async fn with_engine_retry<T, F, Fut>(max_attempts: u32, mut op: F) -> Result<T, DriverError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, DriverError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let backoff = std::time::Duration::from_millis(500 * 2u64.pow(attempt - 1));
                tracing::warn!(
                    attempt,
                    max_attempts,
                    error = %e,
                    "Retryable engine error, backing off"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_engine_retry_succeeds_after_conflicts() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result = with_engine_retry(5, move || {
            let calls = calls_clone.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(DriverError::Conflict("busy".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_engine_retry_gives_up_at_cap() {
        let result: Result<(), _> =
            with_engine_retry(2, || async { Err(DriverError::Conflict("busy".to_string())) })
                .await;
        assert!(matches!(result, Err(DriverError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_engine_retry_does_not_retry_fatal() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<(), _> = with_engine_retry(5, move || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DriverError::Fatal("broken".to_string()))
            }
        })
        .await;

        assert!(matches!(result, Err(DriverError::Fatal(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

//! Contract tests for the container driver seam
//!
//! The orchestrator and the janitor rely on a handful of driver laws:
//! removal is idempotent, conflicts are retryable, fatal errors are not.
//! A recording mock stands in for the engine, as in production only the
//! bollard-backed driver satisfies the trait.

use async_trait::async_trait;
use container_runtime::{
    with_engine_retry, ContainerDriver, DriverError, InstanceSpec, InstanceState, InstanceStats,
};
use deployer_core::config::{ContainerLimits, SecurityConfig};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Clone, Default)]
struct MockEngine {
    inner: Arc<MockEngineInner>,
}

#[derive(Default)]
struct MockEngineInner {
    operations: Mutex<Vec<String>>,
    containers: Mutex<HashSet<String>>,
    next_id: Mutex<u32>,
    /// Conflicts to report before a start succeeds
    start_conflicts: Mutex<u32>,
}

impl MockEngine {
    fn record(&self, entry: impl Into<String>) {
        self.inner.operations.lock().push(entry.into());
    }

    fn operations(&self) -> Vec<String> {
        self.inner.operations.lock().clone()
    }

    fn with_start_conflicts(self, conflicts: u32) -> Self {
        *self.inner.start_conflicts.lock() = conflicts;
        self
    }
}

#[async_trait]
impl ContainerDriver for MockEngine {
    async fn ensure_network(&self) -> Result<(), DriverError> {
        self.record("ensure_network");
        Ok(())
    }

    async fn create(&self, spec: &InstanceSpec) -> Result<String, DriverError> {
        let mut next = self.inner.next_id.lock();
        *next += 1;
        let id = format!("mock-{:08x}", *next);
        drop(next);

        self.inner.containers.lock().insert(id.clone());
        self.record(format!("create:{}:{}", spec.name, spec.host_port));
        Ok(id)
    }

    async fn start(&self, container_id: &str) -> Result<(), DriverError> {
        let mut conflicts = self.inner.start_conflicts.lock();
        if *conflicts > 0 {
            *conflicts -= 1;
            self.record(format!("start_conflict:{}", container_id));
            return Err(DriverError::Conflict("device busy".to_string()));
        }
        drop(conflicts);

        if !self.inner.containers.lock().contains(container_id) {
            return Err(DriverError::NotFound);
        }
        self.record(format!("start:{}", container_id));
        Ok(())
    }

    async fn stop(&self, container_id: &str, _timeout_secs: i64) -> Result<(), DriverError> {
        self.record(format!("stop:{}", container_id));
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<(), DriverError> {
        let existed = self.inner.containers.lock().remove(container_id);
        self.record(format!("remove:{}:{}", container_id, existed));
        // Engine semantics: force-removing a missing container is success.
        Ok(())
    }

    async fn status(&self, container_id: &str) -> Result<InstanceState, DriverError> {
        if self.inner.containers.lock().contains(container_id) {
            Ok(InstanceState::Running)
        } else {
            Ok(InstanceState::NotFound)
        }
    }

    async fn logs(
        &self,
        container_id: &str,
        tail: usize,
        _since: Option<i64>,
    ) -> Result<String, DriverError> {
        if !self.inner.containers.lock().contains(container_id) {
            return Err(DriverError::NotFound);
        }
        Ok(format!("last {} lines of {}\n", tail, container_id))
    }

    async fn stats(&self, _container_id: &str) -> Result<InstanceStats, DriverError> {
        Ok(InstanceStats {
            cpu_percent: 12.5,
            memory_bytes: 64 * 1024 * 1024,
        })
    }

    async fn list_deployment(&self, _project: &str) -> Result<Vec<String>, DriverError> {
        Ok(self.inner.containers.lock().iter().cloned().collect())
    }
}

fn sample_spec(port: u16) -> InstanceSpec {
    InstanceSpec {
        image: "localhost/ctf:latest".to_string(),
        name: format!("ctf_task_session_user_{}", port),
        hostname: "ctf-challenge-user".to_string(),
        host_port: port,
        port_in_container: 8000,
        env: HashMap::from([("FLAG".to_string(), "CTF{test}".to_string())]),
        limits: ContainerLimits {
            memory_bytes: 512 * 1024 * 1024,
            swap_bytes: 512 * 1024 * 1024,
            cpu_cores: 0.5,
            pids_limit: 100,
        },
        security: SecurityConfig {
            no_new_privileges: true,
            read_only: true,
            tmpfs_enable: true,
            tmpfs_size: "64m".to_string(),
            drop_all_caps: true,
            cap_net_bind: true,
            cap_chown: true,
        },
        user_uuid: "user".to_string(),
        project: "ctf_task".to_string(),
    }
}

#[tokio::test]
async fn test_create_start_status_roundtrip() {
    let engine = MockEngine::default();

    let id = engine.create(&sample_spec(9000)).await.unwrap();
    engine.start(&id).await.unwrap();

    let state = engine.status(&id).await.unwrap();
    assert!(state.is_running());

    let ids = engine.list_deployment("ctf_task").await.unwrap();
    assert_eq!(ids, vec![id]);
}

#[tokio::test]
async fn test_remove_is_idempotent() {
    let engine = MockEngine::default();
    let id = engine.create(&sample_spec(9000)).await.unwrap();

    // Stop(c); Stop(c) ≡ Stop(c): the second removal observes the container
    // as gone and still succeeds.
    engine.remove(&id).await.unwrap();
    engine.remove(&id).await.unwrap();

    let ops = engine.operations();
    assert!(ops.contains(&format!("remove:{}:true", id)));
    assert!(ops.contains(&format!("remove:{}:false", id)));
    assert_eq!(engine.status(&id).await.unwrap(), InstanceState::NotFound);
}

#[tokio::test]
async fn test_start_conflicts_are_retried_to_success() {
    let engine = MockEngine::default().with_start_conflicts(2);
    let id = engine.create(&sample_spec(9001)).await.unwrap();

    let engine_for_retry = engine.clone();
    let id_clone = id.clone();
    with_engine_retry(5, move || {
        let engine = engine_for_retry.clone();
        let id = id_clone.clone();
        async move { engine.start(&id).await }
    })
    .await
    .expect("start succeeds after conflicts");

    let ops = engine.operations();
    assert_eq!(
        ops.iter().filter(|op| op.starts_with("start_conflict")).count(),
        2
    );
    assert!(ops.contains(&format!("start:{}", id)));
}

#[tokio::test]
async fn test_logs_of_unknown_container_not_found() {
    let engine = MockEngine::default();
    let result = engine.logs("ghost", 100, None).await;
    assert!(matches!(result, Err(DriverError::NotFound)));
}

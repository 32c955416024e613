//! Janitor queue behaviour that does not need a live database

use async_trait::async_trait;
use container_runtime::{
    ContainerDriver, DriverError, InstanceSpec, InstanceState, InstanceStats,
};
use deadpool_postgres::{Config, Runtime};
use deployer_core::config::MaintenanceConfig;
use deployer_server::db::DbPool;
use deployer_server::janitor::Janitor;
use deployer_server::metrics::Metrics;
use deployer_server::ports::PortAllocator;
use std::sync::Arc;
use tokio_postgres::NoTls;

/// Driver that refuses every call; the queue tests never reach the engine.
struct NullDriver;

#[async_trait]
impl ContainerDriver for NullDriver {
    async fn ensure_network(&self) -> Result<(), DriverError> {
        Ok(())
    }
    async fn create(&self, _spec: &InstanceSpec) -> Result<String, DriverError> {
        Err(DriverError::Fatal("not wired".to_string()))
    }
    async fn start(&self, _id: &str) -> Result<(), DriverError> {
        Err(DriverError::Fatal("not wired".to_string()))
    }
    async fn stop(&self, _id: &str, _timeout_secs: i64) -> Result<(), DriverError> {
        Ok(())
    }
    async fn remove(&self, _id: &str) -> Result<(), DriverError> {
        Ok(())
    }
    async fn status(&self, _id: &str) -> Result<InstanceState, DriverError> {
        Ok(InstanceState::NotFound)
    }
    async fn logs(&self, _id: &str, _tail: usize, _since: Option<i64>) -> Result<String, DriverError> {
        Ok(String::new())
    }
    async fn stats(&self, _id: &str) -> Result<InstanceStats, DriverError> {
        Ok(InstanceStats::default())
    }
    async fn list_deployment(&self, _project: &str) -> Result<Vec<String>, DriverError> {
        Ok(Vec::new())
    }
}

/// Pool that would fail on first use; creation itself is lazy.
fn lazy_pool() -> DbPool {
    let mut cfg = Config::new();
    cfg.host = Some("127.0.0.1".to_string());
    cfg.port = Some(1); // nothing listens here
    cfg.dbname = Some("unused".to_string());
    cfg.user = Some("unused".to_string());
    cfg.password = Some("unused".to_string());
    cfg.create_pool(Some(Runtime::Tokio1), NoTls).unwrap()
}

fn maintenance_config() -> MaintenanceConfig {
    MaintenanceConfig {
        thread_pool_size: 4,
        interval_secs: 60,
        container_check_interval_secs: 30,
        captcha_ttl_secs: 300,
        batch_size: 10,
        pool_min: 1,
        pool_max: 2,
        port_allocation_max_attempts: 3,
        stale_port_max_age_secs: 3600,
    }
}

fn janitor() -> Janitor {
    let pool = lazy_pool();
    let ports = Arc::new(PortAllocator::new(pool.clone(), 3, 3600));
    let metrics = Arc::new(Metrics::new().unwrap());
    Janitor::new(
        pool,
        Arc::new(NullDriver),
        ports,
        metrics,
        maintenance_config(),
        3600,
    )
}

#[tokio::test]
async fn test_schedule_queues_monitor_entries() {
    let janitor = janitor();
    assert_eq!(janitor.queued(), 0);

    janitor.schedule("c-1", 100);
    janitor.schedule("c-2", 50);
    assert_eq!(janitor.queued(), 2);
}

#[tokio::test]
async fn test_extend_pushes_superseding_entry() {
    let janitor = janitor();

    // Deploy schedules one entry; extend pushes another for the same
    // container. The dispatcher drops the stale one after re-reading the
    // store, so duplicates in the queue are expected and harmless.
    janitor.schedule("c-1", 60);
    janitor.schedule("c-1", 90);
    assert_eq!(janitor.queued(), 2);
}

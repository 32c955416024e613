//! Database module for the deployer
//!
//! Two pools back the process: the request pool serves HTTP handlers, a
//! smaller independent maintenance pool serves the janitor so user traffic
//! and cleanup cannot starve each other. Transient connectivity failures are
//! retried with exponential backoff; logical SQL errors propagate unchanged.

pub mod queries;
pub mod schema;

use deadpool_postgres::{Config, Pool, PoolConfig, Runtime};
use deployer_core::config::StoreConfig;
use deployer_core::{DeployError, DeployerConfig};
use thiserror::Error;
use tokio_postgres::NoTls;
use tracing::{info, warn};

pub type DbPool = Pool;

/// Maximum retries for transient database failures
const MAX_RETRIES: u32 = 3;

/// Errors from a single database operation, before retry classification
#[derive(Error, Debug)]
pub enum DbError {
    #[error("pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
}

impl DbError {
    /// Connectivity problems are transient; errors carrying a server-side
    /// SQLSTATE are logical and must not be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            DbError::Pool(_) => true,
            DbError::Postgres(e) => e.as_db_error().is_none(),
        }
    }
}

impl From<DbError> for DeployError {
    fn from(err: DbError) -> Self {
        match err {
            e if e.is_transient() => DeployError::StoreTransient(e.to_string()),
            e => DeployError::Internal(e.to_string()),
        }
    }
}

/// Create the request pool and the maintenance pool.
pub async fn init_pools(config: &DeployerConfig) -> Result<(DbPool, DbPool), DeployError> {
    let request_pool = create_pool(&config.store, config.store.pool_max)?;
    let maintenance_pool = create_pool(&config.store, config.maintenance.pool_max)?;

    // Fail fast if the database is unreachable at startup.
    request_pool
        .get()
        .await
        .map_err(|e| DeployError::StoreTransient(e.to_string()))?;

    info!(
        host = %config.store.host,
        port = config.store.port,
        dbname = %config.store.name,
        request_pool = config.store.pool_max,
        maintenance_pool = config.maintenance.pool_max,
        "Database pools initialized"
    );

    Ok((request_pool, maintenance_pool))
}

fn create_pool(store: &StoreConfig, max_size: usize) -> Result<Pool, DeployError> {
    let mut cfg = Config::new();
    cfg.host = Some(store.host.clone());
    cfg.port = Some(store.port);
    cfg.dbname = Some(store.name.clone());
    cfg.user = Some(store.user.clone());
    cfg.password = Some(store.password.clone());
    cfg.pool = Some(PoolConfig::new(max_size));

    cfg.create_pool(Some(Runtime::Tokio1), NoTls)
        .map_err(|e| DeployError::Internal(format!("pool creation failed: {}", e)))
}

/// Run `op` with exponential backoff on transient failures.
///
/// Backoff doubles from 500ms; logical errors and exhausted retries
/// propagate.
pub async fn with_retry<T, F, Fut>(op_name: &str, mut op: F) -> Result<T, DeployError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, DbError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt <= MAX_RETRIES => {
                let backoff = std::time::Duration::from_millis(500 * 2u64.pow(attempt - 1));
                warn!(
                    op = op_name,
                    attempt,
                    max = MAX_RETRIES,
                    error = %e,
                    "Transient database error, retrying"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Connection-pool statistics for the admin status endpoint.
#[derive(Clone, Debug, serde::Serialize)]
pub struct PoolStats {
    pub status: &'static str,
    pub free_connections: usize,
    pub max_connections: usize,
}

pub fn pool_stats(pool: &DbPool) -> PoolStats {
    let status = pool.status();
    PoolStats {
        status: if pool.is_closed() { "closed" } else { "active" },
        free_connections: status.available,
        max_connections: status.max_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn closed_connection_error() -> DbError {
        // A closed pool is the canonical transient failure.
        DbError::Pool(deadpool_postgres::PoolError::Closed)
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result = with_retry("test_op", move || {
            let calls = calls_clone.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(closed_connection_error())
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_surfaces_store_transient() {
        let result: Result<(), _> =
            with_retry("test_op", || async { Err(closed_connection_error()) }).await;

        assert!(matches!(result, Err(DeployError::StoreTransient(_))));
    }

    #[test]
    fn test_pool_errors_are_transient() {
        assert!(closed_connection_error().is_transient());
    }
}

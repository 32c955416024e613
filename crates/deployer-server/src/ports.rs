//! Port allocator
//!
//! The `port_allocations` table is the authority on which host ports are in
//! use. Reservation is a single transaction: lowest free row, locked with
//! `FOR UPDATE SKIP LOCKED` so competing reservers never observe the same
//! row, then flipped to allocated. An OS-level bind probe guards against the
//! table and the host disagreeing; a port the OS reports busy is poisoned
//! with a synthetic container id and skipped until the sweep reclaims it.

use crate::db::{self, queries, DbError, DbPool};
use deployer_core::{epoch_now, DeployError};
use tracing::{debug, info, warn};

/// Probe signature, swapped out in tests.
pub type PortProbe = fn(u16) -> bool;

/// Default probe: the port is free if we can bind it on all interfaces.
pub fn os_port_is_free(port: u16) -> bool {
    std::net::TcpListener::bind(("0.0.0.0", port)).is_ok()
}

pub struct PortAllocator {
    pool: DbPool,
    max_attempts: u32,
    stale_max_age_secs: u64,
    probe: PortProbe,
}

impl PortAllocator {
    pub fn new(pool: DbPool, max_attempts: u32, stale_max_age_secs: u64) -> Self {
        Self {
            pool,
            max_attempts,
            stale_max_age_secs,
            probe: os_port_is_free,
        }
    }

    /// Replace the OS probe (tests only).
    pub fn with_probe(mut self, probe: PortProbe) -> Self {
        self.probe = probe;
        self
    }

    /// Reserve the lowest free port for `container_id`.
    ///
    /// Returns `PortPoolFull` once `max_attempts` passes found no usable
    /// port, `StoreTransient` on connectivity trouble.
    pub async fn reserve(&self, container_id: &str) -> Result<u16, DeployError> {
        for attempt in 1..=self.max_attempts {
            match self.try_reserve(container_id).await {
                Ok(Some(port)) => {
                    info!(port, container_id = %container_id, "Allocated port");
                    return Ok(port);
                }
                Ok(None) => {
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        "No free port available"
                    );
                }
                Err(e) if e.is_transient() => {
                    warn!(attempt, error = %e, "Transient error during port allocation");
                }
                Err(e) => return Err(e.into()),
            }

            if attempt < self.max_attempts {
                let backoff = std::time::Duration::from_millis(500 * 2u64.pow(attempt - 1));
                tokio::time::sleep(backoff).await;
            }
        }

        Err(DeployError::PortPoolFull)
    }

    /// One allocation pass. `Ok(None)` means the pool had no free row.
    async fn try_reserve(&self, container_id: &str) -> Result<Option<u16>, DbError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let row = tx
            .query_opt(
                "SELECT port FROM port_allocations
                 WHERE allocated = FALSE
                 ORDER BY port
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED",
                &[],
            )
            .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        let port = row.get::<_, i32>(0) as u16;
        let now = epoch_now();

        if !(self.probe)(port) {
            // The table says free but the OS disagrees. Poison the row so the
            // next pass picks a different port; the sweep releases it later.
            let synthetic = format!("stale-{}", now);
            tx.execute(
                "UPDATE port_allocations
                 SET allocated = TRUE, container_id = $1, allocated_at = $2
                 WHERE port = $3",
                &[&synthetic, &now, &(port as i32)],
            )
            .await?;
            tx.commit().await?;
            warn!(port, "Port busy on the host but free in the table, poisoned");
            return Ok(None);
        }

        tx.execute(
            "UPDATE port_allocations
             SET allocated = TRUE, container_id = $1, allocated_at = $2
             WHERE port = $3",
            &[&container_id, &now, &(port as i32)],
        )
        .await?;
        tx.commit().await?;

        Ok(Some(port))
    }

    /// Re-point an allocation from a placeholder id to the engine-assigned
    /// one once the container exists.
    pub async fn assign(&self, port: u16, container_id: &str) -> Result<(), DeployError> {
        db::with_retry("port_assign", || {
            let pool = self.pool.clone();
            let container_id = container_id.to_string();
            async move {
                let client = pool.get().await?;
                client
                    .execute(
                        "UPDATE port_allocations SET container_id = $1 WHERE port = $2 AND allocated",
                        &[&container_id, &(port as i32)],
                    )
                    .await?;
                Ok(())
            }
        })
        .await
    }

    /// Release a port back to the pool. Idempotent: releasing a free port is
    /// a no-op.
    pub async fn release(&self, port: u16) -> Result<(), DeployError> {
        db::with_retry("port_release", || {
            let pool = self.pool.clone();
            async move {
                let client = pool.get().await?;
                let updated = client
                    .execute(
                        "UPDATE port_allocations
                         SET allocated = FALSE, container_id = NULL, allocated_at = NULL
                         WHERE port = $1 AND allocated",
                        &[&(port as i32)],
                    )
                    .await?;
                if updated > 0 {
                    info!(port, "Released port");
                }
                Ok(())
            }
        })
        .await
    }

    /// Release allocations older than the stale cutoff whose container no
    /// longer runs. Invoked by the janitor; runs on the given pool so the
    /// sweep uses the maintenance connections.
    pub async fn sweep(&self, pool: &DbPool) -> Result<u64, DeployError> {
        let cutoff = epoch_now() - self.stale_max_age_secs as i64;
        db::with_retry("port_sweep", || {
            let pool = pool.clone();
            async move {
                let client = pool.get().await?;
                let released = client
                    .execute(
                        "UPDATE port_allocations p
                         SET allocated = FALSE, container_id = NULL, allocated_at = NULL
                         WHERE p.allocated
                           AND p.allocated_at < $1
                           AND NOT EXISTS (
                               SELECT 1 FROM containers c
                               WHERE c.id = p.container_id AND c.status = 'running'
                           )",
                        &[&cutoff],
                    )
                    .await?;
                if released > 0 {
                    info!(released, "Swept stale port allocations");
                } else {
                    debug!("No stale port allocations");
                }
                Ok(released)
            }
        })
        .await
    }

    /// `(total, available)` for status and metrics.
    pub async fn pool_counts(&self) -> Result<(i64, i64), DeployError> {
        let (total, allocated) = queries::port_pool_counts(&self.pool)
            .await
            .map_err(DeployError::from)?;
        Ok((total, total - allocated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_probe_detects_bound_port() {
        let listener = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!os_port_is_free(port));
        drop(listener);
        assert!(os_port_is_free(port));
    }
}

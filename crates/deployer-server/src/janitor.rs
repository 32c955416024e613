//! Background reclamation
//!
//! Two cooperating workers share the maintenance pool:
//!
//! - The **dispatcher** holds a min-heap of `(expiration, container_id)`
//!   entries. One task sleeps until the earliest deadline, re-reads the
//!   authoritative expiration from the store on wake (extensions move the
//!   entry, stopped containers drop out) and hands expired instances to a
//!   bounded reclamation pool.
//! - The **sweeper** wakes on a fixed period and reclaims whatever expired
//!   containers the dispatcher missed, releases stale port allocations and
//!   purges old rate-limit rows.
//!
//! Both paths converge on [`Janitor::reclaim`], which is idempotent, so the
//! dispatcher and the sweeper racing on the same container is harmless.

use crate::db::{queries, DbPool};
use crate::metrics::Metrics;
use crate::ports::PortAllocator;
use container_runtime::{with_engine_retry, ContainerDriver, DriverError};
use dashmap::DashMap;
use deployer_core::config::MaintenanceConfig;
use deployer_core::{epoch_now, ContainerRecord, ContainerStatus, DeployError};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Engine retry attempts during reclamation
const RECLAIM_ENGINE_ATTEMPTS: u32 = 3;

/// Cap on the per-item failure backoff applied by the sweeper
const MAX_FAILURE_SHIFT: u32 = 5;

/// Counters reported after every sweep pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub reclaimed: u64,
    pub errors: u64,
    pub ports_swept: u64,
    pub ip_rows_purged: u64,
}

pub struct Janitor {
    pool: DbPool,
    driver: Arc<dyn ContainerDriver>,
    ports: Arc<PortAllocator>,
    metrics: Arc<Metrics>,
    config: MaintenanceConfig,
    rate_limit_window_secs: u64,

    /// Earliest-deadline-first queue of monitor entries
    queue: Mutex<BinaryHeap<Reverse<(i64, String)>>>,
    /// Woken whenever an earlier deadline may have been pushed
    queue_changed: Notify,
    /// Bounds concurrent reclamation work
    workers: Arc<Semaphore>,
    /// Consecutive reclamation failures per container, for sweep dampening
    failures: DashMap<String, (u32, i64)>,
}

impl Janitor {
    pub fn new(
        pool: DbPool,
        driver: Arc<dyn ContainerDriver>,
        ports: Arc<PortAllocator>,
        metrics: Arc<Metrics>,
        config: MaintenanceConfig,
        rate_limit_window_secs: u64,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.thread_pool_size));
        Self {
            pool,
            driver,
            ports,
            metrics,
            config,
            rate_limit_window_secs,
            queue: Mutex::new(BinaryHeap::new()),
            queue_changed: Notify::new(),
            workers,
            failures: DashMap::new(),
        }
    }

    /// Register (or move) the monitor entry for a container.
    ///
    /// Called on deploy and on every extend. Superseded entries for the same
    /// container are dropped lazily when the dispatcher re-reads the store.
    pub fn schedule(&self, container_id: &str, expiration_time: i64) {
        self.queue
            .lock()
            .push(Reverse((expiration_time, container_id.to_string())));
        self.queue_changed.notify_one();
        debug!(container_id = %container_id, expiration_time, "Monitor scheduled");
    }

    /// Number of queued monitor entries (superseded ones included).
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    /// Spawn the dispatcher and the sweeper.
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) {
        let dispatcher = self.clone();
        let dispatcher_shutdown = shutdown.clone();
        tokio::spawn(async move {
            dispatcher.dispatcher_loop(dispatcher_shutdown).await;
        });

        let sweeper = self.clone();
        tokio::spawn(async move {
            sweeper.sweeper_loop(shutdown).await;
        });

        info!(
            workers = self.config.thread_pool_size,
            sweep_interval = self.config.interval_secs,
            "Janitor started"
        );
    }

    async fn dispatcher_loop(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            let next_deadline = self.queue.lock().peek().map(|Reverse((t, _))| *t);

            match next_deadline {
                None => {
                    tokio::select! {
                        _ = self.queue_changed.notified() => {}
                        _ = shutdown.cancelled() => return,
                    }
                }
                Some(deadline) => {
                    let now = epoch_now();
                    if deadline > now {
                        // Sleep until the deadline, but re-check periodically
                        // so expiry changes made outside this process are
                        // still observed.
                        let wait = (deadline - now)
                            .min(self.config.container_check_interval_secs as i64)
                            .max(1) as u64;
                        tokio::select! {
                            _ = tokio::time::sleep(std::time::Duration::from_secs(wait)) => {}
                            _ = self.queue_changed.notified() => {}
                            _ = shutdown.cancelled() => return,
                        }
                        continue;
                    }

                    let Some(Reverse((_, container_id))) = self.queue.lock().pop() else {
                        continue;
                    };
                    self.clone().dispatch(container_id).await;
                }
            }
        }
    }

    /// Decide what to do with a popped entry by re-reading the store.
    async fn dispatch(self: Arc<Self>, container_id: String) {
        let deadline = match queries::container_deadline(&self.pool, &container_id).await {
            Ok(deadline) => deadline,
            Err(e) => {
                // Keep the entry; the store may come back.
                warn!(container_id = %container_id, error = %e, "Deadline re-read failed, requeueing");
                self.schedule(&container_id, epoch_now() + 5);
                return;
            }
        };

        match deadline {
            None => debug!(container_id = %container_id, "Monitor entry dropped, container unknown"),
            Some((_, status)) if status != ContainerStatus::Running => {
                debug!(container_id = %container_id, %status, "Monitor entry dropped, container no longer running");
            }
            Some((expiration, _)) if expiration > epoch_now() => {
                // Extended since the entry was pushed.
                self.schedule(&container_id, expiration);
            }
            Some(_) => {
                let janitor = self.clone();
                let permit = self.workers.clone().acquire_owned().await;
                let Ok(permit) = permit else { return };
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = janitor.reclaim_by_id(&container_id).await {
                        error!(
                            container_id = %container_id,
                            phase = "monitor",
                            error = %e,
                            "Reclamation failed"
                        );
                        janitor.metrics.error("reclaim_failed");
                    }
                });
            }
        }
    }

    async fn sweeper_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let period = std::time::Duration::from_secs(self.config.interval_secs);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.cancelled() => {
                    info!("Sweeper stopped");
                    return;
                }
            }

            let stats = self.sweep_once().await;
            if stats != SweepStats::default() {
                info!(
                    reclaimed = stats.reclaimed,
                    errors = stats.errors,
                    ports_swept = stats.ports_swept,
                    ip_rows_purged = stats.ip_rows_purged,
                    "Sweep pass complete"
                );
            }
        }
    }

    /// One full maintenance pass.
    pub async fn sweep_once(&self) -> SweepStats {
        let mut stats = SweepStats::default();
        let now = epoch_now();

        let expired = match queries::expired_running_containers(
            &self.pool,
            now,
            self.config.batch_size as i64,
        )
        .await
        {
            Ok(expired) => expired,
            Err(e) => {
                error!(phase = "select_expired", error = %e, "Sweep pass failed");
                self.metrics.error("sweep_select");
                return stats;
            }
        };

        for record in expired {
            if let Some(entry) = self.failures.get(&record.id) {
                let (_, not_before) = *entry;
                if now < not_before {
                    continue; // dampened after repeated failures
                }
            }

            match self.reclaim(&record).await {
                Ok(()) => {
                    self.failures.remove(&record.id);
                    stats.reclaimed += 1;
                }
                Err(e) => {
                    error!(
                        container_id = %record.id,
                        phase = "reclaim",
                        error = %e,
                        "Sweep reclamation failed"
                    );
                    self.metrics.error("sweep_reclaim");
                    stats.errors += 1;

                    let failures = self
                        .failures
                        .get(&record.id)
                        .map(|entry| entry.0)
                        .unwrap_or(0)
                        + 1;
                    let shift = failures.min(MAX_FAILURE_SHIFT);
                    let not_before =
                        now + self.config.interval_secs as i64 * (1i64 << shift);
                    self.failures.insert(record.id.clone(), (failures, not_before));
                }
            }
        }

        match self.ports.sweep(&self.pool).await {
            Ok(released) => stats.ports_swept = released,
            Err(e) => {
                error!(phase = "port_sweep", error = %e, "Sweep pass failed");
                self.metrics.error("sweep_ports");
            }
        }

        let cutoff = now - self.rate_limit_window_secs as i64;
        match queries::purge_ip_requests(&self.pool, cutoff).await {
            Ok(purged) => stats.ip_rows_purged = purged,
            Err(e) => {
                error!(phase = "ip_purge", error = %e, "Sweep pass failed");
                self.metrics.error("sweep_ip_purge");
            }
        }

        stats
    }

    /// Reclaim by id, re-reading the record first (monitor path).
    async fn reclaim_by_id(&self, container_id: &str) -> Result<(), DeployError> {
        let record = queries::get_container(&self.pool, container_id)
            .await
            .map_err(DeployError::from)?;
        match record {
            Some(record) if record.status == ContainerStatus::Running => {
                self.reclaim(&record).await
            }
            _ => Ok(()), // someone else got there first
        }
    }

    /// Reclaim every running instance. Used on shutdown and by `down`:
    /// in-flight challenges do not survive a deployer restart.
    pub async fn reclaim_all(&self) -> SweepStats {
        let mut stats = SweepStats::default();

        let ids = match queries::running_container_ids(&self.pool).await {
            Ok(ids) => ids,
            Err(e) => {
                error!(error = %e, "Failed to enumerate running containers for shutdown");
                return stats;
            }
        };

        for id in ids {
            match self.reclaim_by_id(&id).await {
                Ok(()) => stats.reclaimed += 1,
                Err(e) => {
                    error!(container_id = %id, error = %e, "Shutdown reclamation failed");
                    stats.errors += 1;
                }
            }
        }

        stats
    }

    /// Remove an expired instance: engine first, then the store row and the
    /// port in one transaction. Safe to call twice.
    pub async fn reclaim(&self, record: &ContainerRecord) -> Result<(), DeployError> {
        let id = record.id.clone();
        match with_engine_retry(RECLAIM_ENGINE_ATTEMPTS, || {
            let driver = self.driver.clone();
            let id = id.clone();
            async move { driver.remove(&id).await }
        })
        .await
        {
            Ok(()) => {}
            // Already gone is the expected case when a monitor beat us here.
            Err(DriverError::NotFound) => {}
            Err(DriverError::Conflict(msg)) => return Err(DeployError::EngineTransient(msg)),
            Err(DriverError::Fatal(msg)) => return Err(DeployError::EngineFatal(msg)),
        }

        let finalized =
            queries::finalize_container(&self.pool, &record.id, record.port, ContainerStatus::Removed)
                .await
                .map_err(DeployError::from)?;

        if finalized {
            let lifetime = (epoch_now() - record.start_time).max(0) as f64;
            self.metrics.container_reclaimed(lifetime);
            info!(
                container_id = %record.id,
                port = record.port,
                "Expired instance reclaimed"
            );
        }

        Ok(())
    }
}

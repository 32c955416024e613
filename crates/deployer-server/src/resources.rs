//! Global resource quotas
//!
//! A background task aggregates usage across the deployment every
//! `resource_check_interval` and keeps a read-mostly snapshot. Deploy
//! admission projects the snapshot forward by the expected delta; the
//! snapshot is refreshed inline when it has gone stale.

use crate::db::{queries, DbPool};
use crate::metrics::Metrics;
use container_runtime::ContainerDriver;
use deployer_core::config::QuotaConfig;
use deployer_core::{epoch_now, DeployError};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use sysinfo::System;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Usage of one resource class against its limit
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct ResourceClass {
    pub current: f64,
    pub limit: f64,
    pub percent: f64,
}

impl ResourceClass {
    fn new(current: f64, limit: f64) -> Self {
        let percent = if limit > 0.0 {
            (current / limit) * 100.0
        } else {
            0.0
        };
        Self {
            current,
            limit,
            percent,
        }
    }
}

/// Snapshot of all tracked resource classes
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct ResourceUsage {
    pub containers: ResourceClass,
    pub cpu: ResourceClass,
    pub memory: ResourceClass,
    pub ports: ResourceClass,
    pub last_updated: i64,
}

/// Outcome of a quota admission check
#[derive(Debug)]
pub enum QuotaDecision {
    Admitted,
    Rejected {
        resource: &'static str,
        current: f64,
        limit: f64,
    },
}

pub struct ResourceMonitor {
    config: QuotaConfig,
    pool: DbPool,
    driver: Arc<dyn ContainerDriver>,
    project: String,
    snapshot: RwLock<ResourceUsage>,
    metrics: Arc<Metrics>,
    /// Persistent sampler: host cpu readings need a previous measurement
    sys: parking_lot::Mutex<System>,
}

impl ResourceMonitor {
    pub fn new(
        config: QuotaConfig,
        pool: DbPool,
        driver: Arc<dyn ContainerDriver>,
        project: String,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            pool,
            driver,
            project,
            snapshot: RwLock::new(ResourceUsage::default()),
            metrics,
            sys: parking_lot::Mutex::new(System::new()),
        }
    }

    /// Spawn the periodic refresh loop. Returns immediately; the loop stops
    /// when `shutdown` fires.
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) {
        if !self.config.enabled {
            debug!("Resource quotas disabled, monitor not started");
            return;
        }

        let monitor = self.clone();
        tokio::spawn(async move {
            let period = std::time::Duration::from_secs(monitor.config.check_interval_secs);
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = monitor.refresh().await {
                            error!(error = %e, "Resource usage refresh failed");
                        }
                    }
                    _ = shutdown.cancelled() => {
                        debug!("Resource monitor stopped");
                        return;
                    }
                }
            }
        });
    }

    /// Re-read usage from the store, the engine and the host.
    pub async fn refresh(&self) -> Result<(), DeployError> {
        let container_count = queries::running_container_count(&self.pool)
            .await
            .map_err(DeployError::from)? as f64;

        let mut cpu_total = 0.0;
        let mut memory_total = 0u64;
        match self.driver.list_deployment(&self.project).await {
            Ok(ids) => {
                for id in ids {
                    match self.driver.stats(&id).await {
                        Ok(stats) => {
                            cpu_total += stats.cpu_percent;
                            memory_total += stats.memory_bytes;
                        }
                        Err(e) => {
                            debug!(container_id = %id, error = %e, "Skipping stats for container")
                        }
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to enumerate deployment containers"),
        }

        // Host-level readings catch engine overhead the per-container stats
        // miss; prefer them when they dwarf the aggregate.
        let (host_cpu, host_memory) = {
            let mut sys = self.sys.lock();
            sys.refresh_cpu_usage();
            sys.refresh_memory();
            let cpu = sys.global_cpu_usage() as f64 * sys.cpus().len().max(1) as f64;
            (cpu, sys.used_memory())
        };
        if host_cpu > cpu_total * 1.5 {
            cpu_total = host_cpu;
        }
        if host_memory > memory_total.saturating_mul(3) / 2 {
            memory_total = host_memory;
        }

        let (total_ports, available_ports) = queries::port_pool_counts(&self.pool)
            .await
            .map(|(total, allocated)| (total, total - allocated))
            .map_err(DeployError::from)?;

        let usage = ResourceUsage {
            containers: ResourceClass::new(container_count, self.config.max_total_containers as f64),
            cpu: ResourceClass::new(cpu_total, self.config.max_total_cpu_percent),
            memory: ResourceClass::new(memory_total as f64, self.config.max_total_memory_bytes as f64),
            ports: ResourceClass::new((total_ports - available_ports) as f64, total_ports as f64),
            last_updated: epoch_now(),
        };

        self.warn_on_soft_limit(&usage);
        self.metrics.record_resource_usage(&usage);
        self.metrics
            .record_port_pool(total_ports, available_ports);
        *self.snapshot.write() = usage;
        Ok(())
    }

    fn warn_on_soft_limit(&self, usage: &ResourceUsage) {
        let soft = self.config.soft_limit_percent;
        for (name, class) in [
            ("containers", &usage.containers),
            ("cpu", &usage.cpu),
            ("memory", &usage.memory),
        ] {
            if class.percent >= soft {
                warn!(
                    resource = name,
                    current = class.current,
                    limit = class.limit,
                    percent = class.percent,
                    "Resource usage above soft limit"
                );
            }
        }
    }

    /// Latest snapshot (thread-safe copy).
    pub fn usage(&self) -> ResourceUsage {
        *self.snapshot.read()
    }

    /// Admission check before creating `expected_containers` more instances.
    pub async fn admit(&self, expected_containers: i64) -> Result<QuotaDecision, DeployError> {
        self.metrics.quota_check();

        if !self.config.enabled {
            return Ok(QuotaDecision::Admitted);
        }

        // A snapshot older than three refresh periods is not evidence of
        // anything; re-read before deciding.
        let stale_cutoff = epoch_now() - (self.config.check_interval_secs as i64) * 3;
        if self.usage().last_updated < stale_cutoff {
            self.refresh().await?;
        }

        let usage = self.usage();

        if usage.containers.current + expected_containers as f64
            > self.config.max_total_containers as f64
        {
            self.metrics.quota_rejected("containers");
            return Ok(QuotaDecision::Rejected {
                resource: "containers",
                current: usage.containers.current,
                limit: usage.containers.limit,
            });
        }

        // Projection assumes a new instance may use one full core and the
        // configured per-container memory; the next refresh corrects it.
        let projected_cpu = usage.cpu.current + 100.0 * expected_containers as f64;
        if projected_cpu > self.config.max_total_cpu_percent {
            self.metrics.quota_rejected("cpu");
            return Ok(QuotaDecision::Rejected {
                resource: "cpu",
                current: usage.cpu.current,
                limit: usage.cpu.limit,
            });
        }

        let projected_memory =
            usage.memory.current + (512.0 * 1024.0 * 1024.0) * expected_containers as f64;
        if projected_memory > self.config.max_total_memory_bytes as f64 {
            self.metrics.quota_rejected("memory");
            return Ok(QuotaDecision::Rejected {
                resource: "memory",
                current: usage.memory.current,
                limit: usage.memory.limit,
            });
        }

        Ok(QuotaDecision::Admitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_class_percent() {
        let class = ResourceClass::new(50.0, 200.0);
        assert_eq!(class.percent, 25.0);
    }

    #[test]
    fn test_resource_class_zero_limit() {
        let class = ResourceClass::new(50.0, 0.0);
        assert_eq!(class.percent, 0.0);
    }

    #[test]
    fn test_default_snapshot_is_stale() {
        let usage = ResourceUsage::default();
        assert_eq!(usage.last_updated, 0);
    }
}

//! Prometheus metrics
//!
//! All families live in one registry owned by the application state and are
//! encoded in text exposition format for the `/metrics` endpoint.

use crate::resources::ResourceUsage;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry,
    TextEncoder,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

pub struct Metrics {
    registry: Registry,

    info: GaugeVec,
    active_containers: Gauge,
    deployments_total: Counter,
    deployment_duration: Histogram,
    container_lifetime: Histogram,

    rate_limit_checks: Counter,
    rate_limit_rejections: Counter,

    quota_checks: Counter,
    quota_rejections: CounterVec,

    resource_usage_percent: GaugeVec,
    resource_current: GaugeVec,
    resource_limit: GaugeVec,

    errors_total: CounterVec,

    db_operations: CounterVec,
    db_operation_duration: Histogram,
    db_connection_pool: GaugeVec,

    port_pool: GaugeVec,
    port_allocation_failures: Counter,

    captcha_generated: Counter,
    captcha_validations: Counter,
    restarts_total: Counter,
    extensions_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let info = GaugeVec::new(
            Opts::new("ctf_deployer_info", "Information about this deployer instance"),
            &["version", "challenge"],
        )?;
        registry.register(Box::new(info.clone()))?;

        let active_containers = Gauge::new(
            "ctf_active_containers",
            "Number of currently active challenge containers",
        )?;
        registry.register(Box::new(active_containers.clone()))?;

        let deployments_total = Counter::new(
            "ctf_container_deployments_total",
            "Total number of container deployments",
        )?;
        registry.register(Box::new(deployments_total.clone()))?;

        let deployment_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ctf_container_deployment_duration_seconds",
                "Time taken to deploy a container",
            )
            .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        )?;
        registry.register(Box::new(deployment_duration.clone()))?;

        let container_lifetime = Histogram::with_opts(
            HistogramOpts::new("ctf_container_lifetime_seconds", "Lifetime of containers")
                .buckets(vec![60.0, 300.0, 600.0, 1800.0, 3600.0, 7200.0, 14400.0, 28800.0]),
        )?;
        registry.register(Box::new(container_lifetime.clone()))?;

        let rate_limit_checks = Counter::new(
            "ctf_rate_limit_checks_total",
            "Total number of rate limit checks",
        )?;
        registry.register(Box::new(rate_limit_checks.clone()))?;

        let rate_limit_rejections = Counter::new(
            "ctf_rate_limit_rejections_total",
            "Total number of requests rejected by rate limiting",
        )?;
        registry.register(Box::new(rate_limit_rejections.clone()))?;

        let quota_checks = Counter::new(
            "ctf_resource_quota_checks_total",
            "Total number of resource quota checks",
        )?;
        registry.register(Box::new(quota_checks.clone()))?;

        let quota_rejections = CounterVec::new(
            Opts::new(
                "ctf_resource_quota_rejections_total",
                "Total number of requests rejected by resource quotas",
            ),
            &["resource"],
        )?;
        registry.register(Box::new(quota_rejections.clone()))?;

        let resource_usage_percent = GaugeVec::new(
            Opts::new(
                "ctf_resource_usage_percent",
                "Current resource usage as percentage of the limit",
            ),
            &["resource"],
        )?;
        registry.register(Box::new(resource_usage_percent.clone()))?;

        let resource_current = GaugeVec::new(
            Opts::new("ctf_resource_current", "Current resource usage in absolute units"),
            &["resource"],
        )?;
        registry.register(Box::new(resource_current.clone()))?;

        let resource_limit = GaugeVec::new(
            Opts::new("ctf_resource_limit", "Resource limit in absolute units"),
            &["resource"],
        )?;
        registry.register(Box::new(resource_limit.clone()))?;

        let errors_total = CounterVec::new(
            Opts::new("ctf_errors_total", "Total number of errors"),
            &["type"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let db_operations = CounterVec::new(
            Opts::new(
                "ctf_database_operations_total",
                "Total number of database operations",
            ),
            &["op"],
        )?;
        registry.register(Box::new(db_operations.clone()))?;

        let db_operation_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ctf_database_operation_duration_seconds",
                "Time taken for database operations",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
        )?;
        registry.register(Box::new(db_operation_duration.clone()))?;

        let db_connection_pool = GaugeVec::new(
            Opts::new(
                "ctf_database_connection_pool",
                "Database connection pool statistics",
            ),
            &["state"],
        )?;
        registry.register(Box::new(db_connection_pool.clone()))?;

        let port_pool = GaugeVec::new(
            Opts::new("ctf_port_pool", "Port pool statistics"),
            &["state"],
        )?;
        registry.register(Box::new(port_pool.clone()))?;

        let port_allocation_failures = Counter::new(
            "ctf_port_allocation_failures_total",
            "Total number of port allocation failures",
        )?;
        registry.register(Box::new(port_allocation_failures.clone()))?;

        let captcha_generated = Counter::new(
            "ctf_captcha_generated_total",
            "Total number of captchas generated",
        )?;
        registry.register(Box::new(captcha_generated.clone()))?;

        let captcha_validations = Counter::new(
            "ctf_captcha_validations_total",
            "Total number of captcha validations",
        )?;
        registry.register(Box::new(captcha_validations.clone()))?;

        let restarts_total = Counter::new(
            "ctf_container_restarts_total",
            "Total number of container restarts",
        )?;
        registry.register(Box::new(restarts_total.clone()))?;

        let extensions_total = Counter::new(
            "ctf_container_lifetime_extensions_total",
            "Total number of container lifetime extensions",
        )?;
        registry.register(Box::new(extensions_total.clone()))?;

        Ok(Self {
            registry,
            info,
            active_containers,
            deployments_total,
            deployment_duration,
            container_lifetime,
            rate_limit_checks,
            rate_limit_rejections,
            quota_checks,
            quota_rejections,
            resource_usage_percent,
            resource_current,
            resource_limit,
            errors_total,
            db_operations,
            db_operation_duration,
            db_connection_pool,
            port_pool,
            port_allocation_failures,
            captcha_generated,
            captcha_validations,
            restarts_total,
            extensions_total,
        })
    }

    /// Set the static info labels once at startup.
    pub fn set_info(&self, version: &str, challenge: &str) {
        self.info.with_label_values(&[version, challenge]).set(1.0);
    }

    pub fn deployment_succeeded(&self, duration_secs: f64) {
        self.deployments_total.inc();
        self.deployment_duration.observe(duration_secs);
    }

    pub fn container_reclaimed(&self, lifetime_secs: f64) {
        self.container_lifetime.observe(lifetime_secs);
    }

    pub fn rate_limit_check(&self, rejected: bool) {
        self.rate_limit_checks.inc();
        if rejected {
            self.rate_limit_rejections.inc();
        }
    }

    pub fn quota_check(&self) {
        self.quota_checks.inc();
    }

    pub fn quota_rejected(&self, resource: &str) {
        self.quota_rejections.with_label_values(&[resource]).inc();
    }

    pub fn error(&self, kind: &str) {
        self.errors_total.with_label_values(&[kind]).inc();
    }

    pub fn db_operation(&self, op: &str, duration_secs: f64) {
        self.db_operations.with_label_values(&[op]).inc();
        self.db_operation_duration.observe(duration_secs);
    }

    pub fn record_pool_stats(&self, free: usize, max: usize) {
        self.db_connection_pool
            .with_label_values(&["free"])
            .set(free as f64);
        self.db_connection_pool
            .with_label_values(&["max"])
            .set(max as f64);
    }

    pub fn record_port_pool(&self, total: i64, available: i64) {
        self.port_pool.with_label_values(&["total"]).set(total as f64);
        self.port_pool
            .with_label_values(&["available"])
            .set(available as f64);
        self.port_pool
            .with_label_values(&["allocated"])
            .set((total - available) as f64);
    }

    pub fn port_allocation_failed(&self) {
        self.port_allocation_failures.inc();
    }

    pub fn record_resource_usage(&self, usage: &ResourceUsage) {
        for (name, class) in [
            ("containers", &usage.containers),
            ("cpu", &usage.cpu),
            ("memory", &usage.memory),
            ("ports", &usage.ports),
        ] {
            self.resource_usage_percent
                .with_label_values(&[name])
                .set(class.percent);
            self.resource_current
                .with_label_values(&[name])
                .set(class.current);
            self.resource_limit
                .with_label_values(&[name])
                .set(class.limit);
        }
        self.active_containers.set(usage.containers.current);
    }

    pub fn set_active_containers(&self, count: i64) {
        self.active_containers.set(count as f64);
    }

    pub fn captcha_generated(&self) {
        self.captcha_generated.inc();
    }

    pub fn captcha_validated(&self) {
        self.captcha_validations.inc();
    }

    pub fn container_restarted(&self) {
        self.restarts_total.inc();
    }

    pub fn lifetime_extended(&self) {
        self.extensions_total.inc();
    }

    /// Encode the registry in Prometheus text exposition format.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{ResourceClass, ResourceUsage};

    #[test]
    fn test_registry_creation_and_encoding() {
        let metrics = Metrics::new().expect("metrics registry");
        metrics.set_info("1.2.0", "Test Challenge");
        assert!(metrics.encode_text().is_ok());
    }

    #[test]
    fn test_counters_appear_in_exposition() {
        let metrics = Metrics::new().unwrap();

        metrics.deployment_succeeded(1.25);
        metrics.rate_limit_check(true);
        metrics.quota_check();
        metrics.quota_rejected("memory");
        metrics.error("engine_fatal");
        metrics.port_allocation_failed();
        metrics.captcha_generated();
        metrics.captcha_validated();
        metrics.container_restarted();
        metrics.lifetime_extended();
        metrics.db_operation("insert_container", 0.004);
        metrics.record_port_pool(100, 98);

        let output = metrics.encode_text().unwrap();
        for family in [
            "ctf_container_deployments_total",
            "ctf_container_deployment_duration_seconds",
            "ctf_rate_limit_checks_total",
            "ctf_rate_limit_rejections_total",
            "ctf_resource_quota_checks_total",
            "ctf_resource_quota_rejections_total",
            "ctf_errors_total",
            "ctf_port_allocation_failures_total",
            "ctf_captcha_generated_total",
            "ctf_captcha_validations_total",
            "ctf_container_restarts_total",
            "ctf_container_lifetime_extensions_total",
            "ctf_database_operations_total",
            "ctf_port_pool",
        ] {
            assert!(output.contains(family), "missing {}", family);
        }
    }

    #[test]
    fn test_resource_usage_updates_gauges() {
        let metrics = Metrics::new().unwrap();
        let usage = ResourceUsage {
            containers: ResourceClass {
                current: 3.0,
                limit: 100.0,
                percent: 3.0,
            },
            cpu: ResourceClass::default(),
            memory: ResourceClass::default(),
            ports: ResourceClass::default(),
            last_updated: 0,
        };
        metrics.record_resource_usage(&usage);

        let output = metrics.encode_text().unwrap();
        assert!(output.contains("ctf_active_containers 3"));
        assert!(output.contains("ctf_resource_usage_percent"));
    }
}

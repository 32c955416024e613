//! Deploy / stop / restart / extend orchestration
//!
//! The orchestrator composes the admission checks (captcha, rate limit,
//! existing instance, quota) with the resource pipeline (port reservation,
//! engine create/start, store insert, monitor scheduling). A failure in any
//! step unwinds every reservation made before it.

use crate::captcha::CaptchaBroker;
use crate::db::{queries, DbPool};
use crate::janitor::Janitor;
use crate::metrics::Metrics;
use crate::ports::PortAllocator;
use crate::rate_limit::{Admission, RateLimiter};
use crate::resources::{QuotaDecision, ResourceMonitor};
use container_runtime::{
    with_engine_retry, ContainerDriver, DriverError, InstanceSpec, InstanceState,
};
use deployer_core::{epoch_now, ContainerRecord, ContainerStatus, DeployError, DeployerConfig};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Bound on any single user-facing operation
const OP_TIMEOUT: Duration = Duration::from_secs(60);

/// Engine retry attempts for create/start
const ENGINE_ATTEMPTS: u32 = 3;

/// Grace period for engine stops during restart
const STOP_TIMEOUT_SECS: i64 = 10;

/// Result of a successful deploy or restart
#[derive(Clone, Debug, Serialize)]
pub struct DeployOutcome {
    pub container_id: String,
    pub port: u16,
    pub expiration_time: i64,
}

/// User-facing view of an instance, joined with the live engine state
#[derive(Clone, Debug, Serialize)]
pub struct ContainerView {
    pub id: String,
    pub full_id: String,
    pub port: u16,
    pub start_time: i64,
    pub expiration_time: i64,
    pub time_left: i64,
    pub running: bool,
    pub status: String,
    pub user_uuid: String,
    pub ip_address: String,
}

pub struct Orchestrator {
    config: DeployerConfig,
    pool: DbPool,
    driver: Arc<dyn ContainerDriver>,
    ports: Arc<PortAllocator>,
    rate_limiter: RateLimiter,
    resources: Arc<ResourceMonitor>,
    captcha: Arc<CaptchaBroker>,
    janitor: Arc<Janitor>,
    metrics: Arc<Metrics>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DeployerConfig,
        pool: DbPool,
        driver: Arc<dyn ContainerDriver>,
        ports: Arc<PortAllocator>,
        rate_limiter: RateLimiter,
        resources: Arc<ResourceMonitor>,
        captcha: Arc<CaptchaBroker>,
        janitor: Arc<Janitor>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            pool,
            driver,
            ports,
            rate_limiter,
            resources,
            captcha,
            janitor,
            metrics,
        }
    }

    /// Full admission pipeline plus placement. See module docs for the
    /// unwind rules.
    pub async fn deploy(
        &self,
        user_uuid: &str,
        ip: &str,
        captcha_id: &str,
        captcha_answer: &str,
    ) -> Result<DeployOutcome, DeployError> {
        tokio::time::timeout(
            OP_TIMEOUT,
            self.deploy_inner(user_uuid, ip, captcha_id, captcha_answer),
        )
        .await
        .map_err(|_| DeployError::EngineTransient("deploy timed out".to_string()))?
    }

    async fn deploy_inner(
        &self,
        user_uuid: &str,
        ip: &str,
        captcha_id: &str,
        captcha_answer: &str,
    ) -> Result<DeployOutcome, DeployError> {
        let started = std::time::Instant::now();

        // 1. Captcha
        self.metrics.captcha_validated();
        if !self.captcha.verify(captcha_id, captcha_answer) {
            return Err(DeployError::CaptchaInvalid);
        }

        // 2. Rate limit
        let admission = self.rate_limiter.admit(ip).await?;
        let rejected = matches!(admission, Admission::Rejected { .. });
        self.metrics.rate_limit_check(rejected);
        if rejected {
            return Err(DeployError::RateLimited);
        }

        // 3. Existing instance
        if queries::running_container_for_user(&self.pool, user_uuid)
            .await
            .map_err(DeployError::from)?
            .is_some()
        {
            return Err(DeployError::AlreadyOwns);
        }

        // 4. Quota
        if let QuotaDecision::Rejected {
            resource,
            current,
            limit,
        } = self.resources.admit(1).await?
        {
            return Err(DeployError::QuotaExceeded {
                resource: resource.to_string(),
                current,
                limit,
            });
        }

        // 5. Port reservation under a placeholder id, re-pointed once the
        // engine hands us the real one.
        let placeholder = format!("pending-{}", Uuid::new_v4());
        let port = match self.ports.reserve(&placeholder).await {
            Ok(port) => port,
            Err(e) => {
                if matches!(e, DeployError::PortPoolFull) {
                    self.metrics.port_allocation_failed();
                }
                return Err(e);
            }
        };

        let expiration_time = epoch_now() + self.config.lifetime.default_lifetime as i64;
        match self.place(user_uuid, ip, port, expiration_time).await {
            Ok(outcome) => {
                self.metrics
                    .deployment_succeeded(started.elapsed().as_secs_f64());
                info!(
                    container_id = %outcome.container_id,
                    port = outcome.port,
                    user_uuid = %user_uuid,
                    "Challenge instance deployed"
                );
                Ok(outcome)
            }
            Err(e) => {
                self.metrics.error(e.metric_label());
                Err(e)
            }
        }
    }

    /// Engine create/start, store insert, port re-point and monitor
    /// scheduling for an already-reserved port.
    async fn place(
        &self,
        user_uuid: &str,
        ip: &str,
        port: u16,
        expiration_time: i64,
    ) -> Result<DeployOutcome, DeployError> {
        let spec = self.instance_spec(user_uuid, port);

        // 6. Engine create + start
        let container_id = match with_engine_retry(ENGINE_ATTEMPTS, || {
            let driver = self.driver.clone();
            let spec = spec.clone();
            async move { driver.create(&spec).await }
        })
        .await
        {
            Ok(id) => id,
            Err(e) => {
                self.unwind_port(port).await;
                return Err(map_engine_error(e));
            }
        };

        if let Err(e) = with_engine_retry(ENGINE_ATTEMPTS, || {
            let driver = self.driver.clone();
            let id = container_id.clone();
            async move { driver.start(&id).await }
        })
        .await
        {
            self.unwind_engine(&container_id).await;
            self.unwind_port(port).await;
            return Err(map_engine_error(e));
        }

        // 7. Authoritative record
        let record = ContainerRecord {
            id: container_id.clone(),
            port,
            start_time: epoch_now(),
            expiration_time,
            user_uuid: user_uuid.to_string(),
            ip_address: ip.to_string(),
            status: ContainerStatus::Running,
        };
        if let Err(e) = queries::insert_container(&self.pool, &record).await {
            self.unwind_engine(&container_id).await;
            self.unwind_port(port).await;
            return Err(DeployError::from(e));
        }

        // 8. Re-point the allocation to the real id. A failure here leaves a
        // placeholder id behind; the row is already authoritative through the
        // container record, and the sweep reconciles it.
        if let Err(e) = self.ports.assign(port, &container_id).await {
            warn!(port, container_id = %container_id, error = %e, "Port re-point failed, left to janitor");
        }

        // 9. Monitor
        self.janitor.schedule(&container_id, expiration_time);

        Ok(DeployOutcome {
            container_id,
            port,
            expiration_time,
        })
    }

    /// Stop the caller's instance. Engine-level NotFound is benign.
    pub async fn stop(&self, user_uuid: &str) -> Result<(), DeployError> {
        tokio::time::timeout(OP_TIMEOUT, self.stop_inner(user_uuid))
            .await
            .map_err(|_| DeployError::EngineTransient("stop timed out".to_string()))?
    }

    async fn stop_inner(&self, user_uuid: &str) -> Result<(), DeployError> {
        let record = queries::running_container_for_user(&self.pool, user_uuid)
            .await
            .map_err(DeployError::from)?
            .ok_or(DeployError::NotFound)?;

        match with_engine_retry(ENGINE_ATTEMPTS, || {
            let driver = self.driver.clone();
            let id = record.id.clone();
            async move { driver.remove(&id).await }
        })
        .await
        {
            Ok(()) | Err(DriverError::NotFound) => {}
            Err(e) => return Err(map_engine_error(e)),
        }

        queries::finalize_container(&self.pool, &record.id, record.port, ContainerStatus::Stopped)
            .await
            .map_err(DeployError::from)?;

        let lifetime = (epoch_now() - record.start_time).max(0) as f64;
        self.metrics.container_reclaimed(lifetime);
        info!(container_id = %record.id, user_uuid = %user_uuid, "Instance stopped");
        Ok(())
    }

    /// Stop-then-place for the owner, keeping the original expiration unless
    /// the lifetime reset policy is enabled. Captcha and rate limit are not
    /// re-validated.
    pub async fn restart(&self, user_uuid: &str) -> Result<DeployOutcome, DeployError> {
        tokio::time::timeout(OP_TIMEOUT, self.restart_inner(user_uuid))
            .await
            .map_err(|_| DeployError::EngineTransient("restart timed out".to_string()))?
    }

    async fn restart_inner(&self, user_uuid: &str) -> Result<DeployOutcome, DeployError> {
        let record = queries::running_container_for_user(&self.pool, user_uuid)
            .await
            .map_err(DeployError::from)?
            .ok_or(DeployError::NotFound)?;

        let expiration_time = if self.config.restart_resets_lifetime {
            epoch_now() + self.config.lifetime.default_lifetime as i64
        } else {
            record.expiration_time
        };

        match with_engine_retry(ENGINE_ATTEMPTS, || {
            let driver = self.driver.clone();
            let id = record.id.clone();
            async move {
                driver.stop(&id, STOP_TIMEOUT_SECS).await?;
                driver.remove(&id).await
            }
        })
        .await
        {
            Ok(()) | Err(DriverError::NotFound) => {}
            Err(e) => return Err(map_engine_error(e)),
        }

        queries::finalize_container(&self.pool, &record.id, record.port, ContainerStatus::Stopped)
            .await
            .map_err(DeployError::from)?;

        // Quota admission still applies; the slot freed above keeps the
        // net container count unchanged, but cpu/memory projections may have
        // moved since the original deploy.
        if let QuotaDecision::Rejected {
            resource,
            current,
            limit,
        } = self.resources.admit(1).await?
        {
            return Err(DeployError::QuotaExceeded {
                resource: resource.to_string(),
                current,
                limit,
            });
        }

        let placeholder = format!("pending-{}", Uuid::new_v4());
        let port = self.ports.reserve(&placeholder).await?;

        let outcome = self
            .place(user_uuid, &record.ip_address, port, expiration_time)
            .await?;
        self.metrics.container_restarted();
        info!(
            old_container = %record.id,
            new_container = %outcome.container_id,
            user_uuid = %user_uuid,
            "Instance restarted"
        );
        Ok(outcome)
    }

    /// Push the expiration forward by the configured extension.
    pub async fn extend(&self, user_uuid: &str) -> Result<i64, DeployError> {
        tokio::time::timeout(OP_TIMEOUT, self.extend_inner(user_uuid))
            .await
            .map_err(|_| DeployError::EngineTransient("extend timed out".to_string()))?
    }

    async fn extend_inner(&self, user_uuid: &str) -> Result<i64, DeployError> {
        let record = queries::running_container_for_user(&self.pool, user_uuid)
            .await
            .map_err(DeployError::from)?
            .ok_or(DeployError::NotFound)?;

        let new_expiration = extended_expiration(&self.config, &record, epoch_now())?;

        let updated = queries::update_expiration(&self.pool, &record.id, new_expiration)
            .await
            .map_err(DeployError::from)?;
        if updated == 0 {
            return Err(DeployError::NotFound);
        }

        // The monitor observes the new deadline on its next wake.
        self.janitor.schedule(&record.id, new_expiration);
        self.metrics.lifetime_extended();
        info!(
            container_id = %record.id,
            new_expiration,
            "Instance lifetime extended"
        );
        Ok(new_expiration)
    }

    /// The caller's instance, joined with the live engine state.
    pub async fn get_owned(&self, user_uuid: &str) -> Result<Option<ContainerView>, DeployError> {
        let record = queries::running_container_for_user(&self.pool, user_uuid)
            .await
            .map_err(DeployError::from)?;
        let Some(record) = record else {
            return Ok(None);
        };

        let state = self
            .driver
            .status(&record.id)
            .await
            .unwrap_or(InstanceState::NotFound);
        Ok(Some(view_of(&record, state.is_running())))
    }

    /// All rows for the admin status page, engine state included for running
    /// ones.
    pub async fn list_all(&self) -> Result<Vec<ContainerView>, DeployError> {
        let records = queries::all_containers(&self.pool)
            .await
            .map_err(DeployError::from)?;

        let mut views = Vec::with_capacity(records.len());
        for record in records {
            let running = if record.status == ContainerStatus::Running {
                self.driver
                    .status(&record.id)
                    .await
                    .map(|s| s.is_running())
                    .unwrap_or(false)
            } else {
                false
            };
            views.push(view_of(&record, running));
        }
        Ok(views)
    }

    fn instance_spec(&self, user_uuid: &str, port: u16) -> InstanceSpec {
        build_instance_spec(&self.config, user_uuid, port)
    }

    async fn unwind_engine(&self, container_id: &str) {
        if let Err(e) = self.driver.remove(container_id).await {
            if !matches!(e, DriverError::NotFound) {
                error!(container_id = %container_id, error = %e, "Failed to remove container during unwind");
            }
        }
    }

    async fn unwind_port(&self, port: u16) {
        if let Err(e) = self.ports.release(port).await {
            error!(port, error = %e, "Failed to release port during unwind");
        }
    }
}

/// Container spec for one user instance: naming, flag env, limits and
/// hardening all derive from the configuration snapshot.
pub fn build_instance_spec(config: &DeployerConfig, user_uuid: &str, port: u16) -> InstanceSpec {
    let short_uuid = user_uuid.split('-').next().unwrap_or(user_uuid);
    let mut env = HashMap::new();
    env.insert("FLAG".to_string(), config.challenge.flag.clone());

    InstanceSpec {
        image: config.challenge.image.clone(),
        name: format!(
            "{}_session_{}",
            config.challenge.project_name,
            user_uuid.replace('-', "_")
        ),
        hostname: format!("ctf-challenge-{}", short_uuid),
        host_port: port,
        port_in_container: config.ports.port_in_container,
        env,
        limits: config.limits.clone(),
        security: config.security.clone(),
        user_uuid: user_uuid.to_string(),
        project: config.challenge.project_name.clone(),
    }
}

/// New expiration after one extension: `max(expiration, now) + extension`,
/// clamped by the optional cumulative ceiling. The ceiling is expressed
/// against the original start time so no extension counter needs to be
/// persisted.
pub fn extended_expiration(
    config: &DeployerConfig,
    record: &ContainerRecord,
    now: i64,
) -> Result<i64, DeployError> {
    let new_expiration = record.expiration_time.max(now) + config.lifetime.extension as i64;

    let Some(max_extensions) = config.max_extensions else {
        return Ok(new_expiration);
    };

    let ceiling = record.start_time
        + config.lifetime.default_lifetime as i64
        + config.lifetime.extension as i64 * max_extensions as i64;
    if record.expiration_time >= ceiling {
        return Err(DeployError::QuotaExceeded {
            resource: "extensions".to_string(),
            current: max_extensions as f64,
            limit: max_extensions as f64,
        });
    }
    Ok(new_expiration.min(ceiling))
}

fn map_engine_error(err: DriverError) -> DeployError {
    match err {
        DriverError::NotFound => DeployError::NotFound,
        DriverError::Conflict(msg) => DeployError::EngineTransient(msg),
        DriverError::Fatal(msg) => DeployError::EngineFatal(msg),
    }
}

fn view_of(record: &ContainerRecord, running: bool) -> ContainerView {
    let now = epoch_now();
    ContainerView {
        id: record.short_id().to_string(),
        full_id: record.id.clone(),
        port: record.port,
        start_time: record.start_time,
        expiration_time: record.expiration_time,
        time_left: record.time_left(now),
        running,
        status: record.status.to_string(),
        user_uuid: record.user_uuid.clone(),
        ip_address: record.ip_address.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn test_config() -> DeployerConfig {
        let mut map = StdHashMap::new();
        map.insert("DB_PASSWORD".to_string(), "pw".to_string());
        map.insert("ADMIN_KEY".to_string(), "k".to_string());
        map.insert("IMAGES_NAME".to_string(), "localhost/ctf:latest".to_string());
        map.insert("DEFAULT_LIFETIME".to_string(), "60".to_string());
        map.insert("EXTENSION_TIME".to_string(), "30".to_string());
        DeployerConfig::from_map(&map).unwrap()
    }

    fn record(start: i64, expiration: i64) -> ContainerRecord {
        ContainerRecord {
            id: "c0ffee0123456789".to_string(),
            port: 9000,
            start_time: start,
            expiration_time: expiration,
            user_uuid: "aaaa1111-bbbb-cccc-dddd-eeeeffff0000".to_string(),
            ip_address: "10.0.0.1".to_string(),
            status: ContainerStatus::Running,
        }
    }

    #[test]
    fn test_instance_spec_naming() {
        let config = test_config();
        let spec = build_instance_spec(&config, "aaaa1111-bbbb-cccc-dddd-eeeeffff0000", 9000);

        assert_eq!(
            spec.name,
            "ctf_task_session_aaaa1111_bbbb_cccc_dddd_eeeeffff0000"
        );
        assert_eq!(spec.hostname, "ctf-challenge-aaaa1111");
        assert_eq!(spec.host_port, 9000);
        assert_eq!(spec.env.get("FLAG"), Some(&config.challenge.flag));
        assert_eq!(spec.project, "ctf_task");
    }

    #[test]
    fn test_extension_advances_future_expiration() {
        let config = test_config();
        // Deploy at t=0, expiration t=60, extend at t=50: 60 + 30 = 90.
        let new = extended_expiration(&config, &record(0, 60), 50).unwrap();
        assert_eq!(new, 90);
    }

    #[test]
    fn test_extension_of_past_expiration_starts_from_now() {
        let config = test_config();
        // Expiration already behind the clock: extend from now, not from it.
        let new = extended_expiration(&config, &record(0, 60), 100).unwrap();
        assert_eq!(new, 130);
    }

    #[test]
    fn test_extension_unbounded_by_default() {
        let config = test_config();
        let mut exp = 60;
        for _ in 0..50 {
            exp = extended_expiration(&config, &record(0, exp), 0).unwrap();
        }
        assert_eq!(exp, 60 + 50 * 30);
    }

    #[test]
    fn test_extension_ceiling_enforced() {
        let mut map = StdHashMap::new();
        map.insert("DB_PASSWORD".to_string(), "pw".to_string());
        map.insert("ADMIN_KEY".to_string(), "k".to_string());
        map.insert("IMAGES_NAME".to_string(), "localhost/ctf:latest".to_string());
        map.insert("DEFAULT_LIFETIME".to_string(), "60".to_string());
        map.insert("EXTENSION_TIME".to_string(), "30".to_string());
        map.insert("MAX_EXTENSIONS".to_string(), "2".to_string());
        let config = DeployerConfig::from_map(&map).unwrap();

        // Ceiling is start + 60 + 2*30 = start + 120.
        let first = extended_expiration(&config, &record(0, 60), 0).unwrap();
        assert_eq!(first, 90);
        let second = extended_expiration(&config, &record(0, first), 0).unwrap();
        assert_eq!(second, 120);
        let third = extended_expiration(&config, &record(0, second), 0);
        assert!(matches!(
            third,
            Err(DeployError::QuotaExceeded { .. })
        ));
    }

    #[test]
    fn test_engine_error_mapping() {
        assert!(matches!(
            map_engine_error(DriverError::NotFound),
            DeployError::NotFound
        ));
        assert!(matches!(
            map_engine_error(DriverError::Conflict("x".into())),
            DeployError::EngineTransient(_)
        ));
        assert!(matches!(
            map_engine_error(DriverError::Fatal("x".into())),
            DeployError::EngineFatal(_)
        ));
    }

    #[test]
    fn test_view_reports_time_left() {
        let now = epoch_now();
        let view = view_of(&record(now - 10, now + 50), true);
        assert!(view.time_left > 45 && view.time_left <= 50);
        assert_eq!(view.id.len(), 12);
        assert!(view.running);
    }
}

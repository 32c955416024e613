//! CTF Deployer Server
//!
//! Per-user challenge orchestration on a single host:
//!
//! ```text
//! deploy request
//!   └─ captcha ─ rate limit ─ existing instance ─ quota
//!        └─ port reservation (store, FOR UPDATE SKIP LOCKED)
//!             └─ engine create + start (bollard)
//!                  └─ container record ─ monitor scheduling
//! janitor
//!   ├─ dispatcher: expiry heap → bounded reclamation pool
//!   └─ sweeper: expired batches, stale ports, old rate-limit rows
//! ```
//!
//! PostgreSQL is the only coordination point; in-process state is limited to
//! the captcha table, the monitor heap and the resource snapshot.

pub mod api;
pub mod captcha;
pub mod db;
pub mod janitor;
pub mod metrics;
pub mod orchestration;
pub mod ports;
pub mod rate_limit;
pub mod resources;
pub mod state;

use crate::captcha::CaptchaBroker;
use crate::janitor::Janitor;
use crate::metrics::Metrics;
use crate::orchestration::Orchestrator;
use crate::ports::PortAllocator;
use crate::rate_limit::RateLimiter;
use crate::resources::ResourceMonitor;
use crate::state::AppState;
use anyhow::Context;
use container_runtime::{ContainerDriver, DockerDriver};
use deployer_core::DeployerConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Wire every subsystem together against a concrete driver.
///
/// Split out of [`run`] so tests can substitute a mock engine.
pub async fn build_state(
    config: DeployerConfig,
    driver: Arc<dyn ContainerDriver>,
) -> anyhow::Result<(Arc<AppState>, DbPoolPair)> {
    let (pool, maintenance_pool) = db::init_pools(&config).await?;
    db::schema::init_schema(&pool, config.ports.start_range, config.ports.stop_range)
        .await
        .context("schema initialization failed")?;

    let metrics = Arc::new(Metrics::new().context("metrics registry")?);
    metrics.set_info(VERSION, &config.challenge.title);

    let ports = Arc::new(PortAllocator::new(
        pool.clone(),
        config.maintenance.port_allocation_max_attempts,
        config.maintenance.stale_port_max_age_secs,
    ));

    let captcha = Arc::new(CaptchaBroker::new(
        config.maintenance.captcha_ttl_secs,
        config.admin.bypass_captcha,
    ));

    let resources = Arc::new(ResourceMonitor::new(
        config.quotas.clone(),
        pool.clone(),
        driver.clone(),
        config.challenge.project_name.clone(),
        metrics.clone(),
    ));

    let janitor = Arc::new(Janitor::new(
        maintenance_pool.clone(),
        driver.clone(),
        ports.clone(),
        metrics.clone(),
        config.maintenance.clone(),
        config.rate_limit.window_secs,
    ));

    let rate_limiter = RateLimiter::new(
        pool.clone(),
        config.rate_limit.max_per_window,
        config.rate_limit.window_secs,
    );

    let orchestrator = Orchestrator::new(
        config.clone(),
        pool.clone(),
        driver.clone(),
        ports.clone(),
        rate_limiter,
        resources.clone(),
        captcha.clone(),
        janitor.clone(),
        metrics.clone(),
    );

    let state = Arc::new(AppState::new(
        config,
        pool.clone(),
        driver,
        orchestrator,
        captcha,
        resources,
        ports,
        janitor,
        metrics,
    ));

    Ok((state, DbPoolPair { pool, maintenance_pool }))
}

/// Both pools, handed back to the caller for teardown paths.
pub struct DbPoolPair {
    pub pool: db::DbPool,
    pub maintenance_pool: db::DbPool,
}

/// Run the deployer until `shutdown` fires, then reclaim every instance.
pub async fn run(config: DeployerConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    let driver: Arc<dyn ContainerDriver> = Arc::new(
        DockerDriver::connect(&config.network.network_name, &config.network.network_subnet)
            .await
            .context("docker connection failed")?,
    );
    driver
        .ensure_network()
        .await
        .context("network setup failed")?;

    let api_port = config.ports.api_port;
    let (state, _pools) = build_state(config, driver).await?;

    // Reconcile leftovers from a previous run before taking traffic: stale
    // allocations are released and rows already past their deadline go
    // straight to the reclamation path.
    let stats = state.janitor.sweep_once().await;
    info!(reclaimed = stats.reclaimed, ports_swept = stats.ports_swept, "Initial maintenance complete");

    // Rows still running from a previous process get monitors again.
    match db::queries::all_containers(&state.pool).await {
        Ok(records) => {
            for record in records
                .iter()
                .filter(|r| r.status == deployer_core::ContainerStatus::Running)
            {
                state.janitor.schedule(&record.id, record.expiration_time);
            }
        }
        Err(e) => warn!(error = %e, "Could not schedule monitors for existing containers"),
    }

    state.resources.clone().start(shutdown.clone());
    state.janitor.clone().start(shutdown.clone());

    let app = api::router(state.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], api_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(%addr, "Deployer API listening");

    let server_shutdown = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
    .await?;

    // In-flight challenges do not survive a restart: tear everything down.
    info!("Shutting down, reclaiming all instances");
    let stats = state.janitor.reclaim_all().await;
    info!(
        reclaimed = stats.reclaimed,
        errors = stats.errors,
        "Shutdown cleanup complete"
    );

    Ok(())
}

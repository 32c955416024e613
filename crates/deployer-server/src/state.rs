//! Application state

use crate::captcha::CaptchaBroker;
use crate::db::DbPool;
use crate::janitor::Janitor;
use crate::metrics::Metrics;
use crate::orchestration::Orchestrator;
use crate::ports::PortAllocator;
use crate::resources::ResourceMonitor;
use container_runtime::ContainerDriver;
use deployer_core::{epoch_now, DeployerConfig};
use std::sync::Arc;

pub struct AppState {
    pub config: DeployerConfig,
    pub pool: DbPool,
    pub driver: Arc<dyn ContainerDriver>,
    pub orchestrator: Orchestrator,
    pub captcha: Arc<CaptchaBroker>,
    pub resources: Arc<ResourceMonitor>,
    pub ports: Arc<PortAllocator>,
    pub janitor: Arc<Janitor>,
    pub metrics: Arc<Metrics>,
    pub started_at: i64,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DeployerConfig,
        pool: DbPool,
        driver: Arc<dyn ContainerDriver>,
        orchestrator: Orchestrator,
        captcha: Arc<CaptchaBroker>,
        resources: Arc<ResourceMonitor>,
        ports: Arc<PortAllocator>,
        janitor: Arc<Janitor>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            pool,
            driver,
            orchestrator,
            captcha,
            resources,
            ports,
            janitor,
            metrics,
            started_at: epoch_now(),
        }
    }
}

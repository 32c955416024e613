//! `down` - tear down the deployment

use anyhow::Context;
use clap::Args;
use container_runtime::{ContainerDriver, DockerDriver};
use deployer_core::{ContainerStatus, DeployerConfig};
use deployer_server::db::{self, queries};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Args)]
pub struct DownArgs {
    /// Environment file supplying configuration defaults
    #[arg(long = "env-file", default_value = ".env")]
    pub env_file: PathBuf,
}

pub async fn run(args: DownArgs) -> anyhow::Result<()> {
    let config = DeployerConfig::from_env_file(Some(&args.env_file))
        .context("configuration validation failed")?;

    let driver: Arc<dyn ContainerDriver> = Arc::new(
        DockerDriver::connect(&config.network.network_name, &config.network.network_subnet)
            .await
            .context("docker daemon unreachable")?,
    );

    // Engine first: remove everything carrying this deployment's label.
    let mut removed = 0usize;
    match driver.list_deployment(&config.challenge.project_name).await {
        Ok(ids) => {
            for id in ids {
                match driver.remove(&id).await {
                    Ok(()) => {
                        removed += 1;
                        info!(container_id = %id, "Removed container");
                    }
                    Err(e) => warn!(container_id = %id, error = %e, "Failed to remove container"),
                }
            }
        }
        Err(e) => warn!(error = %e, "Could not enumerate deployment containers"),
    }

    // Then the store: close out running rows and free their ports.
    match db::init_pools(&config).await {
        Ok((pool, _)) => {
            let records = queries::all_containers(&pool).await.unwrap_or_default();
            for record in records
                .iter()
                .filter(|r| r.status == ContainerStatus::Running)
            {
                if let Err(e) =
                    queries::finalize_container(&pool, &record.id, record.port, ContainerStatus::Removed)
                        .await
                {
                    warn!(container_id = %record.id, error = %e, "Failed to finalize container row");
                }
            }
            info!("Store records finalized");
        }
        Err(e) => warn!(error = %e, "Database unreachable, skipped store cleanup"),
    }

    info!(removed, "Deployment torn down");
    Ok(())
}

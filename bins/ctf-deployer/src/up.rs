//! `up` - validate, lock and run

use anyhow::{bail, Context};
use clap::Args;
use container_runtime::{ContainerDriver, DockerDriver};
use deployer_core::{DeployerConfig, InstanceLock};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Args)]
pub struct UpArgs {
    /// Environment file supplying configuration defaults
    #[arg(long = "env-file", default_value = ".env")]
    pub env_file: PathBuf,

    /// Skip pre-deploy validations
    #[arg(short = 's', long = "skip-validations")]
    pub skip_validations: bool,

    /// Run a post-deploy smoke probe against the live API
    #[arg(short = 'p', long = "post-deploy-smoke")]
    pub post_deploy_smoke: bool,

    /// Run the unit suite before starting
    #[arg(short = 'u', long = "unit-tests")]
    pub unit_tests: bool,
}

pub async fn run(args: UpArgs) -> anyhow::Result<()> {
    let config = DeployerConfig::from_env_file(Some(&args.env_file))
        .context("configuration validation failed")?;

    if args.unit_tests {
        run_unit_suite()?;
    }

    if args.skip_validations {
        warn!("Pre-deploy validations skipped (-s)");
    } else {
        validate(&config).await?;
    }

    // One instance per port range per host.
    let install_path = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let _lock = InstanceLock::acquire(
        "ctf-deployer",
        config.ports.start_range,
        config.ports.stop_range,
        &install_path,
    )
    .context("instance lock acquisition failed")?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            signal_token.cancel();
        }
    });

    if args.post_deploy_smoke {
        let api_port = config.ports.api_port;
        let smoke_shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            if smoke_shutdown.is_cancelled() {
                return;
            }
            match smoke_probe(api_port).await {
                Ok(()) => info!("Post-deploy smoke probe passed"),
                Err(e) => error!(error = %e, "Post-deploy smoke probe FAILED"),
            }
        });
    }

    deployer_server::run(config, shutdown).await
}

/// Pre-deploy checks: container engine, database reachability, challenge
/// image presence.
async fn validate(config: &DeployerConfig) -> anyhow::Result<()> {
    info!("Running pre-deploy validations");

    let driver = DockerDriver::connect(&config.network.network_name, &config.network.network_subnet)
        .await
        .context("validation: docker daemon unreachable")?;
    driver
        .ensure_network()
        .await
        .context("validation: docker network setup failed")?;

    let db_addr = format!("{}:{}", config.store.host, config.store.port);
    tokio::time::timeout(
        Duration::from_secs(5),
        tokio::net::TcpStream::connect(&db_addr),
    )
    .await
    .map_err(|_| anyhow::anyhow!("validation: database {} did not answer in 5s", db_addr))?
    .with_context(|| format!("validation: database {} unreachable", db_addr))?;

    info!(
        image = %config.challenge.image,
        ports = config.ports.pool_size(),
        "Pre-deploy validations passed"
    );
    Ok(())
}

fn run_unit_suite() -> anyhow::Result<()> {
    info!("Running unit suite (cargo test)");
    let status = std::process::Command::new("cargo")
        .args(["test", "--workspace", "--quiet"])
        .status()
        .context("failed to spawn cargo test")?;

    if !status.success() {
        bail!("unit suite failed, refusing to deploy");
    }
    Ok(())
}

/// Post-deploy probe: the health endpoint answers and a captcha can be
/// fetched.
async fn smoke_probe(api_port: u16) -> anyhow::Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;
    let base = format!("http://127.0.0.1:{}", api_port);

    let health: serde_json::Value = client
        .get(format!("{}/health", base))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    if health.get("ok") != Some(&serde_json::Value::Bool(true)) {
        bail!("health endpoint returned {}", health);
    }

    let captcha: serde_json::Value = client
        .get(format!("{}/get_captcha", base))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    if captcha.get("captcha_id").is_none() {
        bail!("captcha endpoint returned {}", captcha);
    }

    Ok(())
}

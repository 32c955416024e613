//! Docker client wrapper for challenge containers
//!
//! One challenge image, many per-user instances. Every container is created
//! with the host port handed out by the allocation table, the configured
//! resource limits and the hardening flags from the security config.

use crate::types::{labels, DriverError, InstanceSpec, InstanceState, InstanceStats};
use crate::ContainerDriver;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::models::{HostConfig, Ipam, IpamConfig, PortBinding};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Docker driver for challenge instances
pub struct DockerDriver {
    docker: Docker,
    network_name: String,
    network_subnet: String,
}

impl DockerDriver {
    /// Connect to the local Docker daemon and verify it responds.
    pub async fn connect(network_name: &str, network_subnet: &str) -> Result<Self, DriverError> {
        let docker = Docker::connect_with_local_defaults()?;
        docker.ping().await?;
        info!("Connected to Docker daemon");

        Ok(Self {
            docker,
            network_name: network_name.to_string(),
            network_subnet: network_subnet.to_string(),
        })
    }

    fn port_key(port: u16) -> String {
        format!("{}/tcp", port)
    }

    fn security_opts(spec: &InstanceSpec) -> Option<Vec<String>> {
        if spec.security.no_new_privileges {
            Some(vec!["no-new-privileges:true".to_string()])
        } else {
            None
        }
    }

    fn capabilities(spec: &InstanceSpec) -> (Option<Vec<String>>, Option<Vec<String>>) {
        if !spec.security.drop_all_caps {
            return (None, None);
        }
        let mut add = Vec::new();
        if spec.security.cap_net_bind {
            add.push("NET_BIND_SERVICE".to_string());
        }
        if spec.security.cap_chown {
            add.push("CHOWN".to_string());
        }
        (Some(vec!["ALL".to_string()]), Some(add))
    }

    fn tmpfs(spec: &InstanceSpec) -> Option<HashMap<String, String>> {
        if !spec.security.tmpfs_enable {
            return None;
        }
        let mut map = HashMap::new();
        map.insert(
            "/tmp".to_string(),
            format!("exec,size={}", spec.security.tmpfs_size),
        );
        Some(map)
    }
}

#[async_trait]
impl ContainerDriver for DockerDriver {
    async fn ensure_network(&self) -> Result<(), DriverError> {
        let networks = self.docker.list_networks::<String>(None).await?;
        let exists = networks
            .iter()
            .any(|n| n.name.as_deref() == Some(self.network_name.as_str()));

        if exists {
            debug!(network = %self.network_name, "Docker network already exists");
            return Ok(());
        }

        use bollard::network::CreateNetworkOptions;
        let config = CreateNetworkOptions {
            name: self.network_name.clone(),
            driver: "bridge".to_string(),
            ipam: Ipam {
                config: Some(vec![IpamConfig {
                    subnet: Some(self.network_subnet.clone()),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            ..Default::default()
        };
        self.docker.create_network(config).await?;
        info!(network = %self.network_name, subnet = %self.network_subnet, "Created Docker network");
        Ok(())
    }

    async fn create(&self, spec: &InstanceSpec) -> Result<String, DriverError> {
        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            Self::port_key(spec.port_in_container),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(spec.host_port.to_string()),
            }]),
        );

        let (cap_drop, cap_add) = Self::capabilities(spec);

        let host_config = HostConfig {
            network_mode: Some(self.network_name.clone()),
            port_bindings: Some(port_bindings),
            memory: Some(spec.limits.memory_bytes),
            memory_swap: Some(spec.limits.swap_bytes),
            cpu_period: Some(100_000),
            cpu_quota: Some((100_000.0 * spec.limits.cpu_cores) as i64),
            pids_limit: Some(spec.limits.pids_limit),
            security_opt: Self::security_opts(spec),
            readonly_rootfs: Some(spec.security.read_only),
            tmpfs: Self::tmpfs(spec),
            cap_drop,
            cap_add,
            ..Default::default()
        };

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let mut container_labels = HashMap::new();
        container_labels.insert(labels::MANAGED.to_string(), "true".to_string());
        container_labels.insert(labels::PROJECT.to_string(), spec.project.clone());
        container_labels.insert(labels::USER.to_string(), spec.user_uuid.clone());

        let container_config = Config {
            image: Some(spec.image.clone()),
            hostname: Some(spec.hostname.clone()),
            env: Some(env),
            labels: Some(container_labels),
            exposed_ports: Some({
                let mut ports = HashMap::new();
                ports.insert(Self::port_key(spec.port_in_container), HashMap::new());
                ports
            }),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await?;

        debug!(
            container_id = %response.id,
            name = %spec.name,
            host_port = spec.host_port,
            "Challenge container created"
        );
        Ok(response.id)
    }

    async fn start(&self, container_id: &str) -> Result<(), DriverError> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await?;
        info!(container_id = %container_id, "Challenge container started");
        Ok(())
    }

    async fn stop(&self, container_id: &str, timeout_secs: i64) -> Result<(), DriverError> {
        let options = StopContainerOptions { t: timeout_secs };
        match self.docker.stop_container(container_id, Some(options)).await {
            Ok(_) => {
                debug!(container_id = %container_id, "Container stopped");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()), // already stopped
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, container_id: &str) -> Result<(), DriverError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self
            .docker
            .remove_container(container_id, Some(options))
            .await
        {
            Ok(_) => {
                debug!(container_id = %container_id, "Container removed");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container_id = %container_id, "Container already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn status(&self, container_id: &str) -> Result<InstanceState, DriverError> {
        match self.docker.inspect_container(container_id, None).await {
            Ok(info) => {
                let state = info.state.as_ref();
                if state.and_then(|s| s.running).unwrap_or(false) {
                    Ok(InstanceState::Running)
                } else if state
                    .and_then(|s| s.status.as_ref())
                    .map(|s| s.to_string() == "exited")
                    .unwrap_or(false)
                {
                    Ok(InstanceState::Exited)
                } else {
                    Ok(InstanceState::Other)
                }
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(InstanceState::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    async fn logs(
        &self,
        container_id: &str,
        tail: usize,
        since: Option<i64>,
    ) -> Result<String, DriverError> {
        use futures::TryStreamExt;

        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            timestamps: true,
            tail: tail.to_string(),
            since: since.unwrap_or(0),
            ..Default::default()
        };

        let chunks: Vec<_> = self
            .docker
            .logs(container_id, Some(options))
            .try_collect()
            .await?;

        Ok(chunks
            .into_iter()
            .map(|chunk| chunk.to_string())
            .collect::<Vec<_>>()
            .join(""))
    }

    async fn stats(&self, container_id: &str) -> Result<InstanceStats, DriverError> {
        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };

        let mut stream = self.docker.stats(container_id, Some(options));
        let stats = match stream.next().await {
            Some(Ok(stats)) => stats,
            Some(Err(e)) => return Err(e.into()),
            None => return Ok(InstanceStats::default()),
        };

        let cpu_delta = stats
            .cpu_stats
            .cpu_usage
            .total_usage
            .saturating_sub(stats.precpu_stats.cpu_usage.total_usage);
        let system_delta = stats
            .cpu_stats
            .system_cpu_usage
            .unwrap_or(0)
            .saturating_sub(stats.precpu_stats.system_cpu_usage.unwrap_or(0));
        let online_cpus = stats.cpu_stats.online_cpus.unwrap_or(1) as f64;

        let cpu_percent = if system_delta > 0 {
            (cpu_delta as f64 / system_delta as f64) * 100.0 * online_cpus
        } else {
            0.0
        };

        let memory_bytes = stats.memory_stats.usage.unwrap_or(0);

        Ok(InstanceStats {
            cpu_percent,
            memory_bytes,
        })
    }

    async fn list_deployment(&self, project: &str) -> Result<Vec<String>, DriverError> {
        let label_filter = format!("{}={}", labels::PROJECT, project);
        let mut filters = HashMap::new();
        filters.insert("label", vec![label_filter.as_str()]);

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self.docker.list_containers(Some(options)).await?;
        let mut ids: Vec<String> = containers.into_iter().filter_map(|c| c.id).collect();

        // System services (API host, database, reference challenge) are named
        // by the compose project rather than labelled.
        for service in ["deployer", "db", "challenge_direct"] {
            let name = format!("{}_{}", project, service);
            match self.docker.inspect_container(&name, None).await {
                Ok(info) => {
                    if let Some(id) = info.id {
                        if !ids.contains(&id) {
                            ids.push(id);
                        }
                    }
                }
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => {}
                Err(e) => warn!(container = %name, error = %e, "Failed to inspect system service"),
            }
        }

        Ok(ids)
    }
}

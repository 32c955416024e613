//! Deployer configuration
//!
//! The configuration is an immutable snapshot built once at startup from
//! environment-style `KEY=VALUE` pairs (process environment merged over an
//! optional env file). Validation fails fast with an error naming the
//! offending key; nothing is mutated after [`DeployerConfig::from_map`]
//! returns.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;

/// Ports that must never be claimed by the deployer: standard service ports
/// that would collide with infrastructure on any reasonable host.
pub const RESERVED_PORTS: &[u16] = &[22, 25, 53, 80, 443, 3306, 5432, 6379, 8080];

/// Configuration errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required config key: {0}")]
    MissingKey(&'static str),

    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid port range: start_range {start} must be below stop_range {stop}")]
    InvalidRange { start: u16, stop: u16 },

    #[error("port {port} ({key}) is a reserved well-known service port")]
    ReservedPort { key: &'static str, port: u16 },
}

/// Challenge lifetime settings
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LifetimeConfig {
    /// Seconds a fresh instance lives before reclamation
    pub default_lifetime: u64,
    /// Seconds added per extend request
    pub extension: u64,
}

/// Port layout
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PortConfig {
    /// Port the challenge listens on inside the container
    pub port_in_container: u16,
    /// First host port handed to challenge instances (inclusive)
    pub start_range: u16,
    /// One past the last host port (exclusive)
    pub stop_range: u16,
    /// Port the deployer API binds
    pub api_port: u16,
    /// Host port of the reference challenge instance
    pub direct_test_port: u16,
}

impl PortConfig {
    /// Number of ports in the pool
    pub fn pool_size(&self) -> usize {
        (self.stop_range - self.start_range) as usize
    }
}

/// Docker network settings
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    pub network_name: String,
    pub network_subnet: String,
}

/// PostgreSQL connection settings
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    pub pool_min: usize,
    pub pool_max: usize,
}

/// Per-container resource limits
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ContainerLimits {
    /// Memory limit in bytes
    pub memory_bytes: i64,
    /// Memory+swap limit in bytes
    pub swap_bytes: i64,
    /// CPU limit (1.0 = one core)
    pub cpu_cores: f64,
    /// Maximum number of PIDs (fork-bomb guard)
    pub pids_limit: i64,
}

/// Container hardening toggles
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SecurityConfig {
    pub no_new_privileges: bool,
    pub read_only: bool,
    pub tmpfs_enable: bool,
    /// tmpfs size spec, e.g. "64m"
    pub tmpfs_size: String,
    pub drop_all_caps: bool,
    pub cap_net_bind: bool,
    pub cap_chown: bool,
}

/// Per-source admission window
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    pub max_per_window: i64,
    pub window_secs: u64,
}

/// Janitor and maintenance settings
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MaintenanceConfig {
    /// Bound on concurrent reclamation workers
    pub thread_pool_size: usize,
    /// Sweeper period in seconds
    pub interval_secs: u64,
    /// Per-container monitor re-check period in seconds
    pub container_check_interval_secs: u64,
    pub captcha_ttl_secs: u64,
    pub batch_size: usize,
    pub pool_min: usize,
    pub pool_max: usize,
    pub port_allocation_max_attempts: u32,
    /// Age after which an allocation with no live container is reclaimed
    pub stale_port_max_age_secs: u64,
}

/// Global resource quotas
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct QuotaConfig {
    pub enabled: bool,
    pub max_total_containers: i64,
    /// Percentage points, 100 = one core
    pub max_total_cpu_percent: f64,
    pub max_total_memory_bytes: u64,
    pub check_interval_secs: u64,
    /// Usage percentage at which warnings start
    pub soft_limit_percent: f64,
}

/// Admin surface and test-mode toggles
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AdminConfig {
    pub admin_key: String,
    pub enable_metrics: bool,
    pub enable_logs_endpoint: bool,
    pub bypass_captcha: bool,
}

/// The challenge being deployed
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChallengeConfig {
    /// Docker image of the challenge
    pub image: String,
    /// Flag injected as the FLAG environment variable
    pub flag: String,
    pub title: String,
    pub description: String,
    /// Prefix for container names, one deployment per prefix
    pub project_name: String,
}

/// Complete validated configuration snapshot
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DeployerConfig {
    pub lifetime: LifetimeConfig,
    pub ports: PortConfig,
    pub network: NetworkConfig,
    pub store: StoreConfig,
    pub limits: ContainerLimits,
    pub security: SecurityConfig,
    pub rate_limit: RateLimitConfig,
    pub maintenance: MaintenanceConfig,
    pub quotas: QuotaConfig,
    pub admin: AdminConfig,
    pub challenge: ChallengeConfig,
    /// Whether restart resets the instance lifetime instead of preserving it
    pub restart_resets_lifetime: bool,
    /// Optional ceiling on the number of extensions per instance
    pub max_extensions: Option<u32>,
}

fn get<'a>(map: &'a HashMap<String, String>, key: &'static str) -> Option<&'a str> {
    map.get(key).map(|s| s.trim()).filter(|s| !s.is_empty())
}

fn require<'a>(map: &'a HashMap<String, String>, key: &'static str) -> Result<&'a str, ConfigError> {
    get(map, key).ok_or(ConfigError::MissingKey(key))
}

fn parse<T>(map: &HashMap<String, String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(map, key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key,
            value: raw.to_string(),
            reason: e.to_string(),
        }),
    }
}

fn parse_bool(
    map: &HashMap<String, String>,
    key: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    match get(map, key) {
        None => Ok(default),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key,
                value: raw.to_string(),
                reason: "expected true or false".to_string(),
            }),
        },
    }
}

fn string(map: &HashMap<String, String>, key: &'static str, default: &str) -> String {
    get(map, key).unwrap_or(default).to_string()
}

impl DeployerConfig {
    /// Build a snapshot from the process environment, with `file` (if given)
    /// supplying defaults for keys the environment does not set.
    pub fn from_env_file(file: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let mut map = HashMap::new();
        if let Some(path) = file {
            if let Ok(contents) = std::fs::read_to_string(path) {
                for line in contents.lines() {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    if let Some((key, value)) = line.split_once('=') {
                        map.insert(key.trim().to_string(), value.trim().to_string());
                    }
                }
            }
        }
        // Process environment wins over the file.
        for (key, value) in std::env::vars() {
            map.insert(key, value);
        }
        Self::from_map(&map)
    }

    /// Build and validate a snapshot from a key/value map.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let config = Self {
            lifetime: LifetimeConfig {
                default_lifetime: parse(map, "DEFAULT_LIFETIME", 1800)?,
                extension: parse(map, "EXTENSION_TIME", 600)?,
            },
            ports: PortConfig {
                port_in_container: parse(map, "PORT_IN_CONTAINER", 8000)?,
                start_range: parse(map, "START_RANGE", 9000)?,
                stop_range: parse(map, "STOP_RANGE", 10001)?,
                api_port: parse(map, "API_PORT", 5000)?,
                direct_test_port: parse(map, "DIRECT_TEST_PORT", 8888)?,
            },
            network: NetworkConfig {
                network_name: string(map, "NETWORK_NAME", "ctf-network"),
                network_subnet: string(map, "NETWORK_SUBNET", "172.28.0.0/16"),
            },
            store: StoreConfig {
                host: string(map, "DB_HOST", "localhost"),
                port: parse(map, "DB_PORT", 5432)?,
                name: string(map, "DB_NAME", "ctf_deployer"),
                user: string(map, "DB_USER", "ctf"),
                password: require(map, "DB_PASSWORD")?.to_string(),
                pool_min: parse(map, "DB_POOL_MIN", 5)?,
                pool_max: parse(map, "DB_POOL_MAX", 20)?,
            },
            limits: ContainerLimits {
                memory_bytes: parse(map, "CONTAINER_MEMORY_LIMIT", 512 * 1024 * 1024)?,
                swap_bytes: parse(map, "CONTAINER_SWAP_LIMIT", 512 * 1024 * 1024)?,
                cpu_cores: parse(map, "CONTAINER_CPU_LIMIT", 0.5)?,
                pids_limit: parse(map, "CONTAINER_PIDS_LIMIT", 100)?,
            },
            security: SecurityConfig {
                no_new_privileges: parse_bool(map, "ENABLE_NO_NEW_PRIVILEGES", true)?,
                read_only: parse_bool(map, "ENABLE_READ_ONLY", true)?,
                tmpfs_enable: parse_bool(map, "ENABLE_TMPFS", true)?,
                tmpfs_size: string(map, "TMPFS_SIZE", "64m"),
                drop_all_caps: parse_bool(map, "DROP_ALL_CAPABILITIES", true)?,
                cap_net_bind: parse_bool(map, "CAP_NET_BIND_SERVICE", true)?,
                cap_chown: parse_bool(map, "CAP_CHOWN", true)?,
            },
            rate_limit: RateLimitConfig {
                max_per_window: parse(map, "MAX_CONTAINERS_PER_HOUR", 5)?,
                window_secs: parse(map, "RATE_LIMIT_WINDOW", 3600)?,
            },
            maintenance: MaintenanceConfig {
                thread_pool_size: parse(map, "THREAD_POOL_SIZE", 10)?,
                interval_secs: parse(map, "MAINTENANCE_INTERVAL", 60)?,
                container_check_interval_secs: parse(map, "CONTAINER_CHECK_INTERVAL", 30)?,
                captcha_ttl_secs: parse(map, "CAPTCHA_TTL", 300)?,
                batch_size: parse(map, "MAINTENANCE_BATCH_SIZE", 10)?,
                pool_min: parse(map, "MAINTENANCE_POOL_MIN", 2)?,
                pool_max: parse(map, "MAINTENANCE_POOL_MAX", 5)?,
                port_allocation_max_attempts: parse(map, "PORT_ALLOCATION_MAX_ATTEMPTS", 5)?,
                stale_port_max_age_secs: parse(map, "STALE_PORT_MAX_AGE", 3600)?,
            },
            quotas: QuotaConfig {
                enabled: parse_bool(map, "ENABLE_RESOURCE_QUOTAS", true)?,
                max_total_containers: parse(map, "MAX_TOTAL_CONTAINERS", 100)?,
                max_total_cpu_percent: parse(map, "MAX_TOTAL_CPU_PERCENT", 800.0)?,
                max_total_memory_bytes: parse(
                    map,
                    "MAX_TOTAL_MEMORY",
                    8u64 * 1024 * 1024 * 1024,
                )?,
                check_interval_secs: parse(map, "RESOURCE_CHECK_INTERVAL", 30)?,
                soft_limit_percent: parse(map, "RESOURCE_SOFT_LIMIT_PERCENT", 80.0)?,
            },
            admin: AdminConfig {
                admin_key: require(map, "ADMIN_KEY")?.to_string(),
                enable_metrics: parse_bool(map, "ENABLE_METRICS", true)?,
                enable_logs_endpoint: parse_bool(map, "ENABLE_LOGS_ENDPOINT", true)?,
                bypass_captcha: parse_bool(map, "BYPASS_CAPTCHA", false)?,
            },
            challenge: ChallengeConfig {
                image: require(map, "IMAGES_NAME")?.to_string(),
                flag: string(map, "FLAG", "CTF{placeholder_flag}"),
                title: string(map, "CHALLENGE_TITLE", "Generic CTF Challenge"),
                description: string(
                    map,
                    "CHALLENGE_DESCRIPTION",
                    "Solve the challenge to find the hidden flag!",
                ),
                project_name: string(map, "COMPOSE_PROJECT_NAME", "ctf_task"),
            },
            restart_resets_lifetime: parse_bool(map, "RESTART_RESETS_LIFETIME", false)?,
            max_extensions: match get(map, "MAX_EXTENSIONS") {
                None => None,
                Some(raw) => Some(raw.parse().map_err(|e: std::num::ParseIntError| {
                    ConfigError::InvalidValue {
                        key: "MAX_EXTENSIONS",
                        value: raw.to_string(),
                        reason: e.to_string(),
                    }
                })?),
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.ports.start_range >= self.ports.stop_range {
            return Err(ConfigError::InvalidRange {
                start: self.ports.start_range,
                stop: self.ports.stop_range,
            });
        }

        if self.lifetime.default_lifetime == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DEFAULT_LIFETIME",
                value: "0".to_string(),
                reason: "lifetime must be positive".to_string(),
            });
        }

        let named = [
            ("API_PORT", self.ports.api_port),
            ("DIRECT_TEST_PORT", self.ports.direct_test_port),
            ("PORT_IN_CONTAINER", self.ports.port_in_container),
        ];
        for (key, port) in named {
            if RESERVED_PORTS.contains(&port) {
                return Err(ConfigError::ReservedPort { key, port });
            }
        }
        for &reserved in RESERVED_PORTS {
            if reserved >= self.ports.start_range && reserved < self.ports.stop_range {
                return Err(ConfigError::ReservedPort {
                    key: "START_RANGE..STOP_RANGE",
                    port: reserved,
                });
            }
        }

        if self.store.pool_min > self.store.pool_max {
            return Err(ConfigError::InvalidValue {
                key: "DB_POOL_MIN",
                value: self.store.pool_min.to_string(),
                reason: format!("exceeds DB_POOL_MAX ({})", self.store.pool_max),
            });
        }
        if self.maintenance.pool_min > self.maintenance.pool_max {
            return Err(ConfigError::InvalidValue {
                key: "MAINTENANCE_POOL_MIN",
                value: self.maintenance.pool_min.to_string(),
                reason: format!("exceeds MAINTENANCE_POOL_MAX ({})", self.maintenance.pool_max),
            });
        }
        if self.maintenance.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAINTENANCE_BATCH_SIZE",
                value: "0".to_string(),
                reason: "batch size must be positive".to_string(),
            });
        }
        if self.maintenance.thread_pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "THREAD_POOL_SIZE",
                value: "0".to_string(),
                reason: "worker pool must have at least one slot".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_map() -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("DB_PASSWORD".to_string(), "secret".to_string());
        map.insert("ADMIN_KEY".to_string(), "k".to_string());
        map.insert(
            "IMAGES_NAME".to_string(),
            "localhost/generic_ctf_task:latest".to_string(),
        );
        map
    }

    #[test]
    fn test_defaults_validate() {
        let config = DeployerConfig::from_map(&base_map()).expect("defaults are valid");
        assert_eq!(config.ports.start_range, 9000);
        assert_eq!(config.ports.pool_size(), 1001);
        assert_eq!(config.rate_limit.max_per_window, 5);
        assert!(!config.restart_resets_lifetime);
        assert!(config.max_extensions.is_none());
    }

    #[test]
    fn test_missing_required_key_is_named() {
        let mut map = base_map();
        map.remove("ADMIN_KEY");
        let err = DeployerConfig::from_map(&map).expect_err("missing admin key");
        assert_eq!(err, ConfigError::MissingKey("ADMIN_KEY"));
    }

    #[test]
    fn test_bool_parsing_is_case_insensitive() {
        let mut map = base_map();
        map.insert("BYPASS_CAPTCHA".to_string(), "TRUE".to_string());
        map.insert("ENABLE_READ_ONLY".to_string(), "False".to_string());
        let config = DeployerConfig::from_map(&map).unwrap();
        assert!(config.admin.bypass_captcha);
        assert!(!config.security.read_only);
    }

    #[test]
    fn test_bad_bool_rejected() {
        let mut map = base_map();
        map.insert("ENABLE_TMPFS".to_string(), "yes".to_string());
        let err = DeployerConfig::from_map(&map).expect_err("bad boolean");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "ENABLE_TMPFS",
                ..
            }
        ));
    }

    #[test]
    fn test_inverted_range_rejected() {
        let mut map = base_map();
        map.insert("START_RANGE".to_string(), "9100".to_string());
        map.insert("STOP_RANGE".to_string(), "9100".to_string());
        let err = DeployerConfig::from_map(&map).expect_err("empty range");
        assert_eq!(
            err,
            ConfigError::InvalidRange {
                start: 9100,
                stop: 9100
            }
        );
    }

    #[test]
    fn test_reserved_port_rejected_in_named_fields() {
        let mut map = base_map();
        map.insert("API_PORT".to_string(), "8080".to_string());
        let err = DeployerConfig::from_map(&map).expect_err("reserved api port");
        assert_eq!(
            err,
            ConfigError::ReservedPort {
                key: "API_PORT",
                port: 8080
            }
        );
    }

    #[test]
    fn test_reserved_port_rejected_inside_range() {
        let mut map = base_map();
        map.insert("START_RANGE".to_string(), "5000".to_string());
        map.insert("STOP_RANGE".to_string(), "6000".to_string());
        let err = DeployerConfig::from_map(&map).expect_err("range overlaps postgres");
        assert!(matches!(err, ConfigError::ReservedPort { port: 5432, .. }));
    }

    #[test]
    fn test_single_port_range_is_valid() {
        let mut map = base_map();
        map.insert("START_RANGE".to_string(), "9000".to_string());
        map.insert("STOP_RANGE".to_string(), "9001".to_string());
        let config = DeployerConfig::from_map(&map).unwrap();
        assert_eq!(config.ports.pool_size(), 1);
    }

    #[test]
    fn test_serialize_round_trip() {
        let config = DeployerConfig::from_map(&base_map()).unwrap();
        let json = serde_json::to_string(&config).expect("serialize");
        let round_trip: DeployerConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(round_trip, config);
    }

    #[test]
    fn test_env_file_parsing_ignores_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deploy.env");
        std::fs::write(
            &path,
            "# deployment settings\nDB_PASSWORD=filepw\nADMIN_KEY=filekey\nIMAGES_NAME=img:1\n\nSTART_RANGE = 9200\n",
        )
        .unwrap();

        let config = DeployerConfig::from_env_file(Some(&path)).unwrap();
        assert_eq!(config.ports.start_range, 9200);
        // Real env vars may shadow file values, but these keys are unlikely
        // to be set in a test environment.
        assert_eq!(config.challenge.image, "img:1");
    }

    #[test]
    fn test_max_extensions_parsed() {
        let mut map = base_map();
        map.insert("MAX_EXTENSIONS".to_string(), "3".to_string());
        let config = DeployerConfig::from_map(&map).unwrap();
        assert_eq!(config.max_extensions, Some(3));
    }
}

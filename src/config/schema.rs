use serde::Deserialize;

use super::depend::DependencyNode;
use super::duration::DurationValue;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default, rename = "backend")]
    pub backends: Vec<BackendDef>,
    pub service: ServiceConfig,
    #[serde(default, rename = "monitor")]
    pub monitors: Vec<MonitorDef>,
    #[serde(default)]
    pub users: UsersConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Reject sloppy values (e.g. unit-less durations) instead of guessing
    #[serde(default)]
    pub strict_config: bool,
}

fn default_listen_port() -> u16 {
    3307
}

/// One backend database server
#[derive(Debug, Clone, Deserialize)]
pub struct BackendDef {
    pub name: String,
    /// Hostname, IPv4 address, or absolute unix-socket path
    pub address: String,
    #[serde(default = "default_backend_port")]
    pub port: u16,
    /// Send a PROXY protocol v1 header on connect
    #[serde(default)]
    pub proxy_protocol: bool,
    /// Idle authenticated connections parked per server; zero disables
    #[serde(default = "default_persistent_pool_max")]
    pub persistent_pool_max: usize,
}

fn default_backend_port() -> u16 {
    3306
}

fn default_persistent_pool_max() -> usize {
    8
}

/// The routing service exposed to clients
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Routing module: "readwritesplit" or "readconnroute"
    #[serde(default = "default_router")]
    pub router: String,
    /// Deliver whole result sets to the router as one buffer
    #[serde(default)]
    pub collect_results: bool,
    /// Backends (by name) this service routes to
    pub targets: Vec<String>,
    /// Privileged account used to replicate credentials
    pub user: String,
    #[serde(default)]
    pub password: String,
}

fn default_service_name() -> String {
    "proxy-service".to_string()
}

fn default_router() -> String {
    "readwritesplit".to_string()
}

/// An external monitor declaration; only its server references matter to
/// the core's dependency checks
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorDef {
    pub name: String,
    pub servers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UsersConfig {
    /// How often the credential table is re-fetched
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: DurationValue,
}

fn default_refresh_interval() -> DurationValue {
    DurationValue::from_secs(300)
}

impl Default for UsersConfig {
    fn default() -> Self {
        Self {
            refresh_interval: default_refresh_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Pending backend bytes above which the client reader pauses
    #[serde(default = "default_writeq_high_water")]
    pub writeq_high_water: usize,
    /// Pending backend bytes below which it resumes
    #[serde(default = "default_writeq_low_water")]
    pub writeq_low_water: usize,
    /// DNS cache entry lifetime
    #[serde(default = "default_dns_ttl")]
    pub dns_cache_ttl: DurationValue,
}

fn default_writeq_high_water() -> usize {
    16 * 1024 * 1024
}

fn default_writeq_low_water() -> usize {
    8 * 1024 * 1024
}

fn default_dns_ttl() -> DurationValue {
    DurationValue::from_secs(600)
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            writeq_high_water: default_writeq_high_water(),
            writeq_low_water: default_writeq_low_water(),
            dns_cache_ttl: default_dns_ttl(),
        }
    }
}

impl Config {
    /// The dependency graph of named objects: the service depends on its
    /// targets, monitors on their servers
    pub fn dependency_nodes(&self) -> Vec<DependencyNode> {
        let mut nodes: Vec<DependencyNode> = self
            .backends
            .iter()
            .map(|b| DependencyNode {
                name: b.name.clone(),
                depends_on: Vec::new(),
            })
            .collect();

        nodes.push(DependencyNode {
            name: self.service.name.clone(),
            depends_on: self.service.targets.clone(),
        });

        for monitor in &self.monitors {
            nodes.push(DependencyNode {
                name: monitor.name.clone(),
                depends_on: monitor.servers.clone(),
            });
        }

        nodes
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                listen_addr: "127.0.0.1".to_string(),
                listen_port: 3307,
                strict_config: false,
            },
            backends: vec![BackendDef {
                name: "server1".to_string(),
                address: "127.0.0.1".to_string(),
                port: 3306,
                proxy_protocol: false,
                persistent_pool_max: default_persistent_pool_max(),
            }],
            service: ServiceConfig {
                name: default_service_name(),
                router: default_router(),
                collect_results: false,
                targets: vec!["server1".to_string()],
                user: "root".to_string(),
                password: String::new(),
            },
            monitors: Vec::new(),
            users: UsersConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

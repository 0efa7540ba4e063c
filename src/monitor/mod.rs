//! Server registry and monitor bridge.
//!
//! Monitors run outside the core; they own most of the status bits on
//! these records. The core reads them when picking a backend to dial and
//! writes exactly one of them itself: MAINTENANCE, when a backend starts
//! refusing connections because of too many failed connects.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{error, info};

use crate::config::BackendDef;

/// Server status bits, monitor-owned unless noted
pub mod status {
    pub const RUNNING: u32 = 0x01;
    /// Operator/core-set: do not dial until cleared
    pub const MAINTENANCE: u32 = 0x02;
    pub const MASTER: u32 = 0x04;
    pub const SLAVE: u32 = 0x08;
}

/// Where a backend listens
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServerAddr {
    Tcp { host: String, port: u16 },
    Unix { path: String },
}

impl std::fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerAddr::Tcp { host, port } => write!(f, "{}:{}", host, port),
            ServerAddr::Unix { path } => write!(f, "{}", path),
        }
    }
}

/// One configured backend server
#[derive(Debug)]
pub struct Server {
    pub name: String,
    pub addr: ServerAddr,
    /// Send a PROXY protocol v1 header right after connecting
    pub proxy_protocol: bool,
    /// Idle authenticated connections kept per server; zero disables pooling
    pub persistent_pool_max: usize,
    status: AtomicU32,
}

impl Server {
    pub fn from_def(def: &BackendDef) -> Self {
        let addr = if def.address.starts_with('/') {
            ServerAddr::Unix {
                path: def.address.clone(),
            }
        } else {
            ServerAddr::Tcp {
                host: def.address.clone(),
                port: def.port,
            }
        };
        Self {
            name: def.name.clone(),
            addr,
            proxy_protocol: def.proxy_protocol,
            persistent_pool_max: def.persistent_pool_max,
            status: AtomicU32::new(status::RUNNING),
        }
    }

    pub fn status(&self) -> u32 {
        self.status.load(Ordering::Acquire)
    }

    pub fn set_status(&self, bits: u32) {
        self.status.fetch_or(bits, Ordering::AcqRel);
    }

    pub fn clear_status(&self, bits: u32) {
        self.status.fetch_and(!bits, Ordering::AcqRel);
    }

    pub fn is_in_maintenance(&self) -> bool {
        self.status() & status::MAINTENANCE != 0
    }

    /// Whether the core may dial this server right now
    pub fn is_usable(&self) -> bool {
        let s = self.status();
        s & status::RUNNING != 0 && s & status::MAINTENANCE == 0
    }

    pub fn is_master(&self) -> bool {
        self.status() & status::MASTER != 0
    }

    pub fn persistent_conns_enabled(&self) -> bool {
        self.persistent_pool_max > 0
    }

    /// Put this server into maintenance because it is blocking us.
    ///
    /// Nothing clears the bit automatically: the backend tracks failed
    /// connects on its side, so dialling again before an operator runs
    /// flush-hosts would only dig the hole deeper.
    pub fn enter_maintenance_blocked(&self) {
        self.set_status(status::MAINTENANCE);
        error!(
            server = %self.name,
            addr = %self.addr,
            "server has been put into maintenance mode due to the server blocking \
             connections from the proxy. Run 'mysqladmin flush-hosts' on this server \
             before taking it out of maintenance mode. To avoid this problem in the \
             future, raise 'max_connect_errors' on the backend"
        );
    }
}

/// All configured servers, shared across every session
#[derive(Default)]
pub struct ServerRegistry {
    servers: DashMap<String, Arc<Server>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, server: Server) -> Arc<Server> {
        let server = Arc::new(server);
        info!(server = %server.name, addr = %server.addr, "server registered");
        self.servers.insert(server.name.clone(), server.clone());
        server
    }

    pub fn get(&self, name: &str) -> Option<Arc<Server>> {
        self.servers.get(name).map(|s| s.clone())
    }

    pub fn all(&self) -> Vec<Arc<Server>> {
        self.servers.iter().map(|s| s.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

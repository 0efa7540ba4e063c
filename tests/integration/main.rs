//! Integration test entry point
//!
//! Run with: PORTICO_RUN_INTEGRATION_TESTS=1 cargo test --test integration
//!
//! Requires a running proxy (see `proxy.rs` for the expected topology)
//! and a MySQL backend reachable with the configured credentials.

mod proxy;

use std::env;

/// Check if integration tests should run
pub fn should_run_integration_tests() -> bool {
    env::var("PORTICO_RUN_INTEGRATION_TESTS")
        .map(|v| v == "1")
        .unwrap_or(false)
}

/// Get proxy connection config from environment
pub fn get_proxy_config() -> ProxyTestConfig {
    ProxyTestConfig {
        host: env::var("PORTICO_TEST_PROXY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
        port: env::var("PORTICO_TEST_PROXY_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3307),
        user: env::var("PORTICO_TEST_USER").unwrap_or_else(|_| "root".to_string()),
        password: env::var("PORTICO_TEST_PASS").unwrap_or_default(),
        database: env::var("PORTICO_TEST_DB").unwrap_or_else(|_| "test".to_string()),
    }
}

/// Proxy test configuration
#[derive(Debug, Clone)]
pub struct ProxyTestConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl ProxyTestConfig {
    /// Get connection URL for the mysql client
    pub fn url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }
}

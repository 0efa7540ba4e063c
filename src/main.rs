mod auth;
mod backend;
mod config;
mod dns;
mod metrics;
mod monitor;
mod protocol;
mod router;
mod session;
mod users;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinSet;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use auth::default_authenticator;
use backend::pool::ConnectionPool;
use config::Config;
use dns::DnsCache;
use monitor::{Server, ServerAddr, ServerRegistry};
use session::{ProxyShared, Session};
use users::{UserRefresher, UserStore};

/// Global connection counter for generating unique session IDs
static CONNECTION_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Graceful shutdown timeout (wait for sessions to close)
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    // Load configuration
    let config = load_or_default_config();
    let startup_order = config.validate()?;
    info!(order = ?startup_order, "configuration objects resolved");

    // Server registry, constructed dependencies-first
    let registry = Arc::new(ServerRegistry::new());
    for def in &config.backends {
        registry.insert(Server::from_def(def));
    }

    let service_servers: Vec<Arc<Server>> = config
        .service
        .targets
        .iter()
        .filter_map(|name| registry.get(name))
        .collect();
    if service_servers.is_empty() {
        anyhow::bail!("service '{}' resolved no usable targets", config.service.name);
    }

    let strict = config.server.strict_config;
    let dns = Arc::new(DnsCache::new(config.limits.dns_cache_ttl.resolve(strict)?));
    let pool = Arc::new(ConnectionPool::new());
    let users = Arc::new(UserStore::new());

    // Credential replication sources: every TCP target of the service
    let sources: Vec<String> = service_servers
        .iter()
        .filter_map(|s| match &s.addr {
            ServerAddr::Tcp { host, port } => Some(format!("{}:{}", host, port)),
            ServerAddr::Unix { .. } => None,
        })
        .collect();
    let refresher = Arc::new(UserRefresher::new(
        users.clone(),
        sources,
        &config.service.user,
        &config.service.password,
    ));

    // Prefetch once so the first client doesn't pay for it
    if !refresher.refresh().await {
        warn!("initial credential fetch failed; clients will be rejected until a reload succeeds");
    }

    // Periodic credential refresh
    let refresh_interval = config.users.refresh_interval.resolve(strict)?;
    if !refresh_interval.is_zero() {
        let refresher = refresher.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(refresh_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // immediate first tick already covered
            loop {
                ticker.tick().await;
                refresher.refresh().await;
            }
        });
    }

    let shared = Arc::new(ProxyShared {
        service: config.service.clone(),
        service_servers,
        pool,
        users,
        refresher,
        dns,
        authenticator: Arc::new(default_authenticator()),
        limits: config.limits.clone(),
    });

    let addr = format!("{}:{}", config.server.listen_addr, config.server.listen_port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, service = %config.service.name, "Portico MySQL proxy listening");

    // Start metrics server in background
    let metrics_addr = format!(
        "{}:{}",
        config.server.listen_addr,
        config.server.listen_port + 1000
    );
    info!(metrics_addr = %metrics_addr, "Metrics server starting");
    tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(&metrics_addr).await {
            error!(error = %e, "Metrics server failed");
        }
    });

    // Track active sessions for graceful shutdown
    let mut sessions: JoinSet<()> = JoinSet::new();

    // Main accept loop with graceful shutdown support
    loop {
        tokio::select! {
            // Handle shutdown signals
            _ = shutdown_signal() => {
                info!("Shutdown signal received, stopping accept loop");
                break;
            }

            // Accept new connections
            accept_result = listener.accept() => {
                let (stream, peer_addr) = match accept_result {
                    Ok(v) => v,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };
                stream.set_nodelay(true).ok();

                let session_id = CONNECTION_COUNTER.fetch_add(1, Ordering::SeqCst);
                let shared = shared.clone();

                info!(session_id = session_id, peer = %peer_addr, "New connection");
                metrics::metrics().record_connection_accepted();

                sessions.spawn(async move {
                    match Session::new(session_id, shared) {
                        Ok(session) => {
                            if let Err(e) = session.run(stream, Some(peer_addr)).await {
                                warn!(session_id = session_id, error = %e, "Session ended with error");
                            } else {
                                info!(session_id = session_id, "Session ended");
                            }
                        }
                        Err(e) => {
                            error!(session_id = session_id, error = %e, "Session setup failed");
                        }
                    }
                    metrics::metrics().record_connection_closed();
                });
            }
        }
    }

    // Graceful shutdown: wait for active sessions to complete
    let active_count = sessions.len();
    if active_count > 0 {
        info!(
            active_sessions = active_count,
            timeout_secs = GRACEFUL_SHUTDOWN_TIMEOUT.as_secs(),
            "Waiting for active sessions to complete"
        );

        let shutdown_deadline = tokio::time::Instant::now() + GRACEFUL_SHUTDOWN_TIMEOUT;

        loop {
            if sessions.is_empty() {
                info!("All sessions completed gracefully");
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep_until(shutdown_deadline) => {
                    let remaining = sessions.len();
                    warn!(
                        remaining_sessions = remaining,
                        "Graceful shutdown timeout, aborting remaining sessions"
                    );
                    sessions.abort_all();
                    break;
                }

                Some(result) = sessions.join_next() => {
                    if let Err(e) = result {
                        if !e.is_cancelled() {
                            error!(error = %e, "Session task panicked");
                        }
                    }
                    let remaining = sessions.len();
                    if remaining > 0 {
                        info!(remaining_sessions = remaining, "Session completed during shutdown");
                    }
                }
            }
        }
    }

    // Parked backends get a proper goodbye
    for conn in shared.pool.clear() {
        conn.close().await;
    }

    info!("Portico MySQL proxy shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn load_or_default_config() -> Config {
    // Try to load from config file
    let config_paths = ["config/portico.toml", "portico.toml"];

    for path in config_paths {
        match config::load_config(path) {
            Ok(config) => {
                info!(path = path, "Loaded configuration");
                return config;
            }
            Err(e) => {
                warn!(path = path, error = %e, "Failed to load config");
            }
        }
    }

    info!("Using default configuration");
    Config::default()
}

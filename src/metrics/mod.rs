//! Prometheus metrics for the Portico proxy
//!
//! Exposes metrics via HTTP endpoint for Prometheus scraping.

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::sync::OnceLock;

/// Global metrics registry
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Portico metrics collection
pub struct Metrics {
    /// Registry for all metrics
    pub registry: Registry,

    // Connection metrics
    /// Total client connections accepted
    pub connections_total: IntCounter,
    /// Current active client connections
    pub connections_active: IntGauge,
    /// Total client connections closed
    pub connections_closed: IntCounter,

    // Command metrics
    /// Total client commands routed, by command class
    pub commands_total: IntCounterVec,
    /// Command round-trip latency (in seconds)
    pub command_duration_seconds: HistogramVec,
    /// Backend errors by kind
    pub backend_errors_total: IntCounterVec,

    // Pool metrics
    /// Pool lookups that found an idle connection
    pub pool_hits_total: IntCounterVec,
    /// Pool lookups that had to dial
    pub pool_misses_total: IntCounterVec,
    /// Currently parked backend connections
    pub pooled_connections: IntGauge,
    /// COM_CHANGE_USER re-identifications by result
    pub reauth_total: IntCounterVec,

    // Credential metrics
    /// Credential table reloads by outcome
    pub user_reloads_total: IntCounterVec,
}

impl Metrics {
    /// Create a new metrics collection
    pub fn new() -> Self {
        let registry = Registry::new();

        let connections_total = IntCounter::new(
            "portico_connections_total",
            "Total number of client connections accepted",
        )
        .unwrap();

        let connections_active = IntGauge::new(
            "portico_connections_active",
            "Current number of active client connections",
        )
        .unwrap();

        let connections_closed = IntCounter::new(
            "portico_connections_closed_total",
            "Total number of client connections closed",
        )
        .unwrap();

        let commands_total = IntCounterVec::new(
            Opts::new(
                "portico_commands_total",
                "Total number of client commands routed",
            ),
            &["command"], // query, prepare, ping, etc.
        )
        .unwrap();

        let command_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "portico_command_duration_seconds",
                "Command round-trip latency in seconds",
            )
            .buckets(vec![
                0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
                10.0,
            ]),
            &["command", "server"],
        )
        .unwrap();

        let backend_errors_total = IntCounterVec::new(
            Opts::new(
                "portico_backend_errors_total",
                "Total number of backend errors",
            ),
            &["kind"], // lost, auth, reauth, protocol
        )
        .unwrap();

        let pool_hits_total = IntCounterVec::new(
            Opts::new(
                "portico_pool_hits_total",
                "Pool lookups satisfied by an idle connection",
            ),
            &["server"],
        )
        .unwrap();

        let pool_misses_total = IntCounterVec::new(
            Opts::new(
                "portico_pool_misses_total",
                "Pool lookups that required a fresh connection",
            ),
            &["server"],
        )
        .unwrap();

        let pooled_connections = IntGauge::new(
            "portico_pooled_connections",
            "Backend connections currently parked in the pool",
        )
        .unwrap();

        let reauth_total = IntCounterVec::new(
            Opts::new(
                "portico_reauth_total",
                "COM_CHANGE_USER re-identifications",
            ),
            &["result"], // ok, failed
        )
        .unwrap();

        let user_reloads_total = IntCounterVec::new(
            Opts::new(
                "portico_user_reloads_total",
                "Credential table reload attempts",
            ),
            &["result"], // changed, unchanged, failed, throttled
        )
        .unwrap();

        // Register all metrics
        registry
            .register(Box::new(connections_total.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_active.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_closed.clone()))
            .unwrap();
        registry.register(Box::new(commands_total.clone())).unwrap();
        registry
            .register(Box::new(command_duration_seconds.clone()))
            .unwrap();
        registry
            .register(Box::new(backend_errors_total.clone()))
            .unwrap();
        registry.register(Box::new(pool_hits_total.clone())).unwrap();
        registry
            .register(Box::new(pool_misses_total.clone()))
            .unwrap();
        registry
            .register(Box::new(pooled_connections.clone()))
            .unwrap();
        registry.register(Box::new(reauth_total.clone())).unwrap();
        registry
            .register(Box::new(user_reloads_total.clone()))
            .unwrap();

        Self {
            registry,
            connections_total,
            connections_active,
            connections_closed,
            commands_total,
            command_duration_seconds,
            backend_errors_total,
            pool_hits_total,
            pool_misses_total,
            pooled_connections,
            reauth_total,
            user_reloads_total,
        }
    }

    /// Record a new connection
    pub fn record_connection_accepted(&self) {
        self.connections_total.inc();
        self.connections_active.inc();
    }

    /// Record a connection closed
    pub fn record_connection_closed(&self) {
        self.connections_active.dec();
        self.connections_closed.inc();
    }

    /// Record a routed command and its round trip
    pub fn record_command(&self, command: &str, server: &str, duration_secs: f64) {
        self.commands_total.with_label_values(&[command]).inc();
        self.command_duration_seconds
            .with_label_values(&[command, server])
            .observe(duration_secs);
    }

    /// Record a backend error
    pub fn record_backend_error(&self, kind: &str) {
        self.backend_errors_total.with_label_values(&[kind]).inc();
    }

    /// Record a pool hit
    pub fn record_pool_hit(&self, server: &str) {
        self.pool_hits_total.with_label_values(&[server]).inc();
    }

    /// Record a pool miss
    pub fn record_pool_miss(&self, server: &str) {
        self.pool_misses_total.with_label_values(&[server]).inc();
    }

    /// Update the parked-connection gauge
    pub fn set_pooled_connections(&self, count: i64) {
        self.pooled_connections.set(count);
    }

    /// Record a re-identification attempt
    pub fn record_reauth(&self, success: bool) {
        let result = if success { "ok" } else { "failed" };
        self.reauth_total.with_label_values(&[result]).inc();
    }

    /// Record a credential reload outcome
    pub fn record_user_reload(&self, result: &str) {
        self.user_reloads_total.with_label_values(&[result]).inc();
    }

    /// Get metrics as Prometheus text format
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(addr: &str) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tracing::{error, info};

    async fn handle_request(
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        match req.uri().path() {
            "/metrics" => {
                let body = metrics().gather();
                Ok(Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                    .body(Full::new(Bytes::from(body)))
                    .unwrap())
            }
            "/health" => Ok(Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::from("OK")))
                .unwrap()),
            _ => Ok(Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from("Not Found")))
                .unwrap()),
        }
    }

    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!(error = %e, "Metrics server connection error");
            }
        });
    }
}

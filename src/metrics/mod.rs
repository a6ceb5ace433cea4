//! Prometheus metrics for the rwsplit proxy
//!
//! Exposes metrics via HTTP endpoint for Prometheus scraping.

use prometheus::core::Collector;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::{Arc, OnceLock};

use crate::router::RouterInstance;

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

pub struct Metrics {
    pub registry: Registry,

    // Sessions
    pub sessions_total: IntCounter,
    pub sessions_active: IntGauge,

    // Routing
    /// Statements routed by target (master/slave/all)
    pub statements_routed_total: IntCounterVec,
    /// Time from dispatch until the reply is complete
    pub statement_duration_seconds: HistogramVec,
    /// Client-visible errors by kind
    pub errors_total: IntCounterVec,
    pub read_retries_total: IntCounter,

    // Session commands
    pub session_commands_total: IntCounter,
    /// Replays onto newly attached backends by result
    pub replays_total: IntCounterVec,
    pub reply_divergence_total: IntCounter,

    // Backends
    pub backend_failures_total: IntCounterVec,
    pub health_check_total: IntCounterVec,
}

fn register<C: Collector + Clone + 'static>(registry: &Registry, collector: C) -> C {
    // Names are static and distinct; a failure here is a programming error
    registry
        .register(Box::new(collector.clone()))
        .expect("metric registered twice");
    collector
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| {
            register(&registry, IntCounter::new(name, help).expect("valid metric"))
        };
        let counter_vec = |name: &str, help: &str, labels: &[&str]| {
            register(
                &registry,
                IntCounterVec::new(Opts::new(name, help), labels).expect("valid metric"),
            )
        };

        let sessions_total = counter("rwsplit_sessions_total", "Total number of client sessions accepted");
        let sessions_active = register(
            &registry,
            IntGauge::new("rwsplit_sessions_active", "Current number of client sessions").expect("valid metric"),
        );

        let statements_routed_total = counter_vec(
            "rwsplit_statements_routed_total",
            "Total number of statements routed by target",
            &["target"],
        );
        let statement_duration_seconds = register(
            &registry,
            HistogramVec::new(
                HistogramOpts::new(
                    "rwsplit_statement_duration_seconds",
                    "Statement latency in seconds",
                )
                .buckets(vec![
                    0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
                    5.0, 10.0,
                ]),
                &["target"],
            )
            .expect("valid metric"),
        );
        let errors_total = counter_vec(
            "rwsplit_errors_total",
            "Total number of error replies sent to clients",
            &["kind"],
        );
        let read_retries_total = counter(
            "rwsplit_read_retries_total",
            "Reads retried on another backend after a backend failure",
        );
        let session_commands_total = counter(
            "rwsplit_session_commands_total",
            "Session commands broadcast to backends",
        );
        let replays_total = counter_vec(
            "rwsplit_sescmd_replays_total",
            "Session command history replays by result",
            &["result"],
        );
        let reply_divergence_total = counter(
            "rwsplit_reply_divergence_total",
            "Broadcasts where backends disagreed on the outcome",
        );
        let backend_failures_total = counter_vec(
            "rwsplit_backend_failures_total",
            "Backend connections lost during a session by role",
            &["role"],
        );
        let health_check_total = counter_vec(
            "rwsplit_health_check_total",
            "Total number of health checks by result",
            &["result"],
        );

        Self {
            registry,
            sessions_total,
            sessions_active,
            statements_routed_total,
            statement_duration_seconds,
            errors_total,
            read_retries_total,
            session_commands_total,
            replays_total,
            reply_divergence_total,
            backend_failures_total,
            health_check_total,
        }
    }

    pub fn record_session_started(&self) {
        self.sessions_total.inc();
        self.sessions_active.inc();
    }

    pub fn record_session_closed(&self) {
        self.sessions_active.dec();
    }

    pub fn record_route(&self, target: &str) {
        self.statements_routed_total.with_label_values(&[target]).inc();
    }

    pub fn record_statement_duration(&self, target: &str, seconds: f64) {
        self.statement_duration_seconds
            .with_label_values(&[target])
            .observe(seconds);
    }

    pub fn record_error(&self, kind: &str) {
        self.errors_total.with_label_values(&[kind]).inc();
    }

    pub fn record_replay(&self, result: &str) {
        self.replays_total.with_label_values(&[result]).inc();
    }

    pub fn record_backend_failure(&self, role: &str) {
        self.backend_failures_total.with_label_values(&[role]).inc();
    }

    pub fn record_health_check(&self, result: &str) {
        self.health_check_total.with_label_values(&[result]).inc();
    }

    /// Get metrics as Prometheus text format
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Live sessions and routing totals, one line each
pub fn render_sessions(router: &RouterInstance) -> String {
    let stats = router.stats().snapshot();
    let mut out = format!(
        "sessions={} total={} queries={} master={} slave={} all={}\n",
        router.session_count(),
        stats.n_sessions,
        stats.n_queries,
        stats.n_master,
        stats.n_slave,
        stats.n_all
    );
    for (id, info) in router.sessions() {
        out.push_str(&format!(
            "{} {}@{} {}s\n",
            id,
            info.user,
            info.host,
            info.started.elapsed().as_secs()
        ));
    }
    out
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(addr: &str, router: Arc<RouterInstance>) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tracing::{error, info};

    async fn handle_request(
        req: Request<hyper::body::Incoming>,
        router: Arc<RouterInstance>,
    ) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
        match req.uri().path() {
            "/metrics" => Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(metrics().gather()))),
            "/health" => Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::from(format!("OK sessions={}", router.session_count())))),
            "/sessions" => Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; charset=utf-8")
                .body(Full::new(Bytes::from(render_sessions(&router)))),
            _ => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from("Not Found"))),
        }
    }

    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let router = router.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| handle_request(req, router.clone()));
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                error!(error = %e, "Metrics server connection error");
            }
        });
    }
}

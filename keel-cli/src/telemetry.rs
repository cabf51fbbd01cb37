use std::convert::Infallible;
use std::fs::{self, OpenOptions};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use hyper::body::Body;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Request, Response, StatusCode};
use keel_core::DecisionAction;
use prometheus::{Encoder, GaugeVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global tracing subscriber with optional JSON file logging.
pub fn init_tracing(filter: &str, log_path: Option<&Path>) -> Result<()> {
    let stdout_layer = fmt::layer()
        .with_target(false)
        .with_filter(EnvFilter::new(filter));
    let Some(path) = log_path else {
        tracing_subscriber::registry().with(stdout_layer).try_init()?;
        return Ok(());
    };

    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create log directory {dir:?}"))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(file);
    let _ = FILE_GUARD.set(guard);
    let file_layer = fmt::layer()
        .json()
        .with_ansi(false)
        .with_target(true)
        .with_writer(writer)
        .with_filter(EnvFilter::new(filter));
    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .try_init()?;
    Ok(())
}

/// Prometheus metrics collected while traders run.
pub struct LiveMetrics {
    registry: Registry,
    cycles_total: IntCounterVec,
    cycle_failures: IntCounterVec,
    actions_total: IntCounterVec,
    drawdown_closes: IntCounterVec,
    auto_closes: IntCounterVec,
    stale_reads: IntCounter,
    connection_status: GaugeVec,
    equity_gauge: GaugeVec,
}

impl LiveMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let cycles_total = IntCounterVec::new(
            Opts::new("keel_decision_cycles_total", "Decision cycles started"),
            &["trader"],
        )?;
        let cycle_failures = IntCounterVec::new(
            Opts::new(
                "keel_decision_cycle_failures_total",
                "Decision cycles that ended without executing decisions",
            ),
            &["trader"],
        )?;
        let actions_total = IntCounterVec::new(
            Opts::new("keel_actions_total", "Routed decision actions by outcome"),
            &["trader", "action", "outcome"],
        )?;
        let drawdown_closes = IntCounterVec::new(
            Opts::new(
                "keel_drawdown_closes_total",
                "Protective closes issued by the drawdown guard",
            ),
            &["trader"],
        )?;
        let auto_closes = IntCounterVec::new(
            Opts::new(
                "keel_auto_close_detections_total",
                "Positions found closed outside the decision loop",
            ),
            &["trader"],
        )?;
        let stale_reads = IntCounter::new(
            "keel_stale_reads_total",
            "Market data reads refused because the cache entry was stale",
        )?;
        let connection_status = GaugeVec::new(
            Opts::new(
                "keel_stream_connection_status",
                "Status of market data streams (1=connected, 0=disconnected)",
            ),
            &["stream"],
        )?;
        let equity_gauge = GaugeVec::new(
            Opts::new("keel_trader_equity", "Latest total equity per trader"),
            &["trader"],
        )?;

        registry.register(Box::new(cycles_total.clone()))?;
        registry.register(Box::new(cycle_failures.clone()))?;
        registry.register(Box::new(actions_total.clone()))?;
        registry.register(Box::new(drawdown_closes.clone()))?;
        registry.register(Box::new(auto_closes.clone()))?;
        registry.register(Box::new(stale_reads.clone()))?;
        registry.register(Box::new(connection_status.clone()))?;
        registry.register(Box::new(equity_gauge.clone()))?;

        Ok(Self {
            registry,
            cycles_total,
            cycle_failures,
            actions_total,
            drawdown_closes,
            auto_closes,
            stale_reads,
            connection_status,
            equity_gauge,
        })
    }

    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    pub fn inc_cycle(&self, trader: &str) {
        self.cycles_total.with_label_values(&[trader]).inc();
    }

    pub fn inc_cycle_failure(&self, trader: &str) {
        self.cycle_failures.with_label_values(&[trader]).inc();
    }

    pub fn record_actions(&self, trader: &str, actions: &[DecisionAction]) {
        for action in actions {
            let outcome = if action.success { "success" } else { "failure" };
            self.actions_total
                .with_label_values(&[trader, action.action.as_str(), outcome])
                .inc();
        }
    }

    pub fn inc_drawdown_closes(&self, trader: &str, count: usize) {
        self.drawdown_closes
            .with_label_values(&[trader])
            .inc_by(count as u64);
    }

    pub fn inc_auto_closes(&self, trader: &str, count: usize) {
        self.auto_closes
            .with_label_values(&[trader])
            .inc_by(count as u64);
    }

    pub fn inc_stale_read(&self) {
        self.stale_reads.inc();
    }

    pub fn update_connection_status(&self, stream: &str, connected: bool) {
        let value = if connected { 1.0 } else { 0.0 };
        self.connection_status
            .with_label_values(&[stream])
            .set(value);
    }

    pub fn update_equity(&self, trader: &str, equity: Decimal) {
        self.equity_gauge
            .with_label_values(&[trader])
            .set(equity.to_f64().unwrap_or_default());
    }
}

/// Launch a lightweight HTTP server that exposes Prometheus metrics.
pub fn spawn_metrics_server(registry: Registry, addr: SocketAddr) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let make_svc = make_service_fn(move |_| {
            let registry = registry.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |_req: Request<Body>| {
                    let registry = registry.clone();
                    async move { Ok::<_, Infallible>(render_metrics(&registry)) }
                }))
            }
        });

        if let Err(err) = hyper::Server::bind(&addr).serve(make_svc).await {
            error!(error = %err, %addr, "metrics server terminated");
        } else {
            info!(%addr, "metrics server shutdown");
        }
    })
}

fn render_metrics(registry: &Registry) -> Response<Body> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&registry.gather(), &mut buffer) {
        error!(error = %err, "failed to encode Prometheus metrics");
        let mut response = Response::new(Body::from("failed to encode metrics"));
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        return response;
    }
    let mut response = Response::new(Body::from(buffer));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(prometheus::TEXT_FORMAT));
    response
}

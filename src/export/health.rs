use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::bind_addr;

const NAMESPACE: &str = "sensorhub";

/// Prometheus metrics for the ingestion, storage and refresh paths.
///
/// All metrics use the "sensorhub" namespace and live in a private registry so
/// several instances can coexist in one process (tests do this).
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Ingestion ===
    /// Samples decoded from producer frames.
    pub samples_received: Counter,
    /// Samples skipped by the sensor allow-list.
    pub samples_filtered: Counter,
    /// Parse errors by kind.
    pub parse_errors: CounterVec,
    /// Sessions opened by transport.
    pub sessions_opened: CounterVec,
    /// Sessions closed by reason.
    pub sessions_closed: CounterVec,
    /// Currently open socket sessions.
    pub sessions_active: Gauge,

    // === Store ===
    /// Samples committed to the store.
    pub samples_stored: Counter,
    /// Samples ignored because their (device, sensor, timestamp) was already stored.
    pub samples_duplicate: Counter,
    /// Samples lost because the store could not commit them.
    pub samples_dropped: Counter,
    /// Samples committed behind their stream head.
    pub samples_out_of_order: Counter,
    /// Samples removed by retention.
    pub samples_evicted: Counter,
    /// Samples resident in the read index.
    pub samples_resident: Gauge,
    /// Streams tracked by the read index.
    pub streams_tracked: Gauge,
    /// Requests waiting in the write queue.
    pub write_queue_depth: Gauge,
    /// Failed batch commits.
    pub commit_errors: Counter,
    /// Batch commit duration.
    pub commit_duration: Histogram,
    /// Samples per committed batch.
    pub batch_size: Histogram,
    /// Reads that failed.
    pub query_errors: CounterVec,

    // === Refresh ===
    /// Frames published by live views, by freshness.
    pub refresh_frames: CounterVec,
    /// Ticks skipped because the previous pull was still running.
    pub refresh_coalesced: Counter,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let samples_received = counter("samples_received_total", "Samples decoded from producer frames.")?;
        let samples_filtered = counter(
            "samples_filtered_total",
            "Samples skipped by the sensor allow-list.",
        )?;
        let parse_errors = CounterVec::new(
            Opts::new("parse_errors_total", "Parse errors by kind.").namespace(NAMESPACE),
            &["kind"],
        )?;
        let sessions_opened = CounterVec::new(
            Opts::new("sessions_opened_total", "Producer sessions opened by transport.")
                .namespace(NAMESPACE),
            &["transport"],
        )?;
        let sessions_closed = CounterVec::new(
            Opts::new("sessions_closed_total", "Producer sessions closed by reason.")
                .namespace(NAMESPACE),
            &["reason"],
        )?;
        let sessions_active = Gauge::with_opts(
            Opts::new("sessions_active", "Currently open socket sessions.").namespace(NAMESPACE),
        )?;

        let samples_stored = counter("samples_stored_total", "Samples committed to the store.")?;
        let samples_duplicate = counter(
            "samples_duplicate_total",
            "Samples ignored because the same device, sensor and timestamp was already stored.",
        )?;
        let samples_dropped = counter(
            "samples_dropped_total",
            "Samples lost because the store could not commit them.",
        )?;
        let samples_out_of_order = counter(
            "samples_out_of_order_total",
            "Samples committed behind their stream head.",
        )?;
        let samples_evicted = counter("samples_evicted_total", "Samples removed by retention.")?;
        let samples_resident = Gauge::with_opts(
            Opts::new("samples_resident", "Samples resident in the read index.")
                .namespace(NAMESPACE),
        )?;
        let streams_tracked = Gauge::with_opts(
            Opts::new("streams_tracked", "Streams tracked by the read index.").namespace(NAMESPACE),
        )?;
        let write_queue_depth = Gauge::with_opts(
            Opts::new("write_queue_depth", "Requests waiting in the write queue.")
                .namespace(NAMESPACE),
        )?;
        let commit_errors = counter("commit_errors_total", "Failed batch commits.")?;
        let commit_duration = Histogram::with_opts(
            HistogramOpts::new("commit_duration_seconds", "Batch commit duration.")
                .namespace(NAMESPACE)
                .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5]),
        )?;
        let batch_size = Histogram::with_opts(
            HistogramOpts::new("batch_size", "Samples per committed batch.")
                .namespace(NAMESPACE)
                .buckets(vec![1.0, 8.0, 32.0, 128.0, 512.0, 1024.0, 4096.0]),
        )?;
        let query_errors = CounterVec::new(
            Opts::new("query_errors_total", "Reads that failed by kind.").namespace(NAMESPACE),
            &["kind"],
        )?;

        let refresh_frames = CounterVec::new(
            Opts::new("refresh_frames_total", "Frames published by live views.")
                .namespace(NAMESPACE),
            &["view", "freshness"],
        )?;
        let refresh_coalesced = counter(
            "refresh_coalesced_total",
            "Refresh ticks skipped because the previous pull was still running.",
        )?;

        registry.register(Box::new(samples_received.clone()))?;
        registry.register(Box::new(samples_filtered.clone()))?;
        registry.register(Box::new(parse_errors.clone()))?;
        registry.register(Box::new(sessions_opened.clone()))?;
        registry.register(Box::new(sessions_closed.clone()))?;
        registry.register(Box::new(sessions_active.clone()))?;
        registry.register(Box::new(samples_stored.clone()))?;
        registry.register(Box::new(samples_duplicate.clone()))?;
        registry.register(Box::new(samples_dropped.clone()))?;
        registry.register(Box::new(samples_out_of_order.clone()))?;
        registry.register(Box::new(samples_evicted.clone()))?;
        registry.register(Box::new(samples_resident.clone()))?;
        registry.register(Box::new(streams_tracked.clone()))?;
        registry.register(Box::new(write_queue_depth.clone()))?;
        registry.register(Box::new(commit_errors.clone()))?;
        registry.register(Box::new(commit_duration.clone()))?;
        registry.register(Box::new(batch_size.clone()))?;
        registry.register(Box::new(query_errors.clone()))?;
        registry.register(Box::new(refresh_frames.clone()))?;
        registry.register(Box::new(refresh_coalesced.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            samples_received,
            samples_filtered,
            parse_errors,
            sessions_opened,
            sessions_closed,
            sessions_active,
            samples_stored,
            samples_duplicate,
            samples_dropped,
            samples_out_of_order,
            samples_evicted,
            samples_resident,
            streams_tracked,
            write_queue_depth,
            commit_errors,
            commit_duration,
            batch_size,
            query_errors,
            refresh_frames,
            refresh_coalesced,
        })
    }

    /// Metrics not bound to any listen address, for embedding and tests.
    pub fn detached() -> Result<Self> {
        Self::new("")
    }

    /// Renders the registry in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        if self.addr.is_empty() {
            tracing::debug!("health metrics server disabled");
            return Ok(());
        }
        let bind = bind_addr(&self.addr);

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind)
            .await
            .with_context(|| format!("listening on {bind}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

fn counter(name: &str, help: &str) -> prometheus::Result<Counter> {
    Counter::with_opts(Opts::new(name, help).namespace(NAMESPACE))
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_namespace() {
        let health = HealthMetrics::detached().expect("metrics");
        health.samples_dropped.inc();
        health.parse_errors.with_label_values(&["invalid_json"]).inc();

        let text = health.render().expect("render");
        assert!(text.contains("sensorhub_samples_dropped_total 1"));
        assert!(text.contains("sensorhub_parse_errors_total{kind=\"invalid_json\"} 1"));
    }

    #[test]
    fn test_instances_are_independent() {
        let a = HealthMetrics::detached().expect("a");
        let b = HealthMetrics::detached().expect("b");
        a.samples_stored.inc_by(3.0);
        assert_eq!(a.samples_stored.get(), 3.0);
        assert_eq!(b.samples_stored.get(), 0.0);
    }

    #[tokio::test]
    async fn test_server_serves_healthz() {
        let health = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        health.start().await.expect("start");
        health.stop().await.expect("stop");
        assert!(health.shutdown.lock().is_none());
    }
}

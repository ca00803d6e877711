//! HTTP ingestion: one JSON document per POST, keep-alive friendly.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{ConnectInfo, DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::{Ingestor, Transport};
use crate::codec::Timestamp;
use crate::config::{bind_addr, IngestConfig};

pub struct HttpIngest {
    ingestor: Arc<Ingestor>,
    listener: TcpListener,
    local_addr: SocketAddr,
    max_body: usize,
}

impl HttpIngest {
    pub async fn bind(ingestor: Arc<Ingestor>, cfg: &IngestConfig) -> Result<Self> {
        let bind = bind_addr(&cfg.http_addr);
        let listener = TcpListener::bind(&bind)
            .await
            .with_context(|| format!("listening on {bind}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;
        Ok(Self {
            ingestor,
            listener,
            local_addr,
            max_body: cfg.max_frame_bytes,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn serve(self, ctx: CancellationToken) {
        let app = router(self.ingestor, self.max_body);
        info!(addr = %self.local_addr, "http ingest listener started");

        let result = axum::serve(
            self.listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            ctx.cancelled().await;
        })
        .await;

        if let Err(e) = result {
            error!(error = %e, "http ingest server error");
        }
        info!(addr = %self.local_addr, "http ingest listener stopped");
    }
}

pub fn router(ingestor: Arc<Ingestor>, max_body: usize) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/data", post(data_handler))
        .route("/stats", get(stats_handler))
        .layer(DefaultBodyLimit::max(max_body))
        .with_state(ingestor)
}

fn error_response(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (
        status,
        Json(json!({ "status": "error", "message": message.to_string() })),
    )
        .into_response()
}

/// GET / - Liveness with server time.
async fn root_handler() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "message": "sensorhub ingest is running",
        "timestamp": Timestamp::now().to_rfc3339(),
    }))
}

/// POST /data - Decode and store one batch or record.
async fn data_handler(
    State(ingestor): State<Arc<Ingestor>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Response {
    let mut session = ingestor.session(peer, Transport::Http);

    let samples = match ingestor.decode(&body, &mut session) {
        Ok(samples) => samples,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };
    let count = samples.len();

    let result = ingestor.store().append_batch(samples).await;
    let outcome = result.clone();
    ingestor.settle(result, count, &mut session);

    match outcome {
        Ok(ack) => Json(json!({
            "status": "success",
            "processed_count": ack.stored + ack.duplicates,
            "stored": ack.stored,
            "duplicates": ack.duplicates,
            "rejected": session.stats.rejected,
        }))
        .into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e),
    }
}

/// GET /stats - Totals over everything stored.
async fn stats_handler(State(ingestor): State<Arc<Ingestor>>) -> Response {
    match ingestor.store().summary().await {
        Ok(summary) => Json(json!({
            "total_records": summary.total_records,
            "oldest_record": summary.oldest_record.map(Timestamp::to_rfc3339),
            "newest_record": summary.newest_record.map(Timestamp::to_rfc3339),
            "streams": summary.streams,
            "devices": summary.devices,
        }))
        .into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e),
    }
}

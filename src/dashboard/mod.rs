//! Dashboard query API: device list and tags, latest location, on-demand
//! windows and the frames published by live views.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::aggregate::Aggregator;
use crate::codec::SensorType;
use crate::config::bind_addr;
use crate::refresh::FrameReceiver;
use crate::store::Store;

const DEFAULT_SPAN: Duration = Duration::from_secs(10);

/// Shared state for axum handlers.
pub struct DashboardState {
    pub store: Arc<Store>,
    pub aggregator: Arc<Aggregator>,
    pub views: HashMap<String, FrameReceiver>,
}

pub struct Dashboard {
    addr: String,
    state: Arc<DashboardState>,
    local_addr: Option<SocketAddr>,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
}

impl Dashboard {
    pub fn new(addr: &str, state: DashboardState) -> Self {
        Self {
            addr: addr.to_string(),
            state: Arc::new(state),
            local_addr: None,
            shutdown: parking_lot::Mutex::new(None),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Starts the API server. An empty address disables it.
    pub async fn start(&mut self) -> Result<()> {
        if self.addr.is_empty() {
            tracing::debug!("dashboard api disabled");
            return Ok(());
        }
        let bind = bind_addr(&self.addr);
        let listener = TcpListener::bind(&bind)
            .await
            .with_context(|| format!("listening on {bind}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;
        self.local_addr = Some(local_addr);

        let app = router(Arc::clone(&self.state));
        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            info!(addr = %local_addr, "dashboard api started");
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;
            if let Err(e) = result {
                error!(error = %e, "dashboard api server error");
            }
        });

        Ok(())
    }

    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

pub fn router(state: Arc<DashboardState>) -> Router {
    Router::new()
        .route("/api/devices", get(devices_handler))
        .route("/api/devices/:device/tag", put(tag_handler))
        .route("/api/devices/:device/location", get(location_handler))
        .route("/api/window", get(window_handler))
        .route("/api/live/:view", get(live_handler))
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (status, Json(json!({ "error": message.to_string() }))).into_response()
}

/// GET /api/devices
async fn devices_handler(State(state): State<Arc<DashboardState>>) -> Response {
    match state.store.devices().await {
        Ok(devices) => Json(devices).into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e),
    }
}

#[derive(Debug, Deserialize)]
struct TagBody {
    tag: String,
}

/// PUT /api/devices/:device/tag
async fn tag_handler(
    State(state): State<Arc<DashboardState>>,
    Path(device): Path<String>,
    Json(body): Json<TagBody>,
) -> Response {
    let tag = body.tag.trim();
    if tag.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "tag must not be empty");
    }
    match state.store.set_tag(&device, tag).await {
        Ok(()) => Json(json!({ "device_id": device, "tag": tag })).into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e),
    }
}

/// GET /api/devices/:device/location
async fn location_handler(
    State(state): State<Arc<DashboardState>>,
    Path(device): Path<String>,
) -> Response {
    match state.store.latest(&device, &SensorType::Location) {
        Ok(Some(stored)) => {
            let s = &stored.sample;
            Json(json!({
                "device_id": s.device_id,
                "timestamp": s.timestamp.to_rfc3339(),
                "latitude": s.field("latitude").or_else(|| s.field("lat")),
                "longitude": s.field("longitude").or_else(|| s.field("lon")),
                "altitude": s.field("altitude").or_else(|| s.field("alt")),
                "fields": s.fields,
            }))
            .into_response()
        }
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("no location for {device}")),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e),
    }
}

#[derive(Debug, Deserialize)]
struct WindowParams {
    device: String,
    sensors: String,
    span: Option<String>,
}

/// GET /api/window?device=..&sensors=a,b&span=10s
async fn window_handler(
    State(state): State<Arc<DashboardState>>,
    Query(params): Query<WindowParams>,
) -> Response {
    let sensors: Result<BTreeSet<SensorType>, _> = params
        .sensors
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(str::parse)
        .collect();
    let sensors = match sensors {
        Ok(s) if !s.is_empty() => s,
        Ok(_) => return error_response(StatusCode::BAD_REQUEST, "sensors must not be empty"),
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };
    let span = match params.span.as_deref().map(humantime::parse_duration) {
        None => DEFAULT_SPAN,
        Some(Ok(span)) if !span.is_zero() => span,
        Some(Ok(_)) => return error_response(StatusCode::BAD_REQUEST, "span must be positive"),
        Some(Err(e)) => return error_response(StatusCode::BAD_REQUEST, e),
    };

    let aggregator = Arc::clone(&state.aggregator);
    let device = params.device;
    let joined =
        tokio::task::spawn_blocking(move || aggregator.window(&device, &sensors, span)).await;
    match joined {
        Ok(Ok(table)) => Json(table).into_response(),
        Ok(Err(e)) => error_response(StatusCode::SERVICE_UNAVAILABLE, e),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// GET /api/live/:view
async fn live_handler(
    State(state): State<Arc<DashboardState>>,
    Path(view): Path<String>,
) -> Response {
    let Some(rx) = state.views.get(&view) else {
        return error_response(StatusCode::NOT_FOUND, format!("unknown view {view}"));
    };
    let Some(frame) = rx.borrow().clone() else {
        return StatusCode::NO_CONTENT.into_response();
    };
    Json(json!({
        "view": view,
        "seq": frame.seq,
        "stale": frame.stale,
        "error": frame.error,
        "generated_at": frame.generated_at.to_rfc3339(),
        "table": &*frame.table,
    }))
    .into_response()
}

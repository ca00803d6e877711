//! Live refresh loop: recomputes one view's window on a fixed interval (and
//! optionally on every commit) and publishes it as a [`Frame`].
//!
//! At most one pull runs at a time. A tick that fires while a pull is still in
//! flight is dropped, never queued.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregate::{Aggregator, MultiSeriesTable};
use crate::codec::{SensorType, Timestamp};
use crate::config::ViewConfig;
use crate::export::health::HealthMetrics;
use crate::store::QueryError;

/// Anything that can produce a window. Implemented by [`Aggregator`]; tests
/// substitute slow or failing sources.
pub trait WindowSource: Send + Sync + 'static {
    fn window(
        &self,
        device_id: &str,
        sensors: &BTreeSet<SensorType>,
        span: Duration,
    ) -> Result<MultiSeriesTable, QueryError>;
}

impl WindowSource for Aggregator {
    fn window(
        &self,
        device_id: &str,
        sensors: &BTreeSet<SensorType>,
        span: Duration,
    ) -> Result<MultiSeriesTable, QueryError> {
        Aggregator::window(self, device_id, sensors, span)
    }
}

/// What a live view shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewSpec {
    pub name: String,
    pub device_id: String,
    pub sensors: BTreeSet<SensorType>,
    pub span: Duration,
}

impl ViewSpec {
    pub fn from_config(cfg: &ViewConfig) -> Result<Self> {
        Ok(Self {
            name: cfg.name.clone(),
            device_id: cfg.device_id.clone(),
            sensors: cfg.sensor_set()?,
            span: cfg.span,
        })
    }
}

/// One published render of a view.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Increments with every published frame.
    pub seq: u64,
    pub generated_at: Timestamp,
    /// True when the latest pull failed and `table` is the last good one.
    pub stale: bool,
    pub error: Option<String>,
    pub table: Arc<MultiSeriesTable>,
}

pub type FrameReceiver = watch::Receiver<Option<Arc<Frame>>>;

type PullResult = Result<MultiSeriesTable, QueryError>;

pub struct RefreshLoop<S: WindowSource> {
    view: ViewSpec,
    source: Arc<S>,
    interval: Duration,
    commits: Option<watch::Receiver<u64>>,
    health: Arc<HealthMetrics>,
    frames: watch::Sender<Option<Arc<Frame>>>,
}

impl<S: WindowSource> RefreshLoop<S> {
    pub fn new(
        view: ViewSpec,
        source: Arc<S>,
        interval: Duration,
        health: Arc<HealthMetrics>,
    ) -> (Self, FrameReceiver) {
        let (frames, rx) = watch::channel(None);
        let this = Self {
            view,
            source,
            interval,
            commits: None,
            health,
            frames,
        };
        (this, rx)
    }

    /// Also refresh whenever `commits` changes.
    pub fn with_commits(mut self, commits: watch::Receiver<u64>) -> Self {
        self.commits = Some(commits);
        self
    }

    pub fn subscribe(&self) -> FrameReceiver {
        self.frames.subscribe()
    }

    /// Runs until `cancel` fires. A pull still in flight at that point is
    /// abandoned and its result never published.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            view = %self.view.name,
            device = %self.view.device_id,
            interval = ?self.interval,
            event_driven = self.commits.is_some(),
            "refresh loop started",
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut pull: Option<JoinHandle<PullResult>> = None;
        let mut seq = 0u64;
        let mut last_good: Option<Arc<MultiSeriesTable>> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(view = %self.view.name, frames = seq, "refresh loop stopped");
                    return;
                }

                _ = ticker.tick() => {
                    self.trigger(&mut pull);
                }

                alive = next_commit(&mut self.commits) => {
                    if alive {
                        self.trigger(&mut pull);
                    } else {
                        debug!(view = %self.view.name, "commit feed closed, timer only");
                        self.commits = None;
                    }
                }

                joined = next_pull(&mut pull) => {
                    pull = None;
                    let result = joined.unwrap_or_else(|e| {
                        Err(QueryError::Backend(format!("window pull aborted: {e}")))
                    });
                    seq += 1;
                    let frame = self.frame(seq, result, &mut last_good);
                    self.frames.send_replace(Some(Arc::new(frame)));
                }
            }
        }
    }

    fn trigger(&self, pull: &mut Option<JoinHandle<PullResult>>) {
        if pull.is_some() {
            self.health.refresh_coalesced.inc();
            debug!(view = %self.view.name, "refresh tick coalesced");
            return;
        }

        let source = Arc::clone(&self.source);
        let view = self.view.clone();
        *pull = Some(tokio::task::spawn_blocking(move || {
            source.window(&view.device_id, &view.sensors, view.span)
        }));
    }

    fn frame(
        &self,
        seq: u64,
        result: Result<MultiSeriesTable, QueryError>,
        last_good: &mut Option<Arc<MultiSeriesTable>>,
    ) -> Frame {
        let generated_at = Timestamp::now();
        match result {
            Ok(table) => {
                let table = Arc::new(table);
                *last_good = Some(Arc::clone(&table));
                self.health
                    .refresh_frames
                    .with_label_values(&[self.view.name.as_str(), "fresh"])
                    .inc();
                Frame {
                    seq,
                    generated_at,
                    stale: false,
                    error: None,
                    table,
                }
            }
            Err(e) => {
                warn!(view = %self.view.name, error = %e, "window pull failed, showing last good frame");
                self.health
                    .refresh_frames
                    .with_label_values(&[self.view.name.as_str(), "stale"])
                    .inc();
                let table = last_good.clone().unwrap_or_else(|| {
                    Arc::new(MultiSeriesTable {
                        device_id: self.view.device_id.clone(),
                        from: None,
                        to: None,
                        columns: Vec::new(),
                        rows: Vec::new(),
                        gaps: Vec::new(),
                        series: Vec::new(),
                    })
                });
                Frame {
                    seq,
                    generated_at,
                    stale: true,
                    error: Some(e.to_string()),
                    table,
                }
            }
        }
    }
}

/// Resolves when the running pull finishes, panicked pulls included.
/// Never resolves when nothing is running.
async fn next_pull(pull: &mut Option<JoinHandle<PullResult>>) -> Result<PullResult, JoinError> {
    match pull {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

/// Resolves on the next commit (`true`) or when the feed closes (`false`).
/// Never resolves when there is no feed.
async fn next_commit(commits: &mut Option<watch::Receiver<u64>>) -> bool {
    match commits {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

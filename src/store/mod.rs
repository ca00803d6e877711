//! Concurrency-safe sample store.
//!
//! Appends travel through a bounded queue to a single writer task, which
//! commits them in batches to the durable backend and only then publishes them
//! to the in-memory tail index. Reads are served from the index, so they never
//! wait behind a commit and never observe a sample that could still be lost.

pub mod backend;
pub mod index;
pub mod memory;
pub mod pin;
pub mod sqlite;
mod writer;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use self::backend::Backend;
use self::index::TailIndex;
use self::pin::{PinRegistry, ReadPin};
use self::writer::{Command, Maintenance, PendingAppend, Writer};
use crate::codec::{Sample, SensorType, StreamKey, Timestamp};
use crate::config::{RetentionConfig, StoreConfig};
use crate::export::health::HealthMetrics;

/// A write that could not be committed. The samples it carried are lost.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    #[error("store is closed")]
    Closed,

    #[error("store is full: {0}")]
    Full(String),

    #[error("commit failed: {0}")]
    Commit(String),
}

impl WriteError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Full(_) => "full",
            Self::Commit(_) => "commit",
        }
    }
}

/// A read that could not be served.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("store is closed")]
    Closed,

    #[error("stream {stream} stayed locked for {waited:?}")]
    Busy { stream: String, waited: Duration },

    #[error("backend read failed: {0}")]
    Backend(String),
}

impl QueryError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Busy { .. } => "busy",
            Self::Backend(_) => "backend",
        }
    }
}

/// Outcome of one successful append call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Ack {
    /// Samples newly committed.
    pub stored: usize,
    /// Samples whose (device, sensor, timestamp) was already stored.
    pub duplicates: usize,
    /// Committed samples flagged as behind their stream head.
    pub out_of_order: usize,
}

/// A committed sample plus the store's bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSample {
    /// Arrival sequence, unique and increasing across the store.
    pub seq: u64,
    pub out_of_order: bool,
    pub sample: Sample,
}

impl StoredSample {
    /// Total read order: timestamp first, arrival sequence on ties.
    pub fn order_key(&self) -> (Timestamp, u64) {
        (self.sample.timestamp, self.seq)
    }
}

/// Read cursor for [`Store::recent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    /// The newest `n` samples.
    Last(usize),
    /// Every sample strictly newer than the given instant.
    Since(Timestamp),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_age: Option<Duration>,
    pub max_samples_per_stream: Option<usize>,
}

impl From<&RetentionConfig> for RetentionPolicy {
    fn from(cfg: &RetentionConfig) -> Self {
        Self {
            max_age: cfg.max_age,
            max_samples_per_stream: cfg.max_samples_per_stream,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetainReport {
    pub streams: usize,
    /// Samples dropped from the read index.
    pub evicted: usize,
    /// Rows deleted from the durable backend.
    pub deleted: usize,
}

/// Totals over the durable backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreSummary {
    pub total_records: u64,
    pub oldest_record: Option<Timestamp>,
    pub newest_record: Option<Timestamp>,
    pub streams: usize,
    pub devices: usize,
}

/// A device known to the read index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub tag: Option<String>,
    pub sensors: Vec<String>,
}

enum PendingState {
    Ready(Result<Ack, WriteError>),
    Waiting(oneshot::Receiver<Result<Ack, WriteError>>),
    Taken,
}

/// An append accepted into the write queue whose commit outcome is not yet known.
pub struct PendingAck {
    state: PendingState,
    samples: usize,
}

impl PendingAck {
    fn ready(result: Result<Ack, WriteError>) -> Self {
        Self {
            state: PendingState::Ready(result),
            samples: 0,
        }
    }

    /// Number of samples carried by the append.
    pub fn samples(&self) -> usize {
        self.samples
    }

    /// Waits for the commit outcome.
    pub async fn wait(self) -> Result<Ack, WriteError> {
        match self.state {
            PendingState::Ready(result) => result,
            PendingState::Waiting(rx) => rx.await.unwrap_or(Err(WriteError::Closed)),
            PendingState::Taken => Err(WriteError::Closed),
        }
    }

    /// Returns the outcome if it is already known, without waiting.
    pub fn try_take(&mut self) -> Option<Result<Ack, WriteError>> {
        match std::mem::replace(&mut self.state, PendingState::Taken) {
            PendingState::Ready(result) => Some(result),
            PendingState::Waiting(mut rx) => match rx.try_recv() {
                Ok(result) => Some(result),
                Err(oneshot::error::TryRecvError::Empty) => {
                    self.state = PendingState::Waiting(rx);
                    None
                }
                Err(oneshot::error::TryRecvError::Closed) => Some(Err(WriteError::Closed)),
            },
            PendingState::Taken => None,
        }
    }
}

/// The sample store. Shared as `Arc<Store>` by every session and reader.
pub struct Store {
    backend: Arc<Backend>,
    index: Arc<TailIndex>,
    pins: Arc<PinRegistry>,
    health: Arc<HealthMetrics>,
    tx: mpsc::Sender<Command>,
    writer: parking_lot::Mutex<Option<Writer>>,
    commits: watch::Receiver<u64>,
    closed: Arc<AtomicBool>,
    run_task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Store {
    /// Opens the backend and warms the read index from it.
    pub fn open(
        cfg: &StoreConfig,
        order_tolerance: Duration,
        health: Arc<HealthMetrics>,
    ) -> Result<Self> {
        let backend = Arc::new(Backend::open(cfg)?);
        let policy = RetentionPolicy::from(&cfg.retention);
        let (tail, next_seq) = backend.recover(&policy).context("recovering store")?;

        let index = Arc::new(TailIndex::new(cfg.read_timeout));
        let recovered = tail.len();
        index.publish(tail.into_iter().map(Arc::new).collect());
        health.samples_resident.set(index.resident() as f64);
        health.streams_tracked.set(index.stream_count() as f64);

        info!(
            backend = backend.name(),
            recovered,
            streams = index.stream_count(),
            next_seq,
            "store opened",
        );

        let pins = Arc::new(PinRegistry::default());
        let (tx, rx) = mpsc::channel(cfg.queue_capacity);
        let (commits_tx, commits_rx) = watch::channel(0u64);

        let writer = Writer {
            rx,
            backend: Arc::clone(&backend),
            index: Arc::clone(&index),
            pins: Arc::clone(&pins),
            health: Arc::clone(&health),
            commits: commits_tx,
            batch_size: cfg.batch_size,
            max_linger: cfg.max_linger,
            order_tolerance,
            next_seq,
        };

        Ok(Self {
            backend,
            index,
            pins,
            health,
            tx,
            writer: parking_lot::Mutex::new(Some(writer)),
            commits: commits_rx,
            closed: Arc::new(AtomicBool::new(false)),
            run_task: tokio::sync::Mutex::new(None),
        })
    }

    /// Spawns the writer task. Appends queue up (and eventually block) until this is called.
    pub async fn start(&self, ctx: CancellationToken) -> Result<()> {
        let writer = self.writer.lock().take().context("store already started")?;
        let closed = Arc::clone(&self.closed);
        let handle = tokio::spawn(async move {
            writer.run(ctx).await;
            closed.store(true, Ordering::SeqCst);
        });
        *self.run_task.lock().await = Some(handle);
        Ok(())
    }

    /// Waits for the writer to flush and exit after cancellation.
    pub async fn wait_for_shutdown(&self) {
        let run_task = { self.run_task.lock().await.take() };
        if let Some(run_task) = run_task {
            if let Err(e) = run_task.await {
                warn!(error = %e, "store writer task join failed");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Durably record one sample.
    pub async fn append(&self, sample: Sample) -> Result<Ack, WriteError> {
        self.append_batch(vec![sample]).await
    }

    /// Durably record several samples; they commit or fail together.
    pub async fn append_batch(&self, samples: Vec<Sample>) -> Result<Ack, WriteError> {
        self.submit(samples).await?.wait().await
    }

    /// Enqueue an append and return without waiting for the commit.
    ///
    /// Waits only for queue capacity, which is how a saturated writer pushes
    /// back on producers.
    pub async fn submit(&self, samples: Vec<Sample>) -> Result<PendingAck, WriteError> {
        if samples.is_empty() {
            return Ok(PendingAck::ready(Ok(Ack::default())));
        }
        let count = samples.len();
        let (ack, rx) = oneshot::channel();
        if self
            .tx
            .send(Command::Append(PendingAppend { samples, ack }))
            .await
            .is_err()
        {
            self.health.samples_dropped.inc_by(count as f64);
            return Err(WriteError::Closed);
        }
        self.health
            .write_queue_depth
            .set((self.tx.max_capacity() - self.tx.capacity()) as f64);
        Ok(PendingAck {
            state: PendingState::Waiting(rx),
            samples: count,
        })
    }

    /// Samples of one stream selected by `cursor`, in timestamp order with
    /// arrival-sequence tiebreak.
    pub fn recent(
        &self,
        device_id: &str,
        sensor: &SensorType,
        cursor: Cursor,
    ) -> Result<Vec<Arc<StoredSample>>, QueryError> {
        self.check_open()?;
        let key = StreamKey::new(device_id, sensor.clone());
        self.index
            .recent(&key, cursor)
            .inspect_err(|e| self.count_query_error(e))
    }

    /// Samples of one stream with `from <= timestamp <= to`.
    pub fn range(
        &self,
        key: &StreamKey,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<Arc<StoredSample>>, QueryError> {
        self.check_open()?;
        self.index
            .range(key, from, to)
            .inspect_err(|e| self.count_query_error(e))
    }

    /// Oldest and newest resident timestamps of a stream.
    pub fn bounds(&self, key: &StreamKey) -> Result<Option<(Timestamp, Timestamp)>, QueryError> {
        self.check_open()?;
        self.index
            .bounds(key)
            .inspect_err(|e| self.count_query_error(e))
    }

    /// Newest committed sample of a stream.
    pub fn latest(
        &self,
        device_id: &str,
        sensor: &SensorType,
    ) -> Result<Option<Arc<StoredSample>>, QueryError> {
        Ok(self.recent(device_id, sensor, Cursor::Last(1))?.pop())
    }

    /// Protect a stream from eviction at or after `from` while the pin is held.
    pub fn pin(&self, key: StreamKey, from: Timestamp) -> ReadPin {
        self.pins.pin(key, from)
    }

    /// Evict samples outside `policy`, skipping anything an in-flight read has pinned.
    ///
    /// Runs on the writer task, ordered with commits: appends queued before
    /// the call are committed first and are subject to the same policy.
    pub async fn retain(&self, policy: &RetentionPolicy) -> Result<RetainReport, WriteError> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(Command::Maintenance(Maintenance::Retain {
                policy: *policy,
                done,
            }))
            .await
            .map_err(|_| WriteError::Closed)?;
        rx.await.unwrap_or(Err(WriteError::Closed))
    }

    /// Attach a human label to a device, replacing any previous one.
    pub async fn set_tag(&self, device_id: &str, tag: &str) -> Result<(), WriteError> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(Command::Maintenance(Maintenance::Tag {
                device_id: device_id.to_string(),
                tag: tag.to_string(),
                done,
            }))
            .await
            .map_err(|_| WriteError::Closed)?;
        rx.await.unwrap_or(Err(WriteError::Closed))
    }

    pub async fn tags(&self) -> Result<HashMap<String, String>, QueryError> {
        let backend = Arc::clone(&self.backend);
        tokio::task::spawn_blocking(move || backend.tags())
            .await
            .unwrap_or_else(|e| Err(QueryError::Backend(e.to_string())))
            .inspect_err(|e| self.count_query_error(e))
    }

    /// Record count and time range over everything durably stored.
    pub async fn summary(&self) -> Result<StoreSummary, QueryError> {
        let backend = Arc::clone(&self.backend);
        tokio::task::spawn_blocking(move || backend.summary())
            .await
            .unwrap_or_else(|e| Err(QueryError::Backend(e.to_string())))
            .inspect_err(|e| self.count_query_error(e))
    }

    /// Devices with resident samples, their sensors and tags.
    pub async fn devices(&self) -> Result<Vec<DeviceInfo>, QueryError> {
        self.check_open()?;
        let mut tags = self.tags().await?;
        let mut sensors: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for key in self.index.keys() {
            sensors
                .entry(key.device_id)
                .or_default()
                .insert(key.sensor.to_string());
        }
        Ok(sensors
            .into_iter()
            .map(|(device_id, sensors)| DeviceInfo {
                tag: tags.remove(&device_id),
                device_id,
                sensors: sensors.into_iter().collect(),
            })
            .collect())
    }

    /// Receiver that changes after every committed batch.
    pub fn subscribe_commits(&self) -> watch::Receiver<u64> {
        self.commits.clone()
    }

    pub fn stream_keys(&self) -> Vec<StreamKey> {
        self.index.keys()
    }

    pub fn resident(&self) -> usize {
        self.index.resident()
    }

    fn check_open(&self) -> Result<(), QueryError> {
        if self.is_closed() {
            self.count_query_error(&QueryError::Closed);
            return Err(QueryError::Closed);
        }
        Ok(())
    }

    fn count_query_error(&self, e: &QueryError) {
        self.health.query_errors.with_label_values(&[e.kind()]).inc();
    }
}

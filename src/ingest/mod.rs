//! Ingestion listener: socket and HTTP front ends that decode producer frames
//! and forward the samples to the store.
//!
//! Each connection owns a [`SessionContext`]; sessions share nothing but the
//! [`Ingestor`], which is read-only apart from metrics.

pub mod frame;
pub mod http;
pub mod tcp;

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{self, FrameContext, ParseError, Sample, SensorType};
use crate::config::IngestConfig;
use crate::export::health::HealthMetrics;
use crate::store::{Ack, Store, WriteError};

/// Why a session ended abnormally. Committed samples are unaffected.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("no frame received for {0:?}")]
    IdleTimeout(Duration),

    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    #[error("listener shutting down")]
    Shutdown,
}

impl ConnectionError {
    /// Close-reason label for the sessions metric.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::IdleTimeout(_) => "idle_timeout",
            Self::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof => "truncated",
            Self::Io(_) => "io_error",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Http,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Http => "http",
        }
    }
}

/// Per-session counters, logged when the session closes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub frames: u64,
    pub samples: u64,
    pub rejected: u64,
    pub filtered: u64,
    pub stored: u64,
    pub duplicates: u64,
    pub dropped: u64,
}

/// Read state of one producer connection, passed explicitly through its loop.
#[derive(Debug)]
pub struct SessionContext {
    pub id: u64,
    pub peer: SocketAddr,
    pub transport: Transport,
    pub frame: FrameContext,
    pub stats: SessionStats,
}

/// Shared decode-and-forward logic for every transport.
pub struct Ingestor {
    store: Arc<Store>,
    health: Arc<HealthMetrics>,
    filter: Option<HashSet<SensorType>>,
    device_id_from_peer: bool,
    next_session: AtomicU64,
}

impl Ingestor {
    pub fn new(store: Arc<Store>, health: Arc<HealthMetrics>, cfg: &IngestConfig) -> Result<Self> {
        Ok(Self {
            store,
            health,
            filter: cfg.sensor_filter()?,
            device_id_from_peer: cfg.device_id_from_peer,
            next_session: AtomicU64::new(1),
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    pub fn session(&self, peer: SocketAddr, transport: Transport) -> SessionContext {
        let fallback_device = self.device_id_from_peer.then(|| peer.ip().to_string());
        SessionContext {
            id: self.next_session.fetch_add(1, Ordering::Relaxed),
            peer,
            transport,
            frame: FrameContext { fallback_device },
            stats: SessionStats::default(),
        }
    }

    /// Decode one frame into samples that pass the sensor filter.
    ///
    /// Bad entries are counted and skipped; a frame that is bad as a whole
    /// yields an error so the caller can report it.
    pub fn decode(&self, raw: &[u8], session: &mut SessionContext) -> Result<Vec<Sample>, ParseError> {
        session.stats.frames += 1;
        let decoded = match codec::parse_frame(raw, &session.frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.reject(&e, session);
                return Err(e);
            }
        };
        for e in &decoded.rejected {
            self.reject(e, session);
        }

        let mut samples = decoded.samples;
        if let Some(filter) = &self.filter {
            let before = samples.len();
            samples.retain(|s| filter.contains(&s.sensor));
            let filtered = (before - samples.len()) as u64;
            session.stats.filtered += filtered;
            self.health.samples_filtered.inc_by(filtered as f64);
        }

        session.stats.samples += samples.len() as u64;
        self.health.samples_received.inc_by(samples.len() as f64);

        match decoded.rejected.into_iter().next() {
            Some(first) if samples.is_empty() => Err(first),
            _ => Ok(samples),
        }
    }

    /// Count a malformed frame or entry. The session carries on.
    pub fn reject(&self, err: &ParseError, session: &mut SessionContext) {
        session.stats.rejected += 1;
        self.health.parse_errors.with_label_values(&[err.kind()]).inc();
        debug!(session = session.id, peer = %session.peer, error = %err, "rejected frame");
    }

    /// Fold an append outcome into the session's counters.
    ///
    /// Lost samples are already counted by the store; this only logs them.
    pub fn settle(
        &self,
        result: Result<Ack, WriteError>,
        samples: usize,
        session: &mut SessionContext,
    ) {
        match result {
            Ok(ack) => {
                session.stats.stored += ack.stored as u64;
                session.stats.duplicates += ack.duplicates as u64;
            }
            Err(e) => {
                session.stats.dropped += samples as u64;
                warn!(
                    session = session.id,
                    peer = %session.peer,
                    samples,
                    error = %e,
                    "samples dropped on write error",
                );
            }
        }
    }

    fn opened(&self, session: &SessionContext) {
        self.health
            .sessions_opened
            .with_label_values(&[session.transport.as_str()])
            .inc();
        debug!(session = session.id, peer = %session.peer, "session opened");
    }

    fn closed(&self, session: &SessionContext, reason: &'static str) {
        self.health.sessions_closed.with_label_values(&[reason]).inc();
        info!(
            session = session.id,
            peer = %session.peer,
            transport = session.transport.as_str(),
            reason,
            frames = session.stats.frames,
            stored = session.stats.stored,
            rejected = session.stats.rejected,
            dropped = session.stats.dropped,
            "session closed",
        );
    }
}

/// Owns the socket and HTTP listeners.
pub struct IngestServer {
    ingestor: Arc<Ingestor>,
    cfg: IngestConfig,
    tcp_addr: Option<SocketAddr>,
    http_addr: Option<SocketAddr>,
    tasks: tokio::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl IngestServer {
    pub fn new(ingestor: Arc<Ingestor>, cfg: IngestConfig) -> Self {
        Self {
            ingestor,
            cfg,
            tcp_addr: None,
            http_addr: None,
            tasks: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Binds the configured listeners and spawns their accept loops.
    /// An empty address disables that listener.
    pub async fn start(&mut self, ctx: CancellationToken) -> Result<()> {
        let mut tasks = self.tasks.lock().await;

        if !self.cfg.tcp_addr.is_empty() {
            let listener = tcp::TcpIngest::bind(
                Arc::clone(&self.ingestor),
                &self.cfg,
            )
            .await?;
            self.tcp_addr = Some(listener.local_addr());
            tasks.push(tokio::spawn(listener.serve(ctx.child_token())));
        }

        if !self.cfg.http_addr.is_empty() {
            let server = http::HttpIngest::bind(
                Arc::clone(&self.ingestor),
                &self.cfg,
            )
            .await?;
            self.http_addr = Some(server.local_addr());
            tasks.push(tokio::spawn(server.serve(ctx.child_token())));
        }

        Ok(())
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp_addr
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    /// Waits for the listeners and their sessions to finish after cancellation.
    pub async fn wait_for_shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "ingest task join failed");
            }
        }
    }
}

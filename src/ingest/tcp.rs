//! Persistent-socket ingestion. One task per connection.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::frame::{FrameEvent, FrameReader};
use super::{ConnectionError, Ingestor, SessionContext, Transport};
use crate::codec::ParseError;
use crate::config::{bind_addr, Framing, IngestConfig};
use crate::store::PendingAck;

/// Accept loop for the socket listener.
pub struct TcpIngest {
    ingestor: Arc<Ingestor>,
    listener: TcpListener,
    local_addr: SocketAddr,
    sessions: Arc<Semaphore>,
    limits: SessionLimits,
}

#[derive(Debug, Clone, Copy)]
struct SessionLimits {
    framing: Framing,
    max_frame_bytes: usize,
    idle_timeout: Duration,
    max_inflight: usize,
}

impl TcpIngest {
    pub async fn bind(ingestor: Arc<Ingestor>, cfg: &IngestConfig) -> Result<Self> {
        let bind = bind_addr(&cfg.tcp_addr);
        let listener = TcpListener::bind(&bind)
            .await
            .with_context(|| format!("listening on {bind}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;

        Ok(Self {
            ingestor,
            listener,
            local_addr,
            sessions: Arc::new(Semaphore::new(cfg.max_sessions)),
            limits: SessionLimits {
                framing: cfg.framing,
                max_frame_bytes: cfg.max_frame_bytes,
                idle_timeout: cfg.idle_timeout,
                max_inflight: cfg.max_inflight_per_session,
            },
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections until `ctx` is cancelled, then waits for open
    /// sessions to finish flushing.
    pub async fn serve(self, ctx: CancellationToken) {
        info!(addr = %self.local_addr, framing = ?self.limits.framing, "tcp ingest listener started");
        let mut sessions = tokio::task::JoinSet::new();

        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,

                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(v) => v,
                        Err(e) => {
                            error!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let Ok(permit) = Arc::clone(&self.sessions).try_acquire_owned() else {
                        warn!(peer = %peer, "session limit reached, refusing connection");
                        self.ingestor
                            .health()
                            .sessions_closed
                            .with_label_values(&["over_capacity"])
                            .inc();
                        continue;
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(peer = %peer, error = %e, "setting TCP_NODELAY");
                    }

                    let ingestor = Arc::clone(&self.ingestor);
                    let limits = self.limits;
                    let cancel = ctx.child_token();
                    sessions.spawn(async move {
                        run_session(ingestor, stream, peer, limits, cancel).await;
                        drop(permit);
                    });
                }

                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "session task panicked");
                    }
                }
            }
        }

        let open = sessions.len();
        while sessions.join_next().await.is_some() {}
        info!(addr = %self.local_addr, closed_sessions = open, "tcp ingest listener stopped");
    }
}

async fn run_session(
    ingestor: Arc<Ingestor>,
    stream: TcpStream,
    peer: SocketAddr,
    limits: SessionLimits,
    cancel: CancellationToken,
) {
    let mut session = ingestor.session(peer, Transport::Tcp);
    ingestor.opened(&session);
    let health = Arc::clone(ingestor.health());
    health.sessions_active.inc();

    let mut reader = FrameReader::new(stream, limits.framing, limits.max_frame_bytes);
    let mut inflight = VecDeque::new();
    let result = read_loop(&ingestor, &mut reader, &mut session, &mut inflight, limits, &cancel).await;

    // Outcomes of accepted appends are still reported even if the socket died.
    for pending in inflight {
        let samples = pending.samples();
        ingestor.settle(pending.wait().await, samples, &mut session);
    }
    drop(reader);

    let reason = match &result {
        Ok(()) => "eof",
        Err(e) => e.kind(),
    };
    if let Err(e) = &result {
        if !matches!(e, ConnectionError::Shutdown) {
            warn!(session = session.id, peer = %peer, error = %e, "session ended");
        }
    }
    health.sessions_active.dec();
    ingestor.closed(&session, reason);
}

/// Reads frames until end of stream. Appends are pipelined: up to
/// `max_inflight` may await their commit while reading continues, after which
/// the loop waits on the oldest, which stops reading from the socket.
async fn read_loop(
    ingestor: &Ingestor,
    reader: &mut FrameReader<TcpStream>,
    session: &mut SessionContext,
    inflight: &mut VecDeque<PendingAck>,
    limits: SessionLimits,
    cancel: &CancellationToken,
) -> Result<(), ConnectionError> {
    loop {
        while let Some(front) = inflight.front_mut() {
            let samples = front.samples();
            let Some(result) = front.try_take() else {
                break;
            };
            inflight.pop_front();
            ingestor.settle(result, samples, session);
        }

        let event = tokio::select! {
            _ = cancel.cancelled() => return Err(ConnectionError::Shutdown),
            next = tokio::time::timeout(limits.idle_timeout, reader.next()) => match next {
                Ok(event) => event?,
                Err(_) => return Err(ConnectionError::IdleTimeout(limits.idle_timeout)),
            },
        };

        let raw = match event {
            None => return Ok(()),
            Some(FrameEvent::Frame(raw)) => raw,
            Some(FrameEvent::Oversized(size)) => {
                let err = ParseError::FrameTooLarge {
                    size,
                    limit: limits.max_frame_bytes,
                };
                ingestor.reject(&err, session);
                continue;
            }
        };

        let Ok(samples) = ingestor.decode(&raw, session) else {
            continue;
        };
        if samples.is_empty() {
            continue;
        }

        while inflight.len() >= limits.max_inflight {
            let Some(oldest) = inflight.pop_front() else {
                break;
            };
            let count = oldest.samples();
            ingestor.settle(oldest.wait().await, count, session);
        }

        let count = samples.len();
        match ingestor.store().submit(samples).await {
            Ok(pending) => inflight.push_back(pending),
            Err(e) => ingestor.settle(Err(e), count, session),
        }
    }
}

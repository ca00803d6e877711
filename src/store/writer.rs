//! Single writer task: batches appends, commits them to the backend on the
//! blocking pool, then publishes the committed samples to the read index.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backend::Backend;
use super::index::TailIndex;
use super::pin::PinRegistry;
use super::{Ack, RetainReport, RetentionPolicy, StoredSample, WriteError};
use crate::codec::order::{self, Arrival};
use crate::codec::{Sample, StreamKey, Timestamp};
use crate::export::health::HealthMetrics;

pub(super) struct PendingAppend {
    pub samples: Vec<Sample>,
    pub ack: oneshot::Sender<Result<Ack, WriteError>>,
}

pub(super) enum Maintenance {
    /// Runs between batches, so no commit can land behind a cutoff
    /// after the index was trimmed and before the backend delete.
    Retain {
        policy: RetentionPolicy,
        done: oneshot::Sender<Result<RetainReport, WriteError>>,
    },
    Tag {
        device_id: String,
        tag: String,
        done: oneshot::Sender<Result<(), WriteError>>,
    },
}

pub(super) enum Command {
    Append(PendingAppend),
    Maintenance(Maintenance),
}

pub(super) struct Writer {
    pub rx: mpsc::Receiver<Command>,
    pub backend: Arc<Backend>,
    pub index: Arc<TailIndex>,
    pub pins: Arc<PinRegistry>,
    pub health: Arc<HealthMetrics>,
    pub commits: watch::Sender<u64>,
    pub batch_size: usize,
    pub max_linger: Duration,
    pub order_tolerance: Duration,
    pub next_seq: u64,
}

impl Writer {
    pub(super) async fn run(mut self, cancel: CancellationToken) {
        info!(
            backend = self.backend.name(),
            batch_size = self.batch_size,
            max_linger = ?self.max_linger,
            "store writer started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Refuse new work, then flush everything already queued.
                    self.rx.close();
                    let mut flushed = 0;
                    while let Some(cmd) = self.rx.recv().await {
                        flushed += self.handle(cmd).await;
                    }
                    info!(flushed, "store writer stopped");
                    return;
                }

                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => {
                        self.handle(cmd).await;
                    }
                    None => {
                        debug!("store write queue closed");
                        return;
                    }
                },
            }
        }
    }

    /// Handles one command plus whatever appends queue up behind it.
    /// Returns the number of samples committed.
    async fn handle(&mut self, cmd: Command) -> usize {
        match cmd {
            Command::Append(first) => {
                let mut count = first.samples.len();
                let mut batch = vec![first];
                let deferred = self.fill(&mut batch, &mut count).await;
                let committed = self.commit(batch).await;
                if let Some(m) = deferred {
                    self.maintain(m).await;
                }
                committed
            }
            Command::Maintenance(m) => {
                self.maintain(m).await;
                0
            }
        }
    }

    /// Drain queued appends until the batch is full or the linger deadline passes.
    /// A maintenance command ends the batch and is returned to run after it.
    async fn fill(&mut self, batch: &mut Vec<PendingAppend>, count: &mut usize) -> Option<Maintenance> {
        let deadline = tokio::time::Instant::now() + self.max_linger;
        while *count < self.batch_size {
            let next = match self.rx.try_recv() {
                Ok(cmd) => cmd,
                Err(TryRecvError::Empty) if !self.max_linger.is_zero() => {
                    match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                        Ok(Some(cmd)) => cmd,
                        Ok(None) | Err(_) => break,
                    }
                }
                Err(_) => break,
            };
            match next {
                Command::Append(append) => {
                    *count += append.samples.len();
                    batch.push(append);
                }
                Command::Maintenance(m) => return Some(m),
            }
        }
        None
    }

    async fn commit(&mut self, batch: Vec<PendingAppend>) -> usize {
        let total: usize = batch.iter().map(|a| a.samples.len()).sum();
        let mut prepared = Vec::with_capacity(total);
        let mut spans = Vec::with_capacity(batch.len());
        let mut heads: HashMap<StreamKey, Option<Timestamp>> = HashMap::new();

        for PendingAppend { samples, ack } in batch {
            let start = prepared.len();
            for sample in samples {
                let key = sample.stream_key();
                let head = *heads
                    .entry(key.clone())
                    .or_insert_with(|| self.index.head(&key));
                let arrival = order::classify(head, sample.timestamp, self.order_tolerance);
                if let Arrival::OutOfOrder { behind } = arrival {
                    debug!(stream = %key, ?behind, "out-of-order sample");
                }
                heads.insert(
                    key,
                    Some(head.map_or(sample.timestamp, |h| h.max(sample.timestamp))),
                );

                prepared.push(StoredSample {
                    seq: self.next_seq,
                    out_of_order: arrival.is_out_of_order(),
                    sample,
                });
                self.next_seq += 1;
            }
            spans.push((ack, start, prepared.len()));
        }

        let backend = Arc::clone(&self.backend);
        let timer = self.health.commit_duration.start_timer();
        let joined = tokio::task::spawn_blocking(move || {
            let outcome = backend.commit(&prepared);
            (prepared, outcome)
        })
        .await;
        timer.observe_duration();

        let (prepared, outcome) = match joined {
            Ok(v) => v,
            Err(e) => (
                Vec::new(),
                Err(WriteError::Commit(format!("commit task failed: {e}"))),
            ),
        };

        let inserted = match outcome {
            Ok(inserted) => inserted,
            Err(e) => {
                warn!(error = %e, samples = total, "store commit failed, dropping batch");
                self.health.commit_errors.inc();
                self.health.samples_dropped.inc_by(total as f64);
                for (ack, _, _) in spans {
                    let _ = ack.send(Err(e.clone()));
                }
                return 0;
            }
        };

        let entries: Vec<Option<Arc<StoredSample>>> = prepared
            .into_iter()
            .zip(inserted)
            .map(|(stored, is_new)| is_new.then(|| Arc::new(stored)))
            .collect();

        let mut acks = Vec::with_capacity(spans.len());
        for (ack, start, end) in spans {
            let slice = entries.get(start..end).unwrap_or_default();
            let stored = slice.iter().flatten().count();
            let out_of_order = slice.iter().flatten().filter(|s| s.out_of_order).count();
            acks.push((
                ack,
                Ack {
                    stored,
                    duplicates: slice.len() - stored,
                    out_of_order,
                },
            ));
        }

        let published: Vec<Arc<StoredSample>> = entries.into_iter().flatten().collect();
        let stored = published.len();
        let out_of_order = published.iter().filter(|s| s.out_of_order).count();

        // Visible to readers before anyone is told the write succeeded.
        self.index.publish(published);
        self.commits.send_modify(|generation| *generation += 1);

        self.health.samples_stored.inc_by(stored as f64);
        self.health.samples_duplicate.inc_by((total - stored) as f64);
        self.health.samples_out_of_order.inc_by(out_of_order as f64);
        self.health.batch_size.observe(total as f64);
        self.health.samples_resident.set(self.index.resident() as f64);
        self.health.streams_tracked.set(self.index.stream_count() as f64);

        for (ack, result) in acks {
            let _ = ack.send(Ok(result));
        }

        stored
    }

    async fn maintain(&mut self, m: Maintenance) {
        let backend = Arc::clone(&self.backend);
        match m {
            Maintenance::Retain { policy, done } => {
                let mut report = RetainReport::default();
                let mut cutoffs = Vec::new();
                for key in self.index.keys() {
                    let Some(head) = self.index.head(&key) else {
                        continue;
                    };
                    let cutoff = policy.max_age.map(|age| head.saturating_sub(age));
                    let protect = self.pins.oldest(&key);
                    let evicted =
                        self.index
                            .evict(&key, cutoff, policy.max_samples_per_stream, protect);
                    if let Some(ev) = evicted.filter(|ev| ev.removed > 0) {
                        report.streams += 1;
                        report.evicted += ev.removed;
                        cutoffs.push((ev.key, ev.keep_from));
                    }
                }

                self.health.samples_evicted.inc_by(report.evicted as f64);
                self.health.samples_resident.set(self.index.resident() as f64);

                if !cutoffs.is_empty() {
                    let deleted = tokio::task::spawn_blocking(move || backend.evict(&cutoffs))
                        .await
                        .unwrap_or_else(|e| {
                            Err(WriteError::Commit(format!("evict task failed: {e}")))
                        });
                    match deleted {
                        Ok(deleted) => report.deleted = deleted,
                        Err(e) => {
                            let _ = done.send(Err(e));
                            return;
                        }
                    }
                }
                let _ = done.send(Ok(report));
            }
            Maintenance::Tag {
                device_id,
                tag,
                done,
            } => {
                let result = tokio::task::spawn_blocking(move || backend.set_tag(&device_id, &tag))
                    .await
                    .unwrap_or_else(|e| Err(WriteError::Commit(format!("tag task failed: {e}"))));
                let _ = done.send(result);
            }
        }
    }
}

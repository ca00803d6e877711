use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregate::Aggregator;
use crate::config::Config;
use crate::dashboard::{Dashboard, DashboardState};
use crate::export::health::HealthMetrics;
use crate::ingest::{IngestServer, Ingestor};
use crate::refresh::{RefreshLoop, ViewSpec};
use crate::store::{RetentionPolicy, Store};

/// Agent owns every component: store, ingest listeners, live views, dashboard API.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    store: Option<Arc<Store>>,
    ingest: Option<IngestServer>,
    dashboard: Option<Dashboard>,
    refresh_tasks: Vec<tokio::task::JoinHandle<()>>,
    /// Stops ingestion, views and monitors.
    cancel: CancellationToken,
    /// Stops the store writer, after ingestion has drained into it.
    store_cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            store: None,
            ingest: None,
            dashboard: None,
            refresh_tasks: Vec::new(),
            cancel: CancellationToken::new(),
            store_cancel: CancellationToken::new(),
        })
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    pub fn store(&self) -> Option<&Arc<Store>> {
        self.store.as_ref()
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.ingest.as_ref().and_then(IngestServer::tcp_addr)
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.ingest.as_ref().and_then(IngestServer::http_addr)
    }

    pub fn dashboard_addr(&self) -> Option<SocketAddr> {
        self.dashboard.as_ref().and_then(Dashboard::local_addr)
    }

    /// Start all components and begin accepting producers.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Health metrics server first so health checks respond during recovery.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        // 1. Store: open, recover the tail, start the writer.
        let store = Store::open(
            &self.cfg.store,
            self.cfg.ingest.order_tolerance,
            Arc::clone(&self.health),
        )
        .context("opening store")?;
        store
            .start(self.store_cancel.clone())
            .await
            .context("starting store writer")?;
        let store = Arc::new(store);
        self.store = Some(Arc::clone(&store));

        // 2. Live views.
        let aggregator = Arc::new(Aggregator::new(
            Arc::clone(&store),
            self.cfg.aggregate.clone(),
        ));
        let mut views = HashMap::with_capacity(self.cfg.dashboard.views.len());
        for view_cfg in &self.cfg.dashboard.views {
            let view = ViewSpec::from_config(view_cfg)?;
            let name = view.name.clone();
            let (mut refresh, frames) = RefreshLoop::new(
                view,
                Arc::clone(&aggregator),
                self.cfg.dashboard.refresh_interval,
                Arc::clone(&self.health),
            );
            if self.cfg.dashboard.event_driven {
                refresh = refresh.with_commits(store.subscribe_commits());
            }
            self.refresh_tasks
                .push(tokio::spawn(refresh.run(self.cancel.child_token())));
            views.insert(name, frames);
        }

        // 3. Dashboard API.
        let mut dashboard = Dashboard::new(
            &self.cfg.dashboard.addr,
            DashboardState {
                store: Arc::clone(&store),
                aggregator,
                views,
            },
        );
        dashboard.start().await.context("starting dashboard api")?;
        self.dashboard = Some(dashboard);

        // 4. Ingestion last, once everything it feeds is up.
        let ingestor = Arc::new(Ingestor::new(
            Arc::clone(&store),
            Arc::clone(&self.health),
            &self.cfg.ingest,
        )?);
        let mut ingest = IngestServer::new(ingestor, self.cfg.ingest.clone());
        ingest
            .start(self.cancel.child_token())
            .await
            .context("starting ingest listeners")?;
        self.ingest = Some(ingest);

        // 5. Background monitors.
        self.spawn_retention_monitor(Arc::clone(&store));
        self.spawn_store_stats_reporter(store);

        info!(
            tcp = ?self.tcp_addr(),
            http = ?self.http_addr(),
            dashboard = ?self.dashboard_addr(),
            views = self.cfg.dashboard.views.len(),
            "agent fully started",
        );

        Ok(())
    }

    /// Gracefully stop all components. Samples already accepted by a session
    /// are committed before the store closes.
    pub async fn stop(&mut self) -> Result<()> {
        // Stop accepting, end sessions and views.
        self.cancel.cancel();

        if let Some(ingest) = &self.ingest {
            ingest.wait_for_shutdown().await;
        }
        for task in self.refresh_tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "refresh task join failed");
            }
        }

        // Flush the write queue.
        self.store_cancel.cancel();
        if let Some(store) = &self.store {
            store.wait_for_shutdown().await;
        }

        if let Some(dashboard) = &self.dashboard {
            dashboard.stop();
        }

        self.health.stop().await?;

        Ok(())
    }

    /// Spawn periodic retention. Does nothing when no limit is configured.
    fn spawn_retention_monitor(&self, store: Arc<Store>) {
        let policy = RetentionPolicy::from(&self.cfg.store.retention);
        if policy.max_age.is_none() && policy.max_samples_per_stream.is_none() {
            debug!("retention disabled");
            return;
        }
        let cancel = self.cancel.clone();
        let interval = self.cfg.store.retention.interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        match store.retain(&policy).await {
                            Ok(report) if report.evicted > 0 => {
                                debug!(
                                    streams = report.streams,
                                    evicted = report.evicted,
                                    deleted = report.deleted,
                                    "retention pass",
                                );
                            }
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "retention pass failed"),
                        }
                    }
                }
            }
        });
    }

    /// Spawn background store stats reporter.
    fn spawn_store_stats_reporter(&self, store: Arc<Store>) {
        let cancel = self.cancel.clone();
        let health = Arc::clone(&self.health);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut last_stored = 0.0;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let stored = health.samples_stored.get();
                        let delta = stored - last_stored;
                        last_stored = stored;

                        if delta == 0.0 {
                            continue;
                        }

                        info!(
                            stored = delta as u64,
                            resident = store.resident(),
                            streams = store.stream_keys().len(),
                            dropped_total = health.samples_dropped.get() as u64,
                            "store stats (60s)",
                        );
                    }
                }
            }
        });
    }
}

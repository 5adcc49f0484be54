//! Background worker that turns reconnects into drain passes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::backend::Backend;
use crate::connectivity::{ConnectivityMonitor, ConnectivityState};
use crate::sync_engine::SyncEngine;

/// Default interval between backend reachability probes.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Drains the outbox whenever the client comes back online.
///
/// Connectivity is fed by whoever owns the monitor (the OS network callback,
/// failed requests) and by the worker's own periodic health probe.
pub struct SyncWorker {
    engine: Arc<SyncEngine>,
    backend: Arc<dyn Backend>,
    connectivity: ConnectivityMonitor,
    probe_interval: Duration,
    shutdown: Arc<Notify>,
}

impl SyncWorker {
    pub fn new(
        engine: Arc<SyncEngine>,
        backend: Arc<dyn Backend>,
        connectivity: ConnectivityMonitor,
    ) -> Self {
        Self {
            engine,
            backend,
            connectivity,
            probe_interval: PROBE_INTERVAL,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn probe_interval(&self) -> Duration {
        self.probe_interval
    }

    /// Handle used to stop the worker after [`SyncWorker::start`].
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Spawn the worker loop.
    ///
    /// Items left over from a previous session are drained right away when
    /// the client starts online.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(probe_interval = ?self.probe_interval, "sync worker started");

            let mut changes = self.connectivity.subscribe();
            let mut probe = tokio::time::interval(self.probe_interval);
            probe.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            probe.tick().await;

            if !self.connectivity.is_offline() {
                self.drain().await;
            }

            loop {
                tokio::select! {
                    _ = self.shutdown.notified() => {
                        tracing::info!("sync worker received shutdown signal");
                        break;
                    }
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = *changes.borrow_and_update();
                        if state == ConnectivityState::Online {
                            self.drain().await;
                        }
                    }
                    _ = probe.tick() => {
                        let reachable = self.backend.health().await;
                        tracing::debug!(reachable, "connectivity probe");
                        self.connectivity.set(if reachable {
                            ConnectivityState::Online
                        } else {
                            ConnectivityState::Offline
                        });
                    }
                }
            }

            tracing::info!("sync worker stopped");
        })
    }

    async fn drain(&self) {
        match self.engine.drain().await {
            Ok(report) if report.skipped => {}
            Ok(report) => {
                tracing::debug!(?report, "drain pass complete");
            }
            Err(err) => {
                tracing::error!("drain pass failed: {err}");
            }
        }
    }
}

impl std::fmt::Debug for SyncWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncWorker")
            .field("engine", &self.engine)
            .field("connectivity", &self.connectivity.state())
            .field("probe_interval", &self.probe_interval)
            .finish_non_exhaustive()
    }
}

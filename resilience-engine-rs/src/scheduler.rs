//! # Background Scheduling
//!
//! A restartable periodic task with an explicit start/stop lifecycle. Backs
//! the metrics cleanup sweep and the alert monitor.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Longest accepted period; larger values would overflow instant arithmetic
const MAX_PERIOD: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Runs a callback every `period` on the current tokio runtime
#[derive(Debug)]
pub struct PeriodicTask {
    name: String,
    period: Duration,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl PeriodicTask {
    pub fn new<S: Into<String>>(name: S, period: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            name: name.into(),
            period: period.min(MAX_PERIOD),
            worker_handle: Mutex::new(None),
            shutdown_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Starts the worker. The first tick fires one period after start.
    ///
    /// Returns `false` when the task is already running or no tokio runtime
    /// is available.
    pub fn start<F>(&self, tick: F) -> bool
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut worker_handle = self.worker_handle.lock().unwrap_or_else(|p| p.into_inner());

        if worker_handle.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!(task = %self.name, "Periodic task already running");
            return false;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!(task = %self.name, "No tokio runtime available, periodic task not started");
                return false;
            }
        };

        let name = self.name.clone();
        let period = self.period;
        let tick = Arc::new(tick);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = runtime.spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!(task = %name, "Periodic task shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        tick();
                    }
                }
            }
        });

        *worker_handle = Some(handle);

        info!(
            task = %self.name,
            period_secs = self.period.as_secs_f64(),
            "Periodic task started"
        );
        true
    }

    /// Stops the worker; calling it on a stopped task does nothing
    pub fn stop(&self) {
        let handle = self
            .worker_handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();

        if let Some(handle) = handle {
            let _ = self.shutdown_tx.send(());
            // a worker that has not been polled yet never sees the signal
            handle.abort();
            info!(task = %self.name, "Periodic task stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker_handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}

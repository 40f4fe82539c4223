//! Serialized execution of reconciliation passes.
//!
//! Every pass goes through one worker task, so two passes never touch the
//! local ledger at the same time. Passes run in submission order and are
//! never deduplicated; each is idempotent.

use crate::engine::{SyncEngine, SyncReport};
use crate::error::{SyncError, SyncResult};
use crate::record::EntityValue;
use crate::transport::RemoteTransport;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// One queued pass.
struct Job {
    /// `None` reconciles whatever is unsynced when the pass starts.
    keys: Option<Vec<String>>,
    reply: oneshot::Sender<SyncResult<SyncReport>>,
}

/// Completion of a triggered pass.
///
/// Resolves to the pass report, or [`SyncError::SchedulerClosed`] if the
/// scheduler shut down before running it. Dropping it does not cancel the
/// pass.
#[derive(Debug)]
pub struct PendingSync {
    reply: Option<oneshot::Receiver<SyncResult<SyncReport>>>,
}

impl PendingSync {
    fn closed() -> Self {
        Self { reply: None }
    }
}

impl Future for PendingSync {
    type Output = SyncResult<SyncReport>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.reply.as_mut() {
            None => Poll::Ready(Err(SyncError::SchedulerClosed)),
            Some(reply) => Pin::new(reply)
                .poll(cx)
                .map(|result| result.unwrap_or(Err(SyncError::SchedulerClosed))),
        }
    }
}

/// Queues reconciliation passes onto a single worker task.
pub struct SyncScheduler<V, T> {
    engine: Arc<SyncEngine<V, T>>,
    queue: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl<V: EntityValue, T: RemoteTransport + 'static> SyncScheduler<V, T> {
    /// Starts the worker task.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new(engine: Arc<SyncEngine<V, T>>) -> Self {
        let (queue, jobs) = mpsc::unbounded_channel();
        let worker = tokio::spawn(Self::run(Arc::clone(&engine), jobs));
        Self {
            engine,
            queue: Mutex::new(Some(queue)),
            worker: Mutex::new(Some(worker)),
            ticker: Mutex::new(None),
        }
    }

    /// The engine passes run on.
    pub fn engine(&self) -> &Arc<SyncEngine<V, T>> {
        &self.engine
    }

    /// Enqueues a pass over `keys` and returns without waiting for it.
    pub fn trigger<I, S>(&self, keys: I) -> PendingSync
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enqueue(Some(keys.into_iter().map(Into::into).collect()))
    }

    /// Enqueues a pass over every key unsynced when the pass starts.
    pub fn trigger_unsynced(&self) -> PendingSync {
        self.enqueue(None)
    }

    /// Triggers [`trigger_unsynced`](Self::trigger_unsynced) every
    /// `interval`, replacing any previous ticker. A tick waits for its pass
    /// before the next one is scheduled.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SchedulerClosed`] after [`shutdown`](Self::shutdown).
    pub fn start_auto_sync(&self, interval: Duration) -> SyncResult<()> {
        let queue = self.queue.lock().clone().ok_or(SyncError::SchedulerClosed)?;

        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticks.tick().await;
            loop {
                ticks.tick().await;
                let (reply, done) = oneshot::channel();
                if queue.send(Job { keys: None, reply }).is_err() {
                    break;
                }
                if let Ok(Err(e)) = done.await {
                    tracing::debug!(error = %e, "automatic sync pass failed");
                }
            }
        });

        if let Some(previous) = self.ticker.lock().replace(handle) {
            previous.abort();
        }
        tracing::info!(interval_ms = interval.as_millis() as u64, "automatic sync started");
        Ok(())
    }

    /// Stops automatic sync. Queued passes still run.
    pub fn stop_auto_sync(&self) {
        if let Some(handle) = self.ticker.lock().take() {
            handle.abort();
            tracing::info!("automatic sync stopped");
        }
    }

    /// Returns true if automatic sync is running.
    pub fn is_auto_syncing(&self) -> bool {
        self.ticker.lock().is_some()
    }

    /// Stops accepting passes and waits for the queued ones to finish.
    ///
    /// Later triggers resolve to [`SyncError::SchedulerClosed`].
    pub async fn shutdown(&self) {
        self.stop_auto_sync();
        self.queue.lock().take();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "sync worker ended abnormally");
            }
        }
    }

    fn enqueue(&self, keys: Option<Vec<String>>) -> PendingSync {
        let Some(queue) = self.queue.lock().clone() else {
            return PendingSync::closed();
        };
        let (reply, done) = oneshot::channel();
        match queue.send(Job { keys, reply }) {
            Ok(()) => PendingSync { reply: Some(done) },
            Err(_) => PendingSync::closed(),
        }
    }

    async fn run(engine: Arc<SyncEngine<V, T>>, mut jobs: mpsc::UnboundedReceiver<Job>) {
        while let Some(job) = jobs.recv().await {
            let keys = job
                .keys
                .unwrap_or_else(|| engine.local().unsynced_keys());
            let result = engine.reconcile(&keys).await;
            // The caller may have dropped its PendingSync.
            let _ = job.reply.send(result);
        }
        tracing::debug!("sync worker stopped");
    }
}

impl<V, T> Drop for SyncScheduler<V, T> {
    fn drop(&mut self) {
        // The ticker holds a queue handle and would keep the worker alive.
        if let Some(handle) = self.ticker.get_mut().take() {
            handle.abort();
        }
    }
}

impl<V, T> std::fmt::Debug for SyncScheduler<V, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncScheduler")
            .field("open", &self.queue.lock().is_some())
            .field("auto_sync", &self.ticker.lock().is_some())
            .finish()
    }
}

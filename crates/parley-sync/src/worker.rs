//! Serialized background workers.
//!
//! A [`Worker`] owns one task that runs submitted jobs strictly in order.
//! Every worker is created with a [`WorkerScope`] that states who may shut
//! it down: the engine's process-scoped cache writer survives any view
//! closing, while a view's own component-scoped worker dies with the view.

use crate::cache::DurableCache;
use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Command {
    Run(Job),
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerScope {
    /// Shared for the life of the engine; only full teardown stops it.
    Process,
    /// Owned by a single view; stopped when that view closes.
    Component,
}

#[derive(Clone)]
pub struct Worker {
    name: &'static str,
    scope: WorkerScope,
    tx: mpsc::UnboundedSender<Command>,
    accepting: Arc<AtomicBool>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Worker {
    /// Spawns the worker task on the current runtime.
    pub fn spawn(name: &'static str, scope: WorkerScope) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
        let task = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    Command::Run(job) => job(),
                    Command::Stop => break,
                }
            }
            debug!(target = "parley::worker", worker = name, "worker stopped");
        });
        Self {
            name,
            scope,
            tx,
            accepting: Arc::new(AtomicBool::new(true)),
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn scope(&self) -> WorkerScope {
        self.scope
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    fn unavailable(&self) -> SyncError {
        warn!(
            target = "parley::worker",
            worker = self.name,
            "rejected job: worker is not accepting work"
        );
        SyncError::WorkerUnavailable { worker: self.name }
    }

    /// Queues a fire-and-forget job.
    pub fn submit<F>(&self, job: F) -> SyncResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.is_accepting() {
            return Err(self.unavailable());
        }
        self.tx
            .send(Command::Run(Box::new(job)))
            .map_err(|_| self.unavailable())
    }

    /// Queues a job and waits for its result.
    pub async fn run<T, F>(&self, job: F) -> SyncResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit(move || {
            let _ = reply_tx.send(job());
        })?;
        reply_rx
            .await
            .map_err(|_| SyncError::WorkerUnavailable { worker: self.name })
    }

    /// Stops accepting jobs. Already queued jobs still run. Safe to call repeatedly.
    pub fn shutdown(&self) {
        if self.accepting.swap(false, Ordering::AcqRel) {
            let _ = self.tx.send(Command::Stop);
            debug!(
                target = "parley::worker",
                worker = self.name,
                scope = ?self.scope,
                "worker shutdown requested"
            );
        }
    }

    /// Waits for the worker task to finish after [`Worker::shutdown`].
    pub async fn join(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// The single writer every cache mutation goes through.
#[derive(Clone)]
pub struct CacheWriter {
    worker: Worker,
    cache: Arc<dyn DurableCache>,
}

impl CacheWriter {
    pub fn spawn(cache: Arc<dyn DurableCache>) -> Self {
        Self {
            worker: Worker::spawn("cache-writer", WorkerScope::Process),
            cache,
        }
    }

    /// Read access; the cache synchronizes its own readers.
    pub fn cache(&self) -> &Arc<dyn DurableCache> {
        &self.cache
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    /// Runs `op` on the writer task, after every write queued before it.
    pub async fn write<T, F>(&self, op: F) -> SyncResult<T>
    where
        F: FnOnce(&dyn DurableCache) -> SyncResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let cache = self.cache.clone();
        self.worker.run(move || op(cache.as_ref())).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;

    #[tokio::test]
    async fn jobs_run_in_submission_order() {
        let worker = Worker::spawn("test", WorkerScope::Component);
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let seen = seen.clone();
            worker.submit(move || seen.lock().push(i)).unwrap();
        }
        let total = worker.run(|| 10).await.unwrap();
        assert_eq!(total, 10);
        assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_rejects_new_work() {
        let worker = Worker::spawn("test", WorkerScope::Component);
        worker.shutdown();
        worker.shutdown();
        assert!(!worker.is_accepting());
        let err = worker.submit(|| {}).unwrap_err();
        assert!(matches!(err, SyncError::WorkerUnavailable { worker: "test" }));
        worker.join().await;
        worker.join().await;
    }

    #[tokio::test]
    async fn queued_jobs_finish_before_stop() {
        let worker = Worker::spawn("test", WorkerScope::Component);
        let seen = Arc::new(Mutex::new(0));
        let counter = seen.clone();
        worker.submit(move || *counter.lock() += 1).unwrap();
        worker.shutdown();
        worker.join().await;
        assert_eq!(*seen.lock(), 1);
    }

    #[tokio::test]
    async fn writer_serializes_cache_access() {
        let writer = CacheWriter::spawn(MemoryCache::new());
        let count = writer
            .write(|cache| Ok(cache.outbound().len()))
            .await
            .unwrap();
        assert_eq!(count, 0);
        writer.worker().shutdown();
        let err = writer.write(|_| Ok(())).await.unwrap_err();
        assert!(matches!(err, SyncError::WorkerUnavailable { .. }));
    }
}

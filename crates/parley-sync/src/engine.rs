use crate::api::{HttpApi, SyncApi, TokenProvider};
use crate::cache::{CacheChange, DurableCache, MemoryCache};
use crate::config::SyncConfig;
use crate::connection::{
    ConnectionManager, ConnectionSettings, Delivery, LiveConnector, WsConnector,
};
use crate::error::{SyncError, SyncResult};
use crate::locks::EntityLocks;
use crate::mutation::MutationCoordinator;
use crate::outbox::OutboundTracker;
use crate::pending::PendingSends;
use crate::reconcile::{PageReport, PageRequest, PushApplier, ReconcileSettings, Reconciler, ThreadSyncReport};
use crate::worker::{CacheWriter, Worker, WorkerScope};
use crate::Identity;
use parking_lot::Mutex;
use parley_proto::{Envelope, OutboundKind};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Memory pressure levels reported by the host process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPressure {
    RunningModerate,
    RunningLow,
    RunningCritical,
    UiHidden,
    Background,
    Moderate,
    Complete,
}

impl MemoryPressure {
    pub fn from_level(level: i32) -> Option<Self> {
        Some(match level {
            5 => MemoryPressure::RunningModerate,
            10 => MemoryPressure::RunningLow,
            15 => MemoryPressure::RunningCritical,
            20 => MemoryPressure::UiHidden,
            40 => MemoryPressure::Background,
            60 => MemoryPressure::Moderate,
            80 => MemoryPressure::Complete,
            _ => return None,
        })
    }

    pub fn level(self) -> i32 {
        match self {
            MemoryPressure::RunningModerate => 5,
            MemoryPressure::RunningLow => 10,
            MemoryPressure::RunningCritical => 15,
            MemoryPressure::UiHidden => 20,
            MemoryPressure::Background => 40,
            MemoryPressure::Moderate => 60,
            MemoryPressure::Complete => 80,
        }
    }

    /// Only these levels stop the shared channel and writer.
    pub fn requires_teardown(self) -> bool {
        matches!(self, MemoryPressure::RunningCritical | MemoryPressure::Complete)
    }
}

pub struct SyncEngineBuilder {
    config: SyncConfig,
    identity: Identity,
    cache: Option<Arc<dyn DurableCache>>,
    api: Option<Arc<dyn SyncApi>>,
    connector: Option<Arc<dyn LiveConnector>>,
    tokens: Option<Arc<dyn TokenProvider>>,
}

impl SyncEngineBuilder {
    pub fn new(config: SyncConfig, identity: Identity) -> Self {
        Self {
            config: config.normalize(),
            identity,
            cache: None,
            api: None,
            connector: None,
            tokens: None,
        }
    }

    pub fn cache(mut self, cache: Arc<dyn DurableCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn api(mut self, api: Arc<dyn SyncApi>) -> Self {
        self.api = Some(api);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn LiveConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn tokens(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Spawns the writer, the connection actor and the push dispatcher on
    /// the current runtime. The channel stays closed until [`SyncEngine::open`].
    pub fn build(self) -> SyncResult<SyncEngine> {
        let config = self.config;
        let identity = self.identity;
        let missing_tokens = || SyncError::Rejected {
            reason: "a token provider is required for the default transports".to_string(),
        };

        let api: Arc<dyn SyncApi> = match self.api {
            Some(api) => api,
            None => {
                let tokens = self.tokens.clone().ok_or_else(missing_tokens)?;
                Arc::new(HttpApi::new(
                    &config.api_base_url,
                    tokens,
                    config.request_timeout(),
                )?)
            }
        };
        let connector: Arc<dyn LiveConnector> = match self.connector {
            Some(connector) => connector,
            None => {
                let tokens = self.tokens.clone().ok_or_else(missing_tokens)?;
                Arc::new(WsConnector::new(
                    config.ws_base_url.clone(),
                    identity.user_id,
                    tokens,
                    config.liveness_timeout(),
                ))
            }
        };
        let cache = match self.cache {
            Some(cache) => cache,
            None => MemoryCache::new() as Arc<dyn DurableCache>,
        };

        let writer = CacheWriter::spawn(cache);
        let locks = EntityLocks::new();
        let pending = PendingSends::new();
        let outbox = OutboundTracker::new(writer.clone(), config.outbox_max_retries);

        let push = PushApplier::new(
            writer.clone(),
            locks.clone(),
            pending.clone(),
            outbox.clone(),
            identity,
        );
        let connection = ConnectionManager::spawn(
            connector,
            Arc::new(push),
            outbox.clone(),
            ConnectionSettings::from_config(&config),
        );
        let reconciler = Reconciler::new(
            api.clone(),
            writer.clone(),
            locks.clone(),
            pending.clone(),
            identity,
            ReconcileSettings::from_config(&config),
        );
        let mutations = MutationCoordinator::new(
            api,
            writer.clone(),
            locks,
            pending,
            identity,
            config.retry_policy(),
        );

        info!(
            target = "parley::engine",
            user_id = identity.user_id,
            role = ?identity.role,
            api = %config.api_base_url,
            "sync engine started"
        );
        Ok(SyncEngine {
            config,
            identity,
            writer,
            outbox,
            connection,
            reconciler,
            mutations,
            stopped: AtomicBool::new(false),
        })
    }
}

/// Owns every shared component. Views borrow from it through [`ViewScope`].
pub struct SyncEngine {
    config: SyncConfig,
    identity: Identity,
    writer: CacheWriter,
    outbox: OutboundTracker,
    connection: ConnectionManager,
    reconciler: Reconciler,
    mutations: MutationCoordinator,
    stopped: AtomicBool,
}

impl SyncEngine {
    pub fn builder(config: SyncConfig, identity: Identity) -> SyncEngineBuilder {
        SyncEngineBuilder::new(config, identity)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn cache(&self) -> &Arc<dyn DurableCache> {
        self.writer.cache()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn mutations(&self) -> &MutationCoordinator {
        &self.mutations
    }

    pub fn outbox(&self) -> &OutboundTracker {
        &self.outbox
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn open(&self) {
        self.connection.open();
    }

    pub fn close(&self) {
        self.connection.close();
    }

    pub async fn sync_page(&self, request: PageRequest) -> SyncResult<PageReport> {
        self.reconciler.sync_page(request).await
    }

    /// Refreshes the first thread page with the configured page size.
    pub async fn refresh(&self) -> SyncResult<PageReport> {
        self.reconciler
            .sync_page(PageRequest::refresh(self.config.thread_page_size))
            .await
    }

    pub async fn sync_thread(&self, thread_id: i64) -> SyncResult<ThreadSyncReport> {
        self.reconciler.sync_thread(thread_id).await
    }

    /// Sends an envelope on the live channel, queueing it when offline.
    pub async fn publish(
        &self,
        kind: OutboundKind,
        thread_id: Option<i64>,
        data: Option<Value>,
    ) -> SyncResult<Delivery> {
        self.connection
            .send(Envelope::outbound(kind, data), thread_id)
            .await
    }

    pub fn on_foreground(&self) {
        debug!(target = "parley::engine", "foreground");
        self.connection.foreground();
    }

    pub fn on_background(&self) {
        debug!(target = "parley::engine", "background");
        self.connection.background();
    }

    pub fn on_network_available(&self) {
        self.connection.network_available();
    }

    /// Returns whether the level caused a full teardown.
    pub async fn on_memory_pressure(&self, pressure: MemoryPressure) -> bool {
        if !pressure.requires_teardown() {
            debug!(
                target = "parley::engine",
                level = pressure.level(),
                "memory pressure noted"
            );
            return false;
        }
        warn!(
            target = "parley::engine",
            level = pressure.level(),
            "memory pressure critical; tearing down"
        );
        self.shutdown().await;
        true
    }

    pub async fn on_low_memory(&self) {
        warn!(target = "parley::engine", "low memory; tearing down");
        self.shutdown().await;
    }

    /// Opens a view-scoped component: its own worker plus a change observer,
    /// optionally narrowed to one thread.
    pub fn view(&self, name: &'static str, thread_id: Option<i64>) -> ViewScope {
        ViewScope::open(name, self.writer.cache().subscribe(), thread_id)
    }

    /// Full teardown: closes the live channel and stops the shared writer.
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.connection.shutdown().await;
        self.writer.worker().shutdown();
        self.writer.worker().join().await;
        info!(target = "parley::engine", "sync engine stopped");
    }
}

/// Resources owned by one view. Closing it stops only these; the shared
/// channel and writer keep running.
pub struct ViewScope {
    worker: Worker,
    changes: mpsc::UnboundedReceiver<CacheChange>,
    observer: Mutex<Option<JoinHandle<()>>>,
}

impl ViewScope {
    fn open(
        name: &'static str,
        mut feed: broadcast::Receiver<CacheChange>,
        thread_id: Option<i64>,
    ) -> Self {
        let (tx, changes) = mpsc::unbounded_channel();
        let observer = tokio::spawn(async move {
            loop {
                match feed.recv().await {
                    Ok(change) => {
                        let relevant = match (thread_id, change.thread_id()) {
                            (None, _) => true,
                            (Some(wanted), Some(id)) => wanted == id,
                            (Some(_), None) => false,
                        };
                        if relevant && tx.send(change).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(target = "parley::view", skipped, "view observer lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Self {
            worker: Worker::spawn(name, WorkerScope::Component),
            changes,
            observer: Mutex::new(Some(observer)),
        }
    }

    /// The view's own worker for view-local background jobs.
    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    /// Next cache change relevant to this view, or `None` once closed.
    pub async fn next_change(&mut self) -> Option<CacheChange> {
        self.changes.recv().await
    }

    pub fn try_next_change(&mut self) -> Option<CacheChange> {
        self.changes.try_recv().ok()
    }

    /// Unregisters the observer and stops the view's worker.
    pub async fn close(&self) {
        let observer = self.observer.lock().take();
        if let Some(observer) = observer {
            observer.abort();
            let _ = observer.await;
        }
        self.worker.shutdown();
        self.worker.join().await;
        debug!(target = "parley::view", worker = self.worker.name(), "view closed");
    }
}

impl Drop for ViewScope {
    fn drop(&mut self) {
        if let Some(observer) = self.observer.lock().take() {
            observer.abort();
        }
        self.worker.shutdown();
    }
}

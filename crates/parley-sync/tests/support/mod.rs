#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use parley_proto::{
    now_millis, CreateThreadRequest, Lenient, MessageKind, MessagePage, MessageRecord,
    Pagination, SendMessageRequest, ThreadPage, ThreadRecord, ThreadStatus,
};
use parley_sync::api::SyncApi;
use parley_sync::backoff::RetryPolicy;
use parley_sync::cache::MemoryCache;
use parley_sync::connection::{LiveChannel, LiveConnector};
use parley_sync::error::{SyncError, SyncResult, TransportError, TransportKind};
use parley_sync::locks::EntityLocks;
use parley_sync::mutation::MutationCoordinator;
use parley_sync::outbox::OutboundTracker;
use parley_sync::pending::PendingSends;
use parley_sync::reconcile::{PushApplier, ReconcileSettings, Reconciler};
use parley_sync::worker::CacheWriter;
use parley_sync::Identity;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

pub fn refused() -> SyncError {
    SyncError::Transport(TransportError::new(
        TransportKind::ConnectionRefused,
        "scripted failure",
    ))
}

pub fn thread_record(
    id: i64,
    owner: i64,
    assignee: Option<i64>,
    status: ThreadStatus,
    updated_at: i64,
) -> ThreadRecord {
    ThreadRecord {
        id,
        user_id: owner,
        tutor_id: assignee,
        content: format!("question {id}"),
        image_paths: None,
        status,
        created_at: updated_at - 10,
        updated_at: Some(updated_at),
    }
}

pub fn message_record(id: i64, thread_id: i64, sender: i64, content: &str, created_at: i64) -> MessageRecord {
    MessageRecord {
        id,
        question_id: thread_id,
        sender_id: sender,
        content: content.to_string(),
        message_type: MessageKind::Text,
        created_at: Some(created_at),
        is_read: false,
    }
}

fn paginate<T: Clone>(items: &[T], page: u32, page_size: u32) -> (Vec<T>, Pagination) {
    let size = page_size.max(1) as usize;
    let start = (page.max(1) as usize - 1) * size;
    let end = (start + size).min(items.len());
    let slice = if start < items.len() {
        items[start..end].to_vec()
    } else {
        Vec::new()
    };
    let total_pages = items.len().div_ceil(size) as u32;
    (
        slice,
        Pagination {
            page,
            page_size,
            total: items.len() as u64,
            total_pages,
            has_more: end < items.len(),
        },
    )
}

/// In-memory stand-in for the thread server with switches for failure injection.
pub struct FakeApi {
    pub user_id: i64,
    pub threads: Mutex<Vec<ThreadRecord>>,
    pub messages: Mutex<HashMap<i64, Vec<MessageRecord>>>,
    pub failing_threads: Mutex<HashSet<i64>>,
    pub message_delays: Mutex<HashMap<i64, Duration>>,
    pub fail_thread_pages: AtomicBool,
    pub fail_sends: AtomicBool,
    pub hold_sends: AtomicBool,
    pub send_started: Notify,
    pub release_sends: Notify,
    pub fail_status_changes: AtomicBool,
    pub hold_status_changes: AtomicBool,
    pub status_started: Notify,
    pub release_status: Notify,
    pub mark_read_failures: AtomicU32,
    pub mark_read_calls: AtomicU32,
    pub next_message_id: AtomicI64,
    pub sent: Mutex<Vec<SendMessageRequest>>,
    pub status_calls: Mutex<Vec<(&'static str, i64)>>,
    pub uploads: Mutex<Vec<PathBuf>>,
    pub created: Mutex<Vec<CreateThreadRequest>>,
    pub thread_fetches: AtomicU32,
    pub message_fetches: Mutex<Vec<(i64, u32)>>,
}

impl FakeApi {
    pub fn new(user_id: i64) -> Arc<Self> {
        Arc::new(Self {
            user_id,
            threads: Mutex::new(Vec::new()),
            messages: Mutex::new(HashMap::new()),
            failing_threads: Mutex::new(HashSet::new()),
            message_delays: Mutex::new(HashMap::new()),
            fail_thread_pages: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
            hold_sends: AtomicBool::new(false),
            send_started: Notify::new(),
            release_sends: Notify::new(),
            fail_status_changes: AtomicBool::new(false),
            hold_status_changes: AtomicBool::new(false),
            status_started: Notify::new(),
            release_status: Notify::new(),
            mark_read_failures: AtomicU32::new(0),
            mark_read_calls: AtomicU32::new(0),
            next_message_id: AtomicI64::new(1_000),
            sent: Mutex::new(Vec::new()),
            status_calls: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            created: Mutex::new(Vec::new()),
            thread_fetches: AtomicU32::new(0),
            message_fetches: Mutex::new(Vec::new()),
        })
    }

    pub fn set_threads(&self, threads: Vec<ThreadRecord>) {
        *self.threads.lock() = threads;
    }

    pub fn set_messages(&self, thread_id: i64, messages: Vec<MessageRecord>) {
        self.messages.lock().insert(thread_id, messages);
    }

    pub fn fail_messages_for(&self, thread_id: i64) {
        self.failing_threads.lock().insert(thread_id);
    }

    pub fn heal_messages_for(&self, thread_id: i64) {
        self.failing_threads.lock().remove(&thread_id);
    }

    pub fn message_fetch_count(&self, thread_id: i64) -> usize {
        self.message_fetches
            .lock()
            .iter()
            .filter(|(id, _)| *id == thread_id)
            .count()
    }

    async fn status_change(&self, action: &'static str, thread_id: i64, status: ThreadStatus) -> SyncResult<()> {
        self.status_calls.lock().push((action, thread_id));
        if self.hold_status_changes.load(Ordering::SeqCst) {
            self.status_started.notify_one();
            self.release_status.notified().await;
        }
        if self.fail_status_changes.load(Ordering::SeqCst) {
            return Err(SyncError::UnexpectedStatus {
                status: 500,
                body: "boom".into(),
            });
        }
        if let Some(thread) = self.threads.lock().iter_mut().find(|t| t.id == thread_id) {
            thread.status = status;
            if status == ThreadStatus::Active {
                thread.tutor_id = Some(self.user_id);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SyncApi for FakeApi {
    async fn fetch_threads(
        &self,
        page: u32,
        page_size: u32,
        status: Option<ThreadStatus>,
    ) -> SyncResult<ThreadPage> {
        self.thread_fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_thread_pages.load(Ordering::SeqCst) {
            return Err(refused());
        }
        let threads: Vec<ThreadRecord> = self
            .threads
            .lock()
            .iter()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect();
        let (slice, pagination) = paginate(&threads, page, page_size);
        Ok(ThreadPage {
            success: true,
            message: None,
            questions: slice.into_iter().map(|t| Lenient(Ok(t))).collect(),
            pagination,
        })
    }

    async fn fetch_messages(
        &self,
        thread_id: i64,
        page: u32,
        page_size: u32,
    ) -> SyncResult<MessagePage> {
        self.message_fetches.lock().push((thread_id, page));
        let delay = self.message_delays.lock().get(&thread_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_threads.lock().contains(&thread_id) {
            return Err(refused());
        }
        let messages = self
            .messages
            .lock()
            .get(&thread_id)
            .cloned()
            .unwrap_or_default();
        let (slice, pagination) = paginate(&messages, page, page_size);
        Ok(MessagePage {
            success: true,
            message: None,
            messages: slice.into_iter().map(|m| Lenient(Ok(m))).collect(),
            pagination,
        })
    }

    async fn send_message(&self, request: SendMessageRequest) -> SyncResult<MessageRecord> {
        let id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().push(request.clone());
        if self.hold_sends.load(Ordering::SeqCst) {
            self.send_started.notify_one();
            self.release_sends.notified().await;
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(refused());
        }
        let record = MessageRecord {
            id,
            question_id: request.question_id,
            sender_id: self.user_id,
            content: request.content,
            message_type: request.message_type,
            created_at: Some(now_millis()),
            is_read: false,
        };
        self.messages
            .lock()
            .entry(record.question_id)
            .or_default()
            .push(record.clone());
        Ok(record)
    }

    async fn accept_thread(&self, thread_id: i64) -> SyncResult<()> {
        self.status_change("accept", thread_id, ThreadStatus::Active)
            .await
    }

    async fn close_thread(&self, thread_id: i64) -> SyncResult<()> {
        self.status_change("close", thread_id, ThreadStatus::Closed)
            .await
    }

    async fn mark_read(&self, _thread_id: i64) -> SyncResult<()> {
        self.mark_read_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.mark_read_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.mark_read_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(refused());
        }
        Ok(())
    }

    async fn create_thread(&self, request: CreateThreadRequest) -> SyncResult<ThreadRecord> {
        self.created.lock().push(request.clone());
        let id = 900 + self.created.lock().len() as i64;
        let record = ThreadRecord {
            id,
            user_id: self.user_id,
            tutor_id: None,
            content: request.content,
            image_paths: None,
            status: ThreadStatus::Pending,
            created_at: now_millis(),
            updated_at: None,
        };
        self.threads.lock().push(record.clone());
        Ok(record)
    }

    async fn upload_image(&self, path: &Path) -> SyncResult<String> {
        self.uploads.lock().push(path.to_path_buf());
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(format!("/uploads/{name}"))
    }
}

/// Server side of one scripted channel.
pub struct RemoteEnd {
    pub to_client: mpsc::UnboundedSender<String>,
    pub from_client: mpsc::UnboundedReceiver<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectScript {
    Accept,
    Refuse,
}

/// Connector that follows a script and then falls back to a default outcome.
pub struct FakeConnector {
    script: Mutex<VecDeque<ConnectScript>>,
    fallback: ConnectScript,
    attempts: Mutex<Vec<Instant>>,
    remotes: Mutex<VecDeque<RemoteEnd>>,
}

impl FakeConnector {
    pub fn new(fallback: ConnectScript) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            attempts: Mutex::new(Vec::new()),
            remotes: Mutex::new(VecDeque::new()),
        })
    }

    pub fn script(self: &Arc<Self>, steps: impl IntoIterator<Item = ConnectScript>) -> Arc<Self> {
        self.script.lock().extend(steps);
        self.clone()
    }

    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().clone()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().len()
    }

    pub async fn next_remote(&self) -> RemoteEnd {
        loop {
            if let Some(remote) = self.remotes.lock().pop_front() {
                return remote;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl LiveConnector for FakeConnector {
    async fn connect(&self) -> SyncResult<LiveChannel> {
        self.attempts.lock().push(Instant::now());
        let step = self.script.lock().pop_front().unwrap_or(self.fallback);
        match step {
            ConnectScript::Refuse => Err(refused()),
            ConnectScript::Accept => {
                let (out_tx, out_rx) = mpsc::unbounded_channel();
                let (in_tx, in_rx) = mpsc::unbounded_channel();
                self.remotes.lock().push_back(RemoteEnd {
                    to_client: in_tx,
                    from_client: out_rx,
                });
                Ok(LiveChannel::new(out_tx, in_rx))
            }
        }
    }
}

/// Every engine component wired over a fresh cache and a [`FakeApi`].
pub struct Harness {
    pub cache: Arc<MemoryCache>,
    pub api: Arc<FakeApi>,
    pub writer: CacheWriter,
    pub locks: EntityLocks,
    pub pending: PendingSends,
    pub identity: Identity,
    pub outbox: OutboundTracker,
    pub push: PushApplier,
    pub reconciler: Reconciler,
    pub mutations: MutationCoordinator,
}

pub fn reconcile_settings() -> ReconcileSettings {
    ReconcileSettings {
        message_page_size: 50,
        max_message_pages: 100,
        retry_failed_threads_on_refresh: true,
    }
}

impl Harness {
    pub fn new(identity: Identity) -> Self {
        Self::with_settings(identity, reconcile_settings())
    }

    pub fn with_settings(identity: Identity, settings: ReconcileSettings) -> Self {
        let cache = MemoryCache::new();
        let api = FakeApi::new(identity.user_id);
        let writer = CacheWriter::spawn(cache.clone());
        let locks = EntityLocks::new();
        let pending = PendingSends::new();
        let outbox = OutboundTracker::new(writer.clone(), 3);
        let push = PushApplier::new(
            writer.clone(),
            locks.clone(),
            pending.clone(),
            outbox.clone(),
            identity,
        );
        let reconciler = Reconciler::new(
            api.clone(),
            writer.clone(),
            locks.clone(),
            pending.clone(),
            identity,
            settings,
        );
        let mutations = MutationCoordinator::new(
            api.clone(),
            writer.clone(),
            locks.clone(),
            pending.clone(),
            identity,
            RetryPolicy::default(),
        );
        Self {
            cache,
            api,
            writer,
            locks,
            pending,
            identity,
            outbox,
            push,
            reconciler,
            mutations,
        }
    }
}

/// Polls `check` until it holds, sleeping between tries.
pub async fn eventually<F: FnMut() -> bool>(what: &str, mut check: F) {
    for _ in 0..1_000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held: {what}");
}

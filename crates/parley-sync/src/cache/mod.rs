//! Local durable cache.
//!
//! The engine only needs a keyed table with insert-or-replace, delete and a
//! change feed, so the storage engine is a collaborator behind
//! [`DurableCache`]. [`MemoryCache`] is the in-process adapter used by the
//! agent and the tests.
//!
//! Two rules hold for every implementation:
//! - updating or deleting a thread never cascades to its messages; callers
//!   remove messages explicitly;
//! - [`DurableCache::replace_message`] swaps a placeholder for its confirmed
//!   row in one step, so no reader observes both or neither.

mod memory;

pub use memory::MemoryCache;

use parley_proto::{MessageKind, MessageRecord, ThreadRecord, ThreadStatus};
use thiserror::Error;
use tokio::sync::broadcast;

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("thread {0} does not exist")]
    MissingThread(i64),
    #[error("message {0} does not exist")]
    MissingMessage(i64),
    #[error("invalid record: {0}")]
    Invalid(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thread {
    pub id: i64,
    pub owner_id: i64,
    pub assignee_id: Option<i64>,
    pub content: String,
    pub attachments: Vec<String>,
    pub status: ThreadStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Thread {
    pub fn from_record(record: ThreadRecord) -> Self {
        Self {
            id: record.id,
            owner_id: record.user_id,
            assignee_id: record.tutor_id,
            content: record.content,
            attachments: record.image_paths.unwrap_or_default(),
            status: record.status,
            created_at: record.created_at,
            updated_at: record.updated_at.unwrap_or(record.created_at),
        }
    }

    /// Applies a server record on top of the cached row. Attachments are kept
    /// when the payload does not mention them.
    pub fn merge_record(&mut self, record: ThreadRecord) {
        self.owner_id = record.user_id;
        self.assignee_id = record.tutor_id;
        self.content = record.content;
        if let Some(paths) = record.image_paths {
            self.attachments = paths;
        }
        self.status = record.status;
        self.created_at = record.created_at;
        self.updated_at = record.updated_at.unwrap_or(record.created_at);
    }

    pub fn in_scope(&self, scope: PartitionScope) -> bool {
        match scope {
            PartitionScope::OwnedBy(user) => self.owner_id == user,
            PartitionScope::AssignedTo(user) => self.assignee_id == Some(user),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Server id, or a negative placeholder while the send is unconfirmed.
    pub id: i64,
    pub thread_id: i64,
    pub sender_id: i64,
    pub content: String,
    pub kind: MessageKind,
    pub created_at: i64,
    pub read: bool,
    pub delivery: DeliveryStatus,
}

impl Message {
    pub fn is_placeholder(&self) -> bool {
        self.id < 0
    }

    /// Converts a confirmed server record. `fallback_created_at` fills a missing timestamp.
    pub fn from_record(record: MessageRecord, fallback_created_at: i64) -> Self {
        Self {
            id: record.id,
            thread_id: record.question_id,
            sender_id: record.sender_id,
            content: record.content,
            kind: record.message_type,
            created_at: record.created_at.unwrap_or(fallback_created_at),
            read: record.is_read,
            delivery: DeliveryStatus::Sent,
        }
    }
}

/// Row of the durable outbox: a live-channel envelope waiting for delivery or ack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOutbound {
    pub id: u64,
    pub thread_id: Option<i64>,
    pub kind: String,
    pub payload: String,
    pub retry_count: u32,
    pub created_at: i64,
    pub correlation_id: String,
}

/// The slice of threads a user sees: their own as asker, or the ones
/// assigned to them as responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionScope {
    OwnedBy(i64),
    AssignedTo(i64),
}

/// Notification published after every committed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheChange {
    ThreadUpserted(i64),
    ThreadDeleted(i64),
    MessageUpserted { thread_id: i64, message_id: i64 },
    MessageDeleted { thread_id: i64, message_id: i64 },
    OutboxChanged,
}

impl CacheChange {
    pub fn thread_id(&self) -> Option<i64> {
        match self {
            CacheChange::ThreadUpserted(id) | CacheChange::ThreadDeleted(id) => Some(*id),
            CacheChange::MessageUpserted { thread_id, .. }
            | CacheChange::MessageDeleted { thread_id, .. } => Some(*thread_id),
            CacheChange::OutboxChanged => None,
        }
    }
}

pub trait DurableCache: Send + Sync {
    fn thread(&self, id: i64) -> Option<Thread>;

    /// Threads visible in `scope`, optionally narrowed to one status, newest first.
    fn threads(&self, scope: Option<PartitionScope>, status: Option<ThreadStatus>) -> Vec<Thread>;

    /// Inserts a new thread or replaces an existing row.
    fn insert_thread(&self, thread: Thread) -> CacheResult<()>;

    /// Replaces an existing row in place. Fails when the row is absent.
    fn update_thread(&self, thread: Thread) -> CacheResult<()>;

    /// Removes thread rows only. Returns how many existed.
    fn delete_threads(&self, ids: &[i64]) -> CacheResult<usize>;

    fn message(&self, id: i64) -> Option<Message>;

    /// Messages of one thread ordered by creation time.
    fn messages_for_thread(&self, thread_id: i64) -> Vec<Message>;

    /// Inserts or replaces message rows. Every message must belong to a cached thread.
    fn upsert_messages(&self, messages: Vec<Message>) -> CacheResult<()>;

    /// Deletes `old_id` and inserts `replacement` as one operation.
    fn replace_message(&self, old_id: i64, replacement: Message) -> CacheResult<()>;

    fn delete_message(&self, id: i64) -> CacheResult<bool>;

    fn delete_messages(&self, ids: &[i64]) -> CacheResult<usize>;

    fn delete_messages_for_threads(&self, thread_ids: &[i64]) -> CacheResult<usize>;

    fn set_delivery_status(&self, id: i64, status: DeliveryStatus) -> CacheResult<()>;

    /// Marks every message in the thread not sent by `reader_id` as read.
    fn mark_thread_read(&self, thread_id: i64, reader_id: i64) -> CacheResult<usize>;

    fn unread_count(&self, thread_id: i64, reader_id: i64) -> usize;

    fn enqueue_outbound(
        &self,
        thread_id: Option<i64>,
        kind: &str,
        payload: String,
        correlation_id: String,
        created_at: i64,
    ) -> CacheResult<u64>;

    /// Outbox rows in insertion order.
    fn outbound(&self) -> Vec<PendingOutbound>;

    fn bump_outbound_retry(&self, id: u64) -> CacheResult<u32>;

    fn delete_outbound(&self, id: u64) -> CacheResult<bool>;

    fn delete_outbound_by_correlation(&self, correlation_id: &str) -> CacheResult<bool>;

    fn subscribe(&self) -> broadcast::Receiver<CacheChange>;
}

//! Optimistic local mutations.
//!
//! Every user action is applied to the cache first and then confirmed with
//! the server. Sends show up immediately as a pending placeholder row; status
//! changes are applied in place and rolled back if the server refuses them.

use crate::api::SyncApi;
use crate::backoff::{retry_with_backoff, RetryPolicy};
use crate::cache::{DeliveryStatus, Message, Thread};
use crate::error::{SyncError, SyncResult};
use crate::locks::EntityLocks;
use crate::pending::PendingSends;
use crate::worker::CacheWriter;
use crate::Identity;
use parking_lot::Mutex;
use parley_proto::{now_millis, CreateThreadRequest, MessageKind, SendMessageRequest, ThreadStatus};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// User actions that may not run twice at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationClass {
    Send,
    Accept,
    Close,
    Upload,
    Publish,
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationClass::Send => "sending a message",
            OperationClass::Accept => "accepting a thread",
            OperationClass::Close => "closing a thread",
            OperationClass::Upload => "uploading an image",
            OperationClass::Publish => "publishing a thread",
        })
    }
}

/// Source of placeholder ids for unconfirmed messages.
///
/// Seeded at the negated wall clock and strictly decreasing, so ids never
/// collide with server ids (always positive) or with each other.
#[derive(Debug)]
pub struct PlaceholderIds {
    next: AtomicI64,
}

impl PlaceholderIds {
    pub fn new() -> Self {
        Self::starting_at(-now_millis())
    }

    pub fn starting_at(seed: i64) -> Self {
        Self {
            next: AtomicI64::new(seed.min(-1)),
        }
    }

    pub fn next(&self) -> i64 {
        self.next.fetch_sub(1, Ordering::Relaxed)
    }
}

impl Default for PlaceholderIds {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds an operation class busy until dropped.
struct InFlight {
    busy: Arc<Mutex<HashSet<OperationClass>>>,
    class: OperationClass,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.busy.lock().remove(&self.class);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkReadReport {
    pub marked: usize,
    /// Whether the server acknowledged the read within the retry budget.
    pub confirmed: bool,
}

#[derive(Clone)]
pub struct MutationCoordinator {
    api: Arc<dyn SyncApi>,
    writer: CacheWriter,
    locks: EntityLocks,
    pending: PendingSends,
    identity: Identity,
    placeholders: Arc<PlaceholderIds>,
    busy: Arc<Mutex<HashSet<OperationClass>>>,
    retry: RetryPolicy,
}

impl MutationCoordinator {
    pub fn new(
        api: Arc<dyn SyncApi>,
        writer: CacheWriter,
        locks: EntityLocks,
        pending: PendingSends,
        identity: Identity,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            api,
            writer,
            locks,
            pending,
            identity,
            placeholders: Arc::new(PlaceholderIds::new()),
            busy: Arc::new(Mutex::new(HashSet::new())),
            retry,
        }
    }

    /// Replaces the placeholder source; tests use a fixed seed.
    pub fn with_placeholders(mut self, placeholders: PlaceholderIds) -> Self {
        self.placeholders = Arc::new(placeholders);
        self
    }

    fn begin(&self, class: OperationClass) -> SyncResult<InFlight> {
        if !self.busy.lock().insert(class) {
            debug!(target = "parley::mutation", %class, "rejecting duplicate operation");
            return Err(SyncError::Busy(class));
        }
        Ok(InFlight {
            busy: self.busy.clone(),
            class,
        })
    }

    pub fn is_busy(&self, class: OperationClass) -> bool {
        self.busy.lock().contains(&class)
    }

    /// Sends a message optimistically. The returned row is the confirmed server copy.
    pub async fn send_message(
        &self,
        thread_id: i64,
        content: &str,
        kind: MessageKind,
    ) -> SyncResult<Message> {
        let _busy = self.begin(OperationClass::Send)?;
        if self.writer.cache().thread(thread_id).is_none() {
            return Err(SyncError::ThreadNotFound(thread_id));
        }
        let placeholder = Message {
            id: self.placeholders.next(),
            thread_id,
            sender_id: self.identity.user_id,
            content: content.to_string(),
            kind,
            created_at: now_millis(),
            read: true,
            delivery: DeliveryStatus::Pending,
        };
        {
            let _guard = self.locks.messages(thread_id).await;
            self.pending
                .register(placeholder.id, thread_id, &placeholder.content, kind);
            let row = placeholder.clone();
            if let Err(err) = self
                .writer
                .write(move |cache| Ok(cache.upsert_messages(vec![row])?))
                .await
            {
                self.pending.finish(placeholder.id);
                return Err(err);
            }
        }
        debug!(
            target = "parley::mutation",
            thread_id,
            placeholder = placeholder.id,
            "placeholder inserted"
        );
        self.confirm_send(placeholder).await
    }

    /// Re-sends a failed placeholder under the same id.
    pub async fn retry_message(&self, placeholder_id: i64) -> SyncResult<Message> {
        let _busy = self.begin(OperationClass::Send)?;
        let message = self.failed_placeholder(placeholder_id)?;
        {
            let _guard = self.locks.messages(message.thread_id).await;
            // Re-check under the lock; a discard may have raced us.
            self.failed_placeholder(placeholder_id)?;
            self.pending
                .register(placeholder_id, message.thread_id, &message.content, message.kind);
            self.writer
                .write(move |cache| {
                    Ok(cache.set_delivery_status(placeholder_id, DeliveryStatus::Pending)?)
                })
                .await?;
        }
        info!(target = "parley::mutation", placeholder = placeholder_id, "retrying failed send");
        self.confirm_send(message).await
    }

    /// Deletes a failed placeholder the user gave up on.
    pub async fn discard_message(&self, placeholder_id: i64) -> SyncResult<()> {
        let message = self.failed_placeholder(placeholder_id)?;
        let _guard = self.locks.messages(message.thread_id).await;
        self.failed_placeholder(placeholder_id)?;
        self.writer
            .write(move |cache| Ok(cache.delete_message(placeholder_id)?))
            .await?;
        debug!(target = "parley::mutation", placeholder = placeholder_id, "failed message discarded");
        Ok(())
    }

    fn failed_placeholder(&self, placeholder_id: i64) -> SyncResult<Message> {
        let message = self
            .writer
            .cache()
            .message(placeholder_id)
            .ok_or(SyncError::MessageNotFound(placeholder_id))?;
        if !message.is_placeholder() || message.delivery != DeliveryStatus::Failed {
            return Err(SyncError::NotRetryable(placeholder_id));
        }
        Ok(message)
    }

    async fn confirm_send(&self, placeholder: Message) -> SyncResult<Message> {
        let thread_id = placeholder.thread_id;
        let placeholder_id = placeholder.id;
        let request = SendMessageRequest {
            question_id: thread_id,
            content: placeholder.content.clone(),
            message_type: placeholder.kind,
        };

        match self.api.send_message(request).await {
            Ok(record) => {
                let mut confirmed = Message::from_record(record, placeholder.created_at);
                confirmed.read = true;
                {
                    let _guard = self.locks.messages(thread_id).await;
                    let claimed = self.pending.finish(placeholder_id);
                    let row = confirmed.clone();
                    self.writer
                        .write(move |cache| {
                            match claimed {
                                // A push or pull already swapped the placeholder out.
                                Some(_) => cache.upsert_messages(vec![row])?,
                                None => cache.replace_message(placeholder_id, row)?,
                            }
                            Ok(())
                        })
                        .await?;
                }
                self.touch_thread(thread_id, confirmed.created_at).await?;
                metrics::counter!("parley_messages_sent_total", 1);
                debug!(
                    target = "parley::mutation",
                    thread_id,
                    placeholder = placeholder_id,
                    message_id = confirmed.id,
                    "send confirmed"
                );
                Ok(confirmed)
            }
            Err(err) => {
                let _guard = self.locks.messages(thread_id).await;
                if let Some(server_id) = self.pending.finish(placeholder_id) {
                    // The server copy already arrived, so the send did land.
                    warn!(
                        target = "parley::mutation",
                        thread_id,
                        message_id = server_id,
                        error = %err,
                        "send confirmation failed after the server echoed the message"
                    );
                    return self
                        .writer
                        .cache()
                        .message(server_id)
                        .ok_or(SyncError::MessageNotFound(server_id));
                }
                if let Err(mark_err) = self
                    .writer
                    .write(move |cache| {
                        Ok(cache.set_delivery_status(placeholder_id, DeliveryStatus::Failed)?)
                    })
                    .await
                {
                    warn!(
                        target = "parley::mutation",
                        placeholder = placeholder_id,
                        error = %mark_err,
                        "could not mark placeholder failed"
                    );
                }
                metrics::counter!("parley_send_failures_total", 1, "reason" => err.metric_label());
                warn!(
                    target = "parley::mutation",
                    thread_id,
                    placeholder = placeholder_id,
                    error = %err,
                    "send failed"
                );
                Err(err)
            }
        }
    }

    async fn touch_thread(&self, thread_id: i64, updated_at: i64) -> SyncResult<()> {
        let _guard = self.locks.thread(thread_id).await;
        self.writer
            .write(move |cache| {
                if let Some(mut thread) = cache.thread(thread_id) {
                    if thread.updated_at < updated_at {
                        thread.updated_at = updated_at;
                        cache.update_thread(thread)?;
                    }
                }
                Ok(())
            })
            .await
    }

    /// Uploads an image and posts it to the thread as an image message.
    pub async fn send_attachment(&self, thread_id: i64, file: &Path) -> SyncResult<Message> {
        let server_path = {
            let _busy = self.begin(OperationClass::Upload)?;
            self.api.upload_image(file).await?
        };
        self.send_message(thread_id, &server_path, MessageKind::Image)
            .await
    }

    pub async fn accept_thread(&self, thread_id: i64) -> SyncResult<Thread> {
        self.set_thread_status(thread_id, ThreadStatus::Active, Some(self.identity.user_id))
            .await
    }

    pub async fn close_thread(&self, thread_id: i64) -> SyncResult<Thread> {
        self.set_thread_status(thread_id, ThreadStatus::Closed, None)
            .await
    }

    /// Moves a thread forward optimistically and confirms with the server.
    ///
    /// On failure the previous row is restored, but only if nothing else has
    /// written the thread since the optimistic update.
    pub async fn set_thread_status(
        &self,
        thread_id: i64,
        status: ThreadStatus,
        assignee_id: Option<i64>,
    ) -> SyncResult<Thread> {
        let class = match status {
            ThreadStatus::Closed => OperationClass::Close,
            _ => OperationClass::Accept,
        };
        let _busy = self.begin(class)?;

        let (snapshot, optimistic) = {
            let _guard = self.locks.thread(thread_id).await;
            let snapshot = self
                .writer
                .cache()
                .thread(thread_id)
                .ok_or(SyncError::ThreadNotFound(thread_id))?;
            if !snapshot.status.can_advance_to(status) {
                return Err(SyncError::InvalidTransition {
                    thread_id,
                    from: snapshot.status,
                    to: status,
                });
            }
            let mut optimistic = snapshot.clone();
            optimistic.status = status;
            if assignee_id.is_some() {
                optimistic.assignee_id = assignee_id;
            }
            // An active thread always has someone answering it.
            if optimistic.status == ThreadStatus::Active && optimistic.assignee_id.is_none() {
                optimistic.assignee_id = Some(self.identity.user_id);
            }
            optimistic.updated_at = now_millis().max(snapshot.updated_at + 1);
            let row = optimistic.clone();
            self.writer
                .write(move |cache| Ok(cache.update_thread(row)?))
                .await?;
            (snapshot, optimistic)
        };

        let outcome = match status {
            ThreadStatus::Closed => self.api.close_thread(thread_id).await,
            _ => self.api.accept_thread(thread_id).await,
        };
        match outcome {
            Ok(()) => {
                info!(
                    target = "parley::mutation",
                    thread_id,
                    status = status.as_str(),
                    "status change confirmed"
                );
                Ok(optimistic)
            }
            Err(err) => {
                let _guard = self.locks.thread(thread_id).await;
                let expected = optimistic;
                let restored = self
                    .writer
                    .write(move |cache| {
                        match cache.thread(thread_id) {
                            Some(current) if current == expected => {
                                cache.update_thread(snapshot)?;
                                Ok(true)
                            }
                            _ => Ok(false),
                        }
                    })
                    .await?;
                if restored {
                    metrics::counter!("parley_rollbacks_total", 1);
                    warn!(
                        target = "parley::mutation",
                        thread_id,
                        status = status.as_str(),
                        error = %err,
                        "status change rejected; rolled back"
                    );
                } else {
                    warn!(
                        target = "parley::mutation",
                        thread_id,
                        error = %err,
                        "status change rejected; row changed meanwhile, keeping newer state"
                    );
                }
                Err(err)
            }
        }
    }

    /// Marks the thread read locally, then tells the server with retries.
    /// A server that never confirms leaves local state read.
    pub async fn mark_read(&self, thread_id: i64) -> SyncResult<MarkReadReport> {
        let reader = self.identity.user_id;
        let marked = {
            let _guard = self.locks.messages(thread_id).await;
            self.writer
                .write(move |cache| Ok(cache.mark_thread_read(thread_id, reader)?))
                .await?
        };

        let api = self.api.clone();
        let confirmed = match retry_with_backoff(
            self.retry,
            "mark_read",
            SyncError::is_retryable,
            |_| {
                let api = api.clone();
                async move { api.mark_read(thread_id).await }
            },
        )
        .await
        {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    target = "parley::mutation",
                    thread_id,
                    error = %err,
                    "server did not confirm read; local state kept"
                );
                false
            }
        };
        Ok(MarkReadReport { marked, confirmed })
    }

    /// Uploads each file in order, then publishes the thread and caches it.
    pub async fn create_thread(&self, content: &str, files: &[PathBuf]) -> SyncResult<Thread> {
        let _busy = self.begin(OperationClass::Publish)?;
        let mut image_paths = Vec::with_capacity(files.len());
        for file in files {
            image_paths.push(self.api.upload_image(file).await?);
        }
        let record = self
            .api
            .create_thread(CreateThreadRequest {
                content: content.to_string(),
                image_paths: image_paths.clone(),
            })
            .await?;
        let mut thread = Thread::from_record(record);
        if thread.attachments.is_empty() {
            thread.attachments = image_paths;
        }
        let row = thread.clone();
        let _guard = self.locks.thread(thread.id).await;
        self.writer
            .write(move |cache| Ok(cache.insert_thread(row)?))
            .await?;
        info!(target = "parley::mutation", thread_id = thread.id, "thread published");
        Ok(thread)
    }

    pub fn unread_count(&self, thread_id: i64) -> usize {
        self.writer
            .cache()
            .unread_count(thread_id, self.identity.user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_negative_and_strictly_decreasing() {
        let ids = PlaceholderIds::new();
        let first = ids.next();
        let second = ids.next();
        let third = ids.next();
        assert!(first < 0);
        assert!(second < first);
        assert!(third < second);
    }

    #[test]
    fn placeholder_seed_is_clamped_below_zero() {
        let ids = PlaceholderIds::starting_at(5);
        assert_eq!(ids.next(), -1);
        assert_eq!(ids.next(), -2);
    }

    #[test]
    fn operation_names_read_as_sentences() {
        assert_eq!(
            SyncError::Busy(OperationClass::Send).user_message(),
            "Already sending a message. Please wait."
        );
    }
}

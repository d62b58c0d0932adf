//! Pull-side reconciliation and push-side event application.
//!
//! Both paths merge server state into the cache with the same rules:
//! thread rows are updated in place (attachments survive payloads that omit
//! them), messages from the server are stored as sent, and a server copy of
//! the user's own in-flight send replaces its placeholder in one write.

mod push;

pub use push::PushApplier;

use crate::api::SyncApi;
use crate::cache::{DurableCache, Message, Thread};
use crate::error::{SyncError, SyncResult};
use crate::locks::EntityLocks;
use crate::pending::PendingSends;
use crate::worker::CacheWriter;
use crate::Identity;
use futures::future::join_all;
use parking_lot::Mutex;
use parley_proto::{now_millis, ThreadRecord, ThreadStatus};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// First page replaces the local view: threads missing from it are deleted.
    Refresh,
    /// Later pages only add or update.
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
    pub status: Option<ThreadStatus>,
    pub mode: SyncMode,
}

impl PageRequest {
    pub fn refresh(page_size: u32) -> Self {
        Self {
            page: 1,
            page_size,
            status: None,
            mode: SyncMode::Refresh,
        }
    }

    pub fn append(page: u32, page_size: u32) -> Self {
        Self {
            page,
            page_size,
            status: None,
            mode: SyncMode::Append,
        }
    }

    pub fn with_status(mut self, status: ThreadStatus) -> Self {
        self.status = Some(status);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageReport {
    pub threads_synced: usize,
    pub threads_deleted: usize,
    pub records_skipped: usize,
    pub has_more: bool,
    pub total_pages: u32,
    /// Threads whose message history could not be synced, with the reason.
    pub failed_threads: Vec<(i64, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadSyncReport {
    pub thread_id: i64,
    pub messages_synced: usize,
    pub messages_deleted: usize,
    pub pages: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcileSettings {
    pub message_page_size: u32,
    pub max_message_pages: u32,
    pub retry_failed_threads_on_refresh: bool,
}

impl ReconcileSettings {
    pub fn from_config(config: &crate::config::SyncConfig) -> Self {
        Self {
            message_page_size: config.message_page_size,
            max_message_pages: config.max_message_pages,
            retry_failed_threads_on_refresh: config.retry_failed_threads_on_refresh,
        }
    }
}

#[derive(Clone)]
pub struct Reconciler {
    api: Arc<dyn SyncApi>,
    writer: CacheWriter,
    locks: EntityLocks,
    pending: PendingSends,
    identity: Identity,
    settings: ReconcileSettings,
    failed: Arc<Mutex<BTreeSet<i64>>>,
}

impl Reconciler {
    pub fn new(
        api: Arc<dyn SyncApi>,
        writer: CacheWriter,
        locks: EntityLocks,
        pending: PendingSends,
        identity: Identity,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            api,
            writer,
            locks,
            pending,
            identity,
            settings,
            failed: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Threads whose last message sync failed.
    pub fn failed_threads(&self) -> Vec<i64> {
        self.failed.lock().iter().copied().collect()
    }

    /// Pulls one page of threads, merges it, and syncs every returned
    /// thread's full message history concurrently.
    ///
    /// Only a failure to fetch the page itself is an error. Per-thread
    /// message failures are logged and listed in the report.
    pub async fn sync_page(&self, request: PageRequest) -> SyncResult<PageReport> {
        let page = match self
            .api
            .fetch_threads(request.page, request.page_size, request.status)
            .await
        {
            Ok(page) => page,
            Err(err) => {
                metrics::counter!("parley_sync_failures_total", 1, "reason" => err.metric_label());
                warn!(
                    target = "parley::reconcile",
                    page = request.page,
                    error = %err,
                    "thread page fetch failed"
                );
                return Err(err);
            }
        };
        let has_more = page.pagination.has_more;
        let total_pages = page.pagination.total_pages;
        let (records, skipped) = page.into_records();
        for reason in &skipped {
            warn!(target = "parley::reconcile", %reason, "skipping malformed thread record");
        }

        let returned: Vec<i64> = records.iter().map(|r| r.id).collect();
        for record in records {
            self.merge_thread(record).await?;
        }

        let mut deleted = 0;
        if request.mode == SyncMode::Refresh && request.page == 1 {
            deleted = self.delete_stale_threads(&returned, request.status).await?;
        }

        let mut targets: Vec<i64> = returned.clone();
        if request.mode == SyncMode::Refresh && self.settings.retry_failed_threads_on_refresh {
            let cache = self.writer.cache();
            let carried: Vec<i64> = self
                .failed_threads()
                .into_iter()
                .filter(|id| !returned.contains(id) && cache.thread(*id).is_some())
                .collect();
            if !carried.is_empty() {
                debug!(
                    target = "parley::reconcile",
                    count = carried.len(),
                    "retrying threads that failed last time"
                );
            }
            targets.extend(carried);
        }

        let outcomes = join_all(targets.iter().map(|id| self.sync_thread(*id))).await;

        let mut failed_threads = Vec::new();
        {
            let mut failed = self.failed.lock();
            for (thread_id, outcome) in targets.iter().zip(outcomes) {
                match outcome {
                    Ok(_) => {
                        failed.remove(thread_id);
                    }
                    Err(err) => {
                        warn!(
                            target = "parley::reconcile",
                            thread_id,
                            error = %err,
                            "message sync failed for thread"
                        );
                        metrics::counter!("parley_thread_sync_failures_total", 1);
                        failed.insert(*thread_id);
                        failed_threads.push((*thread_id, err.to_string()));
                    }
                }
            }
        }

        let report = PageReport {
            threads_synced: returned.len(),
            threads_deleted: deleted,
            records_skipped: skipped.len(),
            has_more,
            total_pages,
            failed_threads,
        };
        info!(
            target = "parley::reconcile",
            page = request.page,
            synced = report.threads_synced,
            deleted = report.threads_deleted,
            failed = report.failed_threads.len(),
            has_more,
            "thread page reconciled"
        );
        Ok(report)
    }

    async fn merge_thread(&self, record: ThreadRecord) -> SyncResult<()> {
        let thread_id = record.id;
        let _guard = self.locks.thread(thread_id).await;
        self.writer
            .write(move |cache| {
                match cache.thread(thread_id) {
                    Some(mut existing) => {
                        existing.merge_record(record);
                        cache.update_thread(existing)?;
                    }
                    None => cache.insert_thread(Thread::from_record(record))?,
                }
                Ok(())
            })
            .await
    }

    async fn delete_stale_threads(
        &self,
        returned: &[i64],
        status: Option<ThreadStatus>,
    ) -> SyncResult<usize> {
        let scope = self.identity.scope();
        let stale = stale_thread_ids(
            self.writer
                .cache()
                .threads(Some(scope), status)
                .into_iter()
                .map(|t| t.id),
            returned,
        );
        if stale.is_empty() {
            return Ok(0);
        }

        // Ascending id order so overlapping refreshes cannot deadlock.
        let mut guards = Vec::with_capacity(stale.len() * 2);
        for id in &stale {
            guards.push(self.locks.thread(*id).await);
            guards.push(self.locks.messages(*id).await);
        }
        let doomed = stale.clone();
        let removed = self
            .writer
            .write(move |cache| {
                cache.delete_messages_for_threads(&doomed)?;
                Ok(cache.delete_threads(&doomed)?)
            })
            .await?;
        drop(guards);
        self.failed.lock().retain(|id| !stale.contains(id));
        info!(target = "parley::reconcile", count = removed, ?stale, "deleted threads no longer on server");
        Ok(removed)
    }

    /// Fetches every message page of one thread, stores each page as it
    /// arrives, then deletes cached server messages the server no longer has.
    /// Placeholders are never touched here.
    pub async fn sync_thread(&self, thread_id: i64) -> SyncResult<ThreadSyncReport> {
        let mut report = ThreadSyncReport {
            thread_id,
            ..ThreadSyncReport::default()
        };
        let mut seen: HashSet<i64> = HashSet::new();
        let mut page = 1;
        let complete = loop {
            let body = self
                .api
                .fetch_messages(thread_id, page, self.settings.message_page_size)
                .await?;
            let has_more = body.pagination.has_more;
            let (records, skipped) = body.into_records();
            for reason in &skipped {
                warn!(target = "parley::reconcile", thread_id, %reason, "skipping malformed message record");
            }
            let now = now_millis();
            let messages: Vec<Message> = records
                .into_iter()
                .filter(|record| {
                    let belongs = record.question_id == thread_id;
                    if !belongs {
                        warn!(
                            target = "parley::reconcile",
                            thread_id,
                            message_id = record.id,
                            "message listed under the wrong thread"
                        );
                    }
                    belongs
                })
                .map(|record| Message::from_record(record, now))
                .collect();
            seen.extend(messages.iter().map(|m| m.id));
            report.messages_synced += messages.len();
            report.pages += 1;
            self.store_messages(thread_id, messages).await?;

            if !has_more {
                break true;
            }
            if report.pages >= self.settings.max_message_pages {
                warn!(
                    target = "parley::reconcile",
                    thread_id,
                    pages = report.pages,
                    "message page limit reached; skipping stale cleanup"
                );
                break false;
            }
            page += 1;
        };

        if complete {
            let _guard = self.locks.messages(thread_id).await;
            report.messages_deleted = self
                .writer
                .write(move |cache| {
                    let stale: Vec<i64> = cache
                        .messages_for_thread(thread_id)
                        .into_iter()
                        .filter(|m| !m.is_placeholder() && !seen.contains(&m.id))
                        .map(|m| m.id)
                        .collect();
                    Ok(cache.delete_messages(&stale)?)
                })
                .await?;
        }
        debug!(
            target = "parley::reconcile",
            thread_id,
            messages = report.messages_synced,
            deleted = report.messages_deleted,
            pages = report.pages,
            "thread messages reconciled"
        );
        Ok(report)
    }

    async fn store_messages(&self, thread_id: i64, messages: Vec<Message>) -> SyncResult<usize> {
        let _guard = self.locks.messages(thread_id).await;
        let pending = self.pending.clone();
        let user_id = self.identity.user_id;
        self.writer
            .write(move |cache| store_server_messages(cache, &pending, user_id, thread_id, messages))
            .await
    }
}

/// Cached ids missing from the server page, sorted and deduplicated.
fn stale_thread_ids(cached: impl IntoIterator<Item = i64>, returned: &[i64]) -> Vec<i64> {
    let mut stale: Vec<i64> = cached
        .into_iter()
        .filter(|id| !returned.contains(id))
        .collect();
    stale.sort_unstable();
    stale.dedup();
    stale
}

/// Stores confirmed server messages for one thread. A server copy of the
/// user's own in-flight send replaces that send's placeholder.
pub(crate) fn store_server_messages(
    cache: &dyn DurableCache,
    pending: &PendingSends,
    user_id: i64,
    thread_id: i64,
    messages: Vec<Message>,
) -> SyncResult<usize> {
    if cache.thread(thread_id).is_none() {
        return Err(SyncError::ThreadNotFound(thread_id));
    }
    let count = messages.len();
    let mut plain = Vec::with_capacity(count);
    for mut message in messages {
        if message.sender_id == user_id && cache.message(message.id).is_none() {
            if let Some(placeholder) =
                pending.claim(thread_id, &message.content, message.kind, message.id)
            {
                message.read = true;
                debug!(
                    target = "parley::reconcile",
                    placeholder,
                    message_id = message.id,
                    "server copy replaced in-flight placeholder"
                );
                cache.replace_message(placeholder, message)?;
                continue;
            }
        }
        plain.push(message);
    }
    if !plain.is_empty() {
        cache.upsert_messages(plain)?;
    }
    Ok(count)
}

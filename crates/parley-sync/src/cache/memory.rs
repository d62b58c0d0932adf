use super::{
    CacheChange, CacheError, CacheResult, DeliveryStatus, DurableCache, Message, PartitionScope,
    PendingOutbound, Thread,
};
use parking_lot::RwLock;
use parley_proto::ThreadStatus;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;

const CHANGE_CAPACITY: usize = 1024;

#[derive(Default)]
struct Tables {
    threads: BTreeMap<i64, Thread>,
    messages: BTreeMap<i64, Message>,
    outbox: BTreeMap<u64, PendingOutbound>,
    next_outbox_id: u64,
}

/// In-memory [`DurableCache`]. Reads take a shared lock, writes an exclusive
/// one, and change notifications are published after the lock is released.
pub struct MemoryCache {
    tables: RwLock<Tables>,
    changes: broadcast::Sender<CacheChange>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            tables: RwLock::new(Tables::default()),
            changes,
        }
    }
}

impl MemoryCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn publish(&self, changes: impl IntoIterator<Item = CacheChange>) {
        for change in changes {
            let _ = self.changes.send(change);
        }
    }

    fn check_message(tables: &Tables, message: &Message) -> CacheResult<()> {
        if !tables.threads.contains_key(&message.thread_id) {
            return Err(CacheError::MissingThread(message.thread_id));
        }
        if message.is_placeholder() && message.delivery == DeliveryStatus::Sent {
            return Err(CacheError::Invalid(format!(
                "placeholder {} cannot be marked sent",
                message.id
            )));
        }
        Ok(())
    }
}

impl DurableCache for MemoryCache {
    fn thread(&self, id: i64) -> Option<Thread> {
        self.tables.read().threads.get(&id).cloned()
    }

    fn threads(&self, scope: Option<PartitionScope>, status: Option<ThreadStatus>) -> Vec<Thread> {
        let tables = self.tables.read();
        let mut threads: Vec<Thread> = tables
            .threads
            .values()
            .filter(|t| scope.map_or(true, |s| t.in_scope(s)))
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect();
        threads.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        threads
    }

    fn insert_thread(&self, thread: Thread) -> CacheResult<()> {
        let id = thread.id;
        self.tables.write().threads.insert(id, thread);
        self.publish([CacheChange::ThreadUpserted(id)]);
        Ok(())
    }

    fn update_thread(&self, thread: Thread) -> CacheResult<()> {
        let id = thread.id;
        {
            let mut tables = self.tables.write();
            let slot = tables
                .threads
                .get_mut(&id)
                .ok_or(CacheError::MissingThread(id))?;
            *slot = thread;
        }
        self.publish([CacheChange::ThreadUpserted(id)]);
        Ok(())
    }

    fn delete_threads(&self, ids: &[i64]) -> CacheResult<usize> {
        let removed: Vec<i64> = {
            let mut tables = self.tables.write();
            ids.iter()
                .copied()
                .filter(|id| tables.threads.remove(id).is_some())
                .collect()
        };
        let count = removed.len();
        self.publish(removed.into_iter().map(CacheChange::ThreadDeleted));
        Ok(count)
    }

    fn message(&self, id: i64) -> Option<Message> {
        self.tables.read().messages.get(&id).cloned()
    }

    fn messages_for_thread(&self, thread_id: i64) -> Vec<Message> {
        let tables = self.tables.read();
        let mut messages: Vec<Message> = tables
            .messages
            .values()
            .filter(|m| m.thread_id == thread_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        messages
    }

    fn upsert_messages(&self, messages: Vec<Message>) -> CacheResult<()> {
        let mut changes = Vec::with_capacity(messages.len());
        {
            let mut tables = self.tables.write();
            for message in &messages {
                Self::check_message(&tables, message)?;
            }
            for message in messages {
                changes.push(CacheChange::MessageUpserted {
                    thread_id: message.thread_id,
                    message_id: message.id,
                });
                tables.messages.insert(message.id, message);
            }
        }
        self.publish(changes);
        Ok(())
    }

    fn replace_message(&self, old_id: i64, replacement: Message) -> CacheResult<()> {
        let removed = {
            let mut tables = self.tables.write();
            Self::check_message(&tables, &replacement)?;
            let removed = if old_id != replacement.id {
                tables.messages.remove(&old_id)
            } else {
                None
            };
            tables.messages.insert(replacement.id, replacement.clone());
            removed
        };
        let mut changes = Vec::with_capacity(2);
        if let Some(old) = removed {
            changes.push(CacheChange::MessageDeleted {
                thread_id: old.thread_id,
                message_id: old.id,
            });
        }
        changes.push(CacheChange::MessageUpserted {
            thread_id: replacement.thread_id,
            message_id: replacement.id,
        });
        self.publish(changes);
        Ok(())
    }

    fn delete_message(&self, id: i64) -> CacheResult<bool> {
        let removed = self.tables.write().messages.remove(&id);
        match removed {
            Some(message) => {
                self.publish([CacheChange::MessageDeleted {
                    thread_id: message.thread_id,
                    message_id: id,
                }]);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete_messages(&self, ids: &[i64]) -> CacheResult<usize> {
        let removed: Vec<Message> = {
            let mut tables = self.tables.write();
            ids.iter()
                .filter_map(|id| tables.messages.remove(id))
                .collect()
        };
        let count = removed.len();
        self.publish(removed.into_iter().map(|m| CacheChange::MessageDeleted {
            thread_id: m.thread_id,
            message_id: m.id,
        }));
        Ok(count)
    }

    fn delete_messages_for_threads(&self, thread_ids: &[i64]) -> CacheResult<usize> {
        let removed: Vec<Message> = {
            let mut tables = self.tables.write();
            let doomed: Vec<i64> = tables
                .messages
                .values()
                .filter(|m| thread_ids.contains(&m.thread_id))
                .map(|m| m.id)
                .collect();
            doomed
                .into_iter()
                .filter_map(|id| tables.messages.remove(&id))
                .collect()
        };
        let count = removed.len();
        self.publish(removed.into_iter().map(|m| CacheChange::MessageDeleted {
            thread_id: m.thread_id,
            message_id: m.id,
        }));
        Ok(count)
    }

    fn set_delivery_status(&self, id: i64, status: DeliveryStatus) -> CacheResult<()> {
        let thread_id = {
            let mut tables = self.tables.write();
            let message = tables
                .messages
                .get_mut(&id)
                .ok_or(CacheError::MissingMessage(id))?;
            if message.is_placeholder() && status == DeliveryStatus::Sent {
                return Err(CacheError::Invalid(format!(
                    "placeholder {id} cannot be marked sent"
                )));
            }
            message.delivery = status;
            message.thread_id
        };
        self.publish([CacheChange::MessageUpserted {
            thread_id,
            message_id: id,
        }]);
        Ok(())
    }

    fn mark_thread_read(&self, thread_id: i64, reader_id: i64) -> CacheResult<usize> {
        let touched: Vec<i64> = {
            let mut tables = self.tables.write();
            tables
                .messages
                .values_mut()
                .filter(|m| m.thread_id == thread_id && m.sender_id != reader_id && !m.read)
                .map(|m| {
                    m.read = true;
                    m.id
                })
                .collect()
        };
        let count = touched.len();
        self.publish(touched.into_iter().map(|message_id| CacheChange::MessageUpserted {
            thread_id,
            message_id,
        }));
        Ok(count)
    }

    fn unread_count(&self, thread_id: i64, reader_id: i64) -> usize {
        self.tables
            .read()
            .messages
            .values()
            .filter(|m| m.thread_id == thread_id && m.sender_id != reader_id && !m.read)
            .count()
    }

    fn enqueue_outbound(
        &self,
        thread_id: Option<i64>,
        kind: &str,
        payload: String,
        correlation_id: String,
        created_at: i64,
    ) -> CacheResult<u64> {
        let id = {
            let mut tables = self.tables.write();
            tables.next_outbox_id += 1;
            let id = tables.next_outbox_id;
            tables.outbox.insert(
                id,
                PendingOutbound {
                    id,
                    thread_id,
                    kind: kind.to_string(),
                    payload,
                    retry_count: 0,
                    created_at,
                    correlation_id,
                },
            );
            id
        };
        self.publish([CacheChange::OutboxChanged]);
        Ok(id)
    }

    fn outbound(&self) -> Vec<PendingOutbound> {
        self.tables.read().outbox.values().cloned().collect()
    }

    fn bump_outbound_retry(&self, id: u64) -> CacheResult<u32> {
        let count = {
            let mut tables = self.tables.write();
            let record = tables
                .outbox
                .get_mut(&id)
                .ok_or_else(|| CacheError::Storage(format!("outbox row {id} does not exist")))?;
            record.retry_count += 1;
            record.retry_count
        };
        self.publish([CacheChange::OutboxChanged]);
        Ok(count)
    }

    fn delete_outbound(&self, id: u64) -> CacheResult<bool> {
        let removed = self.tables.write().outbox.remove(&id).is_some();
        if removed {
            self.publish([CacheChange::OutboxChanged]);
        }
        Ok(removed)
    }

    fn delete_outbound_by_correlation(&self, correlation_id: &str) -> CacheResult<bool> {
        let removed = {
            let mut tables = self.tables.write();
            let id = tables
                .outbox
                .values()
                .find(|r| r.correlation_id == correlation_id)
                .map(|r| r.id);
            id.and_then(|id| tables.outbox.remove(&id)).is_some()
        };
        if removed {
            self.publish([CacheChange::OutboxChanged]);
        }
        Ok(removed)
    }

    fn subscribe(&self) -> broadcast::Receiver<CacheChange> {
        self.changes.subscribe()
    }
}

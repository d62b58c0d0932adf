use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// What a lock protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKey {
    /// The thread row (status, assignee, timestamps).
    Thread(i64),
    /// The set of message rows belonging to a thread.
    ThreadMessages(i64),
}

/// Per-entity async locks, created on first use.
///
/// Held across a whole read-modify-write so that optimistic mutations,
/// rollbacks and reconciliation merges touching the same entity never
/// interleave. Locks on different entities do not contend.
#[derive(Default, Clone)]
pub struct EntityLocks {
    slots: Arc<Mutex<HashMap<EntityKey, Arc<AsyncMutex<()>>>>>,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: EntityKey) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = self.slots.lock();
            // Entries nobody holds or waits on can go.
            if slots.len() > 256 {
                slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            }
            slots.entry(key).or_default().clone()
        };
        slot.lock_owned().await
    }

    pub async fn thread(&self, thread_id: i64) -> OwnedMutexGuard<()> {
        self.lock(EntityKey::Thread(thread_id)).await
    }

    pub async fn messages(&self, thread_id: i64) -> OwnedMutexGuard<()> {
        self.lock(EntityKey::ThreadMessages(thread_id)).await
    }

    pub fn is_locked(&self, key: EntityKey) -> bool {
        self.slots
            .lock()
            .get(&key)
            .map(|slot| slot.try_lock().is_err())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = EntityLocks::new();
        let guard = locks.thread(1).await;
        assert!(locks.is_locked(EntityKey::Thread(1)));

        let contender = locks.clone();
        let waiter = tokio::spawn(async move {
            let _guard = contender.thread(1).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
        assert!(!locks.is_locked(EntityKey::Thread(1)));
    }

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let locks = EntityLocks::new();
        let _thread = locks.thread(1).await;
        let _messages = locks.messages(1).await;
        let _other = locks.thread(2).await;
        assert!(locks.is_locked(EntityKey::ThreadMessages(1)));
    }
}

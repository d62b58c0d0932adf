use super::store_server_messages;
use crate::cache::{Message, Thread};
use crate::connection::InboundHandler;
use crate::error::{SyncError, SyncResult};
use crate::locks::EntityLocks;
use crate::outbox::OutboundTracker;
use crate::pending::PendingSends;
use crate::worker::CacheWriter;
use crate::Identity;
use async_trait::async_trait;
use parley_proto::{
    now_millis, ChatMessageEvent, InboundEvent, Role, ThreadPatch, ThreadRecord, ThreadStatus,
};
use tracing::{debug, trace, warn};

/// Applies live-channel events to the cache.
///
/// Frames arrive here in channel order. Each event takes the same locks the
/// pull and mutation paths take, so a push never interleaves with a
/// placeholder swap or a rollback on the same thread.
#[derive(Clone)]
pub struct PushApplier {
    writer: CacheWriter,
    locks: EntityLocks,
    pending: PendingSends,
    outbox: OutboundTracker,
    identity: Identity,
}

impl PushApplier {
    pub fn new(
        writer: CacheWriter,
        locks: EntityLocks,
        pending: PendingSends,
        outbox: OutboundTracker,
        identity: Identity,
    ) -> Self {
        Self {
            writer,
            locks,
            pending,
            outbox,
            identity,
        }
    }

    pub async fn apply(&self, event: InboundEvent) -> SyncResult<()> {
        match event {
            InboundEvent::Ack { message_id } => {
                self.outbox.acknowledge(&message_id).await?;
            }
            InboundEvent::ChatMessage(message) => self.apply_chat(message).await?,
            InboundEvent::ThreadUpdated(patch) => self.apply_patch(patch).await?,
            InboundEvent::ThreadAccepted {
                thread_id,
                assignee_id,
            } => {
                self.apply_legacy_status(thread_id, ThreadStatus::Active, assignee_id)
                    .await?
            }
            InboundEvent::ThreadClosed { thread_id } => {
                self.apply_legacy_status(thread_id, ThreadStatus::Closed, None)
                    .await?
            }
            InboundEvent::NewThread(record) => self.apply_new_thread(record).await?,
            InboundEvent::Pong => trace!(target = "parley::push", "pong"),
            InboundEvent::Ignored { kind } => {
                debug!(target = "parley::push", %kind, "ignoring unhandled event kind")
            }
        }
        Ok(())
    }

    async fn apply_chat(&self, event: ChatMessageEvent) -> SyncResult<()> {
        let thread_id = event.question_id;
        let message = Message::from_record(event, now_millis());
        let _guard = self.locks.messages(thread_id).await;
        let pending = self.pending.clone();
        let user_id = self.identity.user_id;
        let outcome = self
            .writer
            .write(move |cache| store_server_messages(cache, &pending, user_id, thread_id, vec![message]))
            .await;
        match outcome {
            Ok(_) => Ok(()),
            Err(SyncError::ThreadNotFound(_)) => {
                debug!(target = "parley::push", thread_id, "message for unknown thread skipped");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn apply_patch(&self, patch: ThreadPatch) -> SyncResult<()> {
        let thread_id = patch.question_id;
        let incoming = patch.status;
        let _guard = self.locks.thread(thread_id).await;
        let outcome = self
            .writer
            .write(move |cache| {
                let Some(mut thread) = cache.thread(thread_id) else {
                    return Ok(StatusPush::UnknownThread);
                };
                if is_backward(thread.status, patch.status) {
                    return Ok(StatusPush::Backward(thread.status));
                }
                thread.status = patch.status;
                if let Some(assignee) = patch.tutor_id {
                    thread.assignee_id = Some(assignee);
                }
                if let Some(content) = patch.content {
                    thread.content = content;
                }
                thread.updated_at = patch.updated_at.unwrap_or_else(now_millis);
                cache.update_thread(thread)?;
                Ok(StatusPush::Applied)
            })
            .await?;
        outcome.log(thread_id, incoming);
        Ok(())
    }

    async fn apply_legacy_status(
        &self,
        thread_id: i64,
        status: ThreadStatus,
        assignee_id: Option<i64>,
    ) -> SyncResult<()> {
        let _guard = self.locks.thread(thread_id).await;
        let outcome = self
            .writer
            .write(move |cache| {
                let Some(mut thread) = cache.thread(thread_id) else {
                    return Ok(StatusPush::UnknownThread);
                };
                if is_backward(thread.status, status) {
                    return Ok(StatusPush::Backward(thread.status));
                }
                thread.status = status;
                if assignee_id.is_some() {
                    thread.assignee_id = assignee_id;
                }
                thread.updated_at = now_millis();
                cache.update_thread(thread)?;
                Ok(StatusPush::Applied)
            })
            .await?;
        outcome.log(thread_id, status);
        Ok(())
    }

    async fn apply_new_thread(&self, record: ThreadRecord) -> SyncResult<()> {
        if self.identity.role != Role::Responder {
            return Ok(());
        }
        let thread_id = record.id;
        let _guard = self.locks.thread(thread_id).await;
        self.writer
            .write(move |cache| {
                if cache.thread(thread_id).is_none() {
                    cache.insert_thread(Thread::from_record(record))?;
                }
                Ok(())
            })
            .await
    }
}

/// Result of applying a status-bearing push to the cache.
enum StatusPush {
    Applied,
    UnknownThread,
    /// The cached row is already past the pushed status.
    Backward(ThreadStatus),
}

impl StatusPush {
    fn log(&self, thread_id: i64, incoming: ThreadStatus) {
        match self {
            StatusPush::Applied => {}
            StatusPush::UnknownThread => debug!(
                target = "parley::push",
                thread_id,
                status = incoming.as_str(),
                "status change for unknown thread skipped"
            ),
            StatusPush::Backward(current) => debug!(
                target = "parley::push",
                thread_id,
                current = current.as_str(),
                status = incoming.as_str(),
                "late status change ignored"
            ),
        }
    }
}

/// Same-status pushes still carry field updates; only moves down the
/// lifecycle are dropped.
fn is_backward(current: ThreadStatus, incoming: ThreadStatus) -> bool {
    current != incoming && !current.can_advance_to(incoming)
}

#[async_trait]
impl InboundHandler for PushApplier {
    async fn handle_frame(&self, frame: String) {
        let event = match InboundEvent::parse(&frame) {
            Ok(event) => event,
            Err(err) => {
                warn!(target = "parley::push", error = %err, "skipping malformed frame");
                metrics::counter!("parley_push_malformed_total", 1);
                return;
            }
        };
        let kind = event.kind().to_string();
        if let Err(err) = self.apply(event).await {
            warn!(target = "parley::push", %kind, error = %err, "failed to apply push event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{DeliveryStatus, DurableCache, MemoryCache};
    use parley_proto::MessageKind;
    use serde_json::json;
    use std::sync::Arc;

    struct Fixture {
        cache: Arc<MemoryCache>,
        pending: PendingSends,
        applier: PushApplier,
    }

    fn fixture(role: Role) -> Fixture {
        let cache = MemoryCache::new();
        let writer = CacheWriter::spawn(cache.clone());
        let pending = PendingSends::new();
        let applier = PushApplier::new(
            writer.clone(),
            EntityLocks::new(),
            pending.clone(),
            OutboundTracker::new(writer, 3),
            Identity::new(7, role),
        );
        Fixture {
            cache,
            pending,
            applier,
        }
    }

    fn thread(id: i64) -> Thread {
        Thread {
            id,
            owner_id: 7,
            assignee_id: None,
            content: "why is the sky blue".into(),
            attachments: vec!["/uploads/sky.png".into()],
            status: ThreadStatus::Pending,
            created_at: 1_000,
            updated_at: 1_000,
        }
    }

    fn frame(kind: &str, data: serde_json::Value) -> String {
        json!({ "type": kind, "data": data, "timestamp": "1" }).to_string()
    }

    #[tokio::test]
    async fn update_patches_in_place_and_keeps_attachments() {
        let fx = fixture(Role::Asker);
        fx.cache.insert_thread(thread(1)).unwrap();
        fx.applier
            .handle_frame(frame(
                "question_updated",
                json!({"questionId": 1, "status": "in_progress", "tutorId": 9, "updatedAt": 5_000}),
            ))
            .await;
        let row = fx.cache.thread(1).unwrap();
        assert_eq!(row.status, ThreadStatus::Active);
        assert_eq!(row.assignee_id, Some(9));
        assert_eq!(row.updated_at, 5_000);
        assert_eq!(row.attachments, vec!["/uploads/sky.png".to_string()]);
    }

    #[tokio::test]
    async fn update_for_unknown_thread_is_skipped() {
        let fx = fixture(Role::Asker);
        fx.applier
            .handle_frame(frame("question_updated", json!({"questionId": 3, "status": "closed"})))
            .await;
        assert!(fx.cache.thread(3).is_none());
    }

    #[tokio::test]
    async fn own_echo_replaces_in_flight_placeholder() {
        let fx = fixture(Role::Asker);
        fx.cache.insert_thread(thread(1)).unwrap();
        fx.cache
            .upsert_messages(vec![Message {
                id: -100,
                thread_id: 1,
                sender_id: 7,
                content: "hi".into(),
                kind: MessageKind::Text,
                created_at: 2_000,
                read: true,
                delivery: DeliveryStatus::Pending,
            }])
            .unwrap();
        fx.pending.register(-100, 1, "hi", MessageKind::Text);

        fx.applier
            .handle_frame(frame(
                "chat_message",
                json!({"id": 55, "questionId": 1, "senderId": 7, "content": "hi", "createdAt": 2_100}),
            ))
            .await;

        let messages = fx.cache.messages_for_thread(1);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, 55);
        assert_eq!(messages[0].delivery, DeliveryStatus::Sent);
        assert_eq!(fx.pending.finish(-100), Some(55));
    }

    #[tokio::test]
    async fn new_thread_only_lands_for_responders() {
        let payload = json!({
            "questionId": 4, "userId": 2, "content": "integrals", "status": "pending", "createdAt": 10
        });
        let asker = fixture(Role::Asker);
        asker.applier.handle_frame(frame("new_question", payload.clone())).await;
        assert!(asker.cache.thread(4).is_none());

        let responder = fixture(Role::Responder);
        responder.applier.handle_frame(frame("new_question", payload)).await;
        assert_eq!(responder.cache.thread(4).unwrap().content, "integrals");
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped() {
        let fx = fixture(Role::Asker);
        fx.cache.insert_thread(thread(1)).unwrap();
        fx.applier.handle_frame("{not json".into()).await;
        fx.applier
            .handle_frame(frame("chat_message", json!({"questionId": 1})))
            .await;
        assert!(fx.cache.messages_for_thread(1).is_empty());
    }

    #[tokio::test]
    async fn late_pushes_never_reopen_a_closed_thread() {
        let fx = fixture(Role::Asker);
        let mut closed = thread(1);
        closed.status = ThreadStatus::Closed;
        closed.assignee_id = Some(9);
        closed.updated_at = 8_000;
        fx.cache.insert_thread(closed.clone()).unwrap();

        fx.applier
            .handle_frame(frame(
                "question_updated",
                json!({"questionId": 1, "status": "in_progress", "tutorId": 12, "updatedAt": 9_000}),
            ))
            .await;
        fx.applier
            .handle_frame(frame("question_accepted", json!({"questionId": 1, "tutorId": 12})))
            .await;

        assert_eq!(fx.cache.thread(1).unwrap(), closed);
    }

    #[tokio::test]
    async fn same_status_update_still_patches_fields() {
        let fx = fixture(Role::Asker);
        let mut active = thread(1);
        active.status = ThreadStatus::Active;
        active.assignee_id = Some(9);
        fx.cache.insert_thread(active).unwrap();

        fx.applier
            .handle_frame(frame(
                "question_updated",
                json!({"questionId": 1, "status": "in_progress", "content": "edited", "updatedAt": 6_000}),
            ))
            .await;

        let row = fx.cache.thread(1).unwrap();
        assert_eq!(row.content, "edited");
        assert_eq!(row.updated_at, 6_000);
    }

    #[tokio::test]
    async fn legacy_close_sets_status() {
        let fx = fixture(Role::Asker);
        fx.cache.insert_thread(thread(1)).unwrap();
        fx.applier
            .handle_frame(frame("question_closed", json!({"questionId": 1})))
            .await;
        let row = fx.cache.thread(1).unwrap();
        assert_eq!(row.status, ThreadStatus::Closed);
        assert!(row.updated_at > 1_000);
    }
}

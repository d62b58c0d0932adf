use crate::model::{MessageRecord, ThreadRecord, ThreadStatus};
use crate::{now_millis, ProtocolError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const KIND_ACK: &str = "ack";
pub const KIND_CHAT: &str = "chat_message";
pub const KIND_THREAD_UPDATED: &str = "question_updated";
pub const KIND_THREAD_ACCEPTED: &str = "question_accepted";
pub const KIND_THREAD_CLOSED: &str = "question_closed";
pub const KIND_NEW_THREAD: &str = "new_question";
pub const KIND_PING: &str = "ping";
pub const KIND_PONG: &str = "pong";

/// Frame carried on the live channel in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(rename = "messageId", default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

/// Client-originated event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundKind {
    Ping,
    Chat,
}

impl OutboundKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboundKind::Ping => KIND_PING,
            OutboundKind::Chat => KIND_CHAT,
        }
    }
}

impl Envelope {
    /// Builds an outbound envelope stamped with the current time and a fresh correlation id.
    pub fn outbound(kind: OutboundKind, data: Option<Value>) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            data,
            timestamp: Some(now_millis().to_string()),
            message_id: Some(Uuid::new_v4().to_string()),
        }
    }

    pub fn heartbeat() -> Self {
        Self::outbound(OutboundKind::Ping, None)
    }

    pub fn to_text(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    pub fn from_text(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Envelope)
    }

    fn payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let data = self
            .data
            .clone()
            .filter(|value| !value.is_null())
            .ok_or_else(|| ProtocolError::MissingData {
                kind: self.kind.clone(),
            })?;
        serde_json::from_value(data).map_err(|source| ProtocolError::Payload {
            kind: self.kind.clone(),
            source,
        })
    }
}

/// A `chat_message` push. The timestamp is optional on the wire; receivers
/// stamp their own clock when it is absent.
pub type ChatMessageEvent = MessageRecord;

/// Partial thread update: only the fields present are applied, attachments are never touched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadPatch {
    pub question_id: i64,
    pub status: ThreadStatus,
    #[serde(default)]
    pub tutor_id: Option<i64>,
    #[serde(default)]
    pub updated_at: Option<i64>,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyStatusPayload {
    question_id: i64,
    #[serde(default)]
    tutor_id: Option<i64>,
}

/// Typed view over an inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Ack { message_id: String },
    ChatMessage(ChatMessageEvent),
    ThreadUpdated(ThreadPatch),
    ThreadAccepted { thread_id: i64, assignee_id: Option<i64> },
    ThreadClosed { thread_id: i64 },
    NewThread(ThreadRecord),
    Pong,
    /// Well-formed envelope of a kind this client does not act on.
    Ignored { kind: String },
}

impl InboundEvent {
    /// Parses a raw text frame. Kind names are matched case-insensitively;
    /// `thread_updated` is accepted as a synonym of `question_updated`.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let envelope = Envelope::from_text(text)?;
        Self::from_envelope(&envelope)
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ProtocolError> {
        let kind = envelope.kind.to_ascii_lowercase();
        let event = match kind.as_str() {
            KIND_ACK => {
                let message_id = envelope
                    .message_id
                    .clone()
                    .filter(|id| !id.is_empty())
                    .ok_or(ProtocolError::AckWithoutId)?;
                InboundEvent::Ack { message_id }
            }
            KIND_CHAT => InboundEvent::ChatMessage(envelope.payload()?),
            KIND_THREAD_UPDATED | "thread_updated" => {
                InboundEvent::ThreadUpdated(envelope.payload()?)
            }
            KIND_THREAD_ACCEPTED => {
                let payload: LegacyStatusPayload = envelope.payload()?;
                InboundEvent::ThreadAccepted {
                    thread_id: payload.question_id,
                    assignee_id: payload.tutor_id,
                }
            }
            KIND_THREAD_CLOSED => {
                let payload: LegacyStatusPayload = envelope.payload()?;
                InboundEvent::ThreadClosed {
                    thread_id: payload.question_id,
                }
            }
            KIND_NEW_THREAD => InboundEvent::NewThread(envelope.payload()?),
            KIND_PONG => InboundEvent::Pong,
            _ => InboundEvent::Ignored { kind },
        };
        Ok(event)
    }

    pub fn kind(&self) -> &str {
        match self {
            InboundEvent::Ack { .. } => KIND_ACK,
            InboundEvent::ChatMessage(_) => KIND_CHAT,
            InboundEvent::ThreadUpdated(_) => KIND_THREAD_UPDATED,
            InboundEvent::ThreadAccepted { .. } => KIND_THREAD_ACCEPTED,
            InboundEvent::ThreadClosed { .. } => KIND_THREAD_CLOSED,
            InboundEvent::NewThread(_) => KIND_NEW_THREAD,
            InboundEvent::Pong => KIND_PONG,
            InboundEvent::Ignored { kind } => kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MessageKind;
    use serde_json::json;

    #[test]
    fn heartbeat_carries_type_timestamp_and_id() {
        let text = Envelope::heartbeat().to_text().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "ping");
        assert!(value["timestamp"].as_str().unwrap().parse::<i64>().is_ok());
        assert!(Uuid::parse_str(value["messageId"].as_str().unwrap()).is_ok());
        assert!(value.get("data").is_none());
    }

    #[test]
    fn parses_chat_message_with_defaults() {
        let frame = json!({
            "type": "chat_message",
            "data": {"id": 9, "questionId": 1, "senderId": 2, "content": "hi"}
        })
        .to_string();
        match InboundEvent::parse(&frame).unwrap() {
            InboundEvent::ChatMessage(msg) => {
                assert_eq!(msg.id, 9);
                assert_eq!(msg.message_type, MessageKind::Text);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn kind_matching_is_case_insensitive_and_accepts_synonym() {
        let frame = json!({
            "type": "THREAD_UPDATED",
            "data": {"questionId": 4, "status": "closed"}
        })
        .to_string();
        let event = InboundEvent::parse(&frame).unwrap();
        assert_eq!(
            event,
            InboundEvent::ThreadUpdated(ThreadPatch {
                question_id: 4,
                status: ThreadStatus::Closed,
                tutor_id: None,
                updated_at: None,
                content: None,
            })
        );
    }

    #[test]
    fn patch_without_status_is_a_payload_error() {
        let frame = json!({"type": "question_updated", "data": {"questionId": 4}}).to_string();
        assert!(matches!(
            InboundEvent::parse(&frame),
            Err(ProtocolError::Payload { .. })
        ));
    }

    #[test]
    fn ack_requires_message_id() {
        let frame = json!({"type": "ack"}).to_string();
        assert!(matches!(
            InboundEvent::parse(&frame),
            Err(ProtocolError::AckWithoutId)
        ));
        let frame = json!({"type": "ack", "messageId": "abc"}).to_string();
        assert_eq!(
            InboundEvent::parse(&frame).unwrap(),
            InboundEvent::Ack {
                message_id: "abc".into()
            }
        );
    }

    #[test]
    fn missing_data_and_garbage_are_errors() {
        let frame = json!({"type": "chat_message", "data": null}).to_string();
        assert!(matches!(
            InboundEvent::parse(&frame),
            Err(ProtocolError::MissingData { .. })
        ));
        assert!(matches!(
            InboundEvent::parse("not json"),
            Err(ProtocolError::Envelope(_))
        ));
    }

    #[test]
    fn unknown_kinds_are_ignored() {
        let frame = json!({"type": "new_answer", "data": {}}).to_string();
        assert_eq!(
            InboundEvent::parse(&frame).unwrap(),
            InboundEvent::Ignored {
                kind: "new_answer".into()
            }
        );
    }

    #[test]
    fn legacy_accept_carries_assignee() {
        let frame = json!({
            "type": "question_accepted",
            "data": {"questionId": 5, "tutorId": 8}
        })
        .to_string();
        assert_eq!(
            InboundEvent::parse(&frame).unwrap(),
            InboundEvent::ThreadAccepted {
                thread_id: 5,
                assignee_id: Some(8)
            }
        );
    }
}

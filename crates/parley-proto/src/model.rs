use serde::{Deserialize, Serialize};

/// Lifecycle of a thread. Only ever moves forward: pending, then in progress, then closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThreadStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "in_progress")]
    Active,
    #[serde(rename = "closed")]
    Closed,
}

impl ThreadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ThreadStatus::Pending => "pending",
            ThreadStatus::Active => "in_progress",
            ThreadStatus::Closed => "closed",
        }
    }

    fn rank(self) -> u8 {
        match self {
            ThreadStatus::Pending => 0,
            ThreadStatus::Active => 1,
            ThreadStatus::Closed => 2,
        }
    }

    /// Whether moving from `self` to `next` is a forward step.
    pub fn can_advance_to(self, next: ThreadStatus) -> bool {
        next.rank() > self.rank()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
}

/// Which side of a thread the local user is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "student")]
    Asker,
    #[serde(rename = "tutor")]
    Responder,
}

impl Role {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "student" | "asker" => Some(Role::Asker),
            "tutor" | "responder" => Some(Role::Responder),
            _ => None,
        }
    }
}

/// A thread as the server describes it, on REST pages and in `new_question` pushes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadRecord {
    #[serde(alias = "questionId")]
    pub id: i64,
    pub user_id: i64,
    #[serde(default)]
    pub tutor_id: Option<i64>,
    pub content: String,
    /// `None` means the payload did not mention attachments at all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_paths: Option<Vec<String>>,
    pub status: ThreadStatus,
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: Option<i64>,
}

/// A message as the server describes it. Push frames forwarded by other
/// clients carry the id as `messageId`; both spellings are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawMessageRecord")]
pub struct MessageRecord {
    pub id: i64,
    pub question_id: i64,
    pub sender_id: i64,
    pub content: String,
    pub message_type: MessageKind,
    pub created_at: Option<i64>,
    pub is_read: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessageRecord {
    #[serde(default)]
    id: Option<i64>,
    #[serde(default)]
    message_id: Option<i64>,
    question_id: i64,
    sender_id: i64,
    content: String,
    #[serde(default)]
    message_type: Option<MessageKind>,
    #[serde(default)]
    created_at: Option<i64>,
    #[serde(default)]
    is_read: Option<bool>,
}

impl TryFrom<RawMessageRecord> for MessageRecord {
    type Error = String;

    fn try_from(raw: RawMessageRecord) -> Result<Self, Self::Error> {
        let id = raw
            .id
            .or(raw.message_id)
            .ok_or_else(|| "message has neither `id` nor `messageId`".to_string())?;
        Ok(Self {
            id,
            question_id: raw.question_id,
            sender_id: raw.sender_id,
            content: raw.content,
            message_type: raw.message_type.unwrap_or_default(),
            created_at: raw.created_at,
            is_read: raw.is_read.unwrap_or(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_uses_server_spelling() {
        let status: ThreadStatus = serde_json::from_value(json!("in_progress")).unwrap();
        assert_eq!(status, ThreadStatus::Active);
        assert_eq!(ThreadStatus::Closed.as_str(), "closed");
        assert!(serde_json::from_value::<ThreadStatus>(json!("archived")).is_err());
    }

    #[test]
    fn status_only_advances() {
        assert!(ThreadStatus::Pending.can_advance_to(ThreadStatus::Active));
        assert!(ThreadStatus::Pending.can_advance_to(ThreadStatus::Closed));
        assert!(ThreadStatus::Active.can_advance_to(ThreadStatus::Closed));
        assert!(!ThreadStatus::Closed.can_advance_to(ThreadStatus::Active));
        assert!(!ThreadStatus::Active.can_advance_to(ThreadStatus::Active));
    }

    #[test]
    fn message_accepts_message_id_alias_and_defaults() {
        let record: MessageRecord = serde_json::from_value(json!({
            "messageId": 42,
            "questionId": 7,
            "senderId": 3,
            "content": "hello"
        }))
        .unwrap();
        assert_eq!(record.id, 42);
        assert_eq!(record.message_type, MessageKind::Text);
        assert_eq!(record.created_at, None);
        assert!(!record.is_read);
    }

    #[test]
    fn message_prefers_id_over_alias() {
        let record: MessageRecord = serde_json::from_value(json!({
            "id": 1,
            "messageId": 2,
            "questionId": 7,
            "senderId": 3,
            "content": "x",
            "messageType": "image"
        }))
        .unwrap();
        assert_eq!(record.id, 1);
        assert_eq!(record.message_type, MessageKind::Image);
    }

    #[test]
    fn message_without_any_id_is_rejected() {
        let result = serde_json::from_value::<MessageRecord>(json!({
            "questionId": 7,
            "senderId": 3,
            "content": "x"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn thread_distinguishes_missing_attachments_from_empty() {
        let omitted: ThreadRecord = serde_json::from_value(json!({
            "id": 1, "userId": 2, "content": "q", "status": "pending", "createdAt": 10
        }))
        .unwrap();
        assert_eq!(omitted.image_paths, None);

        let empty: ThreadRecord = serde_json::from_value(json!({
            "questionId": 1, "userId": 2, "content": "q", "status": "pending",
            "createdAt": 10, "imagePaths": []
        }))
        .unwrap();
        assert_eq!(empty.image_paths, Some(vec![]));
    }

    #[test]
    fn role_parses_both_vocabularies() {
        assert_eq!(Role::parse("Tutor"), Some(Role::Responder));
        assert_eq!(Role::parse("asker"), Some(Role::Asker));
        assert_eq!(Role::parse("admin"), None);
    }
}

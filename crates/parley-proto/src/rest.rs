use crate::model::{MessageKind, MessageRecord, ThreadRecord};
use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A list element that failed to decode is kept as an error instead of
/// failing the whole page, so one bad record never hides its siblings.
#[derive(Debug, Clone)]
pub struct Lenient<T>(pub Result<T, String>);

impl<'de, T: DeserializeOwned> Deserialize<'de> for Lenient<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(Lenient(
            serde_json::from_value(value).map_err(|err| err.to_string()),
        ))
    }
}

fn split_lenient<T>(items: Vec<Lenient<T>>) -> (Vec<T>, Vec<String>) {
    let mut good = Vec::with_capacity(items.len());
    let mut bad = Vec::new();
    for Lenient(item) in items {
        match item {
            Ok(value) => good.push(value),
            Err(err) => bad.push(err),
        }
    }
    (good, bad)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Pagination {
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
    pub total_pages: u32,
    pub has_more: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadPage {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub questions: Vec<Lenient<ThreadRecord>>,
    #[serde(default)]
    pub pagination: Pagination,
}

impl ThreadPage {
    /// Decoded threads plus a description of every record that was skipped.
    pub fn into_records(self) -> (Vec<ThreadRecord>, Vec<String>) {
        split_lenient(self.questions)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub messages: Vec<Lenient<MessageRecord>>,
    #[serde(default)]
    pub pagination: Pagination,
}

impl MessagePage {
    pub fn into_records(self) -> (Vec<MessageRecord>, Vec<String>) {
        split_lenient(self.messages)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub question_id: i64,
    pub content: String,
    pub message_type: MessageKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<MessageRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadActionRequest {
    pub question_id: i64,
}

pub type MarkReadRequest = ThreadActionRequest;

/// Generic body for endpoints whose only answer is success or a reason.
/// A missing `success` field counts as success when the status code was 2xx.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Acknowledgement {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub message: Option<String>,
}

impl Acknowledgement {
    pub fn is_success(&self) -> bool {
        self.success.unwrap_or(true)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateThreadRequest {
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_paths: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateThreadResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub question: Option<ThreadRecord>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub image_path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn thread_page_skips_broken_records() {
        let page: ThreadPage = serde_json::from_value(json!({
            "success": true,
            "questions": [
                {"id": 1, "userId": 2, "content": "ok", "status": "pending", "createdAt": 1},
                {"id": 2, "content": "missing owner", "status": "pending", "createdAt": 1},
                {"id": 3, "userId": 2, "content": "bad status", "status": "weird", "createdAt": 1}
            ],
            "pagination": {"page": 1, "pageSize": 20, "total": 3, "totalPages": 1, "hasMore": false}
        }))
        .unwrap();
        assert_eq!(page.pagination.total_pages, 1);
        let (records, skipped) = page.into_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, 1);
        assert_eq!(skipped.len(), 2);
    }

    #[test]
    fn missing_pagination_defaults_to_no_more() {
        let page: MessagePage =
            serde_json::from_value(json!({"success": true, "messages": []})).unwrap();
        assert!(!page.pagination.has_more);
    }

    #[test]
    fn acknowledgement_defaults_to_success() {
        let ack: Acknowledgement = serde_json::from_value(json!({})).unwrap();
        assert!(ack.is_success());
        let ack: Acknowledgement =
            serde_json::from_value(json!({"success": false, "message": "no"})).unwrap();
        assert!(!ack.is_success());
    }

    #[test]
    fn send_request_uses_camel_case() {
        let body = serde_json::to_value(SendMessageRequest {
            question_id: 3,
            content: "hi".into(),
            message_type: MessageKind::Image,
        })
        .unwrap();
        assert_eq!(body, json!({"questionId": 3, "content": "hi", "messageType": "image"}));
    }
}

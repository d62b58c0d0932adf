//! REST client for the thread server.
//!
//! [`SyncApi`] is the seam the engine depends on; [`HttpApi`] is the reqwest
//! implementation. Every call is authenticated with a bearer token fetched
//! from a [`TokenProvider`] right before the request.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use parley_proto::{
    Acknowledgement, CreateThreadRequest, CreateThreadResponse, MessagePage, MessageRecord,
    SendMessageRequest, SendMessageResponse, ThreadActionRequest, ThreadPage, ThreadRecord,
    ThreadStatus, UploadResponse,
};
use reqwest::{multipart, Client, RequestBuilder};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> SyncResult<String>;
}

/// Token that never changes; used by the agent and in tests.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> SyncResult<String> {
        Ok(self.0.clone())
    }
}

#[async_trait]
pub trait SyncApi: Send + Sync {
    async fn fetch_threads(
        &self,
        page: u32,
        page_size: u32,
        status: Option<ThreadStatus>,
    ) -> SyncResult<ThreadPage>;

    async fn fetch_messages(
        &self,
        thread_id: i64,
        page: u32,
        page_size: u32,
    ) -> SyncResult<MessagePage>;

    async fn send_message(&self, request: SendMessageRequest) -> SyncResult<MessageRecord>;

    async fn accept_thread(&self, thread_id: i64) -> SyncResult<()>;

    async fn close_thread(&self, thread_id: i64) -> SyncResult<()>;

    async fn mark_read(&self, thread_id: i64) -> SyncResult<()>;

    async fn create_thread(&self, request: CreateThreadRequest) -> SyncResult<ThreadRecord>;

    /// Uploads a local image and returns the server path referencing it.
    async fn upload_image(&self, path: &Path) -> SyncResult<String>;
}

pub struct HttpApi {
    http: Client,
    base_url: String,
    tokens: std::sync::Arc<dyn TokenProvider>,
}

impl HttpApi {
    pub fn new(
        base_url: impl Into<String>,
        tokens: std::sync::Arc<dyn TokenProvider>,
        timeout: Duration,
    ) -> SyncResult<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn execute<T: DeserializeOwned>(&self, request: RequestBuilder) -> SyncResult<T> {
        let token = self.tokens.token().await?;
        let res = request.bearer_auth(token).send().await?;

        if res.status().is_success() {
            let body = res.bytes().await?;
            serde_json::from_slice::<T>(&body).map_err(|err| SyncError::Malformed(err.to_string()))
        } else {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            Err(SyncError::UnexpectedStatus { status, body })
        }
    }

    async fn post_action(&self, path: &str, thread_id: i64) -> SyncResult<()> {
        let request = self
            .http
            .post(self.url(path))
            .json(&ThreadActionRequest {
                question_id: thread_id,
            });
        let ack: Acknowledgement = self.execute(request).await?;
        if ack.is_success() {
            Ok(())
        } else {
            Err(rejected(ack.message, path))
        }
    }
}

fn rejected(message: Option<String>, what: &str) -> SyncError {
    SyncError::Rejected {
        reason: message.unwrap_or_else(|| format!("{what} reported failure")),
    }
}

fn image_mime(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}

#[async_trait]
impl SyncApi for HttpApi {
    async fn fetch_threads(
        &self,
        page: u32,
        page_size: u32,
        status: Option<ThreadStatus>,
    ) -> SyncResult<ThreadPage> {
        let mut query = vec![
            ("page", page.to_string()),
            ("pageSize", page_size.to_string()),
        ];
        if let Some(status) = status {
            query.push(("status", status.as_str().to_string()));
        }
        let request = self.http.get(self.url("/api/questions")).query(&query);
        let page_body: ThreadPage = self.execute(request).await?;
        if !page_body.success {
            return Err(rejected(page_body.message, "thread listing"));
        }
        debug!(
            target = "parley::api",
            page,
            returned = page_body.questions.len(),
            has_more = page_body.pagination.has_more,
            "fetched thread page"
        );
        Ok(page_body)
    }

    async fn fetch_messages(
        &self,
        thread_id: i64,
        page: u32,
        page_size: u32,
    ) -> SyncResult<MessagePage> {
        let request = self.http.get(self.url("/api/messages")).query(&[
            ("questionId", thread_id.to_string()),
            ("page", page.to_string()),
            ("pageSize", page_size.to_string()),
        ]);
        let page_body: MessagePage = self.execute(request).await?;
        if !page_body.success {
            return Err(rejected(page_body.message, "message listing"));
        }
        Ok(page_body)
    }

    async fn send_message(&self, request: SendMessageRequest) -> SyncResult<MessageRecord> {
        let request = self.http.post(self.url("/api/messages")).json(&request);
        let response: SendMessageResponse = self.execute(request).await?;
        match response {
            SendMessageResponse {
                success: true,
                data: Some(record),
                ..
            } => Ok(record),
            SendMessageResponse {
                success: true,
                data: None,
                ..
            } => Err(SyncError::Malformed(
                "send response is missing the stored message".into(),
            )),
            SendMessageResponse { message, .. } => Err(rejected(message, "send")),
        }
    }

    async fn accept_thread(&self, thread_id: i64) -> SyncResult<()> {
        self.post_action("/api/questions/accept", thread_id).await
    }

    async fn close_thread(&self, thread_id: i64) -> SyncResult<()> {
        self.post_action("/api/questions/close", thread_id).await
    }

    async fn mark_read(&self, thread_id: i64) -> SyncResult<()> {
        self.post_action("/api/messages/mark-read", thread_id).await
    }

    async fn create_thread(&self, request: CreateThreadRequest) -> SyncResult<ThreadRecord> {
        let request = self.http.post(self.url("/api/questions")).json(&request);
        let response: CreateThreadResponse = self.execute(request).await?;
        match response {
            CreateThreadResponse {
                success: true,
                question: Some(record),
                ..
            } => Ok(record),
            CreateThreadResponse {
                success: true,
                question: None,
                ..
            } => Err(SyncError::Malformed(
                "create response is missing the stored thread".into(),
            )),
            CreateThreadResponse { message, .. } => Err(rejected(message, "publish")),
        }
    }

    async fn upload_image(&self, path: &Path) -> SyncResult<String> {
        let bytes = tokio::fs::read(path).await.map_err(SyncError::File)?;
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("image.jpg")
            .to_string();
        let part = multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(image_mime(path))?;
        let form = multipart::Form::new().part("image", part);
        let request = self.http.post(self.url("/api/upload/image")).multipart(form);
        let response: UploadResponse = self.execute(request).await?;
        match response {
            UploadResponse {
                success: true,
                image_path: Some(server_path),
                ..
            } if !server_path.is_empty() => Ok(server_path),
            UploadResponse { message, .. } => Err(rejected(message, "upload")),
        }
    }
}

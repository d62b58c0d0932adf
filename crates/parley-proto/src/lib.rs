//! Shared wire definitions for the parley client and the thread server.
//!
//! Everything that crosses the network lives here: the live-channel envelope
//! and its typed events, plus the REST request/response bodies. Keeping these
//! in a dedicated crate lets mock servers in tests speak the exact same schema
//! as the engine without pulling in the runtime.

mod envelope;
mod model;
mod rest;

pub use envelope::{
    ChatMessageEvent, Envelope, InboundEvent, OutboundKind, ThreadPatch, KIND_ACK, KIND_CHAT,
    KIND_NEW_THREAD, KIND_PING, KIND_PONG, KIND_THREAD_ACCEPTED, KIND_THREAD_CLOSED,
    KIND_THREAD_UPDATED,
};
pub use model::{MessageKind, MessageRecord, Role, ThreadRecord, ThreadStatus};
pub use rest::{
    Acknowledgement, CreateThreadRequest, CreateThreadResponse, Lenient, MarkReadRequest,
    MessagePage, Pagination, SendMessageRequest, SendMessageResponse, ThreadActionRequest,
    ThreadPage, UploadResponse,
};

use thiserror::Error;

/// Wall-clock time in epoch milliseconds, the unit used by every timestamp on the wire.
pub fn now_millis() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("event `{kind}` is missing its data block")]
    MissingData { kind: String },
    #[error("malformed `{kind}` payload: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("ack without messageId")]
    AckWithoutId,
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
}

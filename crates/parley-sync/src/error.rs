use crate::cache::CacheError;
use crate::mutation::OperationClass;
use parley_proto::{ProtocolError, ThreadStatus};
use std::error::Error as StdError;
use std::fmt;
use std::io;
use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

/// Coarse grouping used by callers to decide how to present or react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network-level failure. Retryable, user-facing.
    Transport,
    /// The server answered, but not with something usable.
    Protocol,
    /// A local worker or file could not serve the request.
    LocalResource,
    /// A record was missing required fields.
    DataIntegrity,
    /// The caller asked for something that cannot happen right now.
    Usage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Timeout,
    HostUnresolved,
    ConnectionRefused,
    Io,
}

impl TransportKind {
    pub fn metric_label(self) -> &'static str {
        match self {
            TransportKind::Timeout => "timeout",
            TransportKind::HostUnresolved => "host_unresolved",
            TransportKind::ConnectionRefused => "connection_refused",
            TransportKind::Io => "io",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    pub kind: TransportKind,
    pub detail: String,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.kind {
            TransportKind::Timeout => "request timed out",
            TransportKind::HostUnresolved => "host could not be resolved",
            TransportKind::ConnectionRefused => "connection refused",
            TransportKind::Io => "network i/o failed",
        };
        write!(f, "{label}: {}", self.detail)
    }
}

impl StdError for TransportError {}

impl TransportError {
    pub fn new(kind: TransportKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn from_io(err: &io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransportKind::Timeout,
            io::ErrorKind::ConnectionRefused => TransportKind::ConnectionRefused,
            _ if looks_like_dns_failure(&err.to_string()) => TransportKind::HostUnresolved,
            _ => TransportKind::Io,
        };
        Self::new(kind, err.to_string())
    }

    /// Walks the source chain looking for the most specific cause.
    fn classify_chain(top: &(dyn StdError + 'static), fallback: TransportKind) -> Self {
        let mut current: Option<&(dyn StdError + 'static)> = Some(top);
        while let Some(err) = current {
            if let Some(io_err) = err.downcast_ref::<io::Error>() {
                let classified = Self::from_io(io_err);
                if classified.kind != TransportKind::Io {
                    return Self::new(classified.kind, top.to_string());
                }
            }
            if looks_like_dns_failure(&err.to_string()) {
                return Self::new(TransportKind::HostUnresolved, top.to_string());
            }
            current = err.source();
        }
        Self::new(fallback, top.to_string())
    }
}

fn looks_like_dns_failure(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("dns error")
        || lower.contains("failed to lookup")
        || lower.contains("name or service not known")
        || lower.contains("no such host")
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return SyncError::Malformed(err.to_string());
        }
        if err.is_timeout() {
            return SyncError::Transport(TransportError::new(
                TransportKind::Timeout,
                err.to_string(),
            ));
        }
        SyncError::Transport(TransportError::classify_chain(&err, TransportKind::Io))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match &err {
            WsError::Io(io_err) => SyncError::Transport(TransportError::from_io(io_err)),
            WsError::Http(response) => SyncError::UnexpectedStatus {
                status: response.status().as_u16(),
                body: String::new(),
            },
            WsError::Url(_) => SyncError::Rejected {
                reason: err.to_string(),
            },
            _ => SyncError::Transport(TransportError::classify_chain(&err, TransportKind::Io)),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("unexpected status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },
    #[error("server rejected the request: {reason}")]
    Rejected { reason: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("{worker} worker is not accepting work")]
    WorkerUnavailable { worker: &'static str },
    #[error("failed to read local file: {0}")]
    File(#[source] io::Error),
    #[error("already {0}")]
    Busy(OperationClass),
    #[error("thread {0} not found")]
    ThreadNotFound(i64),
    #[error("message {0} not found")]
    MessageNotFound(i64),
    #[error("thread {thread_id} cannot move from {} to {}", .from.as_str(), .to.as_str())]
    InvalidTransition {
        thread_id: i64,
        from: ThreadStatus,
        to: ThreadStatus,
    },
    #[error("message {0} is not a failed placeholder")]
    NotRetryable(i64),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("gave up after {attempts} attempts: {last}")]
    GaveUp { attempts: u32, last: Box<SyncError> },
    #[error("engine is shut down")]
    Shutdown,
}

impl SyncError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SyncError::Transport(_) => ErrorCategory::Transport,
            SyncError::UnexpectedStatus { .. }
            | SyncError::Rejected { .. }
            | SyncError::Malformed(_)
            | SyncError::Protocol(_) => ErrorCategory::Protocol,
            SyncError::WorkerUnavailable { .. } | SyncError::File(_) | SyncError::Shutdown => {
                ErrorCategory::LocalResource
            }
            SyncError::Cache(CacheError::Invalid(_)) => ErrorCategory::DataIntegrity,
            SyncError::Cache(_) => ErrorCategory::LocalResource,
            SyncError::Busy(_)
            | SyncError::ThreadNotFound(_)
            | SyncError::MessageNotFound(_)
            | SyncError::InvalidTransition { .. }
            | SyncError::NotRetryable(_) => ErrorCategory::Usage,
            SyncError::GaveUp { last, .. } => last.category(),
        }
    }

    /// Whether repeating the same request later could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport(_) => true,
            SyncError::UnexpectedStatus { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    pub fn transport_kind(&self) -> Option<TransportKind> {
        match self {
            SyncError::Transport(err) => Some(err.kind),
            SyncError::GaveUp { last, .. } => last.transport_kind(),
            _ => None,
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            SyncError::Transport(err) => err.kind.metric_label(),
            SyncError::UnexpectedStatus { .. } => "unexpected_status",
            SyncError::Rejected { .. } => "rejected",
            SyncError::Malformed(_) | SyncError::Protocol(_) => "malformed",
            SyncError::WorkerUnavailable { .. } => "worker_unavailable",
            SyncError::File(_) => "file",
            SyncError::Busy(_) => "busy",
            SyncError::ThreadNotFound(_) | SyncError::MessageNotFound(_) => "not_found",
            SyncError::InvalidTransition { .. } => "invalid_transition",
            SyncError::NotRetryable(_) => "not_retryable",
            SyncError::Cache(_) => "cache",
            SyncError::GaveUp { .. } => "gave_up",
            SyncError::Shutdown => "shutdown",
        }
    }

    /// Short sentence suitable for a toast or status line.
    pub fn user_message(&self) -> String {
        match self {
            SyncError::Transport(err) => match err.kind {
                TransportKind::Timeout => {
                    "The server took too long to respond. Check your connection and try again."
                        .to_string()
                }
                TransportKind::HostUnresolved => {
                    "Cannot reach the server. Check your network connection.".to_string()
                }
                TransportKind::ConnectionRefused => {
                    "The server refused the connection. Try again later.".to_string()
                }
                TransportKind::Io => format!("Network error: {}", err.detail),
            },
            SyncError::UnexpectedStatus { status, .. } => format!("Server error ({status})."),
            SyncError::Rejected { reason } => reason.clone(),
            SyncError::Busy(class) => format!("Already {class}. Please wait."),
            SyncError::GaveUp { last, .. } => last.user_message(),
            other => other.to_string(),
        }
    }
}

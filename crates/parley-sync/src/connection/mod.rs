//! Live push channel.
//!
//! [`ConnectionManager`] owns the channel lifecycle (open, heartbeat,
//! reconnect with backoff, background suppression) as a single actor task.
//! The transport itself sits behind [`LiveConnector`] so tests can swap in
//! scripted channels; [`WsConnector`] is the WebSocket implementation.

mod manager;
mod ws;

pub use manager::ConnectionManager;
pub use ws::WsConnector;

use crate::error::SyncResult;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One open bidirectional channel. Text frames in both directions.
pub struct LiveChannel {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
    /// Transport task to abort when the channel is dropped on purpose.
    pub task: Option<JoinHandle<()>>,
}

impl LiveChannel {
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            task: None,
        }
    }

    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.task = Some(task);
        self
    }

    fn close(self) {
        drop(self.outbound);
        if let Some(task) = self.task {
            task.abort();
        }
    }
}

#[async_trait]
pub trait LiveConnector: Send + Sync {
    async fn connect(&self) -> SyncResult<LiveChannel>;
}

/// Receives every inbound frame, in arrival order.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle_frame(&self, frame: String);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting { attempt: u32 },
    Connected,
    AwaitingRetry { attempt: u32, delay: Duration },
    GivenUp { last_error: String },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected { reason: String },
    /// The retry ceiling was reached; nothing is scheduled until the next open.
    GaveUp { attempts: u32, last_error: String },
}

/// Outcome of a send on the live channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Stored in the outbox; replayed on the next successful connect.
    Queued,
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
    pub backoff: crate::backoff::BackoffPolicy,
}

impl ConnectionSettings {
    pub fn from_config(config: &crate::config::SyncConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            connect_timeout: config.connect_timeout(),
            backoff: config.reconnect_policy(),
        }
    }
}

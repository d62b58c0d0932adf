use super::{
    ConnectionEvent, ConnectionSettings, ConnectionState, Delivery, InboundHandler, LiveChannel,
    LiveConnector,
};
use crate::backoff::BackoffPolicy;
use crate::error::{SyncError, SyncResult};
use crate::outbox::OutboundTracker;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use parley_proto::Envelope;
use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 64;

enum Command {
    Open,
    Close,
    Send {
        envelope: Envelope,
        thread_id: Option<i64>,
        reply: oneshot::Sender<SyncResult<Delivery>>,
    },
    Foreground,
    Background,
    NetworkAvailable,
    Shutdown,
}

/// What woke the actor loop.
enum Wake {
    Command(Command),
    ConnectFinished(SyncResult<LiveChannel>),
    Frame(Option<String>),
    Heartbeat,
    RetryDue,
}

/// Handle to the connection actor. Cheap to clone; every clone drives the same channel.
#[derive(Clone)]
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ConnectionManager {
    /// Spawns the actor and its frame dispatcher. The manager starts
    /// foregrounded and disconnected; nothing happens until [`open`](Self::open).
    pub fn spawn(
        connector: Arc<dyn LiveConnector>,
        handler: Arc<dyn InboundHandler>,
        outbox: OutboundTracker,
        settings: ConnectionSettings,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<String>();

        let dispatcher = tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                handler.handle_frame(frame).await;
            }
        });

        let actor = Actor {
            connector,
            backoff: settings.backoff,
            heartbeat_interval: settings.heartbeat_interval.max(Duration::from_millis(1)),
            connect_timeout: settings.connect_timeout,
            outbox,
            frames: frame_tx,
            state: state_tx,
            events: events.clone(),
            foreground: true,
            wanted: false,
            attempt: 0,
            channel: None,
            connecting: None,
            retry: None,
            heartbeat: None,
        };
        let actor_task = tokio::spawn(actor.run(command_rx));

        Self {
            commands,
            state,
            events,
            tasks: Arc::new(Mutex::new(vec![actor_task, dispatcher])),
        }
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!(target = "parley::connection", "connection actor already stopped");
        }
    }

    /// Opens the channel if foregrounded and none is open. Idempotent.
    pub fn open(&self) {
        self.command(Command::Open);
    }

    /// Intentional disconnect: no reconnection, pending retry cancelled.
    pub fn close(&self) {
        self.command(Command::Close);
    }

    pub fn foreground(&self) {
        self.command(Command::Foreground);
    }

    pub fn background(&self) {
        self.command(Command::Background);
    }

    pub fn network_available(&self) {
        self.command(Command::NetworkAvailable);
    }

    /// Transmits now when connected, otherwise stores the envelope in the outbox.
    pub async fn send(&self, envelope: Envelope, thread_id: Option<i64>) -> SyncResult<Delivery> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                envelope,
                thread_id,
                reply,
            })
            .map_err(|_| SyncError::Shutdown)?;
        rx.await.map_err(|_| SyncError::Shutdown)?
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Closes the channel and stops the actor. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.command(Command::Shutdown);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

struct Actor {
    connector: Arc<dyn LiveConnector>,
    backoff: BackoffPolicy,
    heartbeat_interval: Duration,
    connect_timeout: Duration,
    outbox: OutboundTracker,
    frames: mpsc::UnboundedSender<String>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    foreground: bool,
    /// Someone asked for the channel and has not closed it since.
    wanted: bool,
    /// Consecutive failures since the last successful connect.
    attempt: u32,
    channel: Option<LiveChannel>,
    connecting: Option<BoxFuture<'static, SyncResult<LiveChannel>>>,
    retry: Option<Pin<Box<Sleep>>>,
    heartbeat: Option<Interval>,
}

async fn finish_connect(
    slot: &mut Option<BoxFuture<'static, SyncResult<LiveChannel>>>,
) -> SyncResult<LiveChannel> {
    match slot.as_mut() {
        Some(fut) => fut.await,
        None => pending().await,
    }
}

async fn next_frame(channel: &mut Option<LiveChannel>) -> Option<String> {
    match channel.as_mut() {
        Some(channel) => channel.inbound.recv().await,
        None => pending().await,
    }
}

async fn next_heartbeat(heartbeat: &mut Option<Interval>) {
    match heartbeat.as_mut() {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending::<()>().await,
    }
}

async fn retry_due(retry: &mut Option<Pin<Box<Sleep>>>) {
    match retry.as_mut() {
        Some(sleep) => sleep.as_mut().await,
        None => pending::<()>().await,
    }
}

impl Actor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let wake = tokio::select! {
                command = commands.recv() => Wake::Command(command.unwrap_or(Command::Shutdown)),
                result = finish_connect(&mut self.connecting) => Wake::ConnectFinished(result),
                frame = next_frame(&mut self.channel) => Wake::Frame(frame),
                _ = next_heartbeat(&mut self.heartbeat) => Wake::Heartbeat,
                _ = retry_due(&mut self.retry) => Wake::RetryDue,
            };

            match wake {
                Wake::Command(Command::Shutdown) => {
                    self.teardown();
                    info!(target = "parley::connection", "connection actor stopped");
                    break;
                }
                Wake::Command(command) => self.on_command(command).await,
                Wake::ConnectFinished(result) => {
                    self.connecting = None;
                    match result {
                        Ok(channel) => self.on_connected(channel).await,
                        Err(err) => {
                            warn!(target = "parley::connection", error = %err, "connect attempt failed");
                            self.on_disconnect(err.to_string());
                        }
                    }
                }
                Wake::Frame(Some(frame)) => {
                    let _ = self.frames.send(frame);
                }
                Wake::Frame(None) => {
                    info!(target = "parley::connection", "live channel closed by peer");
                    self.on_disconnect("channel closed".to_string());
                }
                Wake::Heartbeat => self.send_heartbeat(),
                Wake::RetryDue => {
                    self.retry = None;
                    if self.may_connect() {
                        self.start_connect();
                    }
                }
            }
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Open => {
                self.wanted = true;
                if matches!(*self.state.borrow(), ConnectionState::GivenUp { .. }) {
                    self.attempt = 0;
                }
                if self.may_connect() && self.retry.is_none() {
                    self.start_connect();
                } else if !self.foreground {
                    debug!(target = "parley::connection", "open deferred until foreground");
                }
            }
            Command::Close => {
                self.wanted = false;
                self.drop_channel();
                self.set_state(ConnectionState::Disconnected);
                info!(target = "parley::connection", "live channel closed on request");
            }
            Command::Send {
                envelope,
                thread_id,
                reply,
            } => {
                let _ = reply.send(self.deliver(envelope, thread_id).await);
            }
            Command::Foreground => {
                self.foreground = true;
                self.wanted = true;
                self.attempt = 0;
                if self.may_connect() && self.retry.is_none() {
                    self.start_connect();
                }
            }
            Command::Background => {
                self.foreground = false;
                self.drop_channel();
                self.set_state(ConnectionState::Disconnected);
                debug!(target = "parley::connection", "backgrounded; channel closed");
            }
            Command::NetworkAvailable => {
                if self.wanted && self.foreground && self.channel.is_none() {
                    self.retry = None;
                    self.attempt = 0;
                    if self.connecting.is_none() {
                        info!(target = "parley::connection", "network available; reconnecting");
                        self.start_connect();
                    }
                }
            }
            Command::Shutdown => unreachable!("handled by the loop"),
        }
    }

    fn may_connect(&self) -> bool {
        self.wanted && self.foreground && self.channel.is_none() && self.connecting.is_none()
    }

    fn start_connect(&mut self) {
        let connector = self.connector.clone();
        let timeout = self.connect_timeout;
        self.set_state(ConnectionState::Connecting {
            attempt: self.attempt,
        });
        self.connecting = Some(Box::pin(async move {
            match tokio::time::timeout(timeout, connector.connect()).await {
                Ok(result) => result,
                Err(_) => Err(SyncError::Transport(crate::error::TransportError::new(
                    crate::error::TransportKind::Timeout,
                    format!("connect did not finish within {}ms", timeout.as_millis()),
                ))),
            }
        }));
    }

    async fn on_connected(&mut self, channel: LiveChannel) {
        if !self.wanted || !self.foreground {
            debug!(target = "parley::connection", "discarding channel opened after close");
            channel.close();
            return;
        }
        let outbound = channel.outbound.clone();
        self.channel = Some(channel);
        self.attempt = 0;
        self.retry = None;
        let mut interval = tokio::time::interval_at(
            Instant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.heartbeat = Some(interval);
        self.set_state(ConnectionState::Connected);
        let _ = self.events.send(ConnectionEvent::Connected);
        metrics::gauge!("parley_connection_up", 1.0);
        info!(target = "parley::connection", "live channel connected");

        match self
            .outbox
            .flush(|payload| outbound.send(payload.to_string()).is_ok())
            .await
        {
            Ok(report) if report.sent > 0 => {
                debug!(target = "parley::connection", sent = report.sent, "replayed outbox")
            }
            Ok(_) => {}
            Err(err) => warn!(target = "parley::connection", error = %err, "outbox flush failed"),
        }
    }

    /// Drops the current channel and, unless the disconnect was intentional,
    /// schedules the next attempt. Any previously scheduled retry is replaced.
    fn on_disconnect(&mut self, reason: String) {
        let was_connected = self.channel.is_some();
        self.release_channel();
        if was_connected {
            let _ = self.events.send(ConnectionEvent::Disconnected {
                reason: reason.clone(),
            });
        }
        if !self.wanted || !self.foreground {
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        self.retry = None;
        self.attempt += 1;
        match self.backoff.delay(self.attempt) {
            Some(delay) => {
                info!(
                    target = "parley::connection",
                    attempt = self.attempt,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "reconnect scheduled"
                );
                metrics::counter!("parley_reconnect_scheduled_total", 1);
                self.retry = Some(Box::pin(tokio::time::sleep(delay)));
                self.set_state(ConnectionState::AwaitingRetry {
                    attempt: self.attempt,
                    delay,
                });
            }
            None => {
                let attempts = self.attempt;
                warn!(
                    target = "parley::connection",
                    attempts,
                    reason = %reason,
                    "giving up on live channel"
                );
                metrics::counter!("parley_reconnect_given_up_total", 1);
                let _ = self.events.send(ConnectionEvent::GaveUp {
                    attempts,
                    last_error: reason.clone(),
                });
                self.set_state(ConnectionState::GivenUp { last_error: reason });
            }
        }
    }

    async fn deliver(&mut self, envelope: Envelope, thread_id: Option<i64>) -> SyncResult<Delivery> {
        let text = envelope.to_text()?;
        if let Some(channel) = self.channel.as_ref() {
            if channel.outbound.send(text).is_ok() {
                return Ok(Delivery::Sent);
            }
            self.on_disconnect("channel closed during send".to_string());
        }
        self.outbox.enqueue(thread_id, &envelope).await?;
        Ok(Delivery::Queued)
    }

    fn send_heartbeat(&mut self) {
        let Some(channel) = self.channel.as_ref() else {
            return;
        };
        let frame = match Envelope::heartbeat().to_text() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(target = "parley::connection", error = %err, "failed to encode heartbeat");
                return;
            }
        };
        if channel.outbound.send(frame).is_err() {
            self.on_disconnect("heartbeat failed".to_string());
        }
    }

    fn release_channel(&mut self) {
        self.heartbeat = None;
        if let Some(channel) = self.channel.take() {
            channel.close();
            metrics::gauge!("parley_connection_up", 0.0);
        }
    }

    /// Cancels everything in flight: channel, connect attempt and retry timer.
    fn drop_channel(&mut self) {
        self.retry = None;
        self.connecting = None;
        self.release_channel();
    }

    fn teardown(&mut self) {
        self.wanted = false;
        self.drop_channel();
        self.set_state(ConnectionState::Disconnected);
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_replace(next);
    }
}

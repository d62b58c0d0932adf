use super::{LiveChannel, LiveConnector};
use crate::api::TokenProvider;
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::Url;

/// Opens the live channel over WebSocket at `{base}{user_id}?token=…`.
pub struct WsConnector {
    base_url: String,
    user_id: i64,
    tokens: Arc<dyn TokenProvider>,
    liveness_timeout: Duration,
}

impl WsConnector {
    pub fn new(
        base_url: impl Into<String>,
        user_id: i64,
        tokens: Arc<dyn TokenProvider>,
        liveness_timeout: Duration,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            user_id,
            tokens,
            liveness_timeout,
        }
    }

    fn endpoint(&self, token: &str) -> SyncResult<Url> {
        let mut base = self.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let mut url = Url::parse(&format!("{base}{}", self.user_id)).map_err(|err| {
            SyncError::Rejected {
                reason: format!("invalid live channel url: {err}"),
            }
        })?;
        url.query_pairs_mut().append_pair("token", token);
        Ok(url)
    }
}

#[async_trait]
impl LiveConnector for WsConnector {
    async fn connect(&self) -> SyncResult<LiveChannel> {
        let token = self.tokens.token().await?;
        let url = self.endpoint(&token)?;
        let (stream, _) = connect_async(url.as_str()).await?;
        debug!(target = "parley::ws", user_id = self.user_id, "websocket handshake complete");

        let (mut sink, mut source) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();
        let liveness = self.liveness_timeout;

        let task = tokio::spawn(async move {
            let writer = tokio::spawn(async move {
                while let Some(text) = out_rx.recv().await {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                let _ = sink.send(Message::Close(None)).await;
            });

            loop {
                match tokio::time::timeout(liveness, source.next()).await {
                    Ok(Some(Ok(Message::Text(text)))) => {
                        if in_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(Some(Ok(Message::Binary(bytes)))) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            if in_tx.send(text).is_err() {
                                break;
                            }
                        }
                        Err(_) => warn!(target = "parley::ws", "dropping non-utf8 binary frame"),
                    },
                    Ok(Some(Ok(Message::Close(frame)))) => {
                        debug!(target = "parley::ws", ?frame, "peer closed websocket");
                        break;
                    }
                    Ok(Some(Ok(_))) => {}
                    Ok(Some(Err(err))) => {
                        warn!(target = "parley::ws", error = %err, "websocket read failed");
                        break;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        warn!(
                            target = "parley::ws",
                            timeout_ms = liveness.as_millis() as u64,
                            "no frame within liveness window; dropping channel"
                        );
                        break;
                    }
                }
            }
            writer.abort();
        });

        Ok(LiveChannel::new(out_tx, in_rx).with_task(task))
    }
}

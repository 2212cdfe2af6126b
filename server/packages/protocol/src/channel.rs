//! Correlated request/response client for a runtime's console port.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::control::{reply_is_ready, ConsoleMessage, ControlRequest, IS_READY};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Value>>>>;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("request `{kind}` timed out after {timeout_ms}ms")]
    RequestTimeout { kind: String, timeout_ms: u64 },
    #[error("control connection lost")]
    ConnectionLost,
    #[error("failed to serialize control message: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to send control message: {0}")]
    Send(String),
    #[error("invalid reply: {reason}")]
    InvalidReply { reason: String },
}

/// Inbound messages that did not answer a pending request.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    Log { message: String },
    Unsolicited(Value),
}

pub struct ControlChannel {
    url: String,
    writer: Arc<Mutex<WsSink>>,
    pending: PendingMap,
    events: broadcast::Sender<ControlEvent>,
    closed: watch::Receiver<bool>,
    reader: JoinHandle<()>,
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("url", &self.url)
            .field("closed", &*self.closed.borrow())
            .finish()
    }
}

impl ControlChannel {
    pub async fn connect(url: &str) -> Result<Self, ChannelError> {
        let (stream, _) =
            tokio_tungstenite::connect_async(url)
                .await
                .map_err(|err| ChannelError::Connect {
                    url: url.to_string(),
                    reason: err.to_string(),
                })?;
        let (writer, reader) = stream.split();

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (closed_tx, closed) = watch::channel(false);

        let reader = tokio::spawn(read_loop(
            reader,
            Arc::clone(&pending),
            events.clone(),
            closed_tx,
        ));

        tracing::debug!(url, "control channel connected");
        Ok(Self {
            url: url.to_string(),
            writer: Arc::new(Mutex::new(writer)),
            pending,
            events,
            closed,
            reader,
        })
    }

    /// Connects, giving up after `timeout`.
    pub async fn connect_with_timeout(url: &str, timeout: Duration) -> Result<Self, ChannelError> {
        tokio::time::timeout(timeout, Self::connect(url))
            .await
            .map_err(|_| ChannelError::Connect {
                url: url.to_string(),
                reason: format!("timed out after {}ms", timeout.as_millis()),
            })?
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Sends `{id, type, ...payload}` and waits for the reply carrying the
    /// same id.
    pub async fn send(
        &self,
        kind: &str,
        payload: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value, ChannelError> {
        let id = uuid::Uuid::new_v4().to_string();
        let request = ControlRequest::new(id.clone(), kind, payload);
        let text = serde_json::to_string(&request)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);
        // the reader may have drained the map just before the insert
        if self.is_closed() {
            self.pending.lock().await.remove(&id);
            return Err(ChannelError::ConnectionLost);
        }

        if let Err(err) = self.write(text).await {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        let issued_at = Instant::now();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => {
                tracing::debug!(
                    id = %id,
                    kind,
                    elapsed_ms = issued_at.elapsed().as_millis() as u64,
                    "control reply"
                );
                Ok(reply)
            }
            Ok(Err(_)) => Err(ChannelError::ConnectionLost),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                tracing::debug!(id = %id, kind, "control request timed out");
                Err(ChannelError::RequestTimeout {
                    kind: kind.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Sends the `is-ready` handshake; the runtime must answer positively.
    pub async fn handshake(&self, timeout: Duration) -> Result<(), ChannelError> {
        let reply = self.send(IS_READY, Map::new(), timeout).await?;
        if reply_is_ready(&reply) {
            Ok(())
        } else {
            Err(ChannelError::InvalidReply {
                reason: format!("runtime not ready: {reply}"),
            })
        }
    }

    /// Fire-and-forget console message.
    pub async fn notify(&self, message: &ConsoleMessage) -> Result<(), ChannelError> {
        let text = serde_json::to_string(message)?;
        self.write(text).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the socket has closed for any reason.
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.send(Message::Close(None)).await;
        let _ = writer.close().await;
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn write(&self, text: String) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::ConnectionLost);
        }
        let mut writer = self.writer.lock().await;
        writer
            .send(Message::Text(text))
            .await
            .map_err(|err| ChannelError::Send(err.to_string()))
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(
    mut reader: SplitStream<WsStream>,
    pending: PendingMap,
    events: broadcast::Sender<ControlEvent>,
    closed: watch::Sender<bool>,
) {
    while let Some(message) = reader.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                tracing::debug!(error = %err, "control channel read failed");
                break;
            }
        };

        let value: Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(error = %err, "dropping malformed control message");
                continue;
            }
        };

        if let Some(id) = value.get("id").and_then(Value::as_str) {
            let waiter = pending.lock().await.remove(id);
            if let Some(waiter) = waiter {
                let _ = waiter.send(value);
                continue;
            }
        }

        let event = match value.get("message").and_then(Value::as_str) {
            Some(message) => ControlEvent::Log {
                message: message.to_string(),
            },
            None => ControlEvent::Unsolicited(value),
        };
        let _ = events.send(event);
    }

    // published before draining so late senders fail fast
    closed.send_replace(true);
    // waiters see their sender dropped
    pending.lock().await.clear();
}

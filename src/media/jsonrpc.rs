// src/media/jsonrpc.rs
//
// Minimal JSON-RPC 2.0 client over a WebSocket.
//
// One writer task owns the sink, one reader task owns the stream.  Requests
// are correlated with their responses through a map of oneshot senders keyed
// by request id; frames carrying a `method` and no `id` are server
// notifications and go to the handler supplied at connect time.
//
// ────────────────────────────────────────────────────────────────────────────

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receives `(method, params)` for every server notification.
pub type NotificationHandler = Arc<dyn Fn(&str, Value) + Send + Sync>;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, CallError>>>>>;

// ─── Errors ─────────────────────────────────────────────────────────────────

/// The `error` member of a JSON-RPC response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallError {
    /// The peer answered with an error object.
    Remote(RpcError),
    /// The connection is gone (or never was).
    Closed(String),
}

// ─── Frame classification ───────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
enum Incoming {
    Response { id: u64, outcome: Result<Value, CallError> },
    Notification { method: String, params: Value },
    Ignored,
}

fn classify(text: &str) -> Incoming {
    let Ok(frame) = serde_json::from_str::<Value>(text) else {
        warn!("dropping non-JSON frame from media server");
        return Incoming::Ignored;
    };

    if let Some(id) = frame.get("id").and_then(Value::as_u64) {
        if let Some(err) = frame.get("error") {
            let outcome = match serde_json::from_value::<RpcError>(err.clone()) {
                Ok(e) => Err(CallError::Remote(e)),
                Err(e) => Err(CallError::Closed(format!("malformed error object: {e}"))),
            };
            return Incoming::Response { id, outcome };
        }
        if frame.get("method").is_none() {
            let result = frame.get("result").cloned().unwrap_or(Value::Null);
            return Incoming::Response { id, outcome: Ok(result) };
        }
    }

    match frame.get("method").and_then(Value::as_str) {
        Some(method) => Incoming::Notification {
            method: method.to_string(),
            params: frame.get("params").cloned().unwrap_or(Value::Null),
        },
        None => Incoming::Ignored,
    }
}

// ─── RpcSession ─────────────────────────────────────────────────────────────

pub struct RpcSession {
    outbound: mpsc::UnboundedSender<Message>,
    pending: PendingMap,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl RpcSession {
    /// Open the WebSocket and start the reader/writer tasks.
    pub async fn connect(uri: &str, on_notification: NotificationHandler) -> Result<Self, CallError> {
        let (ws, _) = connect_async(uri)
            .await
            .map_err(|e| CallError::Closed(format!("cannot connect to {uri}: {e}")))?;
        info!(uri = %uri, "media server control channel connected");

        let (mut sink, mut stream) = ws.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();

        // Writer.
        let writer_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_shutdown.cancelled() => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    msg = outbound_rx.recv() => {
                        let Some(msg) = msg else { break };
                        if let Err(e) = sink.send(msg).await {
                            warn!("media server write failed: {e}");
                            writer_shutdown.cancel();
                            break;
                        }
                    }
                }
            }
        });

        // Reader.
        let reader_shutdown = shutdown.clone();
        let reader_pending = pending.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = reader_shutdown.cancelled() => break,
                    frame = stream.next() => frame,
                };
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        dispatch(&text, &reader_pending, &on_notification);
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => dispatch(&text, &reader_pending, &on_notification),
                        Err(_) => warn!("dropping non-UTF-8 frame from media server"),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        info!("media server closed the control channel");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("media server control channel error: {e}");
                        break;
                    }
                }
            }
            reader_shutdown.cancel();
            fail_pending(&reader_pending, "control channel closed");
        });

        Ok(Self {
            outbound,
            pending,
            next_id: AtomicU64::new(1),
            shutdown,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Token cancelled when the connection goes away; lets sibling tasks
    /// (keepalive) stop with it.
    pub fn closed_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Send a request and wait for the matching response.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, CallError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        // Checked after registering so a concurrent `fail_pending` either
        // sees our entry or we see the cancellation.
        if self.is_closed() {
            return Err(CallError::Closed("control channel closed".into()));
        }

        let frame = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        debug!(id, method, "media server request");
        self.outbound
            .send(Message::Text(frame.to_string()))
            .map_err(|_| CallError::Closed("control channel closed".into()))?;

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(CallError::Closed("control channel dropped".into())),
        }
    }
}

impl Drop for RpcSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Removes an abandoned request (e.g. timed out by the caller) from the
/// pending map.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn dispatch(text: &str, pending: &PendingMap, on_notification: &NotificationHandler) {
    match classify(text) {
        Incoming::Response { id, outcome } => match lock(pending).remove(&id) {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => debug!(id, "response for abandoned request"),
        },
        Incoming::Notification { method, params } => on_notification(&method, params),
        Incoming::Ignored => {}
    }
}

fn fail_pending(pending: &PendingMap, reason: &str) {
    let drained: Vec<_> = lock(pending).drain().collect();
    for (_, tx) in drained {
        let _ = tx.send(Err(CallError::Closed(reason.to_string())));
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

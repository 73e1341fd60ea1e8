use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::{
    deadline::Deadline,
    error::BridgeError,
    stream::{StreamSubscription, StreamTracker},
};

type Waiter = oneshot::Sender<Result<Value, BridgeError>>;

/// Multiplexes calls and streams over one transport.
///
/// Responses are matched to callers by id, so a slow call or an unread stream
/// never holds up anything else sharing the session.
pub struct Dispatcher {
    outbound: mpsc::UnboundedSender<String>,
    pending: Mutex<HashMap<u64, Waiter>>,
    streams: Arc<StreamTracker>,
    notifications: broadcast::Sender<Value>,
    next_id: AtomicU64,
    default_timeout: Duration,
    connected: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl Dispatcher {
    pub fn start(
        outbound: mpsc::UnboundedSender<String>,
        mut inbound: mpsc::UnboundedReceiver<String>,
        default_timeout: Duration,
        notifications: broadcast::Sender<Value>,
    ) -> Arc<Self> {
        let (closed_tx, _) = watch::channel(false);
        let this = Arc::new(Self {
            streams: StreamTracker::new(outbound.clone()),
            outbound,
            pending: Mutex::new(HashMap::new()),
            notifications,
            next_id: AtomicU64::new(1),
            default_timeout,
            connected: AtomicBool::new(true),
            closed_tx,
        });

        let reader = Arc::clone(&this);
        tokio::spawn(async move {
            while let Some(line) = inbound.recv().await {
                reader.handle_line(&line).await;
            }
            if reader.is_connected() {
                tracing::warn!("protocol transport closed");
            }
            reader.fail_all(BridgeError::Disconnected).await;
        });

        this
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Resolves to `true` once the transport is gone.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    pub fn streams(&self) -> &Arc<StreamTracker> {
        &self.streams
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u64, Waiter>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn invoke(&self, method: &str, params: Value) -> Result<Value, BridgeError> {
        self.invoke_with_timeout(method, params, self.default_timeout)
            .await
    }

    pub async fn invoke_with_timeout(
        &self,
        method: &str,
        params: Value,
        limit: Duration,
    ) -> Result<Value, BridgeError> {
        if !self.is_connected() {
            return Err(BridgeError::Disconnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending().insert(id, tx);
        // Removes the entry however this call ends, including when the caller
        // drops the future before an answer or timeout.
        let _entry = PendingEntry {
            dispatcher: self,
            id,
        };

        // A teardown racing this insert has already drained the table.
        if !self.is_connected() {
            return Err(BridgeError::Disconnected);
        }

        let frame = json!({
            "id": id,
            "method": method,
            "params": params,
        });
        if self.outbound.send(frame.to_string()).is_err() {
            return Err(BridgeError::Disconnected);
        }

        let result = Deadline::new("invoke", limit)
            .run(async { rx.await.unwrap_or(Err(BridgeError::Disconnected)) })
            .await;

        if let Err(BridgeError::Timeout(_)) = &result {
            tracing::warn!(method, request_id = id, "invoke timed out");
        }
        result
    }

    /// Notification to the protocol service; no response is expected.
    pub fn notify(&self, method: &str, params: Value) -> Result<(), BridgeError> {
        let frame = json!({ "method": method, "params": params });
        self.outbound
            .send(frame.to_string())
            .map_err(|_| BridgeError::Disconnected)
    }

    pub fn open_stream(&self, topic: &str, params: Value) -> Result<StreamSubscription, BridgeError> {
        if !self.is_connected() {
            return Err(BridgeError::Disconnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let subscription = self.streams.register(id, topic);
        let frame = json!({
            "id": id,
            "method": topic,
            "params": params,
            "stream": true,
        });
        if self.outbound.send(frame.to_string()).is_err() {
            self.streams.finish(id, Some(BridgeError::Disconnected));
            return Err(BridgeError::Disconnected);
        }

        tracing::debug!(stream_id = id, topic, "stream opened");
        Ok(subscription)
    }

    async fn handle_line(&self, line: &str) {
        let value = match serde_json::from_str::<Value>(line) {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(%error, line, "invalid protocol json");
                return;
            }
        };
        let Some(object) = value.as_object() else {
            return;
        };

        let method = object.get("method").and_then(Value::as_str);
        let id = parse_frame_id(object.get("id"));

        match (method, id) {
            (Some(method), None) => {
                let _ = self.notifications.send(json!({
                    "method": method,
                    "params": object.get("params").cloned().unwrap_or(Value::Null),
                }));
            }
            (Some(method), Some(id)) => {
                let _ = self.outbound.send(
                    json!({
                        "id": id,
                        "error": {
                            "code": -32601,
                            "message": format!("Unsupported server request method: {method}")
                        }
                    })
                    .to_string(),
                );
            }
            (None, Some(id)) if self.streams.is_tracked(id) => {
                if let Some(item) = object.get("item") {
                    self.streams.deliver(id, item.clone());
                } else if let Some(error) = object.get("error") {
                    self.streams.finish(id, Some(BridgeError::from_remote(error)));
                } else if object.get("done").and_then(Value::as_bool) == Some(true) {
                    self.streams.finish(id, None);
                }
            }
            (None, Some(id)) => {
                let waiter = self.pending().remove(&id);
                let Some(waiter) = waiter else {
                    tracing::debug!(request_id = id, "dropping frame for unknown id");
                    return;
                };

                let result = match object.get("error") {
                    Some(error) => Err(BridgeError::from_remote(error)),
                    None => Ok(object.get("result").cloned().unwrap_or(Value::Null)),
                };
                let _ = waiter.send(result);
            }
            (None, None) => {}
        }
    }

    /// Abort every in-flight call and stream. Later calls fail with `Disconnected`.
    pub async fn fail_all(&self, error: BridgeError) {
        self.connected.store(false, Ordering::SeqCst);

        let waiters = {
            let mut pending = self.pending();
            pending.drain().map(|(_, waiter)| waiter).collect::<Vec<_>>()
        };
        if !waiters.is_empty() {
            tracing::info!(count = waiters.len(), %error, "failing pending calls");
        }
        for waiter in waiters {
            let _ = waiter.send(Err(error.clone()));
        }

        self.streams.close_all(error);
        self.closed_tx.send_replace(true);
    }
}

struct PendingEntry<'a> {
    dispatcher: &'a Dispatcher,
    id: u64,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.dispatcher.pending().remove(&self.id);
    }
}

fn parse_frame_id(value: Option<&Value>) -> Option<u64> {
    let value = value?;

    if let Some(number) = value.as_u64() {
        return Some(number);
    }

    if let Some(raw) = value.as_str() {
        return raw.parse::<u64>().ok();
    }

    None
}

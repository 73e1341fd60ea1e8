use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use axum::extract::ws::Message;
use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};

use crate::stream::StreamStopper;

struct ClientEntry {
    tx: mpsc::UnboundedSender<Message>,
    streams: HashMap<u64, StreamStopper>,
}

/// Connected UI clients and the streams each of them owns.
pub struct ClientHub {
    next_client_id: AtomicU64,
    clients: RwLock<HashMap<u64, ClientEntry>>,
}

impl ClientHub {
    pub fn new() -> Self {
        Self {
            next_client_id: AtomicU64::new(1),
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add_client(&self, tx: mpsc::UnboundedSender<Message>) -> u64 {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        self.clients.write().await.insert(
            id,
            ClientEntry {
                tx,
                streams: HashMap::new(),
            },
        );
        id
    }

    /// Forget a client and stop every stream it opened.
    pub async fn remove_client(&self, client_id: u64) {
        let entry = self.clients.write().await.remove(&client_id);
        let Some(entry) = entry else {
            return;
        };
        for stopper in entry.streams.values() {
            stopper.stop();
        }
        if !entry.streams.is_empty() {
            tracing::debug!(client_id, count = entry.streams.len(), "stopped client streams");
        }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Returns false if the client is already gone; the caller must then stop the stream.
    pub async fn attach_stream(&self, client_id: u64, stopper: StreamStopper) -> bool {
        let mut clients = self.clients.write().await;
        match clients.get_mut(&client_id) {
            Some(entry) => {
                entry.streams.insert(stopper.id(), stopper);
                true
            }
            None => false,
        }
    }

    pub async fn detach_stream(&self, client_id: u64, stream_id: u64) -> Option<StreamStopper> {
        self.clients
            .write()
            .await
            .get_mut(&client_id)
            .and_then(|entry| entry.streams.remove(&stream_id))
    }

    /// Queue a frame for one client. Returns whether the client is still there.
    pub async fn send_json(&self, client_id: u64, value: Value) -> bool {
        let Some(frame) = encode_frame(&value) else {
            return false;
        };
        let clients = self.clients.read().await;
        clients
            .get(&client_id)
            .is_some_and(|entry| entry.tx.send(frame).is_ok())
    }

    /// Queue a frame for every client. Clients whose socket writer is gone are
    /// dropped along with their streams.
    pub async fn broadcast_json(&self, value: Value) -> usize {
        let Some(frame) = encode_frame(&value) else {
            return 0;
        };

        let gone = {
            let clients = self.clients.read().await;
            clients
                .iter()
                .filter(|(_, entry)| entry.tx.send(frame.clone()).is_err())
                .map(|(id, _)| *id)
                .collect::<Vec<_>>()
        };
        for client_id in &gone {
            self.remove_client(*client_id).await;
        }
        self.client_count().await
    }

    pub async fn broadcast_notification(&self, method: &str, params: Value) {
        self.broadcast_json(json!({
            "method": method,
            "params": params
        }))
        .await;
    }
}

// Utf8Bytes clones share one buffer, so a broadcast serializes once.
fn encode_frame(value: &Value) -> Option<Message> {
    match serde_json::to_string(value) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(error) => {
            tracing::warn!(%error, "dropping unserializable client frame");
            None
        }
    }
}

impl Default for ClientHub {
    fn default() -> Self {
        Self::new()
    }
}

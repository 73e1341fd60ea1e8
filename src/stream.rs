use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::error::BridgeError;

pub const STREAM_CANCEL_METHOD: &str = "stream/cancel";

#[derive(Debug)]
pub(crate) enum StreamMessage {
    Item(Value),
    End,
    Failed(BridgeError),
}

struct StreamEntry {
    topic: String,
    active: Arc<AtomicBool>,
    sender: mpsc::UnboundedSender<StreamMessage>,
}

/// Registry of open server-to-client streams for one session.
///
/// Delivery and stop both run under the entry lock, so once `stop` returns no
/// further item can be queued for that subscription.
pub struct StreamTracker {
    outbound: mpsc::UnboundedSender<String>,
    entries: Mutex<HashMap<u64, StreamEntry>>,
}

impl StreamTracker {
    pub fn new(outbound: mpsc::UnboundedSender<String>) -> Arc<Self> {
        Arc::new(Self {
            outbound,
            entries: Mutex::new(HashMap::new()),
        })
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<u64, StreamEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn register(self: &Arc<Self>, id: u64, topic: &str) -> StreamSubscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(true));
        self.entries().insert(
            id,
            StreamEntry {
                topic: topic.to_string(),
                active: active.clone(),
                sender,
            },
        );

        StreamSubscription {
            id,
            topic: topic.to_string(),
            receiver,
            active,
            finished: false,
            tracker: Arc::clone(self),
        }
    }

    pub(crate) fn is_tracked(&self, id: u64) -> bool {
        self.entries().contains_key(&id)
    }

    /// Queue an item for a live subscription. Returns false if it is gone.
    pub(crate) fn deliver(&self, id: u64, item: Value) -> bool {
        let entries = self.entries();
        match entries.get(&id) {
            Some(entry) => entry.sender.send(StreamMessage::Item(item)).is_ok(),
            None => false,
        }
    }

    /// The server ended the stream; buffered items stay readable.
    pub(crate) fn finish(&self, id: u64, error: Option<BridgeError>) {
        let entry = self.entries().remove(&id);
        if let Some(entry) = entry {
            let message = match error {
                Some(error) => StreamMessage::Failed(error),
                None => StreamMessage::End,
            };
            let _ = entry.sender.send(message);
        }
    }

    /// Stop a subscription. Safe to call any number of times.
    pub fn stop(&self, id: u64) -> bool {
        let entry = self.entries().remove(&id);
        let Some(entry) = entry else {
            return false;
        };

        entry.active.store(false, Ordering::SeqCst);
        drop(entry.sender);

        let cancel = json!({
            "method": STREAM_CANCEL_METHOD,
            "params": { "id": id },
        });
        let _ = self.outbound.send(cancel.to_string());
        tracing::debug!(stream_id = id, topic = %entry.topic, "stream stopped");
        true
    }

    /// End every subscription with `error`, as on session teardown.
    pub(crate) fn close_all(&self, error: BridgeError) {
        let drained = self.entries().drain().collect::<Vec<_>>();
        for (id, entry) in drained {
            tracing::debug!(stream_id = id, topic = %entry.topic, "stream closed with session");
            let _ = entry.sender.send(StreamMessage::Failed(error.clone()));
        }
    }

    pub fn topics(&self) -> Vec<(u64, String)> {
        let mut topics = self
            .entries()
            .iter()
            .map(|(id, entry)| (*id, entry.topic.clone()))
            .collect::<Vec<_>>();
        topics.sort();
        topics
    }
}

/// A live stream opened against the protocol service.
///
/// Items are yielded in the order the server emitted them. Dropping the
/// subscription stops it.
pub struct StreamSubscription {
    id: u64,
    topic: String,
    receiver: mpsc::UnboundedReceiver<StreamMessage>,
    active: Arc<AtomicBool>,
    finished: bool,
    tracker: Arc<StreamTracker>,
}

impl StreamSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_active(&self) -> bool {
        !self.finished && self.active.load(Ordering::SeqCst)
    }

    /// Next item, `None` once the stream ended or was stopped.
    pub async fn next(&mut self) -> Option<Result<Value, BridgeError>> {
        if !self.is_active() {
            return None;
        }

        let message = self.receiver.recv().await;
        if !self.active.load(Ordering::SeqCst) {
            self.finished = true;
            return None;
        }

        match message {
            Some(StreamMessage::Item(item)) => Some(Ok(item)),
            Some(StreamMessage::Failed(error)) => {
                self.finished = true;
                Some(Err(error))
            }
            Some(StreamMessage::End) | None => {
                self.finished = true;
                None
            }
        }
    }

    /// Read every remaining item. A terminal error is returned alongside what
    /// arrived before it.
    pub async fn collect(mut self) -> (Vec<Value>, Option<BridgeError>) {
        let mut items = Vec::new();
        while let Some(next) = self.next().await {
            match next {
                Ok(item) => items.push(item),
                Err(error) => return (items, Some(error)),
            }
        }
        (items, None)
    }

    pub fn stopper(&self) -> StreamStopper {
        StreamStopper {
            id: self.id,
            tracker: Arc::clone(&self.tracker),
        }
    }

    /// Stop delivery and release anything still buffered.
    pub fn stop(&mut self) {
        self.tracker.stop(self.id);
        self.active.store(false, Ordering::SeqCst);
        self.receiver.close();
        while self.receiver.try_recv().is_ok() {}
        self.finished = true;
    }
}

impl Drop for StreamSubscription {
    fn drop(&mut self) {
        self.tracker.stop(self.id);
    }
}

/// Detached handle that can stop a subscription owned elsewhere.
#[derive(Clone)]
pub struct StreamStopper {
    id: u64,
    tracker: Arc<StreamTracker>,
}

impl StreamStopper {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stop(&self) -> bool {
        self.tracker.stop(self.id)
    }
}

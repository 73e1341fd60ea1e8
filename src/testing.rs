//! Scripted stand-ins for the protocol service used across unit tests.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures_util::future::{BoxFuture, FutureExt};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{
    connection::Invoker,
    deadline::Deadline,
    error::BridgeError,
    stream::{StreamSubscription, StreamTracker},
};

#[derive(Clone)]
pub(crate) enum Reply {
    Ok(Value),
    Err(BridgeError),
    Hang,
}

type Handler = Box<dyn Fn(&Value) -> Reply + Send + Sync>;

pub(crate) struct FakeInvoker {
    calls: Mutex<Vec<(String, Value)>>,
    handlers: Mutex<HashMap<String, Handler>>,
    stream_items: Mutex<HashMap<String, Vec<Value>>>,
    streams: Arc<StreamTracker>,
    next_stream: AtomicU64,
    _cancels: mpsc::UnboundedReceiver<String>,
}

impl FakeInvoker {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            handlers: Mutex::new(HashMap::new()),
            stream_items: Mutex::new(HashMap::new()),
            streams: StreamTracker::new(tx),
            next_stream: AtomicU64::new(1),
            _cancels: rx,
        })
    }

    pub fn on<F>(&self, method: &str, handler: F)
    where
        F: Fn(&Value) -> Reply + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .expect("handlers lock")
            .insert(method.to_string(), Box::new(handler));
    }

    pub fn reply(&self, method: &str, reply: Reply) {
        self.on(method, move |_| reply.clone());
    }

    pub fn stream_items(&self, topic: &str, items: Vec<Value>) {
        self.stream_items
            .lock()
            .expect("stream lock")
            .insert(topic.to_string(), items);
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn calls_to(&self, method: &str) -> Vec<Value> {
        self.calls()
            .into_iter()
            .filter(|(m, _)| m == method)
            .map(|(_, params)| params)
            .collect()
    }
}

impl Invoker for FakeInvoker {
    fn invoke<'a>(
        &'a self,
        method: &'a str,
        params: Value,
    ) -> BoxFuture<'a, Result<Value, BridgeError>> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((method.to_string(), params.clone()));
        let reply = self
            .handlers
            .lock()
            .expect("handlers lock")
            .get(method)
            .map(|handler| handler(&params))
            .unwrap_or(Reply::Ok(Value::Null));

        async move {
            match reply {
                Reply::Ok(value) => Ok(value),
                Reply::Err(error) => Err(error),
                Reply::Hang => std::future::pending().await,
            }
        }
        .boxed()
    }

    fn invoke_with_timeout<'a>(
        &'a self,
        method: &'a str,
        params: Value,
        limit: Duration,
    ) -> BoxFuture<'a, Result<Value, BridgeError>> {
        async move {
            Deadline::new("fake", limit)
                .run(self.invoke(method, params))
                .await
        }
        .boxed()
    }

    fn open_stream<'a>(
        &'a self,
        topic: &'a str,
        params: Value,
    ) -> BoxFuture<'a, Result<StreamSubscription, BridgeError>> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((topic.to_string(), params));
        let id = self.next_stream.fetch_add(1, Ordering::Relaxed);
        let subscription = self.streams.register(id, topic);
        let items = self
            .stream_items
            .lock()
            .expect("stream lock")
            .get(topic)
            .cloned()
            .unwrap_or_default();
        for item in items {
            self.streams.deliver(id, item);
        }
        self.streams.finish(id, None);
        async move { Ok(subscription) }.boxed()
    }
}

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex};

use crate::{
    config::BridgeConfig,
    dispatch::Dispatcher,
    error::BridgeError,
    stream::StreamSubscription,
    transport::{normalize_remote_address, ConnectionMode, Transport, TransportGuard},
};

const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(15);

/// Broadcast on every session transition. `status` is `connected`,
/// `disconnected` (transport lost) or `closed`.
pub const CONNECTION_STATE_NOTIFICATION: &str = "bridge/connection/state";

/// The call surface the higher-level services are written against.
pub trait Invoker: Send + Sync {
    fn invoke<'a>(&'a self, method: &'a str, params: Value)
        -> BoxFuture<'a, Result<Value, BridgeError>>;

    fn invoke_with_timeout<'a>(
        &'a self,
        method: &'a str,
        params: Value,
        limit: Duration,
    ) -> BoxFuture<'a, Result<Value, BridgeError>>;

    fn open_stream<'a>(
        &'a self,
        topic: &'a str,
        params: Value,
    ) -> BoxFuture<'a, Result<StreamSubscription, BridgeError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub mode: Option<ConnectionMode>,
    pub error: Option<String>,
    pub connected_at: Option<String>,
    pub open_streams: usize,
}

pub struct Session {
    mode: ConnectionMode,
    dispatcher: Arc<Dispatcher>,
    connected_at: DateTime<Utc>,
}

impl Session {
    pub fn mode(&self) -> &ConnectionMode {
        &self.mode
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }
}

struct Lifecycle {
    state: SessionState,
    generation: u64,
    mode: Option<ConnectionMode>,
    error: Option<String>,
    session: Option<Arc<Session>>,
    guard: Option<TransportGuard>,
}

/// Owns the single live session to the protocol service.
pub struct ConnectionManager {
    config: Arc<BridgeConfig>,
    lifecycle: Mutex<Lifecycle>,
    notifications: broadcast::Sender<Value>,
}

impl ConnectionManager {
    pub fn new(config: Arc<BridgeConfig>) -> Arc<Self> {
        let (notifications, _) = broadcast::channel(256);
        Arc::new(Self {
            config,
            lifecycle: Mutex::new(Lifecycle {
                state: SessionState::Uninitialized,
                generation: 0,
                mode: None,
                error: None,
                session: None,
                guard: None,
            }),
            notifications,
        })
    }

    /// Frames the protocol service pushes without an id, plus bridge
    /// connection state changes.
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Value> {
        self.notifications.subscribe()
    }

    pub async fn init(self: &Arc<Self>) -> Result<(), BridgeError> {
        let generation = self.begin(ConnectionMode::Local).await?;
        let transport = Transport::spawn_local(&self.config.protocol_command).await;
        self.complete(generation, ConnectionMode::Local, transport)
            .await
    }

    pub async fn init_remote(self: &Arc<Self>, address: &str) -> Result<(), BridgeError> {
        let url = normalize_remote_address(address)?;
        let mode = ConnectionMode::Remote {
            address: url.clone(),
        };
        let generation = self.begin(mode.clone()).await?;
        let transport = Transport::connect_remote(&url).await;
        self.complete(generation, mode, transport).await
    }

    #[cfg(test)]
    pub(crate) async fn attach(
        self: &Arc<Self>,
        mode: ConnectionMode,
        transport: Transport,
    ) -> Result<(), BridgeError> {
        let generation = self.begin(mode.clone()).await?;
        self.complete(generation, mode, Ok(transport)).await
    }

    async fn begin(&self, mode: ConnectionMode) -> Result<u64, BridgeError> {
        let mut lifecycle = self.lifecycle.lock().await;
        match lifecycle.state {
            SessionState::Initializing | SessionState::Ready | SessionState::Closing => {
                Err(BridgeError::AlreadyInitialized)
            }
            SessionState::Uninitialized | SessionState::Closed => {
                lifecycle.state = SessionState::Initializing;
                lifecycle.generation += 1;
                lifecycle.mode = Some(mode);
                lifecycle.error = None;
                Ok(lifecycle.generation)
            }
        }
    }

    async fn complete(
        self: &Arc<Self>,
        generation: u64,
        mode: ConnectionMode,
        transport: Result<Transport, BridgeError>,
    ) -> Result<(), BridgeError> {
        let transport = match transport {
            Ok(transport) => transport,
            Err(error) => {
                self.abandon(generation, &error).await;
                return Err(error);
            }
        };

        let (outbound, inbound, mut guard) = transport.into_parts();
        let dispatcher = Dispatcher::start(
            outbound,
            inbound,
            self.config.invoke_timeout,
            self.notifications.clone(),
        );

        if let Err(error) = handshake(&dispatcher).await {
            guard.shutdown();
            dispatcher.fail_all(BridgeError::Disconnected).await;
            self.abandon(generation, &error).await;
            return Err(error);
        }

        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.generation != generation {
            // Closed while the handshake was in flight.
            drop(lifecycle);
            guard.shutdown();
            dispatcher.fail_all(BridgeError::Disconnected).await;
            return Err(BridgeError::Disconnected);
        }

        lifecycle.state = SessionState::Ready;
        lifecycle.session = Some(Arc::new(Session {
            mode: mode.clone(),
            dispatcher: dispatcher.clone(),
            connected_at: Utc::now(),
        }));
        lifecycle.guard = Some(guard);
        drop(lifecycle);

        self.watch_transport(generation, &dispatcher);
        tracing::info!(?mode, "bridge session ready");
        self.announce("connected");
        Ok(())
    }

    async fn abandon(&self, generation: u64, error: &BridgeError) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.generation == generation {
            lifecycle.state = SessionState::Closed;
            lifecycle.error = Some(error.to_string());
        }
        tracing::warn!(%error, "bridge initialization failed");
    }

    fn watch_transport(self: &Arc<Self>, generation: u64, dispatcher: &Arc<Dispatcher>) {
        let manager: Weak<Self> = Arc::downgrade(self);
        let mut closed = dispatcher.closed();
        tokio::spawn(async move {
            if closed.wait_for(|closed| *closed).await.is_err() {
                return;
            }
            let Some(manager) = manager.upgrade() else {
                return;
            };

            let mut lifecycle = manager.lifecycle.lock().await;
            if lifecycle.generation != generation || lifecycle.state != SessionState::Ready {
                return;
            }
            lifecycle.state = SessionState::Closed;
            lifecycle.error = Some("protocol transport closed".to_string());
            lifecycle.session = None;
            lifecycle.guard = None;
            drop(lifecycle);

            tracing::warn!("bridge session lost its transport");
            manager.announce("disconnected");
        });
    }

    fn announce(&self, status: &str) {
        let _ = self.notifications.send(json!({
            "method": CONNECTION_STATE_NOTIFICATION,
            "params": {
                "status": status,
                "at": Utc::now().to_rfc3339(),
            }
        }));
    }

    /// Tear the session down. A no-op when nothing is running.
    pub async fn close(&self) -> Result<(), BridgeError> {
        let (session, guard) = {
            let mut lifecycle = self.lifecycle.lock().await;
            match lifecycle.state {
                SessionState::Ready => {
                    lifecycle.state = SessionState::Closing;
                    lifecycle.generation += 1;
                    (lifecycle.session.take(), lifecycle.guard.take())
                }
                SessionState::Initializing => {
                    lifecycle.state = SessionState::Closed;
                    lifecycle.generation += 1;
                    return Ok(());
                }
                _ => return Ok(()),
            }
        };

        if let Some(session) = session {
            session.dispatcher.fail_all(BridgeError::Disconnected).await;
        }
        drop(guard);

        self.lifecycle.lock().await.state = SessionState::Closed;
        tracing::info!("bridge session closed");
        self.announce("closed");
        Ok(())
    }

    /// Erase persisted state. Refused while a session is live.
    pub async fn clear_storage(&self) -> Result<(), BridgeError> {
        let lifecycle = self.lifecycle.lock().await;
        if matches!(
            lifecycle.state,
            SessionState::Ready | SessionState::Initializing | SessionState::Closing
        ) {
            return Err(BridgeError::StorageBusy);
        }

        let dir = &self.config.data_dir;
        if tokio::fs::try_exists(dir).await? {
            tokio::fs::remove_dir_all(dir).await?;
        }
        tokio::fs::create_dir_all(dir).await?;
        drop(lifecycle);

        tracing::info!(data_dir = %dir.display(), "storage cleared");
        Ok(())
    }

    pub async fn session(&self) -> Result<Arc<Session>, BridgeError> {
        let lifecycle = self.lifecycle.lock().await;
        match (&lifecycle.state, &lifecycle.session) {
            (SessionState::Ready, Some(session)) => Ok(session.clone()),
            _ => Err(BridgeError::NotConnected),
        }
    }

    pub async fn state(&self) -> SessionState {
        self.lifecycle.lock().await.state
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let lifecycle = self.lifecycle.lock().await;
        SessionSnapshot {
            state: lifecycle.state,
            mode: lifecycle.mode.clone(),
            error: lifecycle.error.clone(),
            connected_at: lifecycle
                .session
                .as_ref()
                .map(|session| session.connected_at.to_rfc3339()),
            open_streams: lifecycle
                .session
                .as_ref()
                .map(|session| session.dispatcher.streams().topics().len())
                .unwrap_or(0),
        }
    }
}

async fn handshake(dispatcher: &Dispatcher) -> Result<(), BridgeError> {
    dispatcher
        .invoke_with_timeout(
            "initialize",
            json!({
                "clientInfo": {
                    "name": "message-bridge",
                    "version": env!("CARGO_PKG_VERSION"),
                }
            }),
            INITIALIZE_TIMEOUT,
        )
        .await
        .map_err(|error| BridgeError::InitFailure(format!("protocol initialize failed: {error}")))?;

    dispatcher
        .notify("initialized", json!({}))
        .map_err(|error| BridgeError::InitFailure(format!("initialized write failed: {error}")))
}

impl Invoker for ConnectionManager {
    fn invoke<'a>(
        &'a self,
        method: &'a str,
        params: Value,
    ) -> BoxFuture<'a, Result<Value, BridgeError>> {
        async move { self.session().await?.dispatcher.invoke(method, params).await }.boxed()
    }

    fn invoke_with_timeout<'a>(
        &'a self,
        method: &'a str,
        params: Value,
        limit: Duration,
    ) -> BoxFuture<'a, Result<Value, BridgeError>> {
        async move {
            self.session()
                .await?
                .dispatcher
                .invoke_with_timeout(method, params, limit)
                .await
        }
        .boxed()
    }

    fn open_stream<'a>(
        &'a self,
        topic: &'a str,
        params: Value,
    ) -> BoxFuture<'a, Result<StreamSubscription, BridgeError>> {
        async move { self.session().await?.dispatcher.open_stream(topic, params) }.boxed()
    }
}

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;

use crate::{
    config::{BridgeConfig, BridgeMode},
    connection::{ConnectionManager, Invoker, SessionSnapshot, CONNECTION_STATE_NOTIFICATION},
    error::BridgeError,
    logging::{self, LogLevel},
    pagination::{Interaction, PaginationEngine},
    push::{PushPlatform, PushRegistry, PushStore, PushTimeouts},
    stream::StreamSubscription,
};

pub const INTERACTIONS_NOTIFICATION: &str = "conversation/interactions";
pub const CONVERSATION_UPDATED_NOTIFICATION: &str = "conversation/updated";
pub const ACCOUNT_UPDATED_NOTIFICATION: &str = "account/updated";

/// The live pieces of a local bridge.
pub struct BridgeCore {
    connection: Arc<ConnectionManager>,
    pagination: PaginationEngine,
    push: PushRegistry,
}

impl BridgeCore {
    pub fn new(config: Arc<BridgeConfig>, platform: Arc<dyn PushPlatform>) -> Arc<Self> {
        let connection = ConnectionManager::new(config.clone());
        Self::with_invoker(connection.clone(), connection, &config, platform)
    }

    fn with_invoker(
        connection: Arc<ConnectionManager>,
        invoker: Arc<dyn Invoker>,
        config: &BridgeConfig,
        platform: Arc<dyn PushPlatform>,
    ) -> Arc<Self> {
        Arc::new(Self {
            connection,
            pagination: PaginationEngine::new(invoker.clone(), config.page_size),
            push: PushRegistry::new(
                invoker,
                platform,
                PushStore::new(&config.data_dir),
                PushTimeouts::from_config(config),
            ),
        })
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn pagination(&self) -> &PaginationEngine {
        &self.pagination
    }

    pub fn push(&self) -> &PushRegistry {
        &self.push
    }

    pub async fn close(&self) -> Result<(), BridgeError> {
        self.connection.close().await?;
        self.session_ended();
        Ok(())
    }

    /// Cursors belong to one session. Both an explicit close and a lost
    /// transport end it.
    fn session_ended(&self) {
        self.pagination.reset();
    }

    pub async fn clear_storage(&self) -> Result<(), BridgeError> {
        self.connection.clear_storage().await?;
        self.push.reload();
        Ok(())
    }

    /// Fold server notifications that describe local state into the engines.
    /// Returns whether the notification was consumed by one of them.
    pub fn observe(&self, notification: &Value) -> bool {
        let Some(method) = notification.get("method").and_then(Value::as_str) else {
            return false;
        };
        let params = notification.get("params").cloned().unwrap_or(Value::Null);

        let applied = match method {
            INTERACTIONS_NOTIFICATION => {
                let Some(conversation_pk) = params.get("conversationPk").and_then(Value::as_str)
                else {
                    return false;
                };
                let fresh = params
                    .get("interactions")
                    .cloned()
                    .map(serde_json::from_value::<Vec<Interaction>>)
                    .transpose()
                    .unwrap_or_else(|error| {
                        tracing::warn!(%error, "dropping malformed interactions notification");
                        None
                    })
                    .unwrap_or_default();
                let added = self.pagination.record(conversation_pk, fresh);
                tracing::trace!(conversation_pk, added, "live interactions recorded");
                Ok(true)
            }
            CONNECTION_STATE_NOTIFICATION => {
                let status = params.get("status").and_then(Value::as_str);
                if !matches!(status, Some("disconnected" | "closed")) {
                    return false;
                }
                tracing::debug!(?status, "session ended; dropping history cursors");
                self.session_ended();
                Ok(true)
            }
            CONVERSATION_UPDATED_NOTIFICATION => self.push.apply_conversation_update(&params),
            ACCOUNT_UPDATED_NOTIFICATION => self.push.apply_account_update(&params),
            _ => return false,
        };

        match applied {
            Ok(applied) => applied,
            Err(error) => {
                tracing::warn!(method, %error, "failed to apply server notification");
                false
            }
        }
    }
}

/// The bridge as the UI server sees it. `Noop` stands in on hosts where the
/// protocol service cannot run.
#[derive(Clone)]
pub enum Bridge {
    Local(Arc<BridgeCore>),
    Noop,
}

impl Bridge {
    pub fn new(config: Arc<BridgeConfig>, platform: Arc<dyn PushPlatform>) -> Self {
        match config.mode {
            BridgeMode::Local => Self::Local(BridgeCore::new(config, platform)),
            BridgeMode::Noop => Self::Noop,
        }
    }

    pub fn core(&self) -> Result<&Arc<BridgeCore>, BridgeError> {
        match self {
            Self::Local(core) => Ok(core),
            Self::Noop => Err(BridgeError::Unsupported),
        }
    }

    pub fn subscribe_notifications(&self) -> Option<broadcast::Receiver<Value>> {
        self.core()
            .ok()
            .map(|core| core.connection.subscribe_notifications())
    }

    pub async fn init(&self) -> Result<(), BridgeError> {
        self.core()?.connection.init().await
    }

    pub async fn init_remote(&self, address: &str) -> Result<(), BridgeError> {
        self.core()?.connection.init_remote(address).await
    }

    pub async fn close(&self) -> Result<(), BridgeError> {
        self.core()?.close().await
    }

    pub async fn clear_storage(&self) -> Result<(), BridgeError> {
        self.core()?.clear_storage().await
    }

    pub async fn invoke(&self, method: &str, params: Value) -> Result<Value, BridgeError> {
        self.core()?.connection.invoke(method, params).await
    }

    pub async fn open_stream(
        &self,
        topic: &str,
        params: Value,
    ) -> Result<StreamSubscription, BridgeError> {
        self.core()?.connection.open_stream(topic, params).await
    }

    pub async fn state(&self) -> Result<SessionSnapshot, BridgeError> {
        Ok(self.core()?.connection.snapshot().await)
    }

    /// Works in every mode.
    pub fn log(&self, level: LogLevel, message: &str) {
        logging::forward(level, message);
    }
}

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::{error::BridgeError, hub::ClientHub};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PromptKind {
    NotificationPermission,
    PushToken,
    Confirm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPrompt {
    pub id: String,
    pub kind: PromptKind,
    pub key: Option<String>,
    pub requested_at: String,
}

struct PromptEntry {
    prompt: PendingPrompt,
    responder: oneshot::Sender<Value>,
}

/// Questions the bridge needs the UI to answer: OS permission, the platform
/// push token, and yes/no confirmations.
pub struct PromptBroker {
    hub: Arc<ClientHub>,
    pending: Mutex<HashMap<String, PromptEntry>>,
    counter: AtomicU64,
}

impl PromptBroker {
    pub fn new(hub: Arc<ClientHub>) -> Self {
        Self {
            hub,
            pending: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(1),
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, PromptEntry>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publish a prompt and wait for the UI's answer. Fails with `Cancelled`
    /// when no client is connected or the prompt is abandoned.
    pub async fn ask(&self, kind: PromptKind, key: Option<&str>) -> Result<Value, BridgeError> {
        if self.hub.client_count().await == 0 {
            tracing::warn!(?kind, "no UI client connected to answer prompt");
            return Err(BridgeError::Cancelled);
        }

        let id = format!(
            "{}-{}",
            Utc::now().timestamp_millis(),
            self.counter.fetch_add(1, Ordering::Relaxed)
        );
        let prompt = PendingPrompt {
            id: id.clone(),
            kind,
            key: key.map(str::to_string),
            requested_at: Utc::now().to_rfc3339(),
        };

        let (tx, rx) = oneshot::channel();
        self.pending().insert(
            id.clone(),
            PromptEntry {
                prompt: prompt.clone(),
                responder: tx,
            },
        );
        let _cleanup = PromptCleanup { broker: self, id };

        self.hub
            .broadcast_notification(
                "bridge/prompt.requested",
                serde_json::to_value(&prompt).unwrap_or(Value::Null),
            )
            .await;

        rx.await.map_err(|_| BridgeError::Cancelled)
    }

    pub fn list(&self) -> Vec<PendingPrompt> {
        let mut prompts = self
            .pending()
            .values()
            .map(|entry| entry.prompt.clone())
            .collect::<Vec<_>>();
        prompts.sort_by(|a, b| b.requested_at.cmp(&a.requested_at));
        prompts
    }

    pub async fn resolve(&self, id: &str, response: Value) -> Option<PendingPrompt> {
        let entry = self.pending().remove(id)?;
        let _ = entry.responder.send(response);

        self.hub
            .broadcast_notification(
                "bridge/prompt.resolved",
                serde_json::json!({
                    "id": entry.prompt.id,
                    "kind": entry.prompt.kind,
                    "resolvedAt": Utc::now().to_rfc3339(),
                }),
            )
            .await;

        Some(entry.prompt)
    }
}

/// Drops the prompt if the waiting caller gives up (e.g. on a deadline).
struct PromptCleanup<'a> {
    broker: &'a PromptBroker,
    id: String,
}

impl Drop for PromptCleanup<'_> {
    fn drop(&mut self) {
        self.broker.pending().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;

    #[tokio::test]
    async fn answers_reach_the_asker() {
        let hub = Arc::new(ClientHub::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.add_client(tx).await;
        let broker = Arc::new(PromptBroker::new(hub));

        let ask = tokio::spawn({
            let broker = broker.clone();
            async move {
                broker
                    .ask(PromptKind::Confirm, Some("warning-enable-all"))
                    .await
            }
        });

        let _requested = rx.recv().await.expect("prompt broadcast");
        let pending = broker.list();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].key.as_deref(), Some("warning-enable-all"));

        let resolved = broker
            .resolve(&pending[0].id, json!({ "accepted": true }))
            .await;
        assert!(resolved.is_some());
        assert_eq!(ask.await.expect("join"), Ok(json!({ "accepted": true })));
        assert!(broker.resolve(&pending[0].id, json!({})).await.is_none());
    }

    #[tokio::test]
    async fn no_client_means_cancelled() {
        let broker = PromptBroker::new(Arc::new(ClientHub::new()));
        assert_eq!(
            broker.ask(PromptKind::NotificationPermission, None).await,
            Err(BridgeError::Cancelled)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_prompt_is_removed() {
        let hub = Arc::new(ClientHub::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        hub.add_client(tx).await;
        let broker = PromptBroker::new(hub);

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            broker.ask(PromptKind::PushToken, None),
        )
        .await;
        assert!(result.is_err());
        assert!(broker.list().is_empty());
    }
}

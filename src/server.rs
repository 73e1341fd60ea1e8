use std::{sync::Arc, time::Instant};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};

use crate::{
    bridge::Bridge,
    config::BridgeConfig,
    connection::CONNECTION_STATE_NOTIFICATION,
    error::BridgeError,
    hub::ClientHub,
    logging::LogLevel,
    pagination::Interaction,
    prompt::PromptBroker,
    push::PermissionStatus,
    stream::StreamSubscription,
};

pub struct AppState {
    config: Arc<BridgeConfig>,
    started_at: Instant,
    hub: Arc<ClientHub>,
    prompts: Arc<PromptBroker>,
    bridge: Bridge,
}

impl AppState {
    pub fn new(
        config: Arc<BridgeConfig>,
        hub: Arc<ClientHub>,
        prompts: Arc<PromptBroker>,
        bridge: Bridge,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            started_at: Instant::now(),
            hub,
            prompts,
            bridge,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RpcQuery {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InitRemoteRequest {
    address: String,
}

#[derive(Debug, Deserialize)]
struct LogRequest {
    level: LogLevel,
    message: String,
}

#[derive(Debug, Deserialize)]
struct InvokeRequest {
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Deserialize)]
struct StreamOpenRequest {
    topic: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamStopRequest {
    stream_id: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversationOpenRequest {
    conversation_pk: String,
    #[serde(default)]
    interactions: Vec<Interaction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversationRequest {
    conversation_pk: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountToggleRequest {
    enable: Option<bool>,
    #[serde(default)]
    permission: PermissionStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversationToggleRequest {
    conversation_pk: String,
    #[serde(default)]
    permission: PermissionStatus,
}

#[derive(Debug, Deserialize)]
struct AutoShareRequest {
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SharedTokensRequest {
    conversation_pk: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResolvePromptRequest {
    id: String,
    #[serde(default)]
    response: Value,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/rpc", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Rebroadcast protocol notifications to every UI client after letting the
/// bridge fold them into local state.
pub fn spawn_notification_pump(state: Arc<AppState>) {
    let Some(mut notifications) = state.bridge.subscribe_notifications() else {
        return;
    };

    tokio::spawn(async move {
        loop {
            let notification = match notifications.recv().await {
                Ok(notification) => notification,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "notification pump lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            if let Ok(core) = state.bridge.core() {
                core.observe(&notification);
            }
            state.hub.broadcast_json(notification).await;
        }
    });
}

async fn health(state: &AppState) -> Value {
    let session = state
        .bridge
        .state()
        .await
        .ok()
        .map(|snapshot| snapshot.state);
    json!({
        "status": "ok",
        "at": now_iso(),
        "uptimeSec": state.started_at.elapsed().as_secs(),
        "mode": state.config.mode,
        "session": session,
    })
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(health(&state).await)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<RpcQuery>,
) -> Response {
    match state.config.authorize(&headers, query.token.as_deref()) {
        Ok(()) => ws
            .on_upgrade(move |socket| handle_socket(socket, state))
            .into_response(),
        Err(rejection) => {
            tracing::warn!(reason = rejection.reason(), "rejected ui client");
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({
                    "error": "unauthorized",
                    "message": rejection.reason(),
                })),
            )
                .into_response()
        }
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut socket_tx, mut socket_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let client_id = state.hub.add_client(tx).await;
    tracing::debug!(client_id, "ui client connected");

    let writer_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if socket_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    let session = match state.bridge.state().await {
        Ok(snapshot) => json!(snapshot),
        Err(_) => Value::Null,
    };
    state
        .hub
        .send_json(
            client_id,
            json!({
                "method": CONNECTION_STATE_NOTIFICATION,
                "params": {
                    "status": "attached",
                    "session": session,
                    "at": now_iso(),
                }
            }),
        )
        .await;

    while let Some(message) = socket_rx.next().await {
        match message {
            Ok(Message::Text(text)) => {
                // Requests may wait on prompts that a later message resolves.
                let state = state.clone();
                tokio::spawn(async move {
                    handle_client_message(client_id, text.to_string(), &state).await;
                });
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(_)) => {
                state
                    .hub
                    .send_json(
                        client_id,
                        json!({
                            "id": Value::Null,
                            "error": {
                                "code": -32600,
                                "message": "Binary websocket messages are not supported"
                            }
                        }),
                    )
                    .await;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Err(error) => {
                tracing::warn!(client_id, %error, "websocket error");
                break;
            }
        }
    }

    state.hub.remove_client(client_id).await;
    writer_task.abort();
    tracing::debug!(client_id, "ui client disconnected");
}

async fn handle_client_message(client_id: u64, text: String, state: &Arc<AppState>) {
    let parsed = match serde_json::from_str::<Value>(&text) {
        Ok(value) => value,
        Err(error) => {
            send_rpc_error(
                state,
                client_id,
                Value::Null,
                &BridgeError::InvalidParams(format!("Parse error: {error}")),
            )
            .await;
            return;
        }
    };

    let Some(object) = parsed.as_object() else {
        send_rpc_error(
            state,
            client_id,
            Value::Null,
            &BridgeError::InvalidParams("Invalid request payload".to_string()),
        )
        .await;
        return;
    };

    let Some(method) = object.get("method").and_then(Value::as_str) else {
        send_rpc_error(
            state,
            client_id,
            object.get("id").cloned().unwrap_or(Value::Null),
            &BridgeError::InvalidParams("Missing method".to_string()),
        )
        .await;
        return;
    };

    let Some(id) = object.get("id").cloned() else {
        tracing::trace!(client_id, method, "ignoring client notification");
        return;
    };

    let params = object.get("params").cloned();

    let result = if method.starts_with("bridge/") {
        handle_bridge_method(client_id, method, params, state).await
    } else if is_forwarded_method(method) {
        state
            .bridge
            .invoke(method, params.unwrap_or(Value::Null))
            .await
    } else {
        Err(BridgeError::MethodNotFound(format!(
            "Method not allowed: {method}"
        )))
    };

    match result {
        Ok(result) => {
            state
                .hub
                .send_json(client_id, json!({ "id": id, "result": result }))
                .await;
        }
        Err(error) => {
            tracing::debug!(client_id, method, %error, "request failed");
            send_rpc_error(state, client_id, id, &error).await;
        }
    }
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, BridgeError> {
    Ok(serde_json::from_value(params.unwrap_or_else(|| json!({})))?)
}

async fn handle_bridge_method(
    client_id: u64,
    method: &str,
    params: Option<Value>,
    state: &Arc<AppState>,
) -> Result<Value, BridgeError> {
    let bridge = &state.bridge;
    match method {
        "bridge/health/read" => Ok(health(state).await),
        "bridge/init" => {
            bridge.init().await?;
            Ok(json!(bridge.state().await?))
        }
        "bridge/initRemote" => {
            let request: InitRemoteRequest = parse_params(params)?;
            bridge.init_remote(&request.address).await?;
            Ok(json!(bridge.state().await?))
        }
        "bridge/close" => {
            bridge.close().await?;
            Ok(json!({ "ok": true }))
        }
        "bridge/clearStorage" => {
            bridge.clear_storage().await?;
            Ok(json!({ "ok": true }))
        }
        "bridge/state" => Ok(json!(bridge.state().await?)),
        "bridge/log" => {
            let request: LogRequest = parse_params(params)?;
            bridge.log(request.level, &request.message);
            Ok(json!({ "ok": true }))
        }
        "bridge/invoke" => {
            let request: InvokeRequest = parse_params(params)?;
            bridge.invoke(&request.method, request.params).await
        }
        "bridge/stream/open" => {
            let request: StreamOpenRequest = parse_params(params)?;
            let subscription = bridge.open_stream(&request.topic, request.params).await?;
            let stream_id = subscription.id();
            if !state.hub.attach_stream(client_id, subscription.stopper()).await {
                // Client left before the stream opened; dropping stops it.
                return Err(BridgeError::Cancelled);
            }
            tokio::spawn(forward_stream(state.clone(), client_id, subscription));
            Ok(json!({ "streamId": stream_id }))
        }
        "bridge/stream/stop" => {
            let request: StreamStopRequest = parse_params(params)?;
            let stopped = match state.hub.detach_stream(client_id, request.stream_id).await {
                Some(stopper) => stopper.stop(),
                None => false,
            };
            Ok(json!({ "stopped": stopped }))
        }
        "bridge/conversation/open" => {
            let request: ConversationOpenRequest = parse_params(params)?;
            let cursor = bridge
                .core()?
                .pagination()
                .open(&request.conversation_pk, request.interactions);
            Ok(json!({ "cursor": cursor }))
        }
        "bridge/conversation/loadMore" => {
            let request: ConversationRequest = parse_params(params)?;
            let pagination = bridge.core()?.pagination();
            let outcome = pagination.load_more(&request.conversation_pk).await;
            Ok(json!({
                "outcome": outcome,
                "cursor": pagination.snapshot(&request.conversation_pk),
            }))
        }
        "bridge/conversation/cursor" => {
            let request: ConversationRequest = parse_params(params)?;
            let pagination = bridge.core()?.pagination();
            Ok(json!({
                "cursor": pagination.snapshot(&request.conversation_pk),
                "messages": pagination.messages(&request.conversation_pk),
            }))
        }
        "bridge/push/state" => Ok(json!(bridge.core()?.push().snapshot())),
        "bridge/push/accountToggle" => {
            let request: AccountToggleRequest = parse_params(params)?;
            let outcome = bridge
                .core()?
                .push()
                .account_toggle(request.enable, request.permission)
                .await?;
            Ok(json!(outcome))
        }
        "bridge/push/conversationToggle" => {
            let request: ConversationToggleRequest = parse_params(params)?;
            let outcome = bridge
                .core()?
                .push()
                .conversation_toggle(&request.conversation_pk, request.permission)
                .await?;
            Ok(json!(outcome))
        }
        "bridge/push/enableForConversation" => {
            let request: ConversationRequest = parse_params(params)?;
            bridge
                .core()?
                .push()
                .enable_notifications_for_conversation(&request.conversation_pk)
                .await?;
            Ok(json!({ "ok": true }))
        }
        "bridge/push/autoShare" => {
            let request: AutoShareRequest = parse_params(params)?;
            let enabled = bridge
                .core()?
                .push()
                .ask_and_share_on_all_conversations(request.force)
                .await?;
            Ok(json!({ "enabled": enabled }))
        }
        "bridge/push/sharedTokens" => {
            let request: SharedTokensRequest = parse_params(params)?;
            let tokens = bridge
                .core()?
                .push()
                .shared_tokens_for_conversation(request.conversation_pk.as_deref())
                .await?;
            Ok(json!({ "tokens": tokens }))
        }
        "bridge/prompts/list" => Ok(json!({ "data": state.prompts.list() })),
        "bridge/prompts/resolve" => {
            let request: ResolvePromptRequest = parse_params(params)?;
            let Some(prompt) = state.prompts.resolve(&request.id, request.response).await else {
                return Err(BridgeError::InvalidParams(format!(
                    "unknown prompt: {}",
                    request.id
                )));
            };
            Ok(json!({ "ok": true, "prompt": prompt }))
        }
        _ => Err(BridgeError::MethodNotFound(format!(
            "Unknown bridge method: {method}"
        ))),
    }
}

/// Relay stream output to the client that opened it.
async fn forward_stream(state: Arc<AppState>, client_id: u64, mut subscription: StreamSubscription) {
    let stream_id = subscription.id();
    let mut failure = None;

    while let Some(next) = subscription.next().await {
        match next {
            Ok(item) => {
                let delivered = state
                    .hub
                    .send_json(
                        client_id,
                        json!({
                            "method": "bridge/stream/item",
                            "params": { "streamId": stream_id, "item": item },
                        }),
                    )
                    .await;
                if !delivered {
                    subscription.stop();
                    return;
                }
            }
            Err(error) => {
                failure = Some(error);
                break;
            }
        }
    }

    state.hub.detach_stream(client_id, stream_id).await;
    state
        .hub
        .send_json(
            client_id,
            json!({
                "method": "bridge/stream/end",
                "params": {
                    "streamId": stream_id,
                    "error": failure.as_ref().map(BridgeError::to_rpc_value),
                },
            }),
        )
        .await;
}

async fn send_rpc_error(state: &Arc<AppState>, client_id: u64, id: Value, error: &BridgeError) {
    state
        .hub
        .send_json(client_id, json!({ "id": id, "error": error.to_rpc_value() }))
        .await;
}

fn is_forwarded_method(method: &str) -> bool {
    matches!(
        method,
        "conversationLoad"
            | "credentialVerificationServiceInitFlow"
            | "credentialVerificationServiceCompleteFlow"
    )
}

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

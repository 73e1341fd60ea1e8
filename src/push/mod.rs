//! Push token registry: device token registration, account and per-conversation
//! mute toggles, and token sharing.
//!
//! Every toggle runs under a single writer lock. Remote steps are bounded by
//! their own deadline, and local state is only persisted once every step of a
//! transition succeeded, so a failed or abandoned toggle leaves the previous
//! state untouched.

pub mod platform;
pub mod store;

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{config::BridgeConfig, connection::Invoker, deadline::Deadline, error::BridgeError};

pub use platform::{ClientPlatform, ConfirmPrompt, Notice, PermissionStatus, PushPlatform};
pub use store::{
    ConversationPushState, DeviceToken, PersistedPushState, PushRegistration, PushStore,
    PushTokenType, RegistrationStatus, ServerAck, MUTED_FOREVER,
};

const SET_DEVICE_TOKEN_METHOD: &str = "pushSetDeviceToken";
const SERVER_REGISTER_METHOD: &str = "servicesAuthViaDefault";
const ACCOUNT_CONFIGURE_METHOD: &str = "accountPushConfigure";
const CONVERSATION_MUTE_METHOD: &str = "conversationMute";
const SHARE_TOKEN_METHOD: &str = "pushShareTokenForConversation";
const AUTO_SHARE_METHOD: &str = "pushSetAutoShare";
const SHARED_TOKENS_TOPIC: &str = "pushTokenSharedForConversation";
const PUSH_SERVICE_TYPE: &str = "psh";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ToggleStage {
    Unregistered,
    PermissionRequested,
    TokenFetching,
    ServerRegistering,
    Registered,
    Muted,
    PermissionDenied,
    FetchFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PushStatus {
    /// The push server was registered by this call.
    EnabledJustNow,
    EnabledBefore,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum ToggleOutcome {
    Enabled { status: PushStatus },
    Muted,
    AlreadyEnabled,
    AlreadyDisabled,
    Refused { notice: Notice },
}

#[derive(Debug, Clone, Copy)]
pub struct PushTimeouts {
    pub step: Duration,
    pub permission: Duration,
    pub stream: Duration,
}

impl PushTimeouts {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            step: config.push_step_timeout,
            permission: config.permission_timeout,
            stream: config.invoke_timeout,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushSnapshot {
    pub stage: ToggleStage,
    pub status: RegistrationStatus,
    pub token_type: Option<PushTokenType>,
    pub knows_push_server: bool,
    pub account_muted: bool,
    pub auto_share: bool,
    pub last_failure: Option<ToggleStage>,
    pub filtering_available: bool,
    pub push_available: bool,
    pub conversations: Vec<ConversationSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSnapshot {
    pub conversation_pk: String,
    pub enabled: bool,
    pub shared_token_id: Option<String>,
    pub muted_until: i64,
    pub auto_share: bool,
}

#[derive(Debug, Default)]
struct Progress {
    active: Option<ToggleStage>,
    last_failure: Option<ToggleStage>,
}

pub struct PushRegistry {
    invoker: Arc<dyn Invoker>,
    platform: Arc<dyn PushPlatform>,
    store: PushStore,
    state: Mutex<PersistedPushState>,
    progress: Mutex<Progress>,
    writer: tokio::sync::Mutex<()>,
    timeouts: PushTimeouts,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Transport-level failures of a registration step become `FetchFailed`;
/// push-specific protocol errors keep their identity.
fn step_failure(step: &str, error: BridgeError) -> BridgeError {
    match error {
        BridgeError::UnknownDestination
        | BridgeError::UnknownServer
        | BridgeError::Cancelled
        | BridgeError::NotConnected
        | BridgeError::Unsupported => error,
        BridgeError::FetchFailed(_) => error,
        other => BridgeError::FetchFailed(format!("{step}: {other}")),
    }
}

impl PushRegistry {
    pub fn new(
        invoker: Arc<dyn Invoker>,
        platform: Arc<dyn PushPlatform>,
        store: PushStore,
        timeouts: PushTimeouts,
    ) -> Self {
        let state = store.load();
        Self {
            invoker,
            platform,
            store,
            state: Mutex::new(state),
            progress: Mutex::new(Progress::default()),
            writer: tokio::sync::Mutex::new(()),
            timeouts,
        }
    }

    fn state(&self) -> MutexGuard<'_, PersistedPushState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn progress(&self) -> MutexGuard<'_, Progress> {
        self.progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enter(&self, stage: ToggleStage) {
        tracing::debug!(?stage, "push toggle stage");
        self.progress().active = Some(stage);
    }

    fn settle(&self, failure: Option<ToggleStage>) {
        let mut progress = self.progress();
        progress.active = None;
        progress.last_failure = failure;
    }

    /// Apply a change to a copy, persist it, then publish it.
    fn commit<F>(&self, change: F) -> Result<(), BridgeError>
    where
        F: FnOnce(&mut PersistedPushState),
    {
        let mut state = self.state();
        let mut next = state.clone();
        change(&mut next);
        self.store.save(&next)?;
        *state = next;
        Ok(())
    }

    pub fn filtering_available(&self) -> bool {
        self.platform.filtering_available()
    }

    pub fn registration(&self) -> PushRegistration {
        self.state().registration.clone()
    }

    pub fn conversation(&self, conversation_pk: &str) -> ConversationPushState {
        self.state()
            .conversations
            .get(conversation_pk)
            .cloned()
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> PushSnapshot {
        let now = now_ms();
        let state = self.state().clone();
        let progress = self.progress();
        let registration = &state.registration;
        let registered = registration.status == RegistrationStatus::Registered
            || registration.knows_push_server();

        let stage = match progress.active {
            Some(stage) => stage,
            None if registered && registration.is_muted(now) => ToggleStage::Muted,
            None if registered => ToggleStage::Registered,
            None => progress.last_failure.unwrap_or(ToggleStage::Unregistered),
        };
        let status = if progress.active.is_some() {
            RegistrationStatus::Pending
        } else if !registered && progress.last_failure.is_some() {
            RegistrationStatus::Failed
        } else {
            registration.status
        };

        PushSnapshot {
            stage,
            status,
            token_type: registration.token.as_ref().map(|token| token.token_type),
            knows_push_server: registration.knows_push_server(),
            account_muted: registration.is_muted(now),
            auto_share: registration.auto_share,
            last_failure: progress.last_failure,
            filtering_available: self.platform.filtering_available(),
            push_available: self.platform.platform().push_available(),
            conversations: state
                .conversations
                .iter()
                .map(|(pk, conv)| ConversationSnapshot {
                    conversation_pk: pk.clone(),
                    enabled: conv.is_push_enabled(now),
                    shared_token_id: conv.shared_token_id.clone(),
                    muted_until: conv.muted_until,
                    auto_share: conv.auto_share,
                })
                .collect(),
        }
    }

    /// Reload persisted state after the data directory was wiped.
    pub fn reload(&self) {
        *self.state() = self.store.load();
        *self.progress() = Progress::default();
    }

    fn surface(&self, error: &BridgeError) {
        let notice = match error {
            BridgeError::PermissionDenied => Notice::PermissionDenied,
            BridgeError::FetchFailed(_) => Notice::FetchFailed,
            BridgeError::UnknownDestination => Notice::NoToken,
            BridgeError::UnknownServer => Notice::NoServer,
            _ => return,
        };
        self.platform.notify(notice);
    }

    /// Permission, token, then server registration. Nothing is persisted
    /// unless all three succeed.
    async fn enable_push_permission(
        &self,
        permission: PermissionStatus,
    ) -> Result<PushStatus, BridgeError> {
        let result = self.run_enable(permission).await;
        match &result {
            Ok(_) => self.settle(None),
            Err(BridgeError::PermissionDenied) => self.settle(Some(ToggleStage::PermissionDenied)),
            Err(BridgeError::Cancelled | BridgeError::Unsupported) => self.settle(None),
            Err(_) => self.settle(Some(ToggleStage::FetchFailed)),
        }
        result
    }

    async fn run_enable(&self, permission: PermissionStatus) -> Result<PushStatus, BridgeError> {
        if !self.platform.platform().push_available() {
            return Err(BridgeError::Unsupported);
        }

        self.enter(ToggleStage::PermissionRequested);
        if !permission.allows_notifications() {
            let asked = Deadline::new("notification permission", self.timeouts.permission)
                .run(self.platform.request_permission())
                .await;
            match asked {
                Ok(status) if status.allows_notifications() => {}
                Ok(status) => {
                    tracing::info!(?status, "notification permission not granted");
                    return Err(BridgeError::PermissionDenied);
                }
                Err(error) => {
                    tracing::info!(%error, "notification permission request failed");
                    return Err(BridgeError::PermissionDenied);
                }
            }
        }

        self.enter(ToggleStage::TokenFetching);
        let step = self.timeouts.step;
        let token = Deadline::new("push token", step)
            .run(async {
                let token = self.platform.request_token().await?;
                let receiver = json!({
                    "receiver": {
                        "tokenType": token.token_type,
                        "bundleId": token.bundle_id,
                        "token": token.encoded(),
                    }
                });
                self.invoker
                    .invoke_with_timeout(SET_DEVICE_TOKEN_METHOD, receiver, step)
                    .await?;
                Ok(token)
            })
            .await
            .map_err(|error| step_failure("push token", error))?;

        self.enter(ToggleStage::ServerRegistering);
        let had_server = self.state().registration.knows_push_server();
        let ack = if had_server {
            None
        } else {
            let detail = self
                .invoker
                .invoke_with_timeout(
                    SERVER_REGISTER_METHOD,
                    json!({ "services": [PUSH_SERVICE_TYPE] }),
                    step,
                )
                .await
                .map_err(|error| step_failure("push server registration", error))?;
            Some(ServerAck {
                acknowledged_at: Utc::now().to_rfc3339(),
                detail,
            })
        };

        self.commit(|state| {
            let registration = &mut state.registration;
            registration.token = Some(token);
            registration.status = RegistrationStatus::Registered;
            if let Some(ack) = ack {
                registration.server_ack = Some(ack);
            }
        })?;

        tracing::info!(had_server, "push registration complete");
        Ok(if had_server {
            PushStatus::EnabledBefore
        } else {
            PushStatus::EnabledJustNow
        })
    }

    /// Enable or mute notifications for the whole account. `enable` pins the
    /// target; `None` flips the current state.
    pub async fn account_toggle(
        &self,
        enable: Option<bool>,
        permission: PermissionStatus,
    ) -> Result<ToggleOutcome, BridgeError> {
        let _writer = self.writer.lock().await;
        let result = self.account_toggle_locked(enable, permission).await;
        if let Err(error) = &result {
            self.surface(error);
        }
        result
    }

    async fn account_toggle_locked(
        &self,
        enable: Option<bool>,
        permission: PermissionStatus,
    ) -> Result<ToggleOutcome, BridgeError> {
        let enabled = {
            let state = self.state();
            let registration = &state.registration;
            registration.knows_push_server()
                && !registration.is_muted(now_ms())
                && permission.allows_notifications()
        };

        if !enabled {
            if enable == Some(false) {
                return Ok(ToggleOutcome::AlreadyDisabled);
            }
            let status = self.enable_push_permission(permission).await?;
            self.invoker
                .invoke(ACCOUNT_CONFIGURE_METHOD, json!({ "unmute": true }))
                .await?;
            self.commit(|state| state.registration.muted_until = 0)?;
            if status == PushStatus::EnabledJustNow {
                self.share_on_all_conversations(true).await?;
            }
            return Ok(ToggleOutcome::Enabled { status });
        }

        if enable == Some(true) {
            return Ok(ToggleOutcome::AlreadyEnabled);
        }
        if !self.platform.filtering_available() {
            self.platform.notify(Notice::WhyCantDisableAccount);
            return Ok(ToggleOutcome::Refused {
                notice: Notice::WhyCantDisableAccount,
            });
        }

        self.invoker
            .invoke(ACCOUNT_CONFIGURE_METHOD, json!({ "muteForever": true }))
            .await?;
        self.commit(|state| state.registration.muted_until = MUTED_FOREVER)?;
        Ok(ToggleOutcome::Muted)
    }

    /// Flip notifications for one conversation.
    pub async fn conversation_toggle(
        &self,
        conversation_pk: &str,
        permission: PermissionStatus,
    ) -> Result<ToggleOutcome, BridgeError> {
        if conversation_pk.is_empty() {
            return Err(BridgeError::InvalidParams(
                "conversationPk is required".to_string(),
            ));
        }

        let _writer = self.writer.lock().await;
        let result = self
            .conversation_toggle_locked(conversation_pk, permission)
            .await;
        if let Err(error) = &result {
            self.surface(error);
        }
        result
    }

    async fn conversation_toggle_locked(
        &self,
        conversation_pk: &str,
        permission: PermissionStatus,
    ) -> Result<ToggleOutcome, BridgeError> {
        let enabled =
            self.conversation(conversation_pk).is_push_enabled(now_ms()) && permission.allows_notifications();

        if !enabled {
            let status = self.enable_push_permission(permission).await?;
            self.share_for_conversation(conversation_pk).await?;
            if status == PushStatus::EnabledJustNow && self.platform.filtering_available() {
                self.share_on_all_conversations(false).await?;
            }
            return Ok(ToggleOutcome::Enabled { status });
        }

        if !self.platform.filtering_available() {
            self.platform.notify(Notice::WhyCantDisable);
            return Ok(ToggleOutcome::Refused {
                notice: Notice::WhyCantDisable,
            });
        }

        self.invoker
            .invoke(
                CONVERSATION_MUTE_METHOD,
                json!({ "groupPk": conversation_pk, "muteForever": true }),
            )
            .await?;
        self.commit(|state| {
            state
                .conversations
                .entry(conversation_pk.to_string())
                .or_default()
                .muted_until = MUTED_FOREVER;
        })?;
        Ok(ToggleOutcome::Muted)
    }

    /// Share the device token with a conversation and unmute it.
    pub async fn enable_notifications_for_conversation(
        &self,
        conversation_pk: &str,
    ) -> Result<(), BridgeError> {
        if conversation_pk.is_empty() {
            return Err(BridgeError::InvalidParams(
                "conversationPk is required".to_string(),
            ));
        }
        let _writer = self.writer.lock().await;
        let result = self.share_for_conversation(conversation_pk).await;
        if let Err(error) = &result {
            self.surface(error);
        }
        result
    }

    async fn share_for_conversation(&self, conversation_pk: &str) -> Result<(), BridgeError> {
        if !self.platform.filtering_available()
            && !self.platform.confirm(ConfirmPrompt::ShareTokenWarning).await
        {
            return Err(BridgeError::Cancelled);
        }

        let reply = self
            .invoker
            .invoke(SHARE_TOKEN_METHOD, json!({ "conversationPk": conversation_pk }))
            .await?;
        self.invoker
            .invoke(
                CONVERSATION_MUTE_METHOD,
                json!({ "groupPk": conversation_pk, "unmute": true }),
            )
            .await?;

        // Without an identifier in the reply the next `conversation/updated`
        // carries it.
        let shared_token_id = reply
            .get("sharedPushTokenIdentifier")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string);

        self.commit(|state| {
            let conversation = state
                .conversations
                .entry(conversation_pk.to_string())
                .or_default();
            if shared_token_id.is_some() {
                conversation.shared_token_id = shared_token_id;
            }
            conversation.muted_until = 0;
            conversation.auto_share = false;
        })
    }

    /// Turn on auto-share for all conversations. Without `force` the user is
    /// asked first. Returns whether auto-share was enabled.
    pub async fn ask_and_share_on_all_conversations(
        &self,
        force: bool,
    ) -> Result<bool, BridgeError> {
        let _writer = self.writer.lock().await;
        self.share_on_all_conversations(force).await
    }

    async fn share_on_all_conversations(&self, force: bool) -> Result<bool, BridgeError> {
        if !self.platform.platform().push_available() {
            return Ok(false);
        }
        let accepted =
            force || self.platform.confirm(ConfirmPrompt::EnableAllConversations).await;
        if !accepted {
            return Ok(false);
        }

        self.invoker
            .invoke(AUTO_SHARE_METHOD, json!({ "enabled": true }))
            .await?;
        self.commit(|state| state.registration.auto_share = true)?;
        Ok(true)
    }

    /// Tokens other members shared with a conversation. Error items on the
    /// stream are skipped.
    pub async fn shared_tokens_for_conversation(
        &self,
        conversation_pk: Option<&str>,
    ) -> Result<Vec<Value>, BridgeError> {
        let Some(conversation_pk) = conversation_pk.filter(|pk| !pk.is_empty()) else {
            return Ok(Vec::new());
        };

        let subscription = self
            .invoker
            .open_stream(SHARED_TOKENS_TOPIC, json!({ "conversationPk": conversation_pk }))
            .await?;
        let (items, error) = Deadline::new("shared push tokens", self.timeouts.stream)
            .run(async { Ok(subscription.collect().await) })
            .await?;
        if let Some(error) = error {
            tracing::warn!(%error, conversation_pk, "shared token stream ended with error");
        }

        Ok(items
            .into_iter()
            .filter_map(|item| item.get("pushToken").filter(|token| !token.is_null()).cloned())
            .collect())
    }

    /// Fold a `conversation/updated` notification into local state.
    pub fn apply_conversation_update(&self, params: &Value) -> Result<bool, BridgeError> {
        let conversation = params.get("conversation").unwrap_or(params);
        let Some(pk) = conversation
            .get("publicKey")
            .or_else(|| conversation.get("conversationPk"))
            .and_then(Value::as_str)
        else {
            return Ok(false);
        };
        let shared = conversation
            .get("sharedPushTokenIdentifier")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        let muted_until = conversation.get("mutedUntil").and_then(Value::as_i64);
        let auto_shared = conversation.get("autoShared").and_then(Value::as_bool);

        let current = self.conversation(pk);
        let mut next = current.clone();
        if shared.is_some() {
            next.shared_token_id = shared;
        }
        if let Some(muted_until) = muted_until {
            next.muted_until = muted_until;
        }
        if let Some(auto_shared) = auto_shared {
            next.auto_share = auto_shared;
        }
        if next == current {
            return Ok(false);
        }

        self.commit(|state| {
            state.conversations.insert(pk.to_string(), next);
        })?;
        Ok(true)
    }

    /// Fold an `account/updated` notification into local state.
    pub fn apply_account_update(&self, params: &Value) -> Result<bool, BridgeError> {
        let account = params.get("account").unwrap_or(params);
        let muted_until = account.get("mutedUntil").and_then(Value::as_i64);
        let push_service = account
            .get("serviceTokens")
            .and_then(Value::as_array)
            .map(|tokens| {
                tokens.iter().any(|token| {
                    token.get("serviceType").and_then(Value::as_str) == Some(PUSH_SERVICE_TYPE)
                })
            });

        let current = self.registration();
        let mut next = current.clone();
        if let Some(muted_until) = muted_until {
            next.muted_until = muted_until;
        }
        match push_service {
            Some(true) if next.server_ack.is_none() => {
                next.server_ack = Some(ServerAck {
                    acknowledged_at: Utc::now().to_rfc3339(),
                    detail: Value::Null,
                });
            }
            Some(false) => next.server_ack = None,
            _ => {}
        }
        if next == current {
            return Ok(false);
        }

        self.commit(|state| state.registration = next)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use futures_util::future::{BoxFuture, FutureExt};

    use super::*;
    use crate::{
        config::Platform,
        testing::{FakeInvoker, Reply},
    };

    enum TokenReply {
        Token,
        Hang,
    }

    struct FakePlatform {
        platform: Platform,
        filtering: bool,
        permission: PermissionStatus,
        token: TokenReply,
        confirm: bool,
        permission_asks: StdMutex<usize>,
        confirms: StdMutex<Vec<ConfirmPrompt>>,
        notices: StdMutex<Vec<Notice>>,
    }

    impl FakePlatform {
        fn new(filtering: bool) -> Self {
            Self {
                platform: Platform::Android,
                filtering,
                permission: PermissionStatus::Granted,
                token: TokenReply::Token,
                confirm: true,
                permission_asks: StdMutex::new(0),
                confirms: StdMutex::new(Vec::new()),
                notices: StdMutex::new(Vec::new()),
            }
        }

        fn notices(&self) -> Vec<Notice> {
            self.notices.lock().expect("notices").clone()
        }
    }

    impl PushPlatform for FakePlatform {
        fn platform(&self) -> Platform {
            self.platform
        }

        fn filtering_available(&self) -> bool {
            self.filtering
        }

        fn request_permission(&self) -> BoxFuture<'_, Result<PermissionStatus, BridgeError>> {
            *self.permission_asks.lock().expect("asks") += 1;
            let status = self.permission;
            async move { Ok(status) }.boxed()
        }

        fn request_token(&self) -> BoxFuture<'_, Result<DeviceToken, BridgeError>> {
            async move {
                match self.token {
                    TokenReply::Token => Ok(DeviceToken {
                        token: vec![1, 2, 3, 4],
                        token_type: PushTokenType::Fcm,
                        bundle_id: Some("tech.berty.android".to_string()),
                    }),
                    TokenReply::Hang => std::future::pending().await,
                }
            }
            .boxed()
        }

        fn confirm(&self, prompt: ConfirmPrompt) -> BoxFuture<'_, bool> {
            self.confirms.lock().expect("confirms").push(prompt);
            let answer = self.confirm;
            async move { answer }.boxed()
        }

        fn notify(&self, notice: Notice) {
            self.notices.lock().expect("notices").push(notice);
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        invoker: Arc<FakeInvoker>,
        platform: Arc<FakePlatform>,
        registry: PushRegistry,
    }

    fn timeouts() -> PushTimeouts {
        PushTimeouts {
            step: Duration::from_millis(5_000),
            permission: Duration::from_secs(120),
            stream: Duration::from_secs(30),
        }
    }

    fn fixture(platform: FakePlatform) -> Fixture {
        fixture_with_state(platform, None)
    }

    fn fixture_with_state(platform: FakePlatform, seed: Option<PersistedPushState>) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = PushStore::new(dir.path());
        if let Some(seed) = seed {
            store.save(&seed).expect("seed");
        }
        let invoker = FakeInvoker::new();
        let platform = Arc::new(platform);
        let registry = PushRegistry::new(invoker.clone(), platform.clone(), store, timeouts());
        Fixture {
            _dir: dir,
            invoker,
            platform,
            registry,
        }
    }

    fn registered_state(muted_until: i64) -> PersistedPushState {
        let mut state = PersistedPushState::default();
        state.registration = PushRegistration {
            token: Some(DeviceToken {
                token: vec![9, 9],
                token_type: PushTokenType::Fcm,
                bundle_id: None,
            }),
            status: RegistrationStatus::Registered,
            server_ack: Some(ServerAck {
                acknowledged_at: "2026-01-01T00:00:00Z".to_string(),
                detail: Value::Null,
            }),
            muted_until,
            auto_share: false,
        };
        state
    }

    #[tokio::test]
    async fn denied_permission_makes_no_server_calls() {
        let mut platform = FakePlatform::new(true);
        platform.permission = PermissionStatus::Denied;
        let fx = fixture(platform);

        let result = fx
            .registry
            .account_toggle(None, PermissionStatus::Undetermined)
            .await;

        assert_eq!(result, Err(BridgeError::PermissionDenied));
        assert!(fx.invoker.calls().is_empty());
        assert_eq!(fx.platform.notices(), vec![Notice::PermissionDenied]);
        assert!(!fx.registry.store.path().exists());
        let snapshot = fx.registry.snapshot();
        assert_eq!(snapshot.stage, ToggleStage::PermissionDenied);
        assert_eq!(snapshot.status, RegistrationStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_device_token_call_fails_without_persisting() {
        let fx = fixture(FakePlatform::new(true));
        fx.invoker.reply(SET_DEVICE_TOKEN_METHOD, Reply::Hang);

        let started = tokio::time::Instant::now();
        let result = fx
            .registry
            .account_toggle(None, PermissionStatus::Granted)
            .await;

        assert!(matches!(result, Err(BridgeError::FetchFailed(_))));
        assert!(started.elapsed() >= Duration::from_millis(5_000));
        assert!(fx.invoker.calls_to(SERVER_REGISTER_METHOD).is_empty());
        assert!(!fx.registry.store.path().exists());
        assert_eq!(fx.registry.registration(), PushRegistration::default());
        assert_eq!(fx.platform.notices(), vec![Notice::FetchFailed]);
        assert_eq!(fx.registry.snapshot().stage, ToggleStage::FetchFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_server_registration_fails_without_persisting() {
        let fx = fixture(FakePlatform::new(true));
        fx.invoker.reply(SERVER_REGISTER_METHOD, Reply::Hang);

        let started = tokio::time::Instant::now();
        let result = fx
            .registry
            .account_toggle(None, PermissionStatus::Granted)
            .await;

        assert!(matches!(result, Err(BridgeError::FetchFailed(_))));
        assert!(started.elapsed() >= Duration::from_millis(5_000));
        assert_eq!(fx.invoker.calls_to(SET_DEVICE_TOKEN_METHOD).len(), 1);
        assert_eq!(fx.invoker.calls_to(SERVER_REGISTER_METHOD).len(), 1);
        assert!(fx.invoker.calls_to(ACCOUNT_CONFIGURE_METHOD).is_empty());
        assert!(!fx.registry.store.path().exists());
        assert_eq!(fx.registry.registration(), PushRegistration::default());
        let snapshot = fx.registry.snapshot();
        assert_eq!(snapshot.last_failure, Some(ToggleStage::FetchFailed));
        assert_eq!(snapshot.stage, ToggleStage::FetchFailed);
        assert_eq!(fx.platform.notices(), vec![Notice::FetchFailed]);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_token_request_is_bounded_too() {
        let mut platform = FakePlatform::new(true);
        platform.token = TokenReply::Hang;
        let fx = fixture(platform);

        let result = fx
            .registry
            .conversation_toggle("conv-1", PermissionStatus::Granted)
            .await;

        assert!(matches!(result, Err(BridgeError::FetchFailed(_))));
        assert!(fx.invoker.calls().is_empty());
        assert_eq!(fx.registry.conversation("conv-1"), ConversationPushState::default());
    }

    #[tokio::test]
    async fn first_enable_registers_server_and_forces_auto_share() {
        let fx = fixture(FakePlatform::new(true));

        let outcome = fx
            .registry
            .account_toggle(None, PermissionStatus::Granted)
            .await
            .expect("toggle");

        assert_eq!(
            outcome,
            ToggleOutcome::Enabled {
                status: PushStatus::EnabledJustNow
            }
        );
        let methods = fx
            .invoker
            .calls()
            .into_iter()
            .map(|(method, _)| method)
            .collect::<Vec<_>>();
        assert_eq!(
            methods,
            vec![
                SET_DEVICE_TOKEN_METHOD,
                SERVER_REGISTER_METHOD,
                ACCOUNT_CONFIGURE_METHOD,
                AUTO_SHARE_METHOD
            ]
        );
        let token_call = &fx.invoker.calls_to(SET_DEVICE_TOKEN_METHOD)[0];
        assert_eq!(token_call["receiver"]["token"], "AQIDBA==");
        assert_eq!(token_call["receiver"]["tokenType"], "fcm");
        assert!(fx.platform.confirms.lock().expect("confirms").is_empty());

        let persisted = fx.registry.store.load();
        assert_eq!(persisted.registration.status, RegistrationStatus::Registered);
        assert!(persisted.registration.knows_push_server());
        assert!(persisted.registration.auto_share);
        assert_eq!(fx.registry.snapshot().stage, ToggleStage::Registered);
    }

    #[tokio::test]
    async fn known_server_reports_enabled_before() {
        let fx = fixture_with_state(FakePlatform::new(true), Some(registered_state(MUTED_FOREVER)));

        let outcome = fx
            .registry
            .account_toggle(Some(true), PermissionStatus::Granted)
            .await
            .expect("toggle");

        assert_eq!(
            outcome,
            ToggleOutcome::Enabled {
                status: PushStatus::EnabledBefore
            }
        );
        assert!(fx.invoker.calls_to(SERVER_REGISTER_METHOD).is_empty());
        assert!(fx.invoker.calls_to(AUTO_SHARE_METHOD).is_empty());
        assert_eq!(
            fx.invoker.calls_to(ACCOUNT_CONFIGURE_METHOD),
            vec![json!({ "unmute": true })]
        );
        assert_eq!(fx.registry.registration().muted_until, 0);
    }

    #[tokio::test]
    async fn account_disable_refused_without_filtering() {
        let seed = registered_state(0);
        let fx = fixture_with_state(FakePlatform::new(false), Some(seed.clone()));

        let outcome = fx
            .registry
            .account_toggle(None, PermissionStatus::Granted)
            .await
            .expect("toggle");

        assert_eq!(
            outcome,
            ToggleOutcome::Refused {
                notice: Notice::WhyCantDisableAccount
            }
        );
        assert!(fx.invoker.calls().is_empty());
        assert_eq!(fx.registry.store.load(), seed);
        assert_eq!(fx.platform.notices(), vec![Notice::WhyCantDisableAccount]);
    }

    #[tokio::test]
    async fn account_disable_mutes_forever_with_filtering() {
        let fx = fixture_with_state(FakePlatform::new(true), Some(registered_state(0)));

        let outcome = fx
            .registry
            .account_toggle(Some(false), PermissionStatus::Granted)
            .await
            .expect("toggle");

        assert_eq!(outcome, ToggleOutcome::Muted);
        assert_eq!(
            fx.invoker.calls_to(ACCOUNT_CONFIGURE_METHOD),
            vec![json!({ "muteForever": true })]
        );
        assert_eq!(fx.registry.registration().muted_until, MUTED_FOREVER);
        assert_eq!(fx.registry.snapshot().stage, ToggleStage::Muted);

        let again = fx
            .registry
            .account_toggle(Some(false), PermissionStatus::Granted)
            .await
            .expect("toggle");
        assert_eq!(again, ToggleOutcome::AlreadyDisabled);
    }

    #[tokio::test]
    async fn server_known_account_can_be_muted() {
        let fx = fixture(FakePlatform::new(true));
        assert!(fx
            .registry
            .apply_account_update(&json!({
                "account": { "serviceTokens": [{ "serviceType": "psh" }], "mutedUntil": 0 }
            }))
            .expect("account"));

        let outcome = fx
            .registry
            .account_toggle(Some(false), PermissionStatus::Granted)
            .await
            .expect("toggle");

        assert_eq!(outcome, ToggleOutcome::Muted);
        assert_eq!(
            fx.invoker.calls_to(ACCOUNT_CONFIGURE_METHOD),
            vec![json!({ "muteForever": true })]
        );
        assert_eq!(fx.registry.store.load().registration.muted_until, MUTED_FOREVER);
    }

    #[tokio::test]
    async fn conversation_disable_refused_without_filtering() {
        let mut seed = registered_state(0);
        seed.conversations.insert(
            "conv-1".to_string(),
            ConversationPushState {
                shared_token_id: Some("shared".to_string()),
                muted_until: 0,
                auto_share: false,
            },
        );
        let fx = fixture_with_state(FakePlatform::new(false), Some(seed.clone()));

        let outcome = fx
            .registry
            .conversation_toggle("conv-1", PermissionStatus::Granted)
            .await
            .expect("toggle");

        assert_eq!(
            outcome,
            ToggleOutcome::Refused {
                notice: Notice::WhyCantDisable
            }
        );
        assert!(fx.invoker.calls().is_empty());
        assert_eq!(fx.registry.store.load(), seed);
    }

    #[tokio::test]
    async fn conversation_enable_then_disable() {
        let fx = fixture_with_state(FakePlatform::new(true), Some(registered_state(0)));
        fx.invoker.reply(
            SHARE_TOKEN_METHOD,
            Reply::Ok(json!({ "sharedPushTokenIdentifier": "shared-77" })),
        );

        let enabled = fx
            .registry
            .conversation_toggle("conv-1", PermissionStatus::Granted)
            .await
            .expect("enable");
        assert_eq!(
            enabled,
            ToggleOutcome::Enabled {
                status: PushStatus::EnabledBefore
            }
        );
        assert_eq!(
            fx.invoker.calls_to(CONVERSATION_MUTE_METHOD),
            vec![json!({ "groupPk": "conv-1", "unmute": true })]
        );
        let conversation = fx.registry.conversation("conv-1");
        assert_eq!(conversation.shared_token_id.as_deref(), Some("shared-77"));
        assert!(conversation.is_push_enabled(now_ms()));

        let muted = fx
            .registry
            .conversation_toggle("conv-1", PermissionStatus::Granted)
            .await
            .expect("disable");
        assert_eq!(muted, ToggleOutcome::Muted);
        assert!(!fx.registry.conversation("conv-1").is_push_enabled(now_ms()));
        assert!(!fx.registry.store.load().conversations["conv-1"].is_push_enabled(now_ms()));
    }

    #[tokio::test]
    async fn share_without_identifier_waits_for_server_update() {
        let fx = fixture_with_state(FakePlatform::new(true), Some(registered_state(0)));
        fx.invoker.reply(SHARE_TOKEN_METHOD, Reply::Ok(json!({})));

        fx.registry
            .enable_notifications_for_conversation("conv-3")
            .await
            .expect("share");

        let conversation = fx.registry.conversation("conv-3");
        assert_eq!(conversation.shared_token_id, None);
        assert_eq!(conversation.muted_until, 0);
        assert!(!conversation.is_push_enabled(now_ms()));

        assert!(fx
            .registry
            .apply_conversation_update(&json!({
                "conversation": { "publicKey": "conv-3", "sharedPushTokenIdentifier": "srv-3" }
            }))
            .expect("update"));
        let conversation = fx.registry.conversation("conv-3");
        assert_eq!(conversation.shared_token_id.as_deref(), Some("srv-3"));
        assert!(conversation.is_push_enabled(now_ms()));
    }

    #[tokio::test]
    async fn declined_warning_cancels_share() {
        let mut platform = FakePlatform::new(false);
        platform.confirm = false;
        let fx = fixture_with_state(platform, Some(registered_state(0)));

        let result = fx
            .registry
            .enable_notifications_for_conversation("conv-1")
            .await;

        assert_eq!(result, Err(BridgeError::Cancelled));
        assert!(fx.invoker.calls_to(SHARE_TOKEN_METHOD).is_empty());
        assert_eq!(
            *fx.platform.confirms.lock().expect("confirms"),
            vec![ConfirmPrompt::ShareTokenWarning]
        );
        assert!(fx.platform.notices().is_empty());
    }

    #[tokio::test]
    async fn missing_token_and_missing_server_are_distinct() {
        let fx = fixture_with_state(FakePlatform::new(true), Some(registered_state(0)));

        fx.invoker
            .reply(SHARE_TOKEN_METHOD, Reply::Err(BridgeError::UnknownDestination));
        let no_token = fx
            .registry
            .conversation_toggle("conv-1", PermissionStatus::Granted)
            .await;
        assert_eq!(no_token, Err(BridgeError::UnknownDestination));

        fx.invoker
            .reply(SHARE_TOKEN_METHOD, Reply::Err(BridgeError::UnknownServer));
        let no_server = fx
            .registry
            .conversation_toggle("conv-1", PermissionStatus::Granted)
            .await;
        assert_eq!(no_server, Err(BridgeError::UnknownServer));

        assert_eq!(fx.platform.notices(), vec![Notice::NoToken, Notice::NoServer]);
        assert_eq!(fx.registry.conversation("conv-1"), ConversationPushState::default());
    }

    #[tokio::test]
    async fn auto_share_prompt_skipped_on_web() {
        let mut platform = FakePlatform::new(true);
        platform.platform = Platform::Web;
        let fx = fixture(platform);

        assert_eq!(
            fx.registry.ask_and_share_on_all_conversations(false).await,
            Ok(false)
        );
        assert!(fx.platform.confirms.lock().expect("confirms").is_empty());
        assert_eq!(
            fx.registry
                .account_toggle(None, PermissionStatus::Granted)
                .await,
            Err(BridgeError::Unsupported)
        );
    }

    #[tokio::test]
    async fn shared_tokens_collects_push_tokens() {
        let fx = fixture(FakePlatform::new(true));
        fx.invoker.stream_items(
            SHARED_TOKENS_TOPIC,
            vec![
                json!({ "pushToken": { "token": "a" } }),
                json!({ "error": "decrypt failed" }),
                json!({ "pushToken": { "token": "b" } }),
            ],
        );

        assert!(fx
            .registry
            .shared_tokens_for_conversation(None)
            .await
            .expect("none")
            .is_empty());
        assert!(fx.invoker.calls().is_empty());

        let tokens = fx
            .registry
            .shared_tokens_for_conversation(Some("conv-1"))
            .await
            .expect("tokens");
        assert_eq!(tokens, vec![json!({ "token": "a" }), json!({ "token": "b" })]);
    }

    #[tokio::test]
    async fn server_updates_reconcile_local_state() {
        let fx = fixture(FakePlatform::new(true));

        assert!(fx
            .registry
            .apply_account_update(&json!({
                "account": { "serviceTokens": [{ "serviceType": "psh" }] }
            }))
            .expect("account"));
        assert!(fx.registry.registration().knows_push_server());

        assert!(fx
            .registry
            .apply_conversation_update(&json!({
                "conversation": {
                    "publicKey": "conv-9",
                    "sharedPushTokenIdentifier": "srv-shared",
                    "autoShared": true
                }
            }))
            .expect("conversation"));
        let conversation = fx.registry.store.load().conversations["conv-9"].clone();
        assert_eq!(conversation.shared_token_id.as_deref(), Some("srv-shared"));
        assert!(conversation.auto_share);

        assert!(!fx
            .registry
            .apply_conversation_update(&json!({ "conversation": { "publicKey": "conv-9" } }))
            .expect("unchanged"));
    }
}

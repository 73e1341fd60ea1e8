use std::sync::Arc;

use base64::Engine;
use futures_util::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::store::{DeviceToken, PushTokenType};
use crate::{
    config::Platform,
    error::BridgeError,
    hub::ClientHub,
    prompt::{PromptBroker, PromptKind},
};

/// OS notification permission as reported by the UI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionStatus {
    Granted,
    Limited,
    Denied,
    Blocked,
    Unavailable,
    #[default]
    #[serde(other)]
    Undetermined,
}

impl PermissionStatus {
    pub fn allows_notifications(self) -> bool {
        matches!(self, Self::Granted | Self::Limited)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConfirmPrompt {
    /// Sharing a token without filtering lets the conversation wake the device.
    ShareTokenWarning,
    /// Turn on auto-share for every conversation.
    EnableAllConversations,
}

impl ConfirmPrompt {
    pub fn key(self) -> &'static str {
        match self {
            Self::ShareTokenWarning => "warning-disable",
            Self::EnableAllConversations => "warning-enable-all",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Notice {
    WhyCantDisable,
    WhyCantDisableAccount,
    NoToken,
    NoServer,
    PermissionDenied,
    FetchFailed,
}

impl Notice {
    pub fn key(self) -> &'static str {
        match self {
            Self::WhyCantDisable => "why-cant-disable",
            Self::WhyCantDisableAccount => "why-cant-disable-account",
            Self::NoToken => "no-token",
            Self::NoServer => "no-server",
            Self::PermissionDenied => "perm-denied",
            Self::FetchFailed => "fetch-failed",
        }
    }
}

/// What the push registry needs from the device it runs for.
pub trait PushPlatform: Send + Sync {
    fn platform(&self) -> Platform;

    /// Whether notifications can be filtered per conversation on this device.
    fn filtering_available(&self) -> bool;

    fn request_permission(&self) -> BoxFuture<'_, Result<PermissionStatus, BridgeError>>;

    fn request_token(&self) -> BoxFuture<'_, Result<DeviceToken, BridgeError>>;

    fn confirm(&self, prompt: ConfirmPrompt) -> BoxFuture<'_, bool>;

    fn notify(&self, notice: Notice);
}

/// Platform backed by the connected UI: prompts go out as notifications and
/// answers come back through `bridge/prompts/resolve`.
pub struct ClientPlatform {
    broker: Arc<PromptBroker>,
    hub: Arc<ClientHub>,
    platform: Platform,
    filtering: bool,
    bundle_id: Option<String>,
}

impl ClientPlatform {
    pub fn new(
        broker: Arc<PromptBroker>,
        hub: Arc<ClientHub>,
        platform: Platform,
        filtering: bool,
        bundle_id: Option<String>,
    ) -> Self {
        Self {
            broker,
            hub,
            platform,
            filtering,
            bundle_id,
        }
    }
}

fn parse_token_answer(
    answer: &Value,
    platform: Platform,
    fallback_bundle: Option<&str>,
) -> Result<DeviceToken, BridgeError> {
    let token_type = PushTokenType::for_platform(platform).ok_or(BridgeError::Unsupported)?;
    let encoded = answer
        .get("token")
        .and_then(Value::as_str)
        .filter(|raw| !raw.is_empty())
        .ok_or_else(|| BridgeError::FetchFailed("no push token returned".to_string()))?;
    let token = base64::engine::general_purpose::STANDARD
        .decode(encoded.as_bytes())
        .map_err(|error| BridgeError::FetchFailed(format!("invalid push token: {error}")))?;
    let bundle_id = answer
        .get("bundleId")
        .and_then(Value::as_str)
        .or(fallback_bundle)
        .map(str::to_string);

    Ok(DeviceToken {
        token,
        token_type,
        bundle_id,
    })
}

impl PushPlatform for ClientPlatform {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn filtering_available(&self) -> bool {
        self.filtering
    }

    fn request_permission(&self) -> BoxFuture<'_, Result<PermissionStatus, BridgeError>> {
        async move {
            let answer = self
                .broker
                .ask(PromptKind::NotificationPermission, None)
                .await?;
            let status = answer
                .get("status")
                .cloned()
                .map(serde_json::from_value::<PermissionStatus>)
                .transpose()?
                .unwrap_or_default();
            Ok(status)
        }
        .boxed()
    }

    fn request_token(&self) -> BoxFuture<'_, Result<DeviceToken, BridgeError>> {
        async move {
            let answer = self.broker.ask(PromptKind::PushToken, None).await?;
            parse_token_answer(&answer, self.platform, self.bundle_id.as_deref())
        }
        .boxed()
    }

    fn confirm(&self, prompt: ConfirmPrompt) -> BoxFuture<'_, bool> {
        async move {
            match self.broker.ask(PromptKind::Confirm, Some(prompt.key())).await {
                Ok(answer) => answer
                    .get("accepted")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                Err(error) => {
                    tracing::debug!(key = prompt.key(), %error, "confirmation not answered");
                    false
                }
            }
        }
        .boxed()
    }

    fn notify(&self, notice: Notice) {
        let hub = self.hub.clone();
        tokio::spawn(async move {
            hub.broadcast_notification(
                "bridge/push/notice",
                serde_json::json!({ "notice": notice.key() }),
            )
            .await;
        });
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn token_answer_uses_platform_type_and_fallback_bundle() {
        let token = parse_token_answer(
            &json!({ "token": "3q2+7w==" }),
            Platform::Ios,
            Some("tech.berty.ios"),
        )
        .expect("token");
        assert_eq!(token.token, vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(token.token_type, PushTokenType::Apns);
        assert_eq!(token.bundle_id.as_deref(), Some("tech.berty.ios"));
    }

    #[test]
    fn empty_or_invalid_token_is_a_fetch_failure() {
        assert!(matches!(
            parse_token_answer(&json!({ "token": "" }), Platform::Android, None),
            Err(BridgeError::FetchFailed(_))
        ));
        assert!(matches!(
            parse_token_answer(&json!({ "token": "%%%" }), Platform::Android, None),
            Err(BridgeError::FetchFailed(_))
        ));
        assert_eq!(
            parse_token_answer(&json!({ "token": "AA==" }), Platform::Web, None),
            Err(BridgeError::Unsupported)
        );
    }

    #[test]
    fn unknown_permission_status_is_undetermined() {
        let status: PermissionStatus = serde_json::from_value(json!("provisional")).expect("parse");
        assert_eq!(status, PermissionStatus::Undetermined);
        assert!(!status.allows_notifications());
        assert!(PermissionStatus::Limited.allows_notifications());
    }
}

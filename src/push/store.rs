use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{config::Platform, error::BridgeError};

pub const PUSH_STATE_FILE: &str = "push_state.json";

/// Sentinel for "muted until further notice".
pub const MUTED_FOREVER: i64 = i64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PushTokenType {
    Apns,
    Fcm,
}

impl PushTokenType {
    pub fn for_platform(platform: Platform) -> Option<Self> {
        match platform {
            Platform::Ios => Some(Self::Apns),
            Platform::Android => Some(Self::Fcm),
            Platform::Web => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceToken {
    #[serde(with = "token_bytes")]
    pub token: Vec<u8>,
    pub token_type: PushTokenType,
    #[serde(default)]
    pub bundle_id: Option<String>,
}

impl DeviceToken {
    pub fn encoded(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.token)
    }
}

mod token_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(raw.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RegistrationStatus {
    #[default]
    Unregistered,
    Pending,
    Registered,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerAck {
    pub acknowledged_at: String,
    #[serde(default)]
    pub detail: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PushRegistration {
    pub token: Option<DeviceToken>,
    pub status: RegistrationStatus,
    pub server_ack: Option<ServerAck>,
    pub muted_until: i64,
    pub auto_share: bool,
}

impl PushRegistration {
    pub fn knows_push_server(&self) -> bool {
        self.server_ack.is_some()
    }

    pub fn is_muted(&self, now_ms: i64) -> bool {
        self.muted_until > now_ms
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConversationPushState {
    pub shared_token_id: Option<String>,
    pub muted_until: i64,
    /// Set when the token reached this conversation through account auto-share.
    pub auto_share: bool,
}

impl ConversationPushState {
    pub fn is_push_enabled(&self, now_ms: i64) -> bool {
        self.shared_token_id.is_some() && self.muted_until <= now_ms
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistedPushState {
    pub registration: PushRegistration,
    pub conversations: BTreeMap<String, ConversationPushState>,
}

/// JSON file holding the push registration under the bridge data directory.
#[derive(Debug, Clone)]
pub struct PushStore {
    path: PathBuf,
}

impl PushStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(PUSH_STATE_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> PersistedPushState {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return PersistedPushState::default();
            }
            Err(error) => {
                tracing::warn!(path = %self.path.display(), %error, "failed to read push state");
                return PersistedPushState::default();
            }
        };

        match serde_json::from_str(&raw) {
            Ok(state) => state,
            Err(error) => {
                tracing::warn!(path = %self.path.display(), %error, "ignoring corrupt push state");
                PersistedPushState::default()
            }
        }
    }

    /// Write through a temp file so a crash never leaves a half-written state.
    pub fn save(&self, state: &PersistedPushState) -> Result<(), BridgeError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_vec_pretty(state)
            .map_err(|error| BridgeError::Storage(error.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registered_state() -> PersistedPushState {
        let mut state = PersistedPushState::default();
        state.registration = PushRegistration {
            token: Some(DeviceToken {
                token: vec![0xde, 0xad, 0xbe, 0xef],
                token_type: PushTokenType::Fcm,
                bundle_id: Some("tech.berty.android".to_string()),
            }),
            status: RegistrationStatus::Registered,
            server_ack: None,
            muted_until: 0,
            auto_share: true,
        };
        state.conversations.insert(
            "conv-1".to_string(),
            ConversationPushState {
                shared_token_id: Some("shared-1".to_string()),
                muted_until: 0,
                auto_share: false,
            },
        );
        state
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = PushStore::new(dir.path());
        assert_eq!(store.load(), PersistedPushState::default());
    }

    #[test]
    fn saved_state_survives_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = PushStore::new(&dir.path().join("nested"));
        let state = registered_state();
        store.save(&state).expect("save");

        let raw = fs::read_to_string(store.path()).expect("read");
        assert!(raw.contains("\"token\": \"3q2+7w==\""));
        assert_eq!(store.load(), state);
    }

    #[test]
    fn corrupt_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = PushStore::new(dir.path());
        fs::write(store.path(), "{not json").expect("write");
        assert_eq!(store.load(), PersistedPushState::default());
    }

    #[test]
    fn conversation_enabled_only_when_shared_and_unmuted() {
        let now = 1_000;
        let mut state = ConversationPushState::default();
        assert!(!state.is_push_enabled(now));
        state.shared_token_id = Some("shared".to_string());
        assert!(state.is_push_enabled(now));
        state.muted_until = MUTED_FOREVER;
        assert!(!state.is_push_enabled(now));
    }
}

use std::{env, path::PathBuf, time::Duration};

use axum::http::{header::AUTHORIZATION, HeaderMap};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE_SIZE: u32 = 50;
const MAX_PAGE_SIZE: u32 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeMode {
    Local,
    Noop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
    Web,
}

impl Platform {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ios" => Some(Self::Ios),
            "android" => Some(Self::Android),
            "web" => Some(Self::Web),
            _ => None,
        }
    }

    pub fn push_available(self) -> bool {
        self != Self::Web
    }

    /// Android always filters per conversation; iOS only with the notification extension.
    fn default_filtering(self) -> bool {
        matches!(self, Self::Android)
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub host: String,
    pub port: u16,
    pub auth_token: Option<String>,
    pub auth_enabled: bool,
    pub allow_insecure_no_auth: bool,
    pub allow_query_token_auth: bool,
    pub mode: BridgeMode,
    pub data_dir: PathBuf,
    pub protocol_command: Vec<String>,
    pub invoke_timeout: Duration,
    pub push_step_timeout: Duration,
    pub permission_timeout: Duration,
    pub page_size: u32,
    pub platform: Platform,
    pub push_filtering: bool,
    pub bundle_id: Option<String>,
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let read_bool = |name: &str| {
            read(name)
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false)
        };
        let read_millis = |name: &str, fallback: u64| {
            Duration::from_millis(
                read(name)
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(fallback),
            )
        };

        let host = read("BRIDGE_HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let port = read("BRIDGE_PORT")
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(8787);

        let auth_token = read("BRIDGE_AUTH_TOKEN");
        let allow_insecure_no_auth = read_bool("BRIDGE_ALLOW_INSECURE_NO_AUTH");
        if auth_token.is_none() && !allow_insecure_no_auth {
            return Err(
                "BRIDGE_AUTH_TOKEN is required. Set BRIDGE_ALLOW_INSECURE_NO_AUTH=true only for local development."
                    .to_string(),
            );
        }

        let mode = match read("BRIDGE_MODE").as_deref() {
            None | Some("local") => BridgeMode::Local,
            Some("noop") => BridgeMode::Noop,
            Some(other) => return Err(format!("unknown BRIDGE_MODE: {other}")),
        };

        let platform = match read("BRIDGE_PLATFORM") {
            Some(raw) => {
                Platform::parse(&raw).ok_or_else(|| format!("unknown BRIDGE_PLATFORM: {raw}"))?
            }
            None => Platform::Android,
        };
        let push_filtering = match read("BRIDGE_PUSH_FILTERING") {
            Some(raw) => raw.eq_ignore_ascii_case("true"),
            None => platform.default_filtering(),
        };

        let protocol_command = match read("BRIDGE_PROTOCOL_CMD") {
            Some(raw) => shlex::split(&raw)
                .filter(|tokens| !tokens.is_empty())
                .ok_or_else(|| "BRIDGE_PROTOCOL_CMD has invalid quoting".to_string())?,
            None => vec!["weshd".to_string(), "--stdio".to_string()],
        };

        let page_size = read("BRIDGE_PAGE_SIZE")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);

        Ok(Self {
            host,
            port,
            auth_enabled: auth_token.is_some(),
            auth_token,
            allow_insecure_no_auth,
            allow_query_token_auth: read_bool("BRIDGE_ALLOW_QUERY_TOKEN_AUTH"),
            mode,
            data_dir: read("BRIDGE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("bridge-data")),
            protocol_command,
            invoke_timeout: read_millis("BRIDGE_INVOKE_TIMEOUT_MS", 30_000),
            push_step_timeout: read_millis("BRIDGE_PUSH_STEP_TIMEOUT_MS", 5_000),
            permission_timeout: read_millis("BRIDGE_PERMISSION_TIMEOUT_MS", 120_000),
            page_size,
            platform,
            push_filtering,
            bundle_id: read("BRIDGE_BUNDLE_ID"),
        })
    }

    /// Check the credentials a UI client presented on the websocket upgrade.
    pub fn authorize(
        &self,
        headers: &HeaderMap,
        query_token: Option<&str>,
    ) -> Result<(), AuthRejection> {
        if !self.auth_enabled {
            return Ok(());
        }
        let expected = self
            .auth_token
            .as_deref()
            .ok_or(AuthRejection::NotConfigured)?;

        let query_token = query_token.filter(|_| self.allow_query_token_auth);
        let mut presented = bearer_token(headers).into_iter().chain(query_token).peekable();
        if presented.peek().is_none() {
            return Err(AuthRejection::MissingToken);
        }
        if presented.any(|token| tokens_match(token, expected)) {
            Ok(())
        } else {
            Err(AuthRejection::WrongToken)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRejection {
    NotConfigured,
    MissingToken,
    WrongToken,
}

impl AuthRejection {
    pub fn reason(self) -> &'static str {
        match self {
            Self::NotConfigured => "bridge token not configured",
            Self::MissingToken => "missing bridge token",
            Self::WrongToken => "invalid bridge token",
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = raw.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|token| !token.is_empty())
}

// Compares every byte so the time taken does not reveal the matching prefix.
fn tokens_match(presented: &str, expected: &str) -> bool {
    presented.len() == expected.len()
        && presented
            .bytes()
            .zip(expected.bytes())
            .fold(0u8, |diff, (a, b)| diff | (a ^ b))
            == 0
}

#[cfg(test)]
pub(crate) fn test_config(data_dir: PathBuf) -> BridgeConfig {
    let mut config = BridgeConfig::from_lookup(|name| match name {
        "BRIDGE_ALLOW_INSECURE_NO_AUTH" => Some("true".to_string()),
        _ => None,
    })
    .expect("test config should parse");
    config.data_dir = data_dir;
    config
}

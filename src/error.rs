use serde_json::{json, Value};
use thiserror::Error;

/// Protocol error code reported when a push destination has no token.
pub const ERR_PUSH_UNKNOWN_DESTINATION: i64 = 5005;
/// Protocol error code reported when no push server is configured.
pub const ERR_PUSH_UNKNOWN_SERVER: i64 = 5006;

/// Errors surfaced by the bridge to its callers and over the UI socket.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("bridge session is not connected")]
    NotConnected,
    #[error("bridge session is already initialized")]
    AlreadyInitialized,
    #[error("bridge initialization failed: {0}")]
    InitFailure(String),
    #[error("invalid remote address: {0}")]
    InvalidAddress(String),
    #[error("request timed out after {0}ms")]
    Timeout(u64),
    #[error("bridge session disconnected")]
    Disconnected,
    #[error("notification permission denied")]
    PermissionDenied,
    #[error("push registration failed: {0}")]
    FetchFailed(String),
    #[error("storage is in use by a ready session; close it first")]
    StorageBusy,
    #[error("no push token is known for the destination")]
    UnknownDestination,
    #[error("no push server is known")]
    UnknownServer,
    #[error("{0}")]
    InvalidParams(String),
    #[error("unknown method: {0}")]
    MethodNotFound(String),
    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("bridge is not available on this platform")]
    Unsupported,
    #[error("action cancelled by user")]
    Cancelled,
}

impl BridgeError {
    /// Classify an error object returned by the protocol service.
    pub fn from_remote(error: &Value) -> Self {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(-32000);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown remote error")
            .to_string();

        match code {
            ERR_PUSH_UNKNOWN_DESTINATION => Self::UnknownDestination,
            ERR_PUSH_UNKNOWN_SERVER => Self::UnknownServer,
            _ => Self::Remote { code, message },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NotConnected => "not_connected",
            Self::AlreadyInitialized => "already_initialized",
            Self::InitFailure(_) => "init_failure",
            Self::InvalidAddress(_) => "invalid_address",
            Self::Timeout(_) => "timeout",
            Self::Disconnected => "disconnected",
            Self::PermissionDenied => "permission_denied",
            Self::FetchFailed(_) => "fetch_failed",
            Self::StorageBusy => "storage_busy",
            Self::UnknownDestination => "unknown_destination",
            Self::UnknownServer => "unknown_server",
            Self::InvalidParams(_) => "invalid_params",
            Self::MethodNotFound(_) => "method_not_found",
            Self::Remote { .. } => "remote",
            Self::Storage(_) => "storage",
            Self::Unsupported => "unsupported",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            Self::InvalidParams(_) | Self::InvalidAddress(_) => -32602,
            Self::MethodNotFound(_) => -32601,
            Self::Remote { code, .. } => *code,
            Self::NotConnected | Self::Disconnected => -32010,
            Self::Timeout(_) => -32011,
            Self::PermissionDenied | Self::Cancelled => -32003,
            _ => -32000,
        }
    }

    /// JSON-RPC `error` object for the UI socket.
    pub fn to_rpc_value(&self) -> Value {
        json!({
            "code": self.code(),
            "message": self.to_string(),
            "data": { "error": self.name() },
        })
    }

    /// Transport-level failures abort one operation but leave the session usable.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Disconnected)
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(error: serde_json::Error) -> Self {
        Self::InvalidParams(error.to_string())
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(error: std::io::Error) -> Self {
        Self::Storage(error.to_string())
    }
}

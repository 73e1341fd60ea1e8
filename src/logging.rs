//! Tracing bootstrap and forwarding of UI log lines.

use std::env;

use serde::Deserialize;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,message_bridge=debug";

/// Install the global subscriber. `RUST_LOG` wins over `BRIDGE_LOG`.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_env_filter(filter_from_env())
        .try_init();
}

fn filter_from_env() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    if let Some(value) = env::var("BRIDGE_LOG").ok().filter(|v| !v.trim().is_empty()) {
        if let Ok(filter) = EnvFilter::try_new(value) {
            return filter;
        }
    }

    EnvFilter::new(DEFAULT_FILTER)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Emit a log line reported by the UI process.
pub fn forward(level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => tracing::debug!(target: "ui", "{message}"),
        LogLevel::Info => tracing::info!(target: "ui", "{message}"),
        LogLevel::Warn => tracing::warn!(target: "ui", "{message}"),
        LogLevel::Error => tracing::error!(target: "ui", "{message}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ui_levels() {
        let level: LogLevel = serde_json::from_str("\"warn\"").expect("level");
        assert_eq!(level, LogLevel::Warn);
        assert!(serde_json::from_str::<LogLevel>("\"trace\"").is_err());
    }
}

use std::sync::Arc;

use message_bridge::{
    config::BridgeConfig,
    hub::ClientHub,
    logging,
    prompt::PromptBroker,
    push::ClientPlatform,
    server::{self, AppState},
    Bridge,
};

#[tokio::main]
async fn main() {
    logging::init();

    let config = match BridgeConfig::from_env() {
        Ok(config) => Arc::new(config),
        Err(error) => {
            tracing::error!("{error}");
            std::process::exit(1);
        }
    };

    if !config.auth_enabled && config.allow_insecure_no_auth {
        tracing::warn!(
            "bridge auth is disabled by BRIDGE_ALLOW_INSECURE_NO_AUTH=true (local development only)"
        );
    }
    if config.allow_query_token_auth {
        tracing::warn!(
            "query-token auth is enabled (BRIDGE_ALLOW_QUERY_TOKEN_AUTH=true); prefer Authorization headers instead"
        );
    }

    let hub = Arc::new(ClientHub::new());
    let prompts = Arc::new(PromptBroker::new(hub.clone()));
    let platform = Arc::new(ClientPlatform::new(
        prompts.clone(),
        hub.clone(),
        config.platform,
        config.push_filtering,
        config.bundle_id.clone(),
    ));
    let bridge = Bridge::new(config.clone(), platform);

    let state = AppState::new(config.clone(), hub, prompts, bridge);
    server::spawn_notification_pump(state.clone());
    let app = server::router(state);

    let bind_addr = format!("{}:{}", config.host, config.port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(error) => {
            tracing::error!(%error, "failed to bind {bind_addr}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        mode = ?config.mode,
        platform = ?config.platform,
        data_dir = %config.data_dir.display(),
        "message-bridge listening on {bind_addr}"
    );

    if let Err(error) = axum::serve(listener, app).await {
        tracing::error!(%error, "server error");
        std::process::exit(1);
    }
}

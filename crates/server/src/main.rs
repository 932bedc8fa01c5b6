use std::{net::SocketAddr, sync::Arc};

use axum::{
    routing::{delete, get, patch, post},
    Router,
};
use server_api::{auth::AuthConfig, ApiContext};
use storage::Storage;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod api;
mod app_state;
mod config;
mod hub;
mod ws;

use app_state::{AppState, SocketLimits};
use config::{load_settings, prepare_database_url};
use hub::Hub;

const MAX_BODY_BYTES: usize = 64 * 1024;
const FANOUT_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let api = ApiContext {
        storage,
        auth: AuthConfig {
            secret: settings.jwt_secret.clone(),
            ttl_seconds: settings.token_ttl_seconds,
        },
    };
    let state = AppState {
        api,
        hub: Hub::new(FANOUT_CAPACITY),
        limits: SocketLimits {
            auth_timeout: settings.auth_timeout,
            idle_timeout: settings.idle_timeout,
        },
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(api::healthz))
        .route("/conversations", get(api::list_conversations))
        .route("/conversations/direct", post(api::open_direct))
        .route("/conversations/group", post(api::create_group))
        .route(
            "/conversations/:conversation_id/messages",
            get(api::list_messages),
        )
        .route(
            "/conversations/:conversation_id/participants",
            post(api::add_participant),
        )
        .route(
            "/conversations/:conversation_id/participants/:user_id",
            delete(api::remove_participant),
        )
        .route(
            "/conversations/:conversation_id/admins/:user_id",
            post(api::grant_admin).delete(api::revoke_admin),
        )
        .route(
            "/conversations/:conversation_id/overlay",
            patch(api::update_overlay),
        )
        .route("/ws", get(ws::ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;

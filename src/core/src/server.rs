use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::backend::ToolBackend;
use crate::breaker::CircuitBreaker;
use crate::cbus_config::CbusConfig;
use crate::config::ServerConfig;
use crate::connection::{run_connection, ConnectionParams};
use crate::index::ToolIndex;
use crate::pipeline::ToolPipeline;
use crate::router::MessageRouter;
use crate::routing::{ClientHub, RoutingTable};
use crate::settings::Settings;
use crate::storage::EngramStore;

/// Shared state accessible by handlers.
#[derive(Clone)]
pub(crate) struct AppState {
    pub config: ServerConfig,
    pub hub: Arc<ClientHub>,
    pub router: Arc<MessageRouter>,
}

/// Build the axum router for the coordinator.
///
/// Exposes `/ws` (WebSocket upgrade) and `/health`. On startup the
/// store is migrated, each engram is pruned to the retention count, the
/// default tap from the file config is applied, and configured tool
/// servers are indexed in the background.
pub fn build_router(
    config: ServerConfig,
    file_config: CbusConfig,
    store: Arc<dyn EngramStore>,
    backend: Arc<dyn ToolBackend>,
) -> Router {
    if let Err(e) = store.init() {
        tracing::warn!("store init failed on startup: {e}");
    }
    prune_retention(&*store, config.message_retention);

    let hub = Arc::new(ClientHub::new());
    let routing = Arc::new(RoutingTable::new(hub.clone()));
    let breaker = Arc::new(CircuitBreaker::new(
        config.breaker_window,
        config.breaker_max_calls,
    ));
    let settings = Arc::new(Settings::new());
    let index = Arc::new(ToolIndex::new());

    if let Some(tap) = file_config.default_tap() {
        tracing::info!(tool = %tap.tool_name, "default tap loaded from config");
        settings.set_tap(Some(tap));
    }
    spawn_index_warmup(file_config.servers, backend.clone(), index.clone());

    let pipeline = Arc::new(ToolPipeline::new(
        store.clone(),
        routing.clone(),
        breaker,
        backend.clone(),
        index.clone(),
    ));
    let router = Arc::new(MessageRouter::new(
        store, routing, settings, index, backend, pipeline,
    ));

    let state = AppState {
        config,
        hub,
        router,
    };

    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Trim every engram to the retention count, logging and continuing on
/// failure.
fn prune_retention(store: &dyn EngramStore, keep: usize) {
    let metas = match store.list() {
        Ok(metas) => metas,
        Err(e) => {
            tracing::warn!("failed to list engrams for startup prune: {e}");
            return;
        }
    };
    for meta in metas {
        match store.prune(&meta.engram_id, Some(keep)) {
            Ok(0) => {}
            Ok(removed) => {
                tracing::info!(engram_id = %meta.engram_id, removed, "pruned on startup");
            }
            Err(e) => {
                tracing::warn!(engram_id = %meta.engram_id, "startup prune failed: {e}");
            }
        }
    }
}

fn spawn_index_warmup(servers: Vec<String>, backend: Arc<dyn ToolBackend>, index: Arc<ToolIndex>) {
    if servers.is_empty() {
        return;
    }
    tokio::spawn(async move {
        for url in servers {
            match backend.list_tools(&url).await {
                Ok(tools) => {
                    tracing::info!(%url, count = tools.len(), "tool server indexed at startup");
                    index.replace(&url, tools);
                }
                Err(e) => {
                    tracing::warn!(%url, "startup indexing failed: {e}");
                }
            }
        }
    });
}

async fn health() -> &'static str {
    "ok"
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let params = ConnectionParams {
        heartbeat_interval: state.config.heartbeat_interval,
        idle_timeout: state.config.idle_timeout,
        hub: state.hub.clone(),
        router: state.router.clone(),
    };
    ws.on_upgrade(move |socket| run_connection(socket, params))
}

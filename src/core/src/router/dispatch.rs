use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use cbus_protocol::{
    decode_client_message, CallSource, ClientMessage, EngramMessage, EngramMeta, Inbound, Role,
    RpcCall, RpcResponse, ServerMessage, StoreOp, StoreOptions, TapConfig,
};

use crate::backend::ToolBackend;
use crate::index::ToolIndex;
use crate::outbound::OutboundMessage;
use crate::pipeline::{ToolCall, ToolPipeline};
use crate::routing::RoutingTable;
use crate::settings::Settings;
use crate::storage::{message_id, EngramStore};

/// Single entry point for inbound client messages.
///
/// Structured JSON-RPC calls are proxied to the backend and answered
/// directly; everything else dispatches by its `type` tag. Tool
/// invocations are spawned so one connection's chain never blocks its
/// other requests.
pub struct MessageRouter {
    store: Arc<dyn EngramStore>,
    routing: Arc<RoutingTable>,
    settings: Arc<Settings>,
    index: Arc<ToolIndex>,
    backend: Arc<dyn ToolBackend>,
    pipeline: Arc<ToolPipeline>,
}

#[derive(Debug, Deserialize)]
struct StoreData {
    #[serde(default)]
    meta: Option<EngramMeta>,
    #[serde(default)]
    messages: Vec<EngramMessage>,
}

#[derive(Debug, Deserialize)]
struct AppendData {
    message: EngramMessage,
}

impl MessageRouter {
    pub fn new(
        store: Arc<dyn EngramStore>,
        routing: Arc<RoutingTable>,
        settings: Arc<Settings>,
        index: Arc<ToolIndex>,
        backend: Arc<dyn ToolBackend>,
        pipeline: Arc<ToolPipeline>,
    ) -> Self {
        Self {
            store,
            routing,
            settings,
            index,
            backend,
            pipeline,
        }
    }

    /// Handle one inbound text frame from a connection.
    pub async fn handle_text(&self, conn_id: Uuid, text: &str) {
        match decode_client_message(text) {
            Ok(Inbound::Rpc(call)) => self.proxy_rpc(conn_id, call).await,
            Ok(Inbound::Envelope(msg)) => self.dispatch(conn_id, msg).await,
            Err(error) => {
                tracing::warn!(%conn_id, %error, "undecodable client message dropped");
            }
        }
    }

    /// Backend-proxy path: true request/response, answered only to the
    /// sender.
    async fn proxy_rpc(&self, conn_id: Uuid, call: RpcCall) {
        let call_id = call.id.clone();
        let method = call.method.clone();
        let text = match self.backend.proxy(call).await {
            Ok(body) => serde_json::to_string(&body).ok(),
            Err(error) => {
                tracing::warn!(%conn_id, %method, %error, "backend proxy call failed");
                serde_json::to_string(&RpcResponse::error(call_id, -32000, error.to_string())).ok()
            }
        };
        if let Some(text) = text {
            self.routing.hub().send_to(conn_id, OutboundMessage::raw(text));
        }
    }

    async fn dispatch(&self, conn_id: Uuid, msg: ClientMessage) {
        match msg {
            ClientMessage::CbusSendMessage {
                text,
                role,
                engram_id,
            } => self.ingest_message(conn_id, text, role, engram_id),
            ClientMessage::CallTool {
                engram_id,
                request_id,
                url,
                tool_name,
                args,
                tap_config,
            } => self.call_tool(conn_id, engram_id, request_id, url, tool_name, args, tap_config),
            ClientMessage::SetTapConfig { tap_config } => {
                tracing::info!(
                    tool = tap_config.as_ref().map(|t| t.tool_name.as_str()),
                    "tap config replaced"
                );
                self.settings.set_tap(tap_config);
            }
            ClientMessage::UpdateMemory { imprints } => {
                tracing::info!(count = imprints.len(), "memory imprints replaced");
                self.settings.set_imprints(imprints);
            }
            ClientMessage::InitMcpServersIndex { servers } => {
                for url in servers {
                    self.index_server(&url).await;
                }
            }
            ClientMessage::ListTools { url } => {
                let url = url.or_else(|| self.backend.default_url());
                match url {
                    Some(url) => self.index_server(&url).await,
                    None => tracing::warn!("list_tools without a url and no default server"),
                }
            }
            ClientMessage::CbusSubscribe { engram_id } => {
                self.subscribe(conn_id, engram_id);
            }
            ClientMessage::CbusStore {
                op,
                engram_id,
                data,
                options,
            } => {
                let reply = match self.store_op(op, engram_id.as_deref(), data, options) {
                    Ok(result) => ServerMessage::CbusStoreResult {
                        op,
                        engram_id,
                        result: Some(result),
                        error: None,
                    },
                    Err(error) => {
                        tracing::error!(?op, %error, "store operation failed");
                        ServerMessage::CbusStoreResult {
                            op,
                            engram_id,
                            result: None,
                            error: Some(error),
                        }
                    }
                };
                self.routing.hub().send_to(conn_id, OutboundMessage::push(reply));
            }
        }
    }

    /// Ingest a conversation message, then run the tap when configured.
    fn ingest_message(
        &self,
        conn_id: Uuid,
        text: String,
        role: Option<Role>,
        engram_id: Option<String>,
    ) {
        if let Some(id) = engram_id.as_deref() {
            self.routing.bind(id, conn_id);
        }
        let message = EngramMessage {
            id: message_id(),
            engram_id: engram_id.clone().unwrap_or_default(),
            role: role.unwrap_or(Role::User),
            text,
            timestamp: Utc::now().to_rfc3339(),
        };
        if engram_id.is_some() {
            if let Err(error) = self.store.ingest(&message) {
                tracing::error!(engram_id = %message.engram_id, %error, "message ingest failed");
                return;
            }
        }
        self.routing
            .hub()
            .broadcast(OutboundMessage::push(ServerMessage::CbusMessage { message }));

        let snapshot = self.settings.snapshot();
        if let Some(tap) = snapshot.tap {
            let call = ToolCall {
                source: CallSource::Tap,
                tap,
                engram_id,
                request_id: None,
                origin: Some(conn_id),
                history: None,
                imprints: snapshot.imprints,
            };
            self.spawn_pipeline(call);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn call_tool(
        &self,
        conn_id: Uuid,
        engram_id: Option<String>,
        request_id: Option<String>,
        url: String,
        tool_name: String,
        args: serde_json::Map<String, Value>,
        tap_config: Option<TapConfig>,
    ) {
        if let Some(id) = engram_id.as_deref() {
            self.routing.bind(id, conn_id);
        }
        let tap = tap_config.unwrap_or(TapConfig {
            server_url: url,
            tool_name,
            connected_string_arg: None,
            connected_array_arg: None,
            args,
        });
        let snapshot = self.settings.snapshot();
        let call = ToolCall {
            source: CallSource::Console,
            tap,
            engram_id,
            request_id,
            origin: Some(conn_id),
            history: None,
            imprints: snapshot.imprints,
        };
        self.spawn_pipeline(call);
    }

    fn spawn_pipeline(&self, call: ToolCall) {
        let pipeline = self.pipeline.clone();
        tokio::spawn(async move {
            pipeline.run(call).await;
        });
    }

    /// Fetch one server's tools, merge into the index, announce the list.
    async fn index_server(&self, url: &str) {
        match self.backend.list_tools(url).await {
            Ok(tools) => {
                tracing::info!(%url, count = tools.len(), "tool server indexed");
                self.index.replace(url, tools.clone());
                self.routing
                    .hub()
                    .broadcast(OutboundMessage::push(ServerMessage::ToolsList {
                        tools,
                        url: url.to_string(),
                    }));
            }
            Err(error) => {
                tracing::warn!(%url, %error, "tool server indexing failed");
            }
        }
    }

    fn subscribe(&self, conn_id: Uuid, engram_id: Option<String>) {
        if let Some(id) = engram_id.as_deref() {
            self.routing.bind(id, conn_id);
        }
        let queue = match self.store.load(engram_id.as_deref()) {
            Ok(messages) => messages,
            Err(error) => {
                tracing::error!(?engram_id, %error, "subscribe load failed");
                Vec::new()
            }
        };
        self.routing
            .hub()
            .send_to(conn_id, OutboundMessage::push(ServerMessage::CbusQueue { queue }));
    }

    fn store_op(
        &self,
        op: StoreOp,
        engram_id: Option<&str>,
        data: Option<Value>,
        options: Option<StoreOptions>,
    ) -> Result<Value, String> {
        match op {
            StoreOp::Init => {
                self.store.init().map_err(|e| e.to_string())?;
                Ok(json!({ "status": "initialized" }))
            }
            StoreOp::Store => {
                let id = engram_id.ok_or("store requires an engramId")?;
                let data: StoreData = parse_data(data)?;
                let meta = data.meta.unwrap_or_else(|| EngramMeta {
                    engram_id: id.to_string(),
                    created_at: Utc::now().to_rfc3339(),
                    meta: serde_json::Map::new(),
                });
                self.store
                    .store(id, &meta, &data.messages)
                    .map_err(|e| e.to_string())?;
                Ok(json!({ "status": "stored" }))
            }
            StoreOp::Append => {
                let id = engram_id.ok_or("append requires an engramId")?;
                let data: AppendData = parse_data(data)?;
                self.store
                    .append(id, &data.message)
                    .map_err(|e| e.to_string())?;
                Ok(json!({ "status": "appended" }))
            }
            StoreOp::Load => {
                let messages = self.store.load(engram_id).map_err(|e| e.to_string())?;
                Ok(json!({ "engramId": engram_id, "messages": messages }))
            }
            StoreOp::List => {
                let metas = self.store.list().map_err(|e| e.to_string())?;
                Ok(json!(metas))
            }
            StoreOp::Delete => {
                let id = engram_id.ok_or("delete requires an engramId")?;
                self.store.delete(id).map_err(|e| e.to_string())?;
                Ok(json!({ "status": "deleted" }))
            }
            StoreOp::Prune => {
                let id = engram_id.ok_or("prune requires an engramId")?;
                let keep = options.and_then(|o| o.keep_last_n);
                let removed = match self.store.prune(id, keep) {
                    Ok(removed) => removed,
                    Err(error) => {
                        tracing::warn!(engram_id = id, %error, "prune failed, reporting 0 removed");
                        0
                    }
                };
                Ok(json!({ "status": "pruned", "removed": removed }))
            }
        }
    }
}

fn parse_data<T: serde::de::DeserializeOwned>(data: Option<Value>) -> Result<T, String> {
    let data = data.ok_or("missing data payload")?;
    serde_json::from_value(data).map_err(|e| format!("invalid data payload: {e}"))
}

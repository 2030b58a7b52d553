use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use uuid::Uuid;

use cbus_protocol::{CallSource, EngramMessage, MemoryImprint, Role, ServerMessage, TapConfig};

use crate::backend::ToolBackend;
use crate::breaker::CircuitBreaker;
use crate::index::ToolIndex;
use crate::outbound::OutboundMessage;
use crate::routing::RoutingTable;
use crate::storage::{message_id, EngramStore};

use super::args::{assemble_args, inject_memory};
use super::extract::{embedded_calls, response_text};

/// Error text delivered when the circuit breaker rejects a call, kept
/// distinct from backend failures so callers can tell throttling apart.
pub const TOO_MANY_CALLS: &str = "too many calls: circuit breaker engaged for this conversation";

/// One unit of pipeline work: a tool invocation attempt.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub source: CallSource,
    pub tap: TapConfig,
    pub engram_id: Option<String>,
    pub request_id: Option<String>,
    /// Connection that triggered the chain, used when the routing table
    /// cannot direct delivery.
    pub origin: Option<Uuid>,
    /// History override; fetched fresh from the store when absent.
    pub history: Option<Vec<EngramMessage>>,
    pub imprints: Vec<MemoryImprint>,
}

/// Orchestrates tool invocation: argument assembly, rate admission,
/// backend call, result fan-out, side-channel persistence, and
/// recursive dispatch of calls embedded in tool output.
pub struct ToolPipeline {
    store: Arc<dyn EngramStore>,
    routing: Arc<RoutingTable>,
    breaker: Arc<CircuitBreaker>,
    backend: Arc<dyn ToolBackend>,
    index: Arc<ToolIndex>,
}

impl ToolPipeline {
    pub fn new(
        store: Arc<dyn EngramStore>,
        routing: Arc<RoutingTable>,
        breaker: Arc<CircuitBreaker>,
        backend: Arc<dyn ToolBackend>,
        index: Arc<ToolIndex>,
    ) -> Self {
        Self {
            store,
            routing,
            breaker,
            backend,
            index,
        }
    }

    /// Run a call and, depth-first, every follow-up extracted from tool
    /// output. An explicit queue replaces unbounded recursion: children
    /// go to the front in discovery order, so each call's chain
    /// completes before its siblings and the call stack stays flat. The
    /// breaker is consulted per dequeued call.
    pub async fn run(&self, call: ToolCall) {
        let mut queue = VecDeque::new();
        queue.push_back(call);
        while let Some(next) = queue.pop_front() {
            let children = self.step(next).await;
            for child in children.into_iter().rev() {
                queue.push_front(child);
            }
        }
    }

    async fn step(&self, call: ToolCall) -> Vec<ToolCall> {
        match self.invoke(&call).await {
            Ok(text) => {
                self.deliver_result(&call, Some(&text), None);
                if matches!(call.source, CallSource::Tap | CallSource::Extracted) {
                    self.persist_tool_message(&call, &text);
                }
                self.extract_followups(&call, &text)
            }
            Err(error) => {
                tracing::warn!(
                    tool = %call.tap.tool_name,
                    source = call.source.as_str(),
                    %error,
                    "tool invocation failed"
                );
                self.deliver_result(&call, None, Some(&error));
                Vec::new()
            }
        }
    }

    async fn invoke(&self, call: &ToolCall) -> Result<String, String> {
        let args = self.assemble(call).await?;
        if !self.breaker.admit(call.engram_id.as_deref()) {
            return Err(TOO_MANY_CALLS.to_string());
        }
        tracing::debug!(
            tool = %call.tap.tool_name,
            server = %call.tap.server_url,
            source = call.source.as_str(),
            "invoking tool"
        );
        match self
            .backend
            .invoke(&call.tap.server_url, &call.tap.tool_name, args)
            .await
        {
            Ok(payload) => Ok(response_text(&payload)),
            Err(err) => Err(err.to_string()),
        }
    }

    async fn assemble(&self, call: &ToolCall) -> Result<Map<String, Value>, String> {
        if call.tap.connected_string_arg.is_none() {
            return Ok(call.tap.args.clone());
        }
        let history = match &call.history {
            Some(history) => history.clone(),
            None => self
                .store
                .load(call.engram_id.as_deref())
                .map_err(|e| format!("history load failed: {e}"))?,
        };
        let history = inject_memory(
            history,
            &call.imprints,
            &self.index.summary(),
            call.engram_id.as_deref(),
        );
        Ok(assemble_args(&call.tap, &history))
    }

    /// Result fan-out: conversation-and-correlation ⇒ routed delivery,
    /// else the originating connection, else broadcast.
    fn deliver_result(&self, call: &ToolCall, result: Option<&str>, error: Option<&str>) {
        let msg = OutboundMessage::push(ServerMessage::ToolResult {
            source: call.source,
            engram_id: call.engram_id.clone(),
            request_id: call.request_id.clone(),
            result: result.map(str::to_string),
            error: error.map(str::to_string),
        });
        if call.engram_id.is_some() && call.request_id.is_some() {
            self.routing.deliver(call.engram_id.as_deref(), msg);
        } else if let Some(origin) = call.origin {
            if !self.routing.hub().send_to(origin, msg.clone()) {
                self.routing.hub().broadcast(msg);
            }
        } else {
            self.routing.hub().broadcast(msg);
        }
    }

    fn persist_tool_message(&self, call: &ToolCall, text: &str) {
        let Some(engram_id) = call.engram_id.as_deref() else {
            return;
        };
        let message = EngramMessage {
            id: message_id(),
            engram_id: engram_id.to_string(),
            role: Role::Tool,
            text: text.to_string(),
            timestamp: Utc::now().to_rfc3339(),
        };
        if let Err(error) = self.store.ingest(&message) {
            tracing::error!(engram_id, %error, "failed to persist tool message");
            return;
        }
        self.routing.deliver(
            Some(engram_id),
            OutboundMessage::push(ServerMessage::CbusMessage { message }),
        );
    }

    /// Scan tool output for embedded structured calls and turn each
    /// resolvable one into a child invocation. A call naming the tool
    /// that produced this output is dropped (immediate self-loop);
    /// unknown methods and malformed blocks are logged and skipped.
    fn extract_followups(&self, call: &ToolCall, text: &str) -> Vec<ToolCall> {
        let mut children = Vec::new();
        for rpc in embedded_calls(text) {
            if rpc.method == call.tap.tool_name {
                tracing::debug!(method = %rpc.method, "self-loop call skipped");
                continue;
            }
            let Some((server_url, tool)) = self.index.lookup(&rpc.method) else {
                tracing::debug!(method = %rpc.method, "embedded call names no known tool, skipped");
                continue;
            };
            let mut tap = TapConfig::direct(server_url, tool.name);
            if let Some(params) = rpc.params.as_ref().and_then(Value::as_object) {
                tap.args = params.clone();
            }
            children.push(ToolCall {
                source: CallSource::Extracted,
                tap,
                engram_id: call.engram_id.clone(),
                request_id: None,
                origin: call.origin,
                history: None,
                imprints: call.imprints.clone(),
            });
        }
        if !children.is_empty() {
            self.notify_queue(call, &children);
        }
        children
    }

    fn notify_queue(&self, call: &ToolCall, children: &[ToolCall]) {
        let engram_id = call.engram_id.clone().unwrap_or_default();
        let queue: Vec<EngramMessage> = children
            .iter()
            .map(|child| EngramMessage {
                id: message_id(),
                engram_id: engram_id.clone(),
                role: Role::Tool,
                text: child.tap.tool_name.clone(),
                timestamp: Utc::now().to_rfc3339(),
            })
            .collect();
        self.routing.deliver(
            call.engram_id.as_deref(),
            OutboundMessage::push(ServerMessage::CbusQueue { queue }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;

    use cbus_protocol::ToolDescriptor;

    use crate::backend::{BackendError, BoxFuture};
    use crate::routing::ClientHub;
    use crate::storage::SqliteEngramStore;

    /// Backend stub: canned result payload per tool name, call recorder.
    struct ScriptedBackend {
        responses: HashMap<String, Value>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        fn new(responses: HashMap<String, Value>) -> Self {
            Self {
                responses,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ToolBackend for ScriptedBackend {
        fn invoke(
            &self,
            _server_url: &str,
            tool_name: &str,
            _args: Map<String, Value>,
        ) -> BoxFuture<'_, Result<Value, BackendError>> {
            self.calls.lock().unwrap().push(tool_name.to_string());
            let response = self.responses.get(tool_name).cloned();
            Box::pin(async move {
                match response {
                    Some(payload) => Ok(payload),
                    None => Err(BackendError::Rpc {
                        code: -32601,
                        message: "no such tool".into(),
                    }),
                }
            })
        }

        fn list_tools(
            &self,
            _server_url: &str,
        ) -> BoxFuture<'_, Result<Vec<ToolDescriptor>, BackendError>> {
            Box::pin(async { Ok(Vec::new()) })
        }

        fn proxy(&self, _call: cbus_protocol::RpcCall) -> BoxFuture<'_, Result<Value, BackendError>> {
            Box::pin(async { Ok(json!({"jsonrpc": "2.0", "result": {}})) })
        }
    }

    struct Fixture {
        pipeline: ToolPipeline,
        store: Arc<SqliteEngramStore>,
        backend: Arc<ScriptedBackend>,
        rx: mpsc::Receiver<OutboundMessage>,
        conn_id: Uuid,
    }

    fn text_payload(text: &str) -> Value {
        json!({ "result": { "content": [{ "type": "text", "text": text }] } })
    }

    fn fixture(responses: HashMap<String, Value>, breaker_cap: usize) -> Fixture {
        let store = Arc::new(SqliteEngramStore::open_memory().unwrap());
        let hub = Arc::new(ClientHub::new());
        let (tx, rx) = mpsc::channel(64);
        let conn_id = Uuid::new_v4();
        hub.register(conn_id, tx);

        let routing = Arc::new(RoutingTable::new(hub));
        let breaker = Arc::new(CircuitBreaker::new(Duration::from_secs(10), breaker_cap));
        let backend = Arc::new(ScriptedBackend::new(responses));
        let index = Arc::new(ToolIndex::new());
        index.replace(
            "http://tools",
            vec![
                ToolDescriptor {
                    name: "echo".into(),
                    description: None,
                    input_schema: None,
                },
                ToolDescriptor {
                    name: "search".into(),
                    description: None,
                    input_schema: None,
                },
            ],
        );

        let pipeline = ToolPipeline::new(
            store.clone(),
            routing,
            breaker,
            backend.clone(),
            index,
        );
        Fixture {
            pipeline,
            store,
            backend,
            rx,
            conn_id,
        }
    }

    fn tap_call(source: CallSource, engram_id: Option<&str>, origin: Option<Uuid>) -> ToolCall {
        ToolCall {
            source,
            tap: TapConfig::direct("http://tools", "echo"),
            engram_id: engram_id.map(str::to_string),
            request_id: None,
            origin,
            history: None,
            imprints: Vec::new(),
        }
    }

    fn drain(rx: &mut mpsc::Receiver<OutboundMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let OutboundMessage::Push(push) = msg {
                out.push(push);
            }
        }
        out
    }

    #[tokio::test]
    async fn tap_call_persists_tool_message_and_delivers_result() {
        let responses = HashMap::from([("echo".to_string(), text_payload("tool says hi"))]);
        let mut fx = fixture(responses, 3);

        fx.pipeline
            .run(tap_call(CallSource::Tap, Some("c1"), Some(fx.conn_id)))
            .await;

        let persisted = fx.store.load(Some("c1")).unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].role, Role::Tool);
        assert_eq!(persisted[0].text, "tool says hi");

        let pushed = drain(&mut fx.rx);
        assert!(pushed.iter().any(|m| matches!(
            m,
            ServerMessage::ToolResult { result: Some(r), error: None, .. } if r == "tool says hi"
        )));
        assert!(pushed
            .iter()
            .any(|m| matches!(m, ServerMessage::CbusMessage { .. })));
    }

    #[tokio::test]
    async fn console_call_does_not_persist() {
        let responses = HashMap::from([("echo".to_string(), text_payload("ok"))]);
        let mut fx = fixture(responses, 3);

        fx.pipeline
            .run(tap_call(CallSource::Console, Some("c1"), Some(fx.conn_id)))
            .await;

        assert!(fx.store.load(Some("c1")).unwrap().is_empty());
        let pushed = drain(&mut fx.rx);
        assert!(pushed
            .iter()
            .any(|m| matches!(m, ServerMessage::ToolResult { .. })));
        assert!(!pushed
            .iter()
            .any(|m| matches!(m, ServerMessage::CbusMessage { .. })));
    }

    #[tokio::test]
    async fn embedded_call_is_dispatched_recursively() {
        let followup = "search results:\n```json\n{\"jsonrpc\":\"2.0\",\"method\":\"search\",\"params\":{\"q\":\"x\"}}\n```";
        let responses = HashMap::from([
            ("echo".to_string(), text_payload(followup)),
            ("search".to_string(), text_payload("found it")),
        ]);
        let mut fx = fixture(responses, 5);

        fx.pipeline
            .run(tap_call(CallSource::Tap, Some("c1"), Some(fx.conn_id)))
            .await;

        assert_eq!(fx.backend.calls(), ["echo", "search"]);

        // Both the parent and the extracted child persisted tool messages.
        let persisted = fx.store.load(Some("c1")).unwrap();
        assert_eq!(persisted.len(), 2);
        assert_eq!(persisted[1].text, "found it");

        let pushed = drain(&mut fx.rx);
        assert!(pushed.iter().any(|m| matches!(
            m,
            ServerMessage::CbusQueue { queue } if queue.len() == 1 && queue[0].text == "search"
        )));
        assert!(pushed.iter().any(|m| matches!(
            m,
            ServerMessage::ToolResult { source: CallSource::Extracted, .. }
        )));
    }

    #[tokio::test]
    async fn self_loop_call_is_never_dispatched() {
        let loopback = "again:\n```json\n{\"jsonrpc\":\"2.0\",\"method\":\"echo\",\"params\":{}}\n```";
        let responses = HashMap::from([("echo".to_string(), text_payload(loopback))]);
        let fx = fixture(responses, 5);

        fx.pipeline
            .run(tap_call(CallSource::Tap, Some("c1"), Some(fx.conn_id)))
            .await;

        assert_eq!(fx.backend.calls(), ["echo"]);
    }

    #[tokio::test]
    async fn unknown_embedded_method_is_skipped() {
        let unknown = "```json\n{\"jsonrpc\":\"2.0\",\"method\":\"not_indexed\",\"params\":{}}\n```";
        let responses = HashMap::from([("echo".to_string(), text_payload(unknown))]);
        let fx = fixture(responses, 5);

        fx.pipeline
            .run(tap_call(CallSource::Tap, Some("c1"), Some(fx.conn_id)))
            .await;

        assert_eq!(fx.backend.calls(), ["echo"]);
    }

    #[tokio::test]
    async fn breaker_cuts_runaway_chains_with_distinct_error() {
        // echo and search keep calling each other; cap of 2 stops the
        // third invocation before it reaches the backend.
        let call_search = "```json\n{\"jsonrpc\":\"2.0\",\"method\":\"search\",\"params\":{}}\n```";
        let call_echo = "```json\n{\"jsonrpc\":\"2.0\",\"method\":\"echo\",\"params\":{}}\n```";
        let responses = HashMap::from([
            ("echo".to_string(), text_payload(call_search)),
            ("search".to_string(), text_payload(call_echo)),
        ]);
        let mut fx = fixture(responses, 2);

        fx.pipeline
            .run(tap_call(CallSource::Tap, Some("c1"), Some(fx.conn_id)))
            .await;

        assert_eq!(fx.backend.calls().len(), 2);
        let pushed = drain(&mut fx.rx);
        assert!(pushed.iter().any(|m| matches!(
            m,
            ServerMessage::ToolResult { error: Some(e), .. } if e == TOO_MANY_CALLS
        )));
    }

    #[tokio::test]
    async fn backend_failure_is_delivered_not_thrown() {
        let mut fx = fixture(HashMap::new(), 3);

        fx.pipeline
            .run(tap_call(CallSource::Console, Some("c1"), Some(fx.conn_id)))
            .await;

        let pushed = drain(&mut fx.rx);
        assert!(pushed.iter().any(|m| matches!(
            m,
            ServerMessage::ToolResult { result: None, error: Some(e), .. } if e.contains("no such tool")
        )));
    }

    #[tokio::test]
    async fn unkeyed_calls_admit_and_broadcast() {
        let responses = HashMap::from([("echo".to_string(), text_payload("ok"))]);
        let mut fx = fixture(responses, 3);

        fx.pipeline.run(tap_call(CallSource::Console, None, None)).await;

        let pushed = drain(&mut fx.rx);
        assert!(pushed.iter().any(|m| matches!(
            m,
            ServerMessage::ToolResult { engram_id: None, result: Some(_), .. }
        )));
    }
}

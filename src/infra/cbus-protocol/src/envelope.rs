use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::engram::{EngramMessage, Role};
use crate::rpc::{is_rpc_shaped, RpcCall};
use crate::{MemoryImprint, ProtocolError, TapConfig, ToolDescriptor};

/// Origin of a tool invocation, carried on `tool_result` envelopes so
/// clients can tell explicit calls from autonomous ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallSource {
    /// Explicit `call_tool` request from a client.
    Console,
    /// Automatic invocation triggered by message ingestion.
    Tap,
    /// Follow-up call discovered inside a tool's own output.
    Extracted,
}

impl CallSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Console => "console",
            Self::Tap => "tap",
            Self::Extracted => "extracted",
        }
    }
}

/// Conversation-store operation names for the store-ops proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreOp {
    Init,
    Store,
    Append,
    Load,
    List,
    Delete,
    Prune,
}

/// Options accepted by store ops that take them (currently `prune`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_last_n: Option<usize>,
}

/// Client → coordinator envelope, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Ingest a conversation message; runs the tap when one is configured.
    CbusSendMessage {
        text: String,
        #[serde(default)]
        role: Option<Role>,
        #[serde(default)]
        engram_id: Option<String>,
    },
    /// Explicit tool invocation.
    CallTool {
        #[serde(default)]
        engram_id: Option<String>,
        #[serde(default)]
        request_id: Option<String>,
        url: String,
        tool_name: String,
        #[serde(default)]
        args: Map<String, Value>,
        #[serde(default)]
        tap_config: Option<TapConfig>,
    },
    /// Replace the coordinator tap configuration (null clears it).
    SetTapConfig {
        #[serde(default)]
        tap_config: Option<TapConfig>,
    },
    /// Replace the memory imprint list.
    UpdateMemory { imprints: Vec<MemoryImprint> },
    /// Fetch and index the tool lists of the given servers.
    InitMcpServersIndex { servers: Vec<String> },
    /// Fetch and index one server's tool list.
    ListTools {
        #[serde(default)]
        url: Option<String>,
    },
    /// Bind this connection to an engram and return its persisted log.
    CbusSubscribe {
        #[serde(default)]
        engram_id: Option<String>,
    },
    /// Conversation-store operation proxy.
    CbusStore {
        op: StoreOp,
        #[serde(default)]
        engram_id: Option<String>,
        #[serde(default)]
        data: Option<Value>,
        #[serde(default)]
        options: Option<StoreOptions>,
    },
}

/// Coordinator → client push envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Outcome of a tool invocation.
    ToolResult {
        source: CallSource,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        engram_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Conversation update: a newly persisted or ingested message.
    CbusMessage { message: EngramMessage },
    /// Tool list for a server, after indexing.
    ToolsList {
        tools: Vec<ToolDescriptor>,
        url: String,
    },
    /// A conversation's message queue (subscribe reply, or pending
    /// extracted calls rendered as messages).
    CbusQueue { queue: Vec<EngramMessage> },
    /// Store-ops proxy reply, addressed to the requester.
    CbusStoreResult {
        op: StoreOp,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        engram_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// A decoded inbound client frame.
///
/// Structured JSON-RPC calls take a dedicated request/response proxy
/// path; everything else is a fire-and-forget envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Rpc(RpcCall),
    Envelope(ClientMessage),
}

/// Decode an inbound text frame, classifying by shape.
pub fn decode_client_message(text: &str) -> Result<Inbound, ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    if is_rpc_shaped(&value) {
        let call: RpcCall = serde_json::from_value(value)?;
        return Ok(Inbound::Rpc(call));
    }
    if value.get("type").is_none() {
        return Err(ProtocolError::MissingTypeTag);
    }
    let envelope: ClientMessage = serde_json::from_value(value)?;
    Ok(Inbound::Envelope(envelope))
}

/// Encode a push envelope to a JSON string for a text frame.
pub fn encode_server_message(msg: &ServerMessage) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(msg)?)
}

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ProtocolError;

pub const JSONRPC_VERSION: &str = "2.0";

/// A structured JSON-RPC call.
///
/// Arrives two ways: as a raw client message on the backend-proxy path,
/// and embedded inside fenced code blocks of tool output, where it is
/// re-dispatched as a follow-up invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcCall {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

/// JSON-RPC response returned on the proxy path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcCall {
    /// Parse a call from JSON text.
    ///
    /// Tool output sometimes carries calls with once-escaped quoting
    /// (`{\"jsonrpc\": ...}`); when the direct parse fails, a single
    /// unescape pass is attempted before giving up.
    pub fn parse_lenient(text: &str) -> Result<Self, ProtocolError> {
        match serde_json::from_str::<Self>(text) {
            Ok(call) => call.validate(),
            Err(first_err) => {
                let unescaped = text.replace("\\\"", "\"");
                match serde_json::from_str::<Self>(&unescaped) {
                    Ok(call) => call.validate(),
                    Err(_) => Err(ProtocolError::Json(first_err)),
                }
            }
        }
    }

    fn validate(self) -> Result<Self, ProtocolError> {
        if self.jsonrpc != JSONRPC_VERSION {
            return Err(ProtocolError::UnsupportedRpcVersion(self.jsonrpc));
        }
        Ok(self)
    }
}

impl RpcResponse {
    pub fn result(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<Value>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// Whether a decoded JSON value looks like a structured call (carries
/// the protocol-version tag).
pub(crate) fn is_rpc_shaped(value: &Value) -> bool {
    value.get("jsonrpc").is_some()
}

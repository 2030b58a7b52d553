use serde_json::{json, Map, Value};
use url::Url;
use uuid::Uuid;

use cbus_protocol::{RpcCall, ToolDescriptor, JSONRPC_VERSION};

use super::{BackendError, BoxFuture, ToolBackend};

/// JSON-RPC-over-HTTP tool backend.
///
/// Speaks `tools/call` and `tools/list` to MCP-style servers. One
/// reqwest client is shared across all invocations.
#[derive(Debug)]
pub struct HttpToolBackend {
    client: reqwest::Client,
    default_url: Option<Url>,
}

impl HttpToolBackend {
    pub fn new(default_url: Option<&str>) -> Result<Self, BackendError> {
        let default_url = match default_url {
            Some(raw) => Some(parse_server_url(raw)?),
            None => None,
        };
        Ok(Self {
            client: reqwest::Client::new(),
            default_url,
        })
    }

    async fn post_rpc(&self, url: Url, call: &RpcCall) -> Result<Value, BackendError> {
        let resp = self.client.post(url).json(call).send().await?;
        let raw = resp.text().await?;
        let body: Value = match serde_json::from_str(&raw) {
            Ok(body) => body,
            Err(e) => {
                // A non-JSON body still flows through as text rather
                // than failing the invocation on a parse error.
                tracing::debug!("non-json backend response treated as text: {e}");
                return Ok(json!({ "text": raw }));
            }
        };
        check_rpc_error(&body)?;
        Ok(body)
    }
}

fn parse_server_url(raw: &str) -> Result<Url, BackendError> {
    Url::parse(raw).map_err(|e| BackendError::Unavailable(format!("invalid server url {raw}: {e}")))
}

/// Surface a JSON-RPC `error` member as a typed failure.
fn check_rpc_error(body: &Value) -> Result<(), BackendError> {
    let Some(err) = body.get("error") else {
        return Ok(());
    };
    if err.is_null() {
        return Ok(());
    }
    let code = err.get("code").and_then(Value::as_i64).unwrap_or(-32000);
    let message = err
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown backend error")
        .to_string();
    Err(BackendError::Rpc { code, message })
}

fn parse_tool_list(body: &Value) -> Result<Vec<ToolDescriptor>, BackendError> {
    let tools = body
        .get("result")
        .and_then(|r| r.get("tools"))
        .ok_or_else(|| BackendError::Malformed("tools/list response without result.tools".into()))?;
    serde_json::from_value(tools.clone())
        .map_err(|e| BackendError::Malformed(format!("tools/list payload: {e}")))
}

fn rpc_request(method: &str, params: Value) -> RpcCall {
    RpcCall {
        jsonrpc: JSONRPC_VERSION.into(),
        method: method.into(),
        params: Some(params),
        id: Some(json!(Uuid::new_v4().to_string())),
    }
}

impl ToolBackend for HttpToolBackend {
    fn invoke(
        &self,
        server_url: &str,
        tool_name: &str,
        args: Map<String, Value>,
    ) -> BoxFuture<'_, Result<Value, BackendError>> {
        let server_url = server_url.to_string();
        let tool_name = tool_name.to_string();
        Box::pin(async move {
            let url = parse_server_url(&server_url)?;
            let call = rpc_request(
                "tools/call",
                json!({ "name": tool_name, "arguments": Value::Object(args) }),
            );
            self.post_rpc(url, &call).await
        })
    }

    fn list_tools(&self, server_url: &str) -> BoxFuture<'_, Result<Vec<ToolDescriptor>, BackendError>> {
        let server_url = server_url.to_string();
        Box::pin(async move {
            let url = parse_server_url(&server_url)?;
            let call = rpc_request("tools/list", json!({}));
            let body = self.post_rpc(url, &call).await?;
            parse_tool_list(&body)
        })
    }

    fn proxy(&self, call: RpcCall) -> BoxFuture<'_, Result<Value, BackendError>> {
        Box::pin(async move {
            let url = self
                .default_url
                .clone()
                .ok_or_else(|| BackendError::Unavailable("no backend server configured".into()))?;
            self.post_rpc(url, &call).await
        })
    }

    fn default_url(&self) -> Option<String> {
        self.default_url.as_ref().map(|u| u.to_string())
    }
}

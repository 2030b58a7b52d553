use serde_json::Value;

use cbus_protocol::RpcCall;

/// Marker returned when a response payload carries no recognizable text.
pub const NO_CONTENT: &str = "no content";

/// Flatten a backend result payload to text.
///
/// The known shapes are tried in order: `result.content[]`,
/// `content[]`, the payload itself as an array of `{text}` objects,
/// a bare `text` field, then the no-content marker.
pub fn response_text(payload: &Value) -> String {
    if let Some(content) = payload
        .get("result")
        .and_then(|r| r.get("content"))
        .and_then(Value::as_array)
    {
        return join_text(content);
    }
    if let Some(content) = payload.get("content").and_then(Value::as_array) {
        return join_text(content);
    }
    if let Some(items) = payload.as_array() {
        if items.iter().any(|item| item.get("text").is_some()) {
            return join_text(items);
        }
    }
    if let Some(text) = payload.get("text").and_then(Value::as_str) {
        return text.to_string();
    }
    NO_CONTENT.to_string()
}

fn join_text(items: &[Value]) -> String {
    items
        .iter()
        .filter_map(|item| item.get("text").and_then(Value::as_str))
        .collect()
}

/// Contents of every fenced code block in `text`, language tags
/// stripped. An unterminated trailing fence still yields its content.
pub fn fenced_blocks(text: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut segments = text.split("```");
    segments.next(); // text before the first fence
    while let Some(block) = segments.next() {
        let body = strip_fence_tag(block).trim();
        if !body.is_empty() {
            blocks.push(body.to_string());
        }
        if segments.next().is_none() {
            break;
        }
    }
    blocks
}

fn strip_fence_tag(block: &str) -> &str {
    match block.split_once('\n') {
        Some((first, rest)) if !first.trim().is_empty() && !first.contains('{') => rest,
        _ => block,
    }
}

/// Structured calls embedded in tool output: every fenced block that
/// parses as a JSON-RPC call. Unparseable blocks are skipped.
pub fn embedded_calls(text: &str) -> Vec<RpcCall> {
    let mut calls = Vec::new();
    for block in fenced_blocks(text) {
        match RpcCall::parse_lenient(&block) {
            Ok(call) => calls.push(call),
            Err(err) => {
                tracing::debug!(error = %err, "fenced block is not a structured call, skipped");
            }
        }
    }
    calls
}

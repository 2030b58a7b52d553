use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Tap configuration: the tool invoked automatically when a new user
/// message is ingested, plus how conversation history maps onto its
/// arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TapConfig {
    pub server_url: String,
    pub tool_name: String,
    /// Argument receiving the latest message text (optionally through a
    /// template in `args`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_string_arg: Option<String>,
    /// Argument receiving the remaining history as a list of texts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_array_arg: Option<String>,
    /// Static argument base map.
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl TapConfig {
    /// A tap that passes `args` through untouched (no history wiring).
    pub fn direct(server_url: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            tool_name: tool_name.into(),
            connected_string_arg: None,
            connected_array_arg: None,
            args: Map::new(),
        }
    }
}

/// Synthesized memory entry injected ahead of real history during tap
/// argument assembly. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryImprint {
    pub text: String,
}

/// One tool advertised by a remote server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tap_config_decodes_wire_shape() {
        let tap: TapConfig = serde_json::from_value(json!({
            "serverUrl": "http://localhost:8081",
            "toolName": "echo",
            "connectedStringArg": "q",
            "args": { "q": "pre {{cbus_message}} post" }
        }))
        .unwrap();
        assert_eq!(tap.tool_name, "echo");
        assert_eq!(tap.connected_string_arg.as_deref(), Some("q"));
        assert!(tap.connected_array_arg.is_none());
    }

    #[test]
    fn tool_descriptor_schema_field_is_camel_case() {
        let tool = ToolDescriptor {
            name: "echo".into(),
            description: None,
            input_schema: Some(json!({"type": "object"})),
        };
        let json = serde_json::to_string(&tool).unwrap();
        assert!(json.contains("inputSchema"));
    }
}

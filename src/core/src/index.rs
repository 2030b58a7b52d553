use std::collections::BTreeMap;
use std::sync::Mutex;

use cbus_protocol::ToolDescriptor;

/// Coordinator-wide index of known tool servers and their tools.
///
/// Replaced per server (merge across servers), read by the pipeline to
/// resolve extracted call methods and to synthesize the memory entry
/// describing available tools.
#[derive(Default)]
pub struct ToolIndex {
    servers: Mutex<BTreeMap<String, Vec<ToolDescriptor>>>,
}

impl ToolIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace one server's tool list, keeping other servers intact.
    pub fn replace(&self, server_url: &str, tools: Vec<ToolDescriptor>) {
        if let Ok(mut servers) = self.servers.lock() {
            servers.insert(server_url.to_string(), tools);
        }
    }

    /// Find a tool by name across all indexed servers. Servers are
    /// scanned in URL order, so lookups are deterministic when two
    /// servers export the same name.
    pub fn lookup(&self, tool_name: &str) -> Option<(String, ToolDescriptor)> {
        let servers = self.servers.lock().ok()?;
        for (url, tools) in servers.iter() {
            if let Some(tool) = tools.iter().find(|t| t.name == tool_name) {
                return Some((url.clone(), tool.clone()));
            }
        }
        None
    }

    /// Serialized view of the index (server URL → tool names), injected
    /// as a synthesized memory entry during argument assembly.
    pub fn summary(&self) -> String {
        let Ok(servers) = self.servers.lock() else {
            return "{}".into();
        };
        let view: BTreeMap<&str, Vec<&str>> = servers
            .iter()
            .map(|(url, tools)| {
                (
                    url.as_str(),
                    tools.iter().map(|t| t.name.as_str()).collect(),
                )
            })
            .collect();
        serde_json::to_string(&view).unwrap_or_else(|_| "{}".into())
    }

    pub fn is_empty(&self) -> bool {
        self.servers.lock().map(|s| s.is_empty()).unwrap_or(true)
    }
}

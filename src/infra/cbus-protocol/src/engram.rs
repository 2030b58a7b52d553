use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Role of a conversation message.
///
/// Open enumeration: unknown labels round-trip through `Other` rather
/// than failing to decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    User,
    Tool,
    Memory,
    Other(String),
}

impl Role {
    pub fn as_str(&self) -> &str {
        match self {
            Self::User => "user",
            Self::Tool => "tool",
            Self::Memory => "memory",
            Self::Other(label) => label,
        }
    }

    pub fn from_label(s: &str) -> Self {
        match s {
            "user" => Self::User,
            "tool" => Self::Tool,
            "memory" => Self::Memory,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for Role {
    fn from(s: String) -> Self {
        Self::from_label(&s)
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        role.as_str().to_string()
    }
}

/// One message in an engram's append-only log.
///
/// Immutable once persisted. Insertion order within the engram is
/// maintained by the store; `id` additionally sorts by creation time at
/// millisecond granularity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngramMessage {
    pub id: String,
    pub engram_id: String,
    pub role: Role,
    pub text: String,
    /// RFC 3339 creation timestamp.
    pub timestamp: String,
}

/// Engram metadata record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngramMeta {
    pub engram_id: String,
    pub created_at: String,
    /// Arbitrary client-supplied metadata.
    #[serde(default)]
    pub meta: Map<String, Value>,
}

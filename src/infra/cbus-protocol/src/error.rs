use thiserror::Error;

/// Protocol-level errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not a client envelope: missing `type` tag")]
    MissingTypeTag,

    #[error("unsupported jsonrpc version: {0}")]
    UnsupportedRpcVersion(String),
}

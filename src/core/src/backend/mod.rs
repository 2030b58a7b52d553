mod http;

pub use http::HttpToolBackend;

use std::future::Future;
use std::pin::Pin;

use serde_json::{Map, Value};
use thiserror::Error;

use cbus_protocol::{RpcCall, ToolDescriptor};

/// Compute-backend failures.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Backend not ready or not configured; short-circuits invocation.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    /// The backend accepted the call but returned a failure.
    #[error("tool error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("malformed backend response: {0}")]
    Malformed(String),
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Interface to the external compute backend executing named tools
/// against remote servers. The coordinator core depends only on this
/// trait; [`HttpToolBackend`] is the default implementation.
pub trait ToolBackend: Send + Sync + 'static {
    /// Execute a named tool on a server; returns the raw result payload.
    fn invoke(
        &self,
        server_url: &str,
        tool_name: &str,
        args: Map<String, Value>,
    ) -> BoxFuture<'_, Result<Value, BackendError>>;

    /// Fetch the tool list a server advertises.
    fn list_tools(&self, server_url: &str) -> BoxFuture<'_, Result<Vec<ToolDescriptor>, BackendError>>;

    /// Forward a raw structured call (backend-proxy path).
    fn proxy(&self, call: RpcCall) -> BoxFuture<'_, Result<Value, BackendError>>;

    /// Server used when a request names none.
    fn default_url(&self) -> Option<String> {
        None
    }
}

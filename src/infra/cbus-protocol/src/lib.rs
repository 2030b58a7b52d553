mod config;
mod engram;
mod envelope;
mod error;
mod rpc;

pub use config::{MemoryImprint, TapConfig, ToolDescriptor};
pub use engram::{EngramMessage, EngramMeta, Role};
pub use envelope::{
    decode_client_message, encode_server_message, CallSource, ClientMessage, Inbound,
    ServerMessage, StoreOp, StoreOptions,
};
pub use error::ProtocolError;
pub use rpc::{RpcCall, RpcError, RpcResponse, JSONRPC_VERSION};

/// Placeholder token substituted with the latest conversation message
/// during tap argument assembly.
pub const MESSAGE_PLACEHOLDER: &str = "{{cbus_message}}";

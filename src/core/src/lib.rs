mod backend;
mod breaker;
mod cbus_config;
mod config;
mod connection;
mod index;
mod outbound;
mod pipeline;
mod router;
mod routing;
mod server;
mod settings;
mod storage;

pub use backend::{BackendError, BoxFuture, HttpToolBackend, ToolBackend};
pub use breaker::CircuitBreaker;
pub use cbus_config::CbusConfig;
pub use config::ServerConfig;
pub use index::ToolIndex;
pub use outbound::OutboundMessage;
pub use pipeline::{response_text, ToolCall, ToolPipeline, TOO_MANY_CALLS};
pub use router::MessageRouter;
pub use routing::{ClientHub, RoutingTable};
pub use server::build_router;
pub use settings::{Settings, SettingsSnapshot};
pub use storage::{
    message_id, EngramStore, IngestOutcome, SqliteEngramStore, StorageError, DEFAULT_KEEP_LAST,
};

use cbus_protocol::ServerMessage;

/// Messages pushed toward a client connection's WS loop.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// Typed push envelope.
    Push(ServerMessage),
    /// Pre-serialized frame (JSON-RPC proxy responses go out verbatim).
    Raw(String),
}

impl OutboundMessage {
    pub fn push(msg: ServerMessage) -> Self {
        Self::Push(msg)
    }

    pub fn raw(text: impl Into<String>) -> Self {
        Self::Raw(text.into())
    }
}

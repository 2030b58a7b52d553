use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::outbound::OutboundMessage;

/// Registry of live client connections and their outbound channels.
///
/// Senders are bounded; pushes use `try_send` so a slow client can never
/// block a coordinator handler.
#[derive(Default)]
pub struct ClientHub {
    clients: Mutex<HashMap<Uuid, mpsc::Sender<OutboundMessage>>>,
}

impl ClientHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, conn_id: Uuid, tx: mpsc::Sender<OutboundMessage>) {
        if let Ok(mut clients) = self.clients.lock() {
            clients.insert(conn_id, tx);
        }
    }

    pub fn unregister(&self, conn_id: Uuid) {
        if let Ok(mut clients) = self.clients.lock() {
            clients.remove(&conn_id);
        }
    }

    /// Push to one connection. Returns false when the connection is
    /// unknown or its channel is closed/full; callers treat that as
    /// "not present".
    pub fn send_to(&self, conn_id: Uuid, msg: OutboundMessage) -> bool {
        let Ok(clients) = self.clients.lock() else {
            return false;
        };
        match clients.get(&conn_id) {
            Some(tx) => tx.try_send(msg).is_ok(),
            None => false,
        }
    }

    /// Push to every live connection.
    pub fn broadcast(&self, msg: OutboundMessage) {
        let Ok(clients) = self.clients.lock() else {
            return;
        };
        for tx in clients.values() {
            let _ = tx.try_send(msg.clone());
        }
    }

    pub fn connected(&self) -> usize {
        self.clients.lock().map(|c| c.len()).unwrap_or(0)
    }
}

/// Transient engram → connection bindings for result routing.
///
/// Overwritten (last writer wins) on every conversation-scoped client
/// action; read at delivery time. An absent or dead binding degrades to
/// broadcast, never to an error.
pub struct RoutingTable {
    hub: Arc<ClientHub>,
    bindings: Mutex<HashMap<String, Uuid>>,
}

impl RoutingTable {
    pub fn new(hub: Arc<ClientHub>) -> Self {
        Self {
            hub,
            bindings: Mutex::new(HashMap::new()),
        }
    }

    pub fn bind(&self, engram_id: &str, conn_id: Uuid) {
        if let Ok(mut bindings) = self.bindings.lock() {
            bindings.insert(engram_id.to_string(), conn_id);
        }
    }

    pub fn resolve(&self, engram_id: &str) -> Option<Uuid> {
        self.bindings.lock().ok()?.get(engram_id).copied()
    }

    /// Deliver to the bound connection if present and still reachable,
    /// otherwise broadcast to all live connections.
    pub fn deliver(&self, engram_id: Option<&str>, msg: OutboundMessage) {
        if let Some(id) = engram_id {
            if let Some(conn_id) = self.resolve(id) {
                if self.hub.send_to(conn_id, msg.clone()) {
                    return;
                }
                tracing::debug!(engram_id = %id, %conn_id, "bound connection gone, broadcasting");
            }
        }
        self.hub.broadcast(msg);
    }

    pub fn hub(&self) -> &ClientHub {
        &self.hub
    }
}

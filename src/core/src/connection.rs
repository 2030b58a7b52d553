use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use cbus_protocol::encode_server_message;

use crate::outbound::OutboundMessage;
use crate::router::MessageRouter;
use crate::routing::ClientHub;

/// Parameters required to run a connection session.
#[derive(Clone)]
pub struct ConnectionParams {
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub hub: Arc<ClientHub>,
    pub router: Arc<MessageRouter>,
}

/// Run the full connection lifecycle: register in the hub, then a
/// message loop with heartbeat + idle timeout. Clients attach without
/// negotiation and can disappear at any time; the hub entry is removed
/// on exit so deliveries degrade to broadcast.
pub async fn run_connection(socket: WebSocket, params: ConnectionParams) {
    let conn_id = Uuid::new_v4();
    let span = tracing::info_span!("conn", id = %conn_id);
    let _enter = span.enter();

    let (mut sink, mut stream) = socket.split();

    // Outbound channel: the router and pipeline push results here.
    // Bounded for backpressure — senders use try_send to avoid blocking.
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMessage>(256);
    params.hub.register(conn_id, outbound_tx);
    tracing::info!("client connected");

    let mut idle_deadline = tokio::time::Instant::now() + params.idle_timeout;
    let mut heartbeat = tokio::time::interval(params.heartbeat_interval);
    heartbeat.tick().await; // consume immediate first tick

    loop {
        tokio::select! {
            // Incoming WS message.
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        idle_deadline = tokio::time::Instant::now() + params.idle_timeout;
                        params.router.handle_text(conn_id, &text).await;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        tracing::debug!("binary frame ignored");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        idle_deadline = tokio::time::Instant::now() + params.idle_timeout;
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        idle_deadline = tokio::time::Instant::now() + params.idle_timeout;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        if let Some(frame) = frame {
                            tracing::info!(code = %frame.code, reason = %frame.reason, "ws close");
                        } else {
                            tracing::info!("ws close");
                        }
                        break;
                    }
                    None => {
                        tracing::info!("ws stream ended");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::warn!("ws error: {e}");
                        break;
                    }
                }
            }
            // Outbound pushes from the router/pipeline.
            msg = outbound_rx.recv() => {
                match msg {
                    Some(OutboundMessage::Push(push)) => {
                        match encode_server_message(&push) {
                            Ok(json) => {
                                let _ = sink.send(Message::Text(json.into())).await;
                            }
                            Err(e) => {
                                tracing::warn!("failed to encode push: {e}");
                            }
                        }
                    }
                    Some(OutboundMessage::Raw(text)) => {
                        let _ = sink.send(Message::Text(text.into())).await;
                    }
                    None => break,
                }
            }
            // Heartbeat ping.
            _ = heartbeat.tick() => {
                if sink.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
            // Idle timeout.
            _ = tokio::time::sleep_until(idle_deadline) => {
                tracing::info!("idle timeout");
                let _ = sink
                    .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                        code: 4000,
                        reason: "idle timeout".into(),
                    })))
                    .await;
                break;
            }
        }
    }

    params.hub.unregister(conn_id);
    tracing::info!("connection closed");
}

//! WebSocket event stream.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use serde_json::json;
use tracing::{debug, info, warn};

use cronflow_events::{BusEvent, EventBus};

/// Keep-alive ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Forward bus events to a connected observer until either side closes.
///
/// With a `client_id` the socket receives events targeted at that client in
/// addition to broadcasts.
pub async fn handle_ws_connection(
    mut socket: WebSocket,
    events: Arc<EventBus>,
    client_id: Option<String>,
) {
    let mut subscription = match client_id {
        Some(id) => events.subscribe_as(id).await,
        None => events.subscribe().await,
    };
    let id = subscription.id.clone();
    info!(client_id = %id, "WebSocket client connected");

    let hello = BusEvent::new("connected", json!({ "client_id": id }));
    if send_event(&mut socket, &hello).await.is_ok() {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await;

        loop {
            tokio::select! {
                event = subscription.receiver.recv() => {
                    let Some(event) = event else { break };
                    if send_event(&mut socket, &event).await.is_err() {
                        break;
                    }
                }
                msg = socket.recv() => match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(client_id = %id, "WebSocket receive error: {e}");
                        break;
                    }
                },
                _ = ping.tick() => {
                    if socket.send(Message::Ping(Default::default())).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    events.unsubscribe(&subscription).await;
    info!(client_id = %id, "WebSocket connection closed");
}

async fn send_event(socket: &mut WebSocket, event: &BusEvent) -> Result<(), axum::Error> {
    let text = serde_json::to_string(event).map_err(axum::Error::new)?;
    debug!(event = %event.event, "Forwarding event");
    socket.send(Message::Text(text.into())).await
}

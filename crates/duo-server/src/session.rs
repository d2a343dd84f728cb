//! One WebSocket connection: a writer task draining the connection's outbound
//! queue and a reader loop feeding decoded client events into the hub.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use duo_shared::protocol::ProfileFields;
use duo_shared::{ClientEvent, ConnectionId, ServerEvent, UserId};

use crate::api::AppState;
use crate::hub::Hub;
use crate::rate_limit::TokenBucket;

pub async fn run(socket: WebSocket, state: AppState, user_id: UserId, fields: ProfileFields) {
    let (outbound, mut outbound_rx) = mpsc::channel::<ServerEvent>(state.config.outbound_buffer);
    let conn = state.hub.connect(user_id.clone(), &fields, outbound).await;

    info!(conn = %conn, user = %user_id.short(), "Client connected");

    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            let text = match event.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!(conn = %conn, error = %e, "Dropping unencodable event");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut throttle = TokenBucket::new(state.config.event_rate_per_sec, state.config.event_rate_burst);

    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!(conn = %conn, error = %e, "WebSocket read failed");
                break;
            }
        };

        match frame {
            Message::Text(text) => {
                if !throttle.try_acquire() {
                    warn!(conn = %conn, "Event rate exceeded, dropping frame");
                    continue;
                }
                dispatch(&state.hub, conn, &text).await;
            }
            Message::Binary(_) => {
                debug!(conn = %conn, "Ignoring binary frame");
            }
            Message::Close(_) => break,
            // Pings are answered by the WebSocket layer itself.
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    state.hub.disconnect(conn).await;
    writer.abort();

    info!(conn = %conn, user = %user_id.short(), "Client disconnected");
}

/// Decode and apply one text frame. Rejections the client caused are reported
/// back to it as an `error` event; nothing reaches other connections.
async fn dispatch(hub: &Hub, conn: ConnectionId, text: &str) {
    let result = match ClientEvent::from_json(text) {
        Ok(event) => hub.handle(conn, event).await,
        Err(e) => Err(e.into()),
    };

    let Err(err) = result else {
        return;
    };

    if err.is_client_facing() {
        warn!(conn = %conn, error = %err, "Rejected client event");
        hub.presence()
            .send_to_connection(conn, ServerEvent::error(err.to_string()));
    } else {
        debug!(conn = %conn, error = %err, "Client event ignored");
    }
}

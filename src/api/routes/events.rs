//! Event streaming handlers: SSE and WebSocket.

use crate::api::AppState;
use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::{
        IntoResponse,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
};
use futures::stream::Stream;
use std::convert::Infallible;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

/// GET /events - Server-sent events stream
///
/// Bridges the bus's broadcast channel: each event arrives as an SSE message
/// whose event name is the stable type tag and whose data is the JSON body.
/// A lagging client silently skips the events it missed.
#[utoipa::path(
    get,
    path = "/api/v1/events",
    tag = "events",
    responses((status = 200, description = "SSE stream of bus events"))
)]
pub async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = state.downloader.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| {
        let event = result.ok()?;
        let json = serde_json::to_string(&event).ok()?;
        Some(Ok(SseEvent::default()
            .event(event.event_type.as_str())
            .data(json)))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// GET /events/ws - WebSocket event stream
///
/// Registers the connection with the bus's fan-out list; events arrive as
/// JSON text frames after in-process subscribers have run. The connection is
/// removed from the fan-out when either side closes.
#[utoipa::path(
    get,
    path = "/api/v1/events/ws",
    tag = "events",
    responses((status = 101, description = "WebSocket upgrade"))
)]
pub async fn events_ws(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let bus = state.downloader.event_bus().clone();
    let (conn_id, mut rx) = bus.register_websocket();

    loop {
        tokio::select! {
            outgoing = rx.recv() => {
                match outgoing {
                    Some(json) => {
                        if socket.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    // Client frames are ignored; the stream is one-way
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    bus.remove_websocket(conn_id);
    tracing::debug!("WebSocket event client disconnected");
}

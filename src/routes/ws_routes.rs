use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use tracing::{error, info, warn};

use crate::models::{ChatRequest, WsEvent};
use crate::service::chat_service::ChatService;
use crate::service::orchestrator::TurnEvent;

/// GET `/ws/chat`: upgrades to a WebSocket for streaming chat.
pub async fn ws_chat_handler(
    ws: WebSocketUpgrade,
    State(svc): State<ChatService>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, svc))
}

fn to_ws_event(event: TurnEvent) -> WsEvent {
    match event {
        TurnEvent::Started { session_id, user_message } => {
            WsEvent::StreamStart { session_id, user_message }
        }
        TurnEvent::Snapshot(message) => WsEvent::StreamSnapshot { message },
        TurnEvent::Finalized(message) => WsEvent::StreamEnd { message },
        TurnEvent::Failed { partial, notice } => WsEvent::Error {
            message: notice.text.clone(),
            messages: partial.into_iter().chain(std::iter::once(notice)).collect(),
        },
    }
}

/// Handles a single WebSocket connection.
///
/// Protocol:
/// - Client sends JSON `{ "session_id": "...|null", "message": "...", "preferences": {...}? }`
/// - Server streams back:
///   1. `{ "type": "stream_start", "session_id": "...", "user_message": {...} }`
///   2. `{ "type": "stream_snapshot", "message": {...} }` (repeated, full text so far)
///   3. `{ "type": "stream_end", "message": {...} }` with cleaned text and itinerary
///   or `{ "type": "error", "message": "...", "messages": [...] }` on failure.
async fn handle_socket(mut socket: WebSocket, svc: ChatService) {
    info!("WebSocket client connected");

    while let Some(msg) = socket.recv().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                warn!("WebSocket receive error: {e}");
                break;
            }
        };

        // Only handle text messages
        let text = match &msg {
            Message::Text(t) => t.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };

        let request: ChatRequest = match serde_json::from_str(&text) {
            Ok(r) => r,
            Err(e) => {
                send_event(&mut socket, &WsEvent::Error {
                    message: format!("Invalid request: {e}"),
                    messages: Vec::new(),
                }).await;
                continue;
            }
        };

        // ── Run the turn in its own task, forwarding progress ─────────────
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<TurnEvent>();
        let turn_svc = svc.clone();
        let turn_handle = tokio::spawn(async move { turn_svc.run_turn(request, &tx).await });

        while let Some(event) = rx.recv().await {
            send_event(&mut socket, &to_ws_event(event)).await;
        }

        match turn_handle.await {
            Ok(Ok(response)) => {
                info!("Turn finished for session {} ({} new messages)", response.session_id, response.messages.len());
            }
            Ok(Err(e)) => {
                error!("Chat turn failed: {e}");
                send_event(&mut socket, &WsEvent::Error {
                    message: e.to_string(),
                    messages: Vec::new(),
                }).await;
            }
            Err(e) => {
                error!("Chat turn task panicked: {e}");
                send_event(&mut socket, &WsEvent::Error {
                    message: "Internal error during streaming".to_string(),
                    messages: Vec::new(),
                }).await;
            }
        }
    }

    info!("WebSocket client disconnected");
}

/// Helper: serialize a `WsEvent` and send it over the socket.
async fn send_event(socket: &mut WebSocket, event: &WsEvent) {
    if let Ok(json) = serde_json::to_string(event) {
        let _ = socket.send(Message::Text(json.into())).await;
    }
}

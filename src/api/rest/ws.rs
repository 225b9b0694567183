use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::SinkExt;
use futures::StreamExt;
use serde::Deserialize;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct FeedParams {
    /// Only forward events for this booking.
    pub booking_id: Option<Uuid>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<FeedParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.booking_id))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, booking_id: Option<Uuid>) {
    let (mut sender, mut receiver) = socket.split();
    let events = BroadcastStream::new(state.events_tx.subscribe()).filter_map(move |event| async move {
        match event {
            Ok(notification) if booking_id.is_none_or(|id| id == notification.booking_id) => {
                Some(notification)
            }
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "websocket client lagging; events dropped");
                None
            }
        }
    });

    info!(booking_id = ?booking_id, "websocket client connected");

    let send_task = tokio::spawn(async move {
        let mut events = Box::pin(events);
        while let Some(notification) = events.next().await {
            let json = match serde_json::to_string(&notification) {
                Ok(json) => json,
                Err(err) => {
                    warn!(error = %err, "failed to serialize notification for ws");
                    continue;
                }
            };

            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(_msg)) = receiver.next().await {}
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    info!("websocket client disconnected");
}

/// WebSocket handler for live volume events

use axum::{
    extract::ws::{Message, WebSocket},
    extract::{State, WebSocketUpgrade},
    response::Response,
};
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::core::{VolumeEvent, VolumeService};

pub async fn ws_events_handler(
    State(service): State<Arc<VolumeService>>,
    ws: WebSocketUpgrade,
) -> Response {
    let events = service.subscribe_events();
    ws.on_upgrade(move |socket| handle_events_websocket(socket, events))
}

async fn handle_events_websocket(socket: WebSocket, mut events: broadcast::Receiver<VolumeEvent>) {
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if let Ok(json) = serde_json::to_string(&event) {
                            if sender.send(Message::Text(json)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!("websocket client missed {} volume events", missed);
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

//! WebSocket connection handling
//!
//! Each connection gets a reader (this task) and a writer task draining
//! the connection's outbound queue. The reader hands every message to the
//! relay, which only ever queues onto peers and never waits on them.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::relay::Outbound;
use crate::server::AppState;

/// Upgrade an HTTP request to a relay connection
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

/// Serve one connection until either side closes it
pub async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(state.config.outbound_queue.max(1));
    let id = state.relay.connect(tx);

    let mut writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let message = match outbound {
                Outbound::Text(text) => Message::Text(text),
                Outbound::Binary(frame) => Message::Binary(frame.into()),
            };
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    state.relay.handle_text(id, &text);
                }
                Some(Ok(Message::Binary(frame))) => {
                    state.relay.handle_binary(id, Bytes::from(frame));
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!("Connection {} read error: {}", id, e);
                    break;
                }
            },
            _ = &mut writer => {
                tracing::debug!("Connection {} writer closed", id);
                break;
            }
        }
    }

    state.relay.disconnect(id);
    writer.abort();
}

use crate::app::AppState;
use crate::event::EventReceiver;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

/// Stream session events to a UI client. Slow consumers lag and miss events
/// rather than backpressuring the orchestration core.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let receiver = state.event_sender.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, receiver))
}

async fn handle_socket(socket: WebSocket, receiver: EventReceiver) {
    let (mut sink, mut incoming) = socket.split();
    let mut events = BroadcastStream::new(receiver);

    loop {
        tokio::select! {
            event = events.next() => {
                match event {
                    Some(Ok(event)) => {
                        let text = match serde_json::to_string(&event) {
                            Ok(text) => text,
                            Err(_) => continue,
                        };
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(_lagged)) => continue,
                    None => break,
                }
            }
            msg = incoming.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }
    debug!("event websocket closed");
}

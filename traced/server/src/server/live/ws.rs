//! WebSocket endpoint. Clients send `ClientMessage` frames and receive
//! `LiveMessage` frames, both JSON.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use traced_proto::prelude::{ClientMessage, LiveMessage};

use super::{Broadcaster, Subscription};
use crate::server::AppState;

pub async fn live_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let live = state.live.clone();
    ws.on_upgrade(move |socket| serve_socket(socket, live))
}

async fn next_live(subscription: &mut Option<Subscription>) -> Option<LiveMessage> {
    match subscription {
        Some(sub) => sub.next().await,
        None => std::future::pending().await,
    }
}

fn encode(message: &LiveMessage) -> Option<Message> {
    match serde_json::to_string(message) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            log::error!("failed to encode live message: {e}");
            None
        }
    }
}

async fn serve_socket(socket: WebSocket, live: Arc<Broadcaster>) {
    let (mut sink, mut stream) = socket.split();
    let mut subscription: Option<Subscription> = None;

    loop {
        let mut outgoing = Vec::new();
        let mut finished = false;

        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientMessage>(text.as_str()) {
                        Ok(ClientMessage::Subscribe { topic, backfill }) => {
                            if let Some(old) = subscription.take() {
                                live.hub().unsubscribe(old.id());
                            }
                            match live.subscribe(topic, backfill).await {
                                Ok(mut sub) => {
                                    outgoing.extend(sub.replay());
                                    subscription = Some(sub);
                                }
                                Err(e) => outgoing.push(LiveMessage::Error { message: e.to_string() }),
                            }
                        }
                        Err(e) => outgoing.push(LiveMessage::Error {
                            message: format!("invalid request: {e}"),
                        }),
                    }
                }
                Some(Ok(Message::Close(_))) | None => finished = true,
                Some(Err(e)) => {
                    log::debug!("live socket error: {e}");
                    finished = true;
                }
                Some(Ok(_)) => {}
            },
            message = next_live(&mut subscription) => match message {
                Some(message) => {
                    finished = matches!(message, LiveMessage::Dropped { .. });
                    outgoing.push(message);
                }
                None => subscription = None,
            },
        }

        for message in &outgoing {
            let Some(frame) = encode(message) else {
                continue;
            };
            if sink.send(frame).await.is_err() {
                finished = true;
                break;
            }
        }
        if finished {
            break;
        }
    }

    if let Some(sub) = subscription {
        live.hub().unsubscribe(sub.id());
    }
    let _ = sink.close().await;
}

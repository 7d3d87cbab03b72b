//! `/ws`: a single socket fanning out every event-bus topic to the connected client as JSON
//! text frames. Protocol-level ping/pong (ws control frames) is handled by the underlying
//! `tokio-tungstenite` stack; this endpoint never needs to see it.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;

use super::ApiContext;
use crate::eventbus::{Event, Topic};

const TOPICS: [Topic; 9] = [
	Topic::NewRequest,
	Topic::Intercept,
	Topic::ProxyStatus,
	Topic::WebSocketMessage,
	Topic::IntruderResult,
	Topic::IntruderProgress,
	Topic::SpiderUrl,
	Topic::SpiderProgress,
	Topic::ScanProgress,
];

pub async fn handler(State(ctx): State<ApiContext>, ws: WebSocketUpgrade) -> Response {
	ws.on_upgrade(move |socket| handle_socket(socket, ctx))
}

async fn handle_socket(socket: WebSocket, ctx: ApiContext) {
	let (mut sink, mut stream) = socket.split();
	let (tx, mut rx) = mpsc::channel::<Event>(256);

	let mut forwarders = Vec::with_capacity(TOPICS.len());
	for topic in TOPICS {
		let sub = ctx.bus.subscribe(topic).await;
		let tx = tx.clone();
		forwarders.push(tokio::spawn(async move {
			while let Some(event) = sub.recv().await {
				if tx.send(event).await.is_err() {
					break;
				}
			}
		}));
	}
	drop(tx);

	let send_task = tokio::spawn(async move {
		while let Some(event) = rx.recv().await {
			let frame = json!({"type": event.topic_name, "sequence": event.sequence, "data": event.payload}).to_string();
			if sink.send(Message::Text(frame.into())).await.is_err() {
				break;
			}
		}
	});

	// Drain inbound frames purely to detect disconnect; this endpoint is publish-only.
	while let Some(msg) = stream.next().await {
		match msg {
			Ok(Message::Close(_)) => break,
			Ok(_) => continue,
			Err(e) => {
				debug!(error = %e, "websocket client stream error");
				break;
			}
		}
	}

	send_task.abort();
	for f in forwarders {
		f.abort();
	}
}

//! WebSocket upgrade handling: negotiates the upgrade on both legs symmetrically, then splices
//! frames bidirectionally, recording each one onto the flow and publishing it to the event bus.

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::Role;
use tracing::{debug, warn};

use super::{ProxyEngine, collect_capped, headers_to_list, now_ns, response_from_flow, text_response};
use crate::client::Destination;
use crate::eventbus::Topic;
use crate::types::{Body, Direction, Flow, Scheme, WebSocketFrame, WebSocketOpcode};

impl ProxyEngine {
	pub(super) async fn handle_websocket(self, mut req: Request<Incoming>, scheme: Scheme, fixed_authority: Option<(String, u16)>) -> Response<Full<Bytes>> {
		let Some((host, port)) = Self::resolve_authority(&req, scheme, &fixed_authority) else {
			return text_response(StatusCode::BAD_REQUEST, "missing host");
		};
		let ws_scheme = if matches!(scheme, Scheme::Https) { Scheme::Wss } else { Scheme::Ws };
		let path = req.uri().path().to_string();
		let query = req.uri().query().unwrap_or("").to_string();
		let mut flow = Flow::new(ws_scheme, req.method().to_string(), host.clone(), port, path.clone(), query.clone(), now_ns());
		flow.is_websocket = true;
		flow.request_headers = headers_to_list(req.headers());

		let dest = Destination::new(scheme, host.clone(), port);
		let mut sender = match self.0.client.connect(&dest).await {
			Ok(s) => s,
			Err(e) => {
				flow.finalize_error(0, e.to_string());
				self.finalize(flow).await;
				return text_response(StatusCode::BAD_GATEWAY, "upstream connect failed");
			}
		};

		let pq = if query.is_empty() { path.clone() } else { format!("{path}?{query}") };
		let mut builder = Request::builder().method(req.method().clone()).uri(pq);
		for (name, value) in flow.request_headers.0.iter() {
			builder = builder.header(name.as_str(), value.as_str());
		}
		let out_req = match builder.body(Full::new(Bytes::new())) {
			Ok(r) => r,
			Err(e) => {
				flow.finalize_error(0, e.to_string());
				self.finalize(flow).await;
				return text_response(StatusCode::BAD_GATEWAY, "failed to build upstream upgrade request");
			}
		};

		let mut upstream_resp = match sender.send_request(out_req).await {
			Ok(r) => r,
			Err(e) => {
				flow.finalize_error(0, e.to_string());
				self.finalize(flow).await;
				return text_response(StatusCode::BAD_GATEWAY, "upstream upgrade request failed");
			}
		};

		if upstream_resp.status() != StatusCode::SWITCHING_PROTOCOLS {
			flow.response_status = Some(upstream_resp.status().as_u16());
			flow.response_headers = headers_to_list(upstream_resp.headers());
			flow.response_body = collect_capped(upstream_resp.into_body(), self.0.config.body_cap).await.unwrap_or_else(|_| Body::empty());
			let response = response_from_flow(&flow);
			self.finalize(flow).await;
			return response;
		}

		// Unlike the ordinary response path, `Connection`/`Upgrade` must be forwarded verbatim here:
		// the client's WebSocket handshake depends on seeing them on the 101 response.
		let mut client_resp_builder = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
		for (name, value) in upstream_resp.headers().iter() {
			client_resp_builder = client_resp_builder.header(name.as_str(), value.as_bytes());
		}
		let client_response = match client_resp_builder.body(Full::new(Bytes::new())) {
			Ok(r) => r,
			Err(e) => {
				flow.finalize_error(0, e.to_string());
				self.finalize(flow).await;
				return text_response(StatusCode::BAD_GATEWAY, "failed to build client upgrade response");
			}
		};

		let this = self.clone();
		tokio::spawn(async move {
			let client_upgrade = match hyper::upgrade::on(&mut req).await {
				Ok(u) => u,
				Err(e) => {
					warn!(error = %e, "client websocket upgrade failed");
					return;
				}
			};
			let upstream_upgrade = match hyper::upgrade::on(&mut upstream_resp).await {
				Ok(u) => u,
				Err(e) => {
					warn!(error = %e, "upstream websocket upgrade failed");
					return;
				}
			};

			let client_ws = WebSocketStream::from_raw_socket(TokioIo::new(client_upgrade), Role::Server, None).await;
			let upstream_ws = WebSocketStream::from_raw_socket(TokioIo::new(upstream_upgrade), Role::Client, None).await;

			this.splice_websocket(flow, client_ws, upstream_ws).await;
		});

		client_response
	}

	async fn splice_websocket(self, mut flow: Flow, client_ws: WebSocketStream<TokioIo<Upgraded>>, upstream_ws: WebSocketStream<TokioIo<Upgraded>>) {
		use futures_util::{SinkExt, StreamExt};

		let (mut client_tx, mut client_rx) = client_ws.split();
		let (mut upstream_tx, mut upstream_rx) = upstream_ws.split();
		let mut index: u64 = 0;
		let started = std::time::Instant::now();

		loop {
			tokio::select! {
				msg = client_rx.next() => {
					match msg {
						Some(Ok(m)) => {
							let closing = matches!(m, Message::Close(_));
							record_frame(&mut flow, &mut index, Direction::ClientToUpstream, &m);
							self.publish_frame(&flow).await;
							if upstream_tx.send(m).await.is_err() || closing {
								break;
							}
						}
						_ => break,
					}
				}
				msg = upstream_rx.next() => {
					match msg {
						Some(Ok(m)) => {
							let closing = matches!(m, Message::Close(_));
							record_frame(&mut flow, &mut index, Direction::UpstreamToClient, &m);
							self.publish_frame(&flow).await;
							if client_tx.send(m).await.is_err() || closing {
								break;
							}
						}
						_ => break,
					}
				}
			}
		}

		debug!(frames = flow.websocket_frames.len(), "websocket session ended");
		flow.duration_ms = Some(started.elapsed().as_millis() as u64);
		self.finalize(flow).await;
	}

	async fn publish_frame(&self, flow: &Flow) {
		let Some(frame) = flow.websocket_frames.last() else { return };
		self.0
			.bus
			.publish(Topic::WebSocketMessage, json!({"flow_id": flow.id.to_string(), "frame": frame}))
			.await;
	}
}

fn record_frame(flow: &mut Flow, index: &mut u64, direction: Direction, msg: &Message) {
	let (opcode, payload) = match msg {
		Message::Text(t) => (WebSocketOpcode::Text, Bytes::copy_from_slice(t.as_bytes())),
		Message::Binary(b) => (WebSocketOpcode::Binary, Bytes::copy_from_slice(b)),
		Message::Close(_) => (WebSocketOpcode::Close, Bytes::new()),
		Message::Ping(p) => (WebSocketOpcode::Ping, Bytes::copy_from_slice(p)),
		Message::Pong(p) => (WebSocketOpcode::Pong, Bytes::copy_from_slice(p)),
		Message::Frame(_) => (WebSocketOpcode::Binary, Bytes::new()),
	};
	let len = payload.len();
	let frame = WebSocketFrame { index: *index, opcode, direction, payload: Body::from_full(payload, len), timestamp_ns: now_ns() };
	flow.websocket_frames.push(frame);
	*index += 1;
}

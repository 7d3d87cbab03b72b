//! The proxy engine: accept loop, HTTP/1.1 connection handling, CONNECT-tunnel TLS termination,
//! forward-proxy mode, and the per-flow rule/intercept/dispatch pipeline.
//!
//! The client-facing leg is served with `hyper::server::conn::http1`, mirroring the low-level,
//! no-pool-wrapper style already used for the upstream leg in `client.rs`. CONNECT handling
//! follows the upgrade-then-peek-then-either-TLS-or-passthrough shape common to transparent MITM
//! proxies: the first bytes off the upgraded stream decide whether we terminate TLS with a
//! minted leaf or fall back to an uninspected byte tunnel.

mod websocket;

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{CONNECTION, HOST, UPGRADE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use proxy_core::drain::{DrainMode, DrainTrigger};

use crate::ca::CaStore;
use crate::client::{Destination, UpstreamClient};
use crate::error::ConfigError;
use crate::eventbus::{EventBus, Topic};
use crate::intercept::SharedInterceptCoordinator;
use crate::rules;
use crate::store::FlowStore;
use crate::types::{Body, Flow, HeaderList, InterceptDecision, InterceptPhase, ModifiedBody, Phase, Rule, Scheme};

const HOP_BY_HOP: &[&str] = &["connection", "proxy-connection", "te", "transfer-encoding", "content-length", "upgrade", "keep-alive"];

fn is_hop_by_hop(name: &str) -> bool {
	HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

fn default_port(scheme: Scheme) -> u16 {
	match scheme {
		Scheme::Http | Scheme::Ws => 80,
		Scheme::Https | Scheme::Wss => 443,
	}
}

fn now_ns() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0)
}

fn headers_to_list(headers: &hyper::HeaderMap) -> HeaderList {
	let mut list = HeaderList::new();
	for (name, value) in headers.iter() {
		list.push(name.as_str(), value.to_str().unwrap_or_default());
	}
	list
}

async fn collect_capped(mut body: Incoming, cap: usize) -> Result<Body, hyper::Error> {
	let mut buf = BytesMut::new();
	let mut total: usize = 0;
	while let Some(frame) = body.frame().await {
		let frame = frame?;
		if let Ok(data) = frame.into_data() {
			total += data.len();
			if buf.len() < cap {
				let take = (cap - buf.len()).min(data.len());
				buf.extend_from_slice(&data[..take]);
			}
		}
	}
	let truncated = total > cap;
	Ok(Body { data: buf.freeze(), truncated, truncated_bytes: if truncated { (total - cap) as u64 } else { 0 } })
}

fn apply_modified(flow: &mut Flow, modified: ModifiedBody, phase: Phase) {
	if let Some(headers) = modified.headers {
		let list = HeaderList(headers);
		match phase {
			Phase::Request => flow.request_headers = list,
			Phase::Response => flow.response_headers = list,
		}
	}
	if let Some(body) = modified.body {
		let cap = body.len();
		let b = Body::from_full(Bytes::from(body), cap);
		match phase {
			Phase::Request => flow.request_body = b,
			Phase::Response => flow.response_body = b,
		}
	}
	if let Some(status) = modified.status {
		flow.response_status = Some(status);
	}
	flow.modified = true;
}

fn response_from_flow(flow: &Flow) -> Response<Full<Bytes>> {
	let status = flow.response_status.unwrap_or(502);
	let mut builder = Response::builder().status(status);
	for (name, value) in flow.response_headers.0.iter() {
		if is_hop_by_hop(name) {
			continue;
		}
		builder = builder.header(name.as_str(), value.as_str());
	}
	builder.body(Full::new(flow.response_body.data.clone())).unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

fn text_response(status: StatusCode, body: impl Into<String>) -> Response<Full<Bytes>> {
	Response::builder()
		.status(status)
		.header("content-type", "text/plain")
		.body(Full::new(Bytes::from(body.into())))
		.unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

fn is_websocket_upgrade(req: &Request<Incoming>) -> bool {
	let has_upgrade_token = req
		.headers()
		.get(CONNECTION)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("upgrade")))
		.unwrap_or(false);
	let wants_websocket = req.headers().get(UPGRADE).and_then(|v| v.to_str().ok()).map(|v| v.eq_ignore_ascii_case("websocket")).unwrap_or(false);
	has_upgrade_token && wants_websocket
}

/// A stream with a small prefix that was already read off the wire and must be replayed before
/// any further reads reach the underlying connection (used after peeking post-CONNECT bytes).
struct Rewind<T> {
	prefix: Option<Bytes>,
	inner: T,
}

impl<T: AsyncRead + Unpin> AsyncRead for Rewind<T> {
	fn poll_read(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
		if let Some(mut prefix) = self.prefix.take() {
			if !prefix.is_empty() {
				let n = buf.remaining().min(prefix.len());
				buf.put_slice(&prefix[..n]);
				if n < prefix.len() {
					self.prefix = Some(prefix.split_off(n));
				}
				return Poll::Ready(Ok(()));
			}
		}
		Pin::new(&mut self.inner).poll_read(cx, buf)
	}
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Rewind<T> {
	fn poll_write(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		Pin::new(&mut self.inner).poll_write(cx, buf)
	}
	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.inner).poll_flush(cx)
	}
	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.inner).poll_shutdown(cx)
	}
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
	pub body_cap: usize,
	pub upstream_timeout: Duration,
}

impl Default for EngineConfig {
	fn default() -> Self {
		EngineConfig { body_cap: 10 * 1024 * 1024, upstream_timeout: Duration::from_secs(30) }
	}
}

#[derive(Clone, Debug, Default, PartialEq, serde::Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum EngineState {
	#[default]
	Stopped,
	Running {
		host: String,
		port: u16,
	},
	Error {
		message: String,
	},
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct EngineStatus {
	#[serde(flatten)]
	pub state: EngineState,
	pub flows_total: u64,
}

struct Inner {
	config: EngineConfig,
	ca: Arc<CaStore>,
	bus: Arc<EventBus>,
	intercept: SharedInterceptCoordinator,
	client: UpstreamClient,
	flow_store: Arc<dyn FlowStore>,
	rules: AsyncMutex<Arc<Vec<Rule>>>,
	state: AsyncMutex<EngineState>,
	drain_trigger: AsyncMutex<Option<DrainTrigger>>,
	accept_shutdown: watch::Sender<bool>,
	flows_total: AtomicU64,
}

/// Exactly one instance per process, per spec: owns the listener lifecycle and the per-flow
/// pipeline. Cheap to clone (wraps an `Arc`).
#[derive(Clone)]
pub struct ProxyEngine(Arc<Inner>);

impl ProxyEngine {
	pub fn new(config: EngineConfig, ca: Arc<CaStore>, bus: Arc<EventBus>, intercept: SharedInterceptCoordinator, client: UpstreamClient, flow_store: Arc<dyn FlowStore>) -> Self {
		let (accept_shutdown, _) = watch::channel(false);
		ProxyEngine(Arc::new(Inner {
			config,
			ca,
			bus,
			intercept,
			client,
			flow_store,
			rules: AsyncMutex::new(Arc::new(Vec::new())),
			state: AsyncMutex::new(EngineState::Stopped),
			drain_trigger: AsyncMutex::new(None),
			accept_shutdown,
			flows_total: AtomicU64::new(0),
		}))
	}

	pub async fn set_rules(&self, rules: Vec<Rule>) {
		*self.0.rules.lock().await = Arc::new(rules);
	}

	async fn rules_snapshot(&self) -> Arc<Vec<Rule>> {
		self.0.rules.lock().await.clone()
	}

	pub async fn status(&self) -> EngineStatus {
		EngineStatus { state: self.0.state.lock().await.clone(), flows_total: self.0.flows_total.load(Ordering::Relaxed) }
	}

	/// Binds the listener and spawns the accept loop. Idempotent while already running.
	pub async fn start(&self, host: &str, port: u16) -> Result<(), ConfigError> {
		let mut state = self.0.state.lock().await;
		if matches!(*state, EngineState::Running { .. }) {
			return Ok(());
		}
		let addr = format!("{host}:{port}");
		let listener = match TcpListener::bind(&addr).await {
			Ok(l) => l,
			Err(source) => {
				*state = EngineState::Error { message: source.to_string() };
				return Err(ConfigError::Bind { addr, source });
			}
		};

		let (trigger, watcher) = proxy_core::drain::new();
		*self.0.drain_trigger.lock().await = Some(trigger);
		let _ = self.0.accept_shutdown.send(false);
		let mut stop_rx = self.0.accept_shutdown.subscribe();
		let this = self.clone();

		tokio::spawn(async move {
			loop {
				tokio::select! {
					accepted = listener.accept() => {
						match accepted {
							Ok((stream, peer)) => {
								let conn_watcher = watcher.clone();
								let this2 = this.clone();
								tokio::spawn(async move {
									let _hold = conn_watcher;
									this2.handle_connection(stream, peer).await;
								});
							}
							Err(e) => warn!(error = %e, "accept failed"),
						}
					}
					_ = stop_rx.changed() => {
						if *stop_rx.borrow() {
							break;
						}
					}
				}
			}
			debug!("proxy accept loop exited");
		});

		*state = EngineState::Running { host: host.to_string(), port };
		drop(state);
		self.0.bus.publish(Topic::ProxyStatus, json!({"state": "running", "host": host, "port": port})).await;
		Ok(())
	}

	/// Stops accepting, then waits (up to a deadline) for in-flight connections to drain.
	pub async fn stop(&self) {
		let _ = self.0.accept_shutdown.send(true);
		self.0.intercept.forward_all().await;
		let trigger = self.0.drain_trigger.lock().await.take();
		if let Some(trigger) = trigger {
			let deadline = Duration::from_secs(10);
			if tokio::time::timeout(deadline, trigger.start_drain_and_wait(DrainMode::Graceful)).await.is_err() {
				warn!("proxy engine drain deadline expired with connections still outstanding");
			}
		}
		*self.0.state.lock().await = EngineState::Stopped;
		self.0.bus.publish(Topic::ProxyStatus, json!({"state": "stopped"})).await;
	}

	pub(crate) async fn finalize(&self, flow: Flow) {
		self.0.flows_total.fetch_add(1, Ordering::Relaxed);
		let payload = serde_json::to_value(&flow).unwrap_or_else(|_| json!({}));
		self.0.bus.publish(Topic::NewRequest, payload).await;
		if let Err(e) = self.0.flow_store.put_flow(flow).await {
			warn!(error = %e, "failed to persist flow");
		}
	}

	async fn handle_connection(self, stream: TcpStream, peer: SocketAddr) {
		let io = TokioIo::new(stream);
		let this = self.clone();
		let service = service_fn(move |req: Request<Incoming>| {
			let this = this.clone();
			async move { Ok::<_, std::convert::Infallible>(this.route(req, Scheme::Http, None).await) }
		});
		if let Err(e) = hyper::server::conn::http1::Builder::new().serve_connection(io, service).with_upgrades().await {
			debug!(error = %e, %peer, "client connection closed");
		}
	}

	async fn serve_tls_tunnel<S>(self, stream: S, host: String, port: u16)
	where
		S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
	{
		let io = TokioIo::new(stream);
		let this = self.clone();
		let service = service_fn(move |req: Request<Incoming>| {
			let this = this.clone();
			let host = host.clone();
			async move { Ok::<_, std::convert::Infallible>(this.route(req, Scheme::Https, Some((host, port))).await) }
		});
		if let Err(e) = hyper::server::conn::http1::Builder::new().serve_connection(io, service).with_upgrades().await {
			debug!(error = %e, "tls tunnel connection closed");
		}
	}

	async fn route(self, req: Request<Incoming>, scheme: Scheme, fixed_authority: Option<(String, u16)>) -> Response<Full<Bytes>> {
		if req.method() == Method::CONNECT && fixed_authority.is_none() {
			return self.process_connect(req).await;
		}
		if is_websocket_upgrade(&req) {
			return self.handle_websocket(req, scheme, fixed_authority).await;
		}
		self.handle_http(req, scheme, fixed_authority).await
	}

	async fn process_connect(self, mut req: Request<Incoming>) -> Response<Full<Bytes>> {
		let Some(authority) = req.uri().authority().cloned() else {
			return text_response(StatusCode::BAD_REQUEST, "CONNECT target missing authority");
		};
		let host = authority.host().to_string();
		let port = authority.port_u16().unwrap_or(443);

		tokio::spawn(async move {
			let upgraded = match hyper::upgrade::on(&mut req).await {
				Ok(u) => u,
				Err(e) => {
					warn!(error = %e, "CONNECT upgrade failed");
					return;
				}
			};
			let mut io = TokioIo::new(upgraded);
			let mut peek = [0u8; 4];
			let n = match io.read(&mut peek).await {
				Ok(n) => n,
				Err(e) => {
					warn!(error = %e, "failed reading tunneled prefix");
					return;
				}
			};
			let prefix = Bytes::copy_from_slice(&peek[..n]);
			let looks_like_tls = n >= 2 && peek[0] == 0x16 && peek[1] == 0x03;

			if looks_like_tls {
				let rewound = Rewind { prefix: Some(prefix), inner: io };
				match self.0.ca.server_config_for(&host).await {
					Ok(server_config) => match TlsAcceptor::from(server_config).accept(rewound).await {
						Ok(tls_stream) => self.serve_tls_tunnel(tls_stream, host, port).await,
						Err(e) => warn!(error = %e, host, "TLS handshake with client failed"),
					},
					Err(e) => warn!(error = %e, host, "failed to mint leaf certificate"),
				}
				return;
			}

			let rewound = Rewind { prefix: Some(prefix), inner: io };
			self.passthrough(rewound, &host, port).await;
		});

		Response::builder().status(StatusCode::OK).body(Full::new(Bytes::new())).unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
	}

	async fn passthrough<S>(&self, mut client: S, host: &str, port: u16)
	where
		S: AsyncRead + AsyncWrite + Unpin,
	{
		let mut server = match TcpStream::connect((host, port)).await {
			Ok(s) => s,
			Err(e) => {
				warn!(error = %e, host, port, "passthrough connect failed");
				return;
			}
		};
		if let Err(e) = tokio::io::copy_bidirectional(&mut client, &mut server).await {
			debug!(error = %e, host, "passthrough tunnel closed");
		}
	}

	fn resolve_authority(req: &Request<Incoming>, scheme: Scheme, fixed_authority: &Option<(String, u16)>) -> Option<(String, u16)> {
		if let Some((host, port)) = fixed_authority {
			return Some((host.clone(), *port));
		}
		if let Some(host) = req.uri().host() {
			return Some((host.to_string(), req.uri().port_u16().unwrap_or(default_port(scheme))));
		}
		let host_header = req.headers().get(HOST)?.to_str().ok()?;
		match host_header.rsplit_once(':') {
			Some((h, p)) => Some((h.to_string(), p.parse().unwrap_or(default_port(scheme)))),
			None => Some((host_header.to_string(), default_port(scheme))),
		}
	}

	async fn handle_http(self, req: Request<Incoming>, scheme: Scheme, fixed_authority: Option<(String, u16)>) -> Response<Full<Bytes>> {
		let Some((host, port)) = Self::resolve_authority(&req, scheme, &fixed_authority) else {
			return text_response(StatusCode::BAD_REQUEST, "missing host");
		};
		let started = Instant::now();
		let method = req.method().to_string();
		let path = req.uri().path().to_string();
		let query = req.uri().query().unwrap_or("").to_string();

		let mut flow = Flow::new(scheme, method.clone(), host.clone(), port, path.clone(), query.clone(), now_ns());
		flow.request_headers = headers_to_list(req.headers());

		let (_parts, body) = req.into_parts();
		flow.request_body = match collect_capped(body, self.0.config.body_cap).await {
			Ok(b) => b,
			Err(e) => {
				flow.finalize_error(started.elapsed().as_millis() as u64, e.to_string());
				self.finalize(flow).await;
				return text_response(StatusCode::BAD_REQUEST, "malformed request body");
			}
		};

		let rules = self.rules_snapshot().await;
		let outcome = rules::evaluate(&rules, &mut flow, Phase::Request);
		if outcome.blocked {
			flow.duration_ms = Some(started.elapsed().as_millis() as u64);
			let response = response_from_flow(&flow);
			self.finalize(flow).await;
			return response;
		}

		if self.0.intercept.is_enabled(InterceptPhase::Request).await {
			let decision = self.0.intercept.submit(flow.clone(), InterceptPhase::Request).await;
			flow.intercepted = true;
			match decision {
				InterceptDecision::Drop => {
					flow.finalize_error(started.elapsed().as_millis() as u64, "dropped by operator");
					self.finalize(flow).await;
					return text_response(StatusCode::FORBIDDEN, "dropped by operator");
				}
				InterceptDecision::ForwardModified(m) => apply_modified(&mut flow, m, Phase::Request),
				InterceptDecision::Forward => {}
			}
		}

		let dest = Destination::new(flow.scheme, flow.host.clone(), flow.port);
		let pq = if query.is_empty() { path.clone() } else { format!("{path}?{query}") };
		let mut builder = Request::builder().method(method.as_str()).uri(pq);
		for (name, value) in flow.request_headers.0.iter() {
			if is_hop_by_hop(name) {
				continue;
			}
			builder = builder.header(name.as_str(), value.as_str());
		}
		let out_req = match builder.body(Full::new(flow.request_body.data.clone())) {
			Ok(r) => r,
			Err(e) => {
				flow.finalize_error(started.elapsed().as_millis() as u64, e.to_string());
				self.finalize(flow).await;
				return text_response(StatusCode::BAD_GATEWAY, "failed to build upstream request");
			}
		};

		let upstream_response = match self.0.client.dispatch(&dest, out_req).await {
			Ok(r) => r,
			Err(e) => {
				flow.finalize_error(started.elapsed().as_millis() as u64, e.to_string());
				flow.response_status = Some(502);
				self.finalize(flow).await;
				return text_response(StatusCode::BAD_GATEWAY, "upstream request failed");
			}
		};

		flow.response_status = Some(upstream_response.status);
		flow.response_reason = upstream_response.reason.clone();
		flow.response_headers = HeaderList(upstream_response.headers.clone());
		flow.response_body = match collect_capped(upstream_response.body, self.0.config.body_cap).await {
			Ok(b) => b,
			Err(e) => {
				flow.finalize_error(started.elapsed().as_millis() as u64, e.to_string());
				self.finalize(flow).await;
				return text_response(StatusCode::BAD_GATEWAY, "upstream response truncated unexpectedly");
			}
		};

		rules::evaluate(&rules, &mut flow, Phase::Response);

		if self.0.intercept.is_enabled(InterceptPhase::Response).await {
			let decision = self.0.intercept.submit(flow.clone(), InterceptPhase::Response).await;
			flow.intercepted = true;
			match decision {
				InterceptDecision::Drop => flow.response_status = Some(502),
				InterceptDecision::ForwardModified(m) => apply_modified(&mut flow, m, Phase::Response),
				InterceptDecision::Forward => {}
			}
		}

		flow.duration_ms = Some(started.elapsed().as_millis() as u64);
		let response = response_from_flow(&flow);
		self.finalize(flow).await;
		response
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hop_by_hop_headers_are_filtered() {
		assert!(is_hop_by_hop("Connection"));
		assert!(is_hop_by_hop("Transfer-Encoding"));
		assert!(!is_hop_by_hop("Content-Type"));
	}

	#[test]
	fn default_ports_match_scheme() {
		assert_eq!(default_port(Scheme::Http), 80);
		assert_eq!(default_port(Scheme::Https), 443);
		assert_eq!(default_port(Scheme::Wss), 443);
	}

	#[tokio::test]
	async fn engine_reports_stopped_before_start() {
		let engine = test_engine();
		let status = engine.status().await;
		assert_eq!(status.state, EngineState::Stopped);
	}

	#[tokio::test]
	async fn start_stop_round_trips_state() {
		let engine = test_engine();
		engine.start("127.0.0.1", 0).await.unwrap();
		assert!(matches!(engine.status().await.state, EngineState::Running { .. }));
		engine.stop().await;
		assert_eq!(engine.status().await.state, EngineState::Stopped);
	}

	fn test_engine() -> ProxyEngine {
		static COUNTER: AtomicU64 = AtomicU64::new(0);
		let n = COUNTER.fetch_add(1, Ordering::SeqCst);
		let dir = std::env::temp_dir().join(format!("proxy-engine-test-{}-{n}", std::process::id()));
		let ca = Arc::new(CaStore::load_or_generate(&dir, 825).unwrap());
		ProxyEngine::new(
			EngineConfig::default(),
			ca,
			Arc::new(EventBus::new()),
			SharedInterceptCoordinator::default(),
			UpstreamClient::new(),
			crate::store::InMemoryStore::shared(),
		)
	}
}

//! Async upstream client: a hand-rolled connection pool over `hyper::client::conn::http1`, keyed
//! by (scheme, host, port), with per-request timeout, optional redirect following, and SNI
//! override for MITM legs.
//!
//! Grounded on the pack's low-level HTTP/1.1 client-connection pattern (`handshake` + spawned
//! connection-driver task + `SendRequest::send_request`), generalized with idle-connection reuse
//! and an explicit pool key instead of dialing fresh for every request.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::Full;
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::error::UpstreamError;
use crate::types::Scheme;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);

fn root_store() -> &'static rustls::RootCertStore {
	static STORE: OnceLock<rustls::RootCertStore> = OnceLock::new();
	STORE.get_or_init(|| {
		let mut store = rustls::RootCertStore::empty();
		for cert in rustls_native_certs::load_native_certs().certs {
			let _ = store.add(cert);
		}
		store
	})
}

fn tls_config() -> Arc<ClientConfig> {
	static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
	CONFIG
		.get_or_init(|| {
			Arc::new(
				ClientConfig::builder()
					.with_root_certificates(root_store().clone())
					.with_no_client_auth(),
			)
		})
		.clone()
}

/// Destination plus how to reach it; the connection pool key.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Destination {
	pub scheme: Scheme,
	pub host: String,
	pub port: u16,
	/// SNI to present on the TLS handshake, if different from `host` (MITM passthrough).
	pub sni_override: Option<String>,
}

impl Destination {
	pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
		Destination { scheme, host: host.into(), port, sni_override: None }
	}

	pub fn with_sni(mut self, sni: impl Into<String>) -> Self {
		self.sni_override = Some(sni.into());
		self
	}

	fn is_tls(&self) -> bool {
		matches!(self.scheme, Scheme::Https | Scheme::Wss)
	}

	fn sni_host(&self) -> &str {
		self.sni_override.as_deref().unwrap_or(&self.host)
	}
}

struct IdleConn {
	sender: SendRequest<Full<Bytes>>,
	parked_at: Instant,
}

/// A streaming upstream response: status, headers, and a body the caller may collect or mirror.
pub struct UpstreamResponse {
	pub status: u16,
	pub reason: Option<String>,
	pub headers: Vec<(String, String)>,
	pub body: hyper::body::Incoming,
}

/// Pooled HTTP/1.1 client used for dispatching proxied requests to the real upstream.
#[derive(Clone)]
pub struct UpstreamClient {
	idle: Arc<Mutex<HashMap<Destination, Vec<IdleConn>>>>,
	timeout: Duration,
	follow_redirects: bool,
}

impl UpstreamClient {
	pub fn new() -> Self {
		UpstreamClient {
			idle: Arc::new(Mutex::new(HashMap::new())),
			timeout: DEFAULT_TIMEOUT,
			follow_redirects: false,
		}
	}

	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;
		self
	}

	pub fn with_follow_redirects(mut self, follow: bool) -> Self {
		self.follow_redirects = follow;
		self
	}

	async fn take_idle(&self, dest: &Destination) -> Option<SendRequest<Full<Bytes>>> {
		let mut idle = self.idle.lock().await;
		let bucket = idle.get_mut(dest)?;
		while let Some(conn) = bucket.pop() {
			if conn.parked_at.elapsed() < KEEPALIVE_IDLE && !conn.sender.is_closed() {
				return Some(conn.sender);
			}
		}
		None
	}

	async fn park_idle(&self, dest: Destination, sender: SendRequest<Full<Bytes>>) {
		if sender.is_closed() {
			return;
		}
		let mut idle = self.idle.lock().await;
		idle.entry(dest).or_default().push(IdleConn { sender, parked_at: Instant::now() });
	}

	/// Dials a fresh, unpooled connection. Used directly by callers (e.g. the WebSocket upgrade
	/// path) that must not hand their connection back to the idle pool.
	pub(crate) async fn connect(&self, dest: &Destination) -> Result<SendRequest<Full<Bytes>>, UpstreamError> {
		let tcp = tokio::time::timeout(self.timeout, TcpStream::connect((dest.host.as_str(), dest.port)))
			.await
			.map_err(|_| UpstreamError::Timeout(self.timeout))?
			.map_err(|source| UpstreamError::Connect { host: dest.host.clone(), port: dest.port, source })?;

		let sender = if dest.is_tls() {
			let server_name = ServerName::try_from(dest.sni_host().to_string())
				.map_err(|e| UpstreamError::Tls { host: dest.host.clone(), source: anyhow::anyhow!(e) })?;
			let connector = TlsConnector::from(tls_config());
			let tls = connector
				.connect(server_name, tcp)
				.await
				.map_err(|e| UpstreamError::Tls { host: dest.host.clone(), source: anyhow::anyhow!(e) })?;
			let io = TokioIo::new(tls);
			let (sender, conn) = tokio::time::timeout(self.timeout, http1::handshake(io))
				.await
				.map_err(|_| UpstreamError::Timeout(self.timeout))?
				.map_err(|e| UpstreamError::Protocol(e.to_string()))?;
			tokio::spawn(async move {
				if let Err(e) = conn.await {
					debug!(error = %e, "upstream https connection driver exited");
				}
			});
			sender
		} else {
			let io = TokioIo::new(tcp);
			let (sender, conn) = tokio::time::timeout(self.timeout, http1::handshake(io))
				.await
				.map_err(|_| UpstreamError::Timeout(self.timeout))?
				.map_err(|e| UpstreamError::Protocol(e.to_string()))?;
			tokio::spawn(async move {
				if let Err(e) = conn.await {
					debug!(error = %e, "upstream http connection driver exited");
				}
			});
			sender
		};
		Ok(sender)
	}

	/// Dispatches one request. `destination.sni_override` only affects the TLS handshake, never
	/// the `Host` header or the URI sent on the wire.
	pub async fn dispatch(&self, destination: &Destination, req: http::Request<Full<Bytes>>) -> Result<UpstreamResponse, UpstreamError> {
		let mut attempt_uri = req.uri().clone();
		let mut attempt_req = req;
		let mut redirects_followed = 0;

		loop {
			let mut sender = match self.take_idle(destination).await {
				Some(s) => s,
				None => self.connect(destination).await?,
			};

			let send = sender.send_request(attempt_req.clone());
			let resp = match tokio::time::timeout(self.timeout, send).await {
				Ok(Ok(resp)) => resp,
				Ok(Err(e)) => {
					warn!(host = %destination.host, error = %e, "upstream request failed");
					return Err(UpstreamError::Protocol(e.to_string()));
				}
				Err(_) => return Err(UpstreamError::Timeout(self.timeout)),
			};

			self.park_idle(destination.clone(), sender).await;

			let status = resp.status().as_u16();
			if self.follow_redirects && (300..400).contains(&status) && redirects_followed < 5 {
				if let Some(location) = resp.headers().get(http::header::LOCATION).and_then(|v| v.to_str().ok()) {
					if let Ok(uri) = location.parse::<http::Uri>() {
						attempt_uri = uri.clone();
						*attempt_req.uri_mut() = uri;
						redirects_followed += 1;
						debug!(%attempt_uri, redirects_followed, "following redirect");
						continue;
					}
				}
			}

			let reason = resp.status().canonical_reason().map(str::to_string);
			let headers = resp
				.headers()
				.iter()
				.map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
				.collect();
			return Ok(UpstreamResponse { status, reason, headers, body: resp.into_body() });
		}
	}
}

impl Default for UpstreamClient {
	fn default() -> Self {
		Self::new()
	}
}

pub async fn collect_body(body: hyper::body::Incoming) -> Result<Bytes, UpstreamError> {
	use http_body_util::BodyExt;
	body.collect().await.map(|c| c.to_bytes()).map_err(|e| UpstreamError::Protocol(e.to_string()))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn destination_with_sni_does_not_change_host() {
		let dest = Destination::new(Scheme::Https, "example.test", 443).with_sni("override.test");
		assert_eq!(dest.host, "example.test");
		assert_eq!(dest.sni_host(), "override.test");
	}

	#[test]
	fn destination_without_sni_falls_back_to_host() {
		let dest = Destination::new(Scheme::Http, "example.test", 80);
		assert_eq!(dest.sni_host(), "example.test");
	}

	#[tokio::test]
	async fn dispatch_times_out_on_unroutable_destination() {
		let client = UpstreamClient::new().with_timeout(Duration::from_millis(50));
		let dest = Destination::new(Scheme::Http, "192.0.2.1", 81);
		let req = http::Request::builder().uri("http://192.0.2.1:81/").body(Full::new(Bytes::new())).unwrap();
		let result = client.dispatch(&dest, req).await;
		assert!(result.is_err());
	}

	#[tokio::test]
	async fn idle_pool_starts_empty() {
		let client = UpstreamClient::new();
		let dest = Destination::new(Scheme::Http, "example.test", 80);
		assert!(client.take_idle(&dest).await.is_none());
	}

	#[tokio::test]
	async fn dispatch_returns_mocked_response_and_parks_the_connection() {
		use wiremock::matchers::{method, path};
		use wiremock::{Mock, MockServer, ResponseTemplate};

		let server = MockServer::start().await;
		Mock::given(method("GET")).and(path("/hello")).respond_with(ResponseTemplate::new(200).set_body_string("hi").insert_header("X-Test", "1")).mount(&server).await;

		let addr = server.address();
		let client = UpstreamClient::new();
		let dest = Destination::new(Scheme::Http, addr.ip().to_string(), addr.port());
		let req = http::Request::builder().uri("/hello").body(Full::new(Bytes::new())).unwrap();

		let resp = client.dispatch(&dest, req).await.unwrap();
		assert_eq!(resp.status, 200);
		assert!(resp.headers.iter().any(|(k, v)| k.eq_ignore_ascii_case("x-test") && v == "1"));
		let body = collect_body(resp.body).await.unwrap();
		assert_eq!(&body[..], b"hi");

		// `dispatch` parks the connection back into the idle pool after a successful response.
		assert!(client.take_idle(&dest).await.is_some());
	}

	#[tokio::test]
	async fn dispatch_follows_redirect_when_enabled() {
		use wiremock::matchers::{method, path};
		use wiremock::{Mock, MockServer, ResponseTemplate};

		let server = MockServer::start().await;
		Mock::given(method("GET")).and(path("/old")).respond_with(ResponseTemplate::new(302).insert_header("Location", "/new")).mount(&server).await;
		Mock::given(method("GET")).and(path("/new")).respond_with(ResponseTemplate::new(200).set_body_string("moved")).mount(&server).await;

		let addr = server.address();
		let client = UpstreamClient::new().with_follow_redirects(true);
		let dest = Destination::new(Scheme::Http, addr.ip().to_string(), addr.port());
		let req = http::Request::builder().uri("/old").body(Full::new(Bytes::new())).unwrap();

		let resp = client.dispatch(&dest, req).await.unwrap();
		assert_eq!(resp.status, 200);
		let body = collect_body(resp.body).await.unwrap();
		assert_eq!(&body[..], b"moved");
	}
}

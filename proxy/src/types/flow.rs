//! The central recorded entity: one client-to-upstream HTTP(S) transaction.

use std::collections::BTreeSet;
use std::fmt;

use bytes::Bytes;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Opaque 128-bit flow identifier, minted once per transaction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowId(pub u128);

impl FlowId {
	pub fn new() -> Self {
		let mut bytes = [0u8; 16];
		rand::rng().fill_bytes(&mut bytes);
		FlowId(u128::from_le_bytes(bytes))
	}
}

impl Default for FlowId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for FlowId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:032x}", self.0)
	}
}

impl fmt::Debug for FlowId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "FlowId({self})")
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
	Http,
	Https,
	Ws,
	Wss,
}

impl fmt::Display for Scheme {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Scheme::Http => "http",
			Scheme::Https => "https",
			Scheme::Ws => "ws",
			Scheme::Wss => "wss",
		};
		write!(f, "{s}")
	}
}

/// Ordered, case-insensitive (by name) multimap preserving wire order and multiplicity.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HeaderList(pub Vec<(String, String)>);

impl HeaderList {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
		self.0.push((name.into(), value.into()));
	}

	pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
		self
			.0
			.iter()
			.filter(move |(n, _)| n.eq_ignore_ascii_case(name))
			.map(|(_, v)| v.as_str())
	}

	pub fn get<'a>(&'a self, name: &'a str) -> Option<&'a str> {
		self.get_all(name).next()
	}

	pub fn contains(&self, name: &str) -> bool {
		self.0.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
	}

	/// Removes every value for `name`. Returns how many entries were removed.
	pub fn remove(&mut self, name: &str) -> usize {
		let before = self.0.len();
		self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
		before - self.0.len()
	}

	/// Adds `(name, value)` unless that exact pair already exists.
	pub fn add_idempotent(&mut self, name: impl Into<String>, value: impl Into<String>) {
		let name = name.into();
		let value = value.into();
		let exists = self
			.0
			.iter()
			.any(|(n, v)| n.eq_ignore_ascii_case(&name) && v == &value);
		if !exists {
			self.0.push((name, value));
		}
	}

	/// Renders as `Name: value\r\n` lines, the form the body/header rule matcher uses for regex.
	pub fn to_wire_lines(&self) -> String {
		self
			.0
			.iter()
			.map(|(n, v)| format!("{n}: {v}"))
			.collect::<Vec<_>>()
			.join("\r\n")
	}
}

/// A request or response body, truncated at the configured cap.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Body {
	#[serde(with = "base64_bytes")]
	pub data: Bytes,
	pub truncated: bool,
	pub truncated_bytes: u64,
}

impl Body {
	pub fn empty() -> Self {
		Self::default()
	}

	/// Builds a body from the full byte stream, truncating at `cap` bytes.
	pub fn from_full(data: Bytes, cap: usize) -> Self {
		if data.len() <= cap {
			Body {
				data,
				truncated: false,
				truncated_bytes: 0,
			}
		} else {
			let truncated_bytes = (data.len() - cap) as u64;
			Body {
				data: data.slice(0..cap),
				truncated: true,
				truncated_bytes,
			}
		}
	}
}

mod base64_bytes {
	use base64::Engine;
	use base64::engine::general_purpose::STANDARD;
	use bytes::Bytes;
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(b: &Bytes, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_str(&STANDARD.encode(b))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
		let s = String::deserialize(d)?;
		STANDARD
			.decode(s.as_bytes())
			.map(Bytes::from)
			.map_err(serde::de::Error::custom)
	}
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WebSocketFrame {
	pub index: u64,
	pub opcode: WebSocketOpcode,
	pub direction: Direction,
	pub payload: Body,
	pub timestamp_ns: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebSocketOpcode {
	Text,
	Binary,
	Close,
	Ping,
	Pong,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
	ClientToUpstream,
	UpstreamToClient,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Flow {
	pub id: FlowId,
	pub timestamp_ns: u64,
	pub scheme: Scheme,
	pub method: String,
	pub host: String,
	pub port: u16,
	pub path: String,
	pub query: String,
	pub request_headers: HeaderList,
	pub request_body: Body,
	pub response_status: Option<u16>,
	pub response_reason: Option<String>,
	pub response_headers: HeaderList,
	pub response_body: Body,
	pub duration_ms: Option<u64>,
	pub intercepted: bool,
	pub modified: bool,
	pub tags: BTreeSet<String>,
	pub is_websocket: bool,
	pub websocket_frames: Vec<WebSocketFrame>,
	pub error: Option<String>,
	pub truncated: bool,
}

impl Flow {
	pub fn new(scheme: Scheme, method: String, host: String, port: u16, path: String, query: String, timestamp_ns: u64) -> Self {
		Flow {
			id: FlowId::new(),
			timestamp_ns,
			scheme,
			method,
			host,
			port,
			path,
			query,
			request_headers: HeaderList::new(),
			request_body: Body::empty(),
			response_status: None,
			response_reason: None,
			response_headers: HeaderList::new(),
			response_body: Body::empty(),
			duration_ms: None,
			intercepted: false,
			modified: false,
			tags: BTreeSet::new(),
			is_websocket: false,
			websocket_frames: Vec::new(),
			error: None,
			truncated: false,
		}
	}

	/// `scheme://host[:port]path?query`, the string the `url` rule matcher compares against.
	pub fn url(&self) -> String {
		let default_port = matches!(self.scheme, Scheme::Http | Scheme::Ws) && self.port == 80
			|| matches!(self.scheme, Scheme::Https | Scheme::Wss) && self.port == 443;
		let authority = if default_port {
			self.host.clone()
		} else {
			format!("{}:{}", self.host, self.port)
		};
		if self.query.is_empty() {
			format!("{}://{}{}", self.scheme, authority, self.path)
		} else {
			format!("{}://{}{}?{}", self.scheme, authority, self.path, self.query)
		}
	}

	pub fn finalize_error(&mut self, duration_ms: u64, error: impl Into<String>) {
		self.duration_ms = Some(duration_ms);
		self.error = Some(error.into());
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn url_omits_default_port() {
		let f = Flow::new(Scheme::Https, "GET".into(), "example.test".into(), 443, "/a".into(), "".into(), 0);
		assert_eq!(f.url(), "https://example.test/a");
	}

	#[test]
	fn url_includes_nondefault_port_and_query() {
		let f = Flow::new(Scheme::Http, "GET".into(), "example.test".into(), 8080, "/a".into(), "x=1".into(), 0);
		assert_eq!(f.url(), "http://example.test:8080/a?x=1");
	}

	#[test]
	fn header_list_is_case_insensitive_and_order_preserving() {
		let mut h = HeaderList::new();
		h.push("Set-Cookie", "a=1");
		h.push("set-cookie", "b=2");
		h.push("Content-Type", "text/plain");
		let cookies: Vec<_> = h.get_all("SET-COOKIE").collect();
		assert_eq!(cookies, vec!["a=1", "b=2"]);
		assert_eq!(h.0[2].0, "Content-Type");
	}

	#[test]
	fn add_idempotent_does_not_duplicate_exact_pair() {
		let mut h = HeaderList::new();
		h.add_idempotent("X-Tag", "v");
		h.add_idempotent("X-Tag", "v");
		h.add_idempotent("X-Tag", "v2");
		assert_eq!(h.0.len(), 2);
	}

	#[test]
	fn body_truncates_at_cap() {
		let data = Bytes::from(vec![1u8; 10]);
		let b = Body::from_full(data.clone(), 10);
		assert!(!b.truncated);
		assert_eq!(b.truncated_bytes, 0);

		let over = Bytes::from(vec![1u8; 11]);
		let b2 = Body::from_full(over, 10);
		assert!(b2.truncated);
		assert_eq!(b2.truncated_bytes, 1);
		assert_eq!(b2.data.len(), 10);
	}

	#[test]
	fn flow_id_round_trips_through_display() {
		let id = FlowId::new();
		let s = id.to_string();
		assert_eq!(s.len(), 32);
	}
}

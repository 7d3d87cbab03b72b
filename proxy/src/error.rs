//! Error kinds from spec §7, one `thiserror` enum per component plus an umbrella `ApiError` that
//! the HTTP facade maps to status codes.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientProtocolError {
	#[error("malformed request line: {0}")]
	MalformedRequestLine(String),
	#[error("malformed header: {0}")]
	MalformedHeader(String),
	#[error("unsupported transfer encoding: {0}")]
	UnsupportedTransferEncoding(String),
}

#[derive(Debug, Error)]
pub enum UpstreamError {
	#[error("dns resolution failed for {host}: {source}")]
	Dns { host: String, source: std::io::Error },
	#[error("tcp connect failed for {host}:{port}: {source}")]
	Connect { host: String, port: u16, source: std::io::Error },
	#[error("tls handshake failed for {host}: {source}")]
	Tls { host: String, source: anyhow::Error },
	#[error("request timed out after {0:?}")]
	Timeout(std::time::Duration),
	#[error("upstream io error: {0}")]
	Io(#[from] std::io::Error),
	#[error("upstream protocol error: {0}")]
	Protocol(String),
}

#[derive(Debug, Error)]
pub enum RuleError {
	#[error("failed to compile pattern {pattern:?}: {source}")]
	PatternCompile { pattern: String, source: regex::Error },
	#[error("rule evaluation exceeded its step budget")]
	Overrun,
}

#[derive(Debug, Error)]
pub enum InterceptError {
	#[error("no pending slot for flow {0} phase {1:?}")]
	UnknownSlot(crate::types::FlowId, crate::types::InterceptPhase),
	#[error("slot for flow {0} phase {1:?} was already resolved")]
	AlreadyResolved(crate::types::FlowId, crate::types::InterceptPhase),
}

#[derive(Debug, Error)]
pub enum StorageError {
	#[error("not found")]
	NotFound,
	#[error("storage backend error: {0}")]
	Backend(String),
}

#[derive(Debug, Error)]
pub enum AttackError {
	#[error("invalid template: {0}")]
	InvalidTemplate(String),
	#[error("empty payload set for strategy {0:?}")]
	EmptyPayloadSet(crate::types::intruder::AttackStrategy),
}

#[derive(Debug, Error)]
pub enum SpiderError {
	#[error("invalid seed url: {0}")]
	InvalidSeed(String),
	#[error("robots.txt fetch failed for {host}: {source}")]
	Robots { host: String, source: anyhow::Error },
}

#[derive(Debug, Error)]
pub enum ScanError {
	#[error("bad target: {0}")]
	BadTarget(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("invalid environment variable {name}={value}: {reason}")]
	InvalidEnv { name: String, value: String, reason: String },
	#[error("failed to bind {addr}: {source}")]
	Bind { addr: String, source: std::io::Error },
}

#[derive(Debug, Error)]
pub enum CaError {
	#[error("failed to generate root CA: {0}")]
	RootGeneration(String),
	#[error("failed to mint leaf certificate for {host}: {reason}")]
	LeafMint { host: String, reason: String },
	#[error("io error persisting CA material: {0}")]
	Io(#[from] std::io::Error),
}

/// Umbrella error surfaced at the API boundary; maps 1:1 to the HTTP statuses in spec §7.
#[derive(Debug, Error)]
pub enum ApiError {
	#[error(transparent)]
	ClientProtocol(#[from] ClientProtocolError),
	#[error(transparent)]
	Intercept(#[from] InterceptError),
	#[error(transparent)]
	Storage(#[from] StorageError),
	#[error(transparent)]
	Config(#[from] ConfigError),
	#[error(transparent)]
	Attack(#[from] AttackError),
	#[error(transparent)]
	Spider(#[from] SpiderError),
	#[error(transparent)]
	Scan(#[from] ScanError),
	#[error("{0}")]
	NotFound(String),
	#[error("{0}")]
	BadRequest(String),
}

impl ApiError {
	pub fn status(&self) -> u16 {
		match self {
			ApiError::ClientProtocol(_) | ApiError::BadRequest(_) | ApiError::Attack(_) | ApiError::Spider(_) | ApiError::Scan(_) => 400,
			ApiError::Intercept(_) => 409,
			ApiError::NotFound(_) => 404,
			ApiError::Storage(_) | ApiError::Config(_) => 500,
		}
	}
}

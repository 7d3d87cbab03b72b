use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
	Configured,
	Running,
	Paused,
	Completed,
	Error,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SpiderScope {
	pub include_patterns: Vec<String>,
	pub exclude_patterns: Vec<String>,
	pub follow_external_links: bool,
	pub respect_robots_txt: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpiderLimits {
	pub max_depth: u32,
	pub max_pages: u64,
}

impl Default for SpiderLimits {
	fn default() -> Self {
		SpiderLimits { max_depth: 3, max_pages: 1000 }
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpiderPoliteness {
	pub threads: usize,
	pub delay_ms: u64,
}

impl Default for SpiderPoliteness {
	fn default() -> Self {
		SpiderPoliteness { threads: 4, delay_ms: 0 }
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpiderSession {
	pub id: SessionId,
	pub status: SessionStatus,
	pub start_urls: Vec<String>,
	pub scope: SpiderScope,
	pub limits: SpiderLimits,
	pub politeness: SpiderPoliteness,
	pub pages_crawled: u64,
	pub pages_queued: u64,
	pub error_message: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlStatus {
	Queued,
	Crawling,
	Crawled,
	Error,
	Skipped,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpiderUrl {
	pub session_id: SessionId,
	pub url: String,
	pub depth: u32,
	pub status: UrlStatus,
	pub source_url: Option<String>,
	pub discovery_order: u64,
	pub response_status: Option<u16>,
	pub links_found: u64,
	pub forms_found: u64,
	pub error: Option<String>,
}

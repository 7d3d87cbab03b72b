//! Spider engine: crawls from a set of seed URLs, respecting scope and robots.txt, extracting
//! links from fetched HTML and feeding them back into the frontier.
//!
//! The frontier is a priority queue ordered by (depth asc, discovery_order asc), deduplicated by
//! canonical URL. Execution uses the same worker-pool/control-signal shape as the intruder
//! engine's run loop, with a per-host delay gate instead of a single global one.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::Full;
use regex::Regex;
use serde_json::json;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tracing::debug;
use url::Url;

use crate::client::{Destination, UpstreamClient};
use crate::error::SpiderError;
use crate::eventbus::{EventBus, Topic};
use crate::store::SpiderStore;
use crate::types::{Scheme, SessionId, SessionStatus, SpiderSession, SpiderUrl, UrlStatus};

fn link_regex() -> &'static Regex {
	static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
	RE.get_or_init(|| Regex::new(r#"(?is)<(a|form|script|link|img)\b[^>]*\b(?:href|src|action)\s*=\s*["']([^"']+)["']"#).unwrap())
}

/// Normalizes `url` for frontier dedup: lowercased host, default port stripped, fragment
/// dropped, query parameters sorted by key.
fn canonicalize(url: &Url) -> String {
	let mut canon = url.clone();
	canon.set_fragment(None);
	let _ = canon.set_host(url.host_str().map(str::to_lowercase).as_deref());
	if matches!((url.scheme(), url.port()), ("http", Some(80)) | ("https", Some(443))) {
		let _ = canon.set_port(None);
	}
	let mut pairs: Vec<(String, String)> = canon.query_pairs().into_owned().collect();
	pairs.sort_by(|a, b| a.0.cmp(&b.0));
	if pairs.is_empty() {
		canon.set_query(None);
	} else {
		let query = pairs.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join("&");
		canon.set_query(Some(&query));
	}
	canon.to_string()
}

#[derive(Clone)]
struct Candidate {
	url: Url,
	depth: u32,
	source_url: Option<String>,
	discovery_order: u64,
}

impl PartialEq for Candidate {
	fn eq(&self, other: &Self) -> bool {
		self.depth == other.depth && self.discovery_order == other.discovery_order
	}
}
impl Eq for Candidate {}
impl PartialOrd for Candidate {
	fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
		Some(self.cmp(other))
	}
}
impl Ord for Candidate {
	fn cmp(&self, other: &Self) -> CmpOrdering {
		// Reversed: BinaryHeap is a max-heap, frontier wants the smallest (depth, order) first.
		(other.depth, other.discovery_order).cmp(&(self.depth, self.discovery_order))
	}
}

struct Robots {
	disallow: Vec<String>,
}

impl Robots {
	fn allows(&self, path: &str) -> bool {
		!self.disallow.iter().any(|rule| !rule.is_empty() && path.starts_with(rule.as_str()))
	}

	fn parse(body: &str) -> Self {
		let mut disallow = Vec::new();
		let mut applies = false;
		for line in body.lines() {
			let line = line.split('#').next().unwrap_or("").trim();
			if let Some(agent) = line.strip_prefix("User-agent:").map(str::trim) {
				applies = agent == "*";
			} else if applies {
				if let Some(rule) = line.strip_prefix("Disallow:").map(str::trim) {
					if !rule.is_empty() {
						disallow.push(rule.to_string());
					}
				}
			}
		}
		Robots { disallow }
	}
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ControlSignal {
	Run,
	Pause,
	Stop,
}

struct RunHandle {
	control: watch::Sender<ControlSignal>,
}

struct Inner {
	client: UpstreamClient,
	store: Arc<dyn SpiderStore>,
	bus: Arc<EventBus>,
	running: AsyncMutex<HashMap<SessionId, RunHandle>>,
	next_id: AtomicU64,
}

/// Crawls one or more spider sessions concurrently, each with its own worker pool.
#[derive(Clone)]
pub struct SpiderEngine(Arc<Inner>);

impl SpiderEngine {
	pub fn new(client: UpstreamClient, store: Arc<dyn SpiderStore>, bus: Arc<EventBus>) -> Self {
		SpiderEngine(Arc::new(Inner { client, store, bus, running: AsyncMutex::new(HashMap::new()), next_id: AtomicU64::new(1) }))
	}

	pub async fn configure(&self, start_urls: Vec<String>, scope: crate::types::SpiderScope, limits: crate::types::SpiderLimits, politeness: crate::types::SpiderPoliteness) -> Result<SessionId, SpiderError> {
		for u in &start_urls {
			Url::parse(u).map_err(|e| SpiderError::InvalidSeed(format!("{u}: {e}")))?;
		}
		let id = SessionId(self.0.next_id.fetch_add(1, Ordering::Relaxed));
		let session = SpiderSession {
			id,
			status: SessionStatus::Configured,
			start_urls,
			scope,
			limits,
			politeness,
			pages_crawled: 0,
			pages_queued: 0,
			error_message: None,
		};
		self.0.store.put_session(session).await.map_err(|e| SpiderError::InvalidSeed(e.to_string()))?;
		Ok(id)
	}

	pub async fn start(&self, id: SessionId) -> Result<(), SpiderError> {
		let Some(mut session) = self.0.store.get_session(id).await.ok().flatten() else {
			return Err(SpiderError::InvalidSeed(format!("unknown session {}", id.0)));
		};

		if session.status == SessionStatus::Running {
			return Ok(());
		}
		if session.status == SessionStatus::Paused {
			if let Some(handle) = self.0.running.lock().await.get(&id) {
				let _ = handle.control.send(ControlSignal::Run);
				session.status = SessionStatus::Running;
				let _ = self.0.store.put_session(session).await;
				return Ok(());
			}
			// No live crawl task (e.g. stop() tore it down): fall through and start fresh.
		}

		session.status = SessionStatus::Running;
		self.0.store.put_session(session.clone()).await.map_err(|e| SpiderError::InvalidSeed(e.to_string()))?;

		let (control_tx, control_rx) = watch::channel(ControlSignal::Run);
		self.0.running.lock().await.insert(id, RunHandle { control: control_tx });

		let this = self.clone();
		tokio::spawn(async move { this.run_session(session, control_rx).await });
		Ok(())
	}

	pub async fn pause(&self, id: SessionId) {
		if let Some(handle) = self.0.running.lock().await.get(&id) {
			let _ = handle.control.send(ControlSignal::Pause);
		}
		if let Some(mut session) = self.0.store.get_session(id).await.ok().flatten() {
			session.status = SessionStatus::Paused;
			let _ = self.0.store.put_session(session).await;
		}
	}

	pub async fn stop(&self, id: SessionId) {
		if let Some(handle) = self.0.running.lock().await.remove(&id) {
			let _ = handle.control.send(ControlSignal::Stop);
		}
	}

	async fn run_session(self, session: SpiderSession, mut control: watch::Receiver<ControlSignal>) {
		let session_id = session.id;
		let seed_hosts: HashSet<String> = session
			.start_urls
			.iter()
			.filter_map(|u| Url::parse(u).ok())
			.filter_map(|u| u.host_str().map(str::to_lowercase))
			.collect();

		let frontier = Arc::new(AsyncMutex::new(BinaryHeap::<Candidate>::new()));
		let seen = Arc::new(AsyncMutex::new(HashSet::<String>::new()));
		let discovery_counter = Arc::new(AtomicU64::new(0));
		let robots_cache: Arc<AsyncMutex<HashMap<String, Option<Robots>>>> = Arc::new(AsyncMutex::new(HashMap::new()));
		let last_dispatch: Arc<AsyncMutex<HashMap<String, Instant>>> = Arc::new(AsyncMutex::new(HashMap::new()));
		let pages_crawled = Arc::new(AtomicU64::new(0));

		{
			let mut frontier = frontier.lock().await;
			let mut seen = seen.lock().await;
			for raw in &session.start_urls {
				if let Ok(url) = Url::parse(raw) {
					let canon = canonicalize(&url);
					if seen.insert(canon) {
						let order = discovery_counter.fetch_add(1, Ordering::Relaxed);
						frontier.push(Candidate { url, depth: 0, source_url: None, discovery_order: order });
					}
				}
			}
		}

		let threads = session.politeness.threads.max(1);
		let mut workers = Vec::with_capacity(threads);
		for _ in 0..threads {
			let this = self.clone();
			let session = session.clone();
			let seed_hosts = seed_hosts.clone();
			let frontier = frontier.clone();
			let seen = seen.clone();
			let discovery_counter = discovery_counter.clone();
			let robots_cache = robots_cache.clone();
			let last_dispatch = last_dispatch.clone();
			let pages_crawled = pages_crawled.clone();
			let mut control = control.clone();
			workers.push(tokio::spawn(async move {
				this.worker_loop(session, seed_hosts, frontier, seen, discovery_counter, robots_cache, last_dispatch, pages_crawled, &mut control).await
			}));
		}
		for w in workers {
			let _ = w.await;
		}

		self.0.running.lock().await.remove(&session_id);
		if let Some(mut stored) = self.0.store.get_session(session_id).await.ok().flatten() {
			stored.pages_crawled = pages_crawled.load(Ordering::Relaxed);
			if stored.status != SessionStatus::Error {
				stored.status = if *control.borrow() == ControlSignal::Stop { SessionStatus::Paused } else { SessionStatus::Completed };
			}
			let _ = self.0.store.put_session(stored).await;
		}
	}

	#[allow(clippy::too_many_arguments)]
	async fn worker_loop(
		&self,
		session: SpiderSession,
		seed_hosts: HashSet<String>,
		frontier: Arc<AsyncMutex<BinaryHeap<Candidate>>>,
		seen: Arc<AsyncMutex<HashSet<String>>>,
		discovery_counter: Arc<AtomicU64>,
		robots_cache: Arc<AsyncMutex<HashMap<String, Option<Robots>>>>,
		last_dispatch: Arc<AsyncMutex<HashMap<String, Instant>>>,
		pages_crawled: Arc<AtomicU64>,
		control: &mut watch::Receiver<ControlSignal>,
	) {
		loop {
			loop {
				match *control.borrow() {
					ControlSignal::Stop => return,
					ControlSignal::Pause => {}
					ControlSignal::Run => break,
				}
				if control.changed().await.is_err() {
					return;
				}
			}

			if pages_crawled.load(Ordering::Relaxed) >= session.limits.max_pages {
				return;
			}

			let candidate = { frontier.lock().await.pop() };
			let Some(candidate) = candidate else {
				// Frontier momentarily empty; another worker may still add to it, so back off briefly
				// rather than exiting immediately.
				tokio::time::sleep(Duration::from_millis(20)).await;
				if frontier.lock().await.is_empty() {
					return;
				}
				continue;
			};

			let host = candidate.url.host_str().unwrap_or_default().to_lowercase();
			if let Some(gate) = last_dispatch.lock().await.get(&host) {
				let wait = Duration::from_millis(session.politeness.delay_ms).saturating_sub(gate.elapsed());
				if !wait.is_zero() {
					tokio::time::sleep(wait).await;
				}
			}
			last_dispatch.lock().await.insert(host.clone(), Instant::now());

			self.crawl_one(&session, &seed_hosts, candidate, &frontier, &seen, &discovery_counter, &robots_cache).await;
			pages_crawled.fetch_add(1, Ordering::Relaxed);
			self.0
				.bus
				.publish(Topic::SpiderProgress, json!({"session_id": session.id.0, "pages_crawled": pages_crawled.load(Ordering::Relaxed)}))
				.await;
		}
	}

	async fn crawl_one(
		&self,
		session: &SpiderSession,
		seed_hosts: &HashSet<String>,
		candidate: Candidate,
		frontier: &Arc<AsyncMutex<BinaryHeap<Candidate>>>,
		seen: &Arc<AsyncMutex<HashSet<String>>>,
		discovery_counter: &Arc<AtomicU64>,
		robots_cache: &Arc<AsyncMutex<HashMap<String, Option<Robots>>>>,
	) {
		let discovery_order = candidate.discovery_order;
		let mut record = SpiderUrl {
			session_id: session.id,
			url: candidate.url.to_string(),
			depth: candidate.depth,
			status: UrlStatus::Crawling,
			source_url: candidate.source_url.clone(),
			discovery_order,
			response_status: None,
			links_found: 0,
			forms_found: 0,
			error: None,
		};

		if session.scope.respect_robots_txt {
			let host = candidate.url.host_str().unwrap_or_default().to_string();
			let allowed = self.robots_allow(&host, candidate.url.scheme(), candidate.url.path(), robots_cache).await;
			if !allowed {
				record.status = UrlStatus::Skipped;
				let _ = self.0.store.put_url(record).await;
				return;
			}
		}

		let dest = match destination_for(&candidate.url) {
			Some(d) => d,
			None => {
				record.status = UrlStatus::Error;
				record.error = Some("unsupported scheme".into());
				let _ = self.0.store.put_url(record).await;
				return;
			}
		};

		let req = match http::Request::builder().method("GET").uri(candidate.url.path().to_string() + &candidate.url.query().map(|q| format!("?{q}")).unwrap_or_default()).body(Full::new(Bytes::new())) {
			Ok(r) => r,
			Err(e) => {
				record.status = UrlStatus::Error;
				record.error = Some(e.to_string());
				let _ = self.0.store.put_url(record).await;
				return;
			}
		};

		match self.0.client.dispatch(&dest, req).await {
			Ok(resp) => {
				record.response_status = Some(resp.status);
				let is_html = resp.headers.iter().any(|(n, v)| n.eq_ignore_ascii_case("content-type") && v.contains("html"));
				let body = crate::client::collect_body(resp.body).await;
				match body {
					Ok(bytes) if is_html => {
						let text = String::from_utf8_lossy(&bytes);
						let (links, forms) = self.expand_links(session, seed_hosts, &candidate, &text, frontier, seen, discovery_counter).await;
						record.links_found = links;
						record.forms_found = forms;
						record.status = UrlStatus::Crawled;
					}
					Ok(_) => record.status = UrlStatus::Crawled,
					Err(e) => {
						record.status = UrlStatus::Error;
						record.error = Some(e.to_string());
					}
				}
			}
			Err(e) => {
				record.status = UrlStatus::Error;
				record.error = Some(e.to_string());
			}
		}

		let _ = self.0.store.put_url(record).await;
	}

	async fn robots_allow(&self, host: &str, scheme: &str, path: &str, cache: &Arc<AsyncMutex<HashMap<String, Option<Robots>>>>) -> bool {
		{
			let cache = cache.lock().await;
			if let Some(entry) = cache.get(host) {
				return entry.as_ref().is_none_or(|r| r.allows(path));
			}
		}
		let fetched = self.fetch_robots(host, scheme).await;
		let allowed = fetched.as_ref().is_none_or(|r| r.allows(path));
		cache.lock().await.insert(host.to_string(), fetched);
		allowed
	}

	async fn fetch_robots(&self, host: &str, scheme: &str) -> Option<Robots> {
		let url = Url::parse(&format!("{scheme}://{host}/robots.txt")).ok()?;
		let dest = destination_for(&url)?;
		let req = http::Request::builder().method("GET").uri("/robots.txt").body(Full::new(Bytes::new())).ok()?;
		match self.0.client.dispatch(&dest, req).await {
			Ok(resp) if resp.status == 200 => {
				let bytes = crate::client::collect_body(resp.body).await.ok()?;
				Some(Robots::parse(&String::from_utf8_lossy(&bytes)))
			}
			Ok(_) => None,
			Err(e) => {
				debug!(host, error = %e, "robots.txt fetch failed, treating as allow-all");
				None
			}
		}
	}

	#[allow(clippy::too_many_arguments)]
	async fn expand_links(
		&self,
		session: &SpiderSession,
		seed_hosts: &HashSet<String>,
		from: &Candidate,
		html: &str,
		frontier: &Arc<AsyncMutex<BinaryHeap<Candidate>>>,
		seen: &Arc<AsyncMutex<HashSet<String>>>,
		discovery_counter: &Arc<AtomicU64>,
	) -> (u64, u64) {
		let mut links = 0u64;
		let mut forms = 0u64;
		let next_depth = from.depth + 1;

		for caps in link_regex().captures_iter(html) {
			let tag = &caps[1];
			let raw = &caps[2];
			if tag.eq_ignore_ascii_case("form") {
				forms += 1;
			}
			let Ok(resolved) = from.url.join(raw) else { continue };
			if !matches!(resolved.scheme(), "http" | "https") {
				continue;
			}
			links += 1;

			let canon = canonicalize(&resolved);
			let mut seen_guard = seen.lock().await;
			if !seen_guard.insert(canon) {
				continue;
			}
			drop(seen_guard);

			if !in_scope(session, seed_hosts, &resolved, next_depth) {
				let order = discovery_counter.fetch_add(1, Ordering::Relaxed);
				let skipped = SpiderUrl {
					session_id: session.id,
					url: resolved.to_string(),
					depth: next_depth,
					status: UrlStatus::Skipped,
					source_url: Some(from.url.to_string()),
					discovery_order: order,
					response_status: None,
					links_found: 0,
					forms_found: 0,
					error: None,
				};
				let _ = self.0.store.put_url(skipped).await;
				continue;
			}
			let order = discovery_counter.fetch_add(1, Ordering::Relaxed);
			frontier.lock().await.push(Candidate { url: resolved, depth: next_depth, source_url: Some(from.url.to_string()), discovery_order: order });
		}
		(links, forms)
	}
}

fn in_scope(session: &SpiderSession, seed_hosts: &HashSet<String>, url: &Url, depth: u32) -> bool {
	if depth > session.limits.max_depth {
		return false;
	}
	let host = url.host_str().unwrap_or_default().to_lowercase();
	if !session.scope.follow_external_links && !seed_hosts.contains(&host) {
		return false;
	}
	let url_str = url.as_str();
	let includes_ok = session.scope.include_patterns.is_empty() || session.scope.include_patterns.iter().any(|p| matches_pattern(p, url_str));
	if !includes_ok {
		return false;
	}
	!session.scope.exclude_patterns.iter().any(|p| matches_pattern(p, url_str))
}

fn matches_pattern(pattern: &str, url: &str) -> bool {
	Regex::new(&regex::escape(pattern).replace(r"\*", ".*")).map(|re| re.is_match(url)).unwrap_or_else(|_| url.contains(pattern))
}

fn destination_for(url: &Url) -> Option<Destination> {
	let scheme = match url.scheme() {
		"http" => Scheme::Http,
		"https" => Scheme::Https,
		_ => return None,
	};
	let host = url.host_str()?.to_string();
	let port = url.port_or_known_default()?;
	Some(Destination::new(scheme, host, port))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::{SpiderLimits, SpiderPoliteness, SpiderScope};

	#[test]
	fn canonicalize_strips_default_port_and_sorts_query() {
		let a = Url::parse("HTTP://Example.test:80/path?b=2&a=1").unwrap();
		let b = Url::parse("http://example.test/path?a=1&b=2").unwrap();
		assert_eq!(canonicalize(&a), canonicalize(&b));
	}

	#[test]
	fn robots_parse_respects_user_agent_star_only() {
		let robots = Robots::parse("User-agent: other\nDisallow: /a\nUser-agent: *\nDisallow: /private\n");
		assert!(!robots.allows("/private/x"));
		assert!(robots.allows("/a"));
	}

	#[test]
	fn in_scope_rejects_over_depth_and_external_host() {
		let session = SpiderSession {
			id: SessionId(1),
			status: SessionStatus::Configured,
			start_urls: vec!["http://seed.test/".into()],
			scope: SpiderScope { follow_external_links: false, ..Default::default() },
			limits: SpiderLimits { max_depth: 1, max_pages: 10 },
			politeness: SpiderPoliteness::default(),
			pages_crawled: 0,
			pages_queued: 0,
			error_message: None,
		};
		let seed_hosts: HashSet<String> = ["seed.test".to_string()].into_iter().collect();
		let internal = Url::parse("http://seed.test/page").unwrap();
		let external = Url::parse("http://other.test/page").unwrap();
		assert!(in_scope(&session, &seed_hosts, &internal, 1));
		assert!(!in_scope(&session, &seed_hosts, &external, 1));
		assert!(!in_scope(&session, &seed_hosts, &internal, 2));
	}

	#[test]
	fn link_regex_finds_anchor_and_form_and_script() {
		let html = r#"<a href="/x">x</a><form action="/submit"></form><script src="/a.js"></script>"#;
		let caps: Vec<_> = link_regex().captures_iter(html).map(|c| c[2].to_string()).collect();
		assert_eq!(caps, vec!["/x".to_string(), "/submit".to_string(), "/a.js".to_string()]);
	}
}

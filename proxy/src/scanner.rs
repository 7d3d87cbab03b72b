//! Scanner engine: runs passive and active checks against flows, emitting deduplicated
//! `ScanIssue`s to storage and the event bus.
//!
//! Checks are small, independent units behind the `Check` trait so new ones can be added without
//! touching the dispatch loop. Passive checks only read the flow already on hand; active checks
//! may issue additional probes through the upstream client.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::client::{Destination, UpstreamClient};
use crate::error::ScanError;
use crate::eventbus::{EventBus, Topic};
use crate::store::ScanStore;
use crate::types::{CheckCategory, Confidence, Flow, IssueId, IssueStatus, ScanIssue, Scheme, Severity};

fn now_ns() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0)
}

/// One finding awaiting an id and timestamps, produced by a `Check`.
pub struct Finding {
	pub check_id: &'static str,
	pub parameter: Option<String>,
	pub severity: Severity,
	pub confidence: Confidence,
	pub evidence: String,
	pub payload: Option<String>,
	pub remediation: &'static str,
}

#[async_trait]
pub trait Check: Send + Sync {
	fn id(&self) -> &'static str;
	fn category(&self) -> CheckCategory;
	async fn run(&self, flow: &Flow, client: &UpstreamClient) -> Vec<Finding>;
}

/// Flags responses missing common hardening headers.
pub struct MissingSecurityHeaders;

#[async_trait]
impl Check for MissingSecurityHeaders {
	fn id(&self) -> &'static str {
		"missing-security-headers"
	}
	fn category(&self) -> CheckCategory {
		CheckCategory::Passive
	}
	async fn run(&self, flow: &Flow, _client: &UpstreamClient) -> Vec<Finding> {
		if flow.response_status.is_none() {
			return Vec::new();
		}
		const HEADERS: &[(&str, &str)] = &[
			("x-content-type-options", "add `X-Content-Type-Options: nosniff`"),
			("content-security-policy", "add a `Content-Security-Policy` header"),
			("strict-transport-security", "add `Strict-Transport-Security` for HTTPS responses"),
		];
		HEADERS
			.iter()
			.filter(|(name, _)| !flow.response_headers.contains(name))
			.map(|(name, remediation)| Finding {
				check_id: "missing-security-headers",
				parameter: None,
				severity: Severity::Low,
				confidence: Confidence::Certain,
				evidence: format!("response missing {name} header"),
				payload: None,
				remediation,
			})
			.collect()
	}
}

/// Flags a `Server`/`X-Powered-By` header that discloses specific software versions.
pub struct ServerHeaderDisclosure;

#[async_trait]
impl Check for ServerHeaderDisclosure {
	fn id(&self) -> &'static str {
		"server-header-disclosure"
	}
	fn category(&self) -> CheckCategory {
		CheckCategory::Passive
	}
	async fn run(&self, flow: &Flow, _client: &UpstreamClient) -> Vec<Finding> {
		["server", "x-powered-by"]
			.iter()
			.filter_map(|name| flow.response_headers.get(name).map(|v| (*name, v.to_string())))
			.filter(|(_, value)| value.chars().any(|c| c.is_ascii_digit()))
			.map(|(name, value)| Finding {
				check_id: "server-header-disclosure",
				parameter: None,
				severity: Severity::Info,
				confidence: Confidence::Firm,
				evidence: format!("{name}: {value}"),
				payload: None,
				remediation: "suppress or genericize version-identifying response headers",
			})
			.collect()
	}
}

/// Active check: appends a unique marker to each query parameter and flags it if the marker
/// comes back unescaped in the response body (classic reflected-injection probe).
pub struct ReflectedParameter;

#[async_trait]
impl Check for ReflectedParameter {
	fn id(&self) -> &'static str {
		"reflected-parameter"
	}
	fn category(&self) -> CheckCategory {
		CheckCategory::Active
	}
	async fn run(&self, flow: &Flow, client: &UpstreamClient) -> Vec<Finding> {
		if flow.query.is_empty() {
			return Vec::new();
		}
		let scheme = if matches!(flow.scheme, crate::types::Scheme::Https) { Scheme::Https } else { Scheme::Http };
		let dest = Destination::new(scheme, flow.host.clone(), flow.port);
		let mut findings = Vec::new();

		for pair in flow.query.split('&') {
			let Some((name, _)) = pair.split_once('=') else { continue };
			let marker = format!("scan{}xyz", name.len());
			let probe_query = flow
				.query
				.split('&')
				.map(|p| match p.split_once('=') {
					Some((n, _)) if n == name => format!("{n}={marker}"),
					_ => p.to_string(),
				})
				.collect::<Vec<_>>()
				.join("&");
			let uri = format!("{}?{}", flow.path, probe_query);

			let req = match http::Request::builder().method("GET").uri(uri.clone()).body(Full::new(Bytes::new())) {
				Ok(r) => r,
				Err(_) => continue,
			};
			let Ok(resp) = client.dispatch(&dest, req).await else { continue };
			let Ok(body) = crate::client::collect_body(resp.body).await else { continue };
			if String::from_utf8_lossy(&body).contains(&marker) {
				findings.push(Finding {
					check_id: "reflected-parameter",
					parameter: Some(name.to_string()),
					severity: Severity::Medium,
					confidence: Confidence::Tentative,
					evidence: format!("marker {marker} reflected unescaped in response body"),
					payload: Some(marker),
					remediation: "HTML-encode user input before reflecting it into response bodies",
				});
			}
		}
		findings
	}
}

fn default_checks() -> Vec<Arc<dyn Check>> {
	vec![Arc::new(MissingSecurityHeaders), Arc::new(ServerHeaderDisclosure), Arc::new(ReflectedParameter)]
}

struct Inner {
	client: UpstreamClient,
	store: Arc<dyn ScanStore>,
	bus: Arc<EventBus>,
	checks: Vec<Arc<dyn Check>>,
	concurrency: Arc<Semaphore>,
	next_id: std::sync::atomic::AtomicU64,
}

/// Runs enabled checks against a flow, up to a configurable concurrency cap.
#[derive(Clone)]
pub struct ScannerEngine(Arc<Inner>);

impl ScannerEngine {
	pub fn new(client: UpstreamClient, store: Arc<dyn ScanStore>, bus: Arc<EventBus>, max_concurrent_checks: usize) -> Self {
		ScannerEngine(Arc::new(Inner {
			client,
			store,
			bus,
			checks: default_checks(),
			concurrency: Arc::new(Semaphore::new(max_concurrent_checks.max(1))),
			next_id: std::sync::atomic::AtomicU64::new(1),
		}))
	}

	/// Scans `flow` with the named checks (empty = all registered checks). Returns the issues
	/// upserted this run (may be fewer than findings, due to in-run dedup against the store).
	pub async fn scan_flow(&self, flow: Flow, enabled: &[String]) -> Result<Vec<ScanIssue>, ScanError> {
		if flow.host.is_empty() {
			return Err(ScanError::BadTarget("flow has no host".into()));
		}
		let selected: Vec<Arc<dyn Check>> = self.0.checks.iter().filter(|c| enabled.is_empty() || enabled.iter().any(|e| e == c.id())).cloned().collect();

		let mut handles = Vec::with_capacity(selected.len());
		for check in selected {
			let this = self.clone();
			let flow = flow.clone();
			handles.push(tokio::spawn(async move {
				let _permit = this.0.concurrency.acquire().await.expect("scanner semaphore never closes");
				check.run(&flow, &this.0.client).await
			}));
		}

		let mut issues = Vec::new();
		for handle in handles {
			let findings = handle.await.unwrap_or_default();
			for finding in findings {
				let now = now_ns();
				let issue = ScanIssue {
					id: IssueId(self.0.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed)),
					check_id: finding.check_id.to_string(),
					url: flow.url(),
					parameter: finding.parameter,
					severity: finding.severity,
					confidence: finding.confidence,
					evidence: finding.evidence,
					payload: finding.payload,
					remediation: finding.remediation.to_string(),
					status: IssueStatus::New,
					first_seen_ns: now,
					last_seen_ns: now,
				};
				if let Err(e) = self.0.store.upsert_issue(issue.clone()).await {
					warn!(error = %e, "failed to persist scan issue");
					continue;
				}
				self.0.bus.publish(Topic::ScanProgress, json!({"check_id": issue.check_id, "url": issue.url, "severity": issue.severity})).await;
				issues.push(issue);
			}
		}
		Ok(issues)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::HeaderList;

	fn flow_with_headers(headers: &[(&str, &str)], status: u16) -> Flow {
		let mut flow = Flow::new(crate::types::Scheme::Https, "GET".into(), "example.test".into(), 443, "/".into(), String::new(), 0);
		flow.response_status = Some(status);
		let mut list = HeaderList::new();
		for (n, v) in headers {
			list.push(*n, *v);
		}
		flow.response_headers = list;
		flow
	}

	#[tokio::test]
	async fn missing_security_headers_flags_all_three_when_absent() {
		let flow = flow_with_headers(&[], 200);
		let findings = MissingSecurityHeaders.run(&flow, &UpstreamClient::new()).await;
		assert_eq!(findings.len(), 3);
	}

	#[tokio::test]
	async fn missing_security_headers_silent_when_present() {
		let flow = flow_with_headers(&[("x-content-type-options", "nosniff"), ("content-security-policy", "default-src 'self'"), ("strict-transport-security", "max-age=1")], 200);
		let findings = MissingSecurityHeaders.run(&flow, &UpstreamClient::new()).await;
		assert!(findings.is_empty());
	}

	#[tokio::test]
	async fn server_header_disclosure_flags_versioned_server_header() {
		let flow = flow_with_headers(&[("server", "nginx/1.18.0")], 200);
		let findings = ServerHeaderDisclosure.run(&flow, &UpstreamClient::new()).await;
		assert_eq!(findings.len(), 1);
	}
}

//! Storage interface: one async trait per entity family, plus an in-memory reference
//! implementation backing tests and the default binary config when no database is configured.
//!
//! Grounded on the ambient-stack decision (no ORM, no lazy relations): `InMemoryStore` is a
//! plain `Arc<RwLock<HashMap/Vec>>` bundle, matching the teacher's preference for explicit,
//! inspectable state over an object-relational layer.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StorageError;
use crate::types::{Collection, CollectionId, Flow, FlowId, HostSiteMap, IntruderAttack, IntruderResult, Rule, RuleId, ScanIssue, SpiderSession, SpiderUrl};

#[derive(Clone, Debug, Default)]
pub struct FlowFilter {
	pub method: Option<String>,
	pub host: Option<String>,
	pub status_code: Option<u16>,
	pub search: Option<String>,
	pub is_websocket: Option<bool>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Paging {
	pub limit: Option<usize>,
	pub offset: usize,
}

#[async_trait]
pub trait FlowStore: Send + Sync {
	async fn put_flow(&self, flow: Flow) -> Result<FlowId, StorageError>;
	async fn get_flow(&self, id: FlowId) -> Result<Option<Flow>, StorageError>;
	async fn list_flows(&self, filter: &FlowFilter, paging: Paging) -> Result<Vec<Flow>, StorageError>;
	async fn delete_flow(&self, id: FlowId) -> Result<bool, StorageError>;
	async fn clear_flows(&self) -> Result<(), StorageError>;
	async fn tag_flow(&self, id: FlowId, tags: Vec<String>) -> Result<bool, StorageError>;
}

#[async_trait]
pub trait RuleStore: Send + Sync {
	async fn list_rules(&self) -> Result<Vec<Rule>, StorageError>;
	async fn put_rule(&self, rule: Rule) -> Result<RuleId, StorageError>;
	async fn patch_rule(&self, id: RuleId, patch: RulePatch) -> Result<Option<Rule>, StorageError>;
	async fn delete_rule(&self, id: RuleId) -> Result<bool, StorageError>;
	async fn toggle_rule(&self, id: RuleId) -> Result<Option<bool>, StorageError>;
}

#[derive(Clone, Debug, Default, serde::Deserialize)]
pub struct RulePatch {
	pub name: Option<String>,
	pub enabled: Option<bool>,
	pub priority: Option<i32>,
	pub match_pattern: Option<String>,
	pub action_value: Option<String>,
}

#[async_trait]
pub trait AttackStore: Send + Sync {
	async fn put_attack(&self, attack: IntruderAttack) -> Result<(), StorageError>;
	async fn get_attack(&self, id: crate::types::AttackId) -> Result<Option<IntruderAttack>, StorageError>;
	async fn list_attacks(&self) -> Result<Vec<IntruderAttack>, StorageError>;
	async fn put_result(&self, result: IntruderResult) -> Result<(), StorageError>;
	async fn list_results(&self, attack_id: crate::types::AttackId) -> Result<Vec<IntruderResult>, StorageError>;
}

#[async_trait]
pub trait SpiderStore: Send + Sync {
	async fn put_session(&self, session: SpiderSession) -> Result<(), StorageError>;
	async fn get_session(&self, id: crate::types::SessionId) -> Result<Option<SpiderSession>, StorageError>;
	async fn list_sessions(&self) -> Result<Vec<SpiderSession>, StorageError>;
	async fn put_url(&self, url: SpiderUrl) -> Result<(), StorageError>;
	async fn list_urls(&self, session_id: crate::types::SessionId) -> Result<Vec<SpiderUrl>, StorageError>;
}

#[async_trait]
pub trait ScanStore: Send + Sync {
	/// Inserts or updates `issue`, deduplicating on `issue.dedup_key()` and bumping `last_seen`
	/// on a repeat (§4.9 idempotence).
	async fn upsert_issue(&self, issue: ScanIssue) -> Result<(), StorageError>;
	async fn list_issues(&self) -> Result<Vec<ScanIssue>, StorageError>;
}

#[async_trait]
pub trait SiteMapStore: Send + Sync {
	async fn put_sitemap(&self, map: HostSiteMap) -> Result<(), StorageError>;
	async fn get_sitemap(&self, host: &str) -> Result<Option<HostSiteMap>, StorageError>;
	async fn list_sitemaps(&self) -> Result<Vec<HostSiteMap>, StorageError>;
}

#[async_trait]
pub trait CollectionStore: Send + Sync {
	async fn list_collections(&self) -> Result<Vec<Collection>, StorageError>;
	async fn put_collection(&self, collection: Collection) -> Result<CollectionId, StorageError>;
	async fn delete_collection(&self, id: CollectionId) -> Result<bool, StorageError>;
	async fn add_item(&self, id: CollectionId, flow_id: FlowId) -> Result<Option<Collection>, StorageError>;
	async fn remove_item(&self, id: CollectionId, flow_id: FlowId) -> Result<Option<Collection>, StorageError>;
}

#[derive(Default)]
struct Tables {
	flows: HashMap<FlowId, Flow>,
	flow_order: Vec<FlowId>,
	rules: HashMap<RuleId, Rule>,
	attacks: HashMap<crate::types::AttackId, IntruderAttack>,
	attack_results: HashMap<crate::types::AttackId, Vec<IntruderResult>>,
	spider_sessions: HashMap<crate::types::SessionId, SpiderSession>,
	spider_urls: HashMap<crate::types::SessionId, Vec<SpiderUrl>>,
	scan_issues: HashMap<(String, String, Option<String>, String), ScanIssue>,
	sitemaps: HashMap<String, HostSiteMap>,
	collections: HashMap<CollectionId, Collection>,
	next_collection_id: u64,
}

/// Plain in-process store backing the default binary config and the test suite.
pub struct InMemoryStore {
	tables: RwLock<Tables>,
}

impl Default for InMemoryStore {
	fn default() -> Self {
		Self::new()
	}
}

impl InMemoryStore {
	pub fn new() -> Self {
		InMemoryStore { tables: RwLock::new(Tables::default()) }
	}

	pub fn shared() -> Arc<Self> {
		Arc::new(Self::new())
	}
}

#[async_trait]
impl FlowStore for InMemoryStore {
	async fn put_flow(&self, flow: Flow) -> Result<FlowId, StorageError> {
		let mut t = self.tables.write().await;
		let id = flow.id;
		if !t.flows.contains_key(&id) {
			t.flow_order.push(id);
		}
		t.flows.insert(id, flow);
		Ok(id)
	}

	async fn get_flow(&self, id: FlowId) -> Result<Option<Flow>, StorageError> {
		Ok(self.tables.read().await.flows.get(&id).cloned())
	}

	async fn list_flows(&self, filter: &FlowFilter, paging: Paging) -> Result<Vec<Flow>, StorageError> {
		let t = self.tables.read().await;
		let matches = |f: &Flow| -> bool {
			if let Some(m) = &filter.method {
				if !f.method.eq_ignore_ascii_case(m) {
					return false;
				}
			}
			if let Some(h) = &filter.host {
				if &f.host != h {
					return false;
				}
			}
			if let Some(s) = filter.status_code {
				if f.response_status != Some(s) {
					return false;
				}
			}
			if let Some(ws) = filter.is_websocket {
				if f.is_websocket != ws {
					return false;
				}
			}
			if let Some(q) = &filter.search {
				if !f.url().contains(q.as_str()) {
					return false;
				}
			}
			true
		};
		let all: Vec<Flow> = t.flow_order.iter().rev().filter_map(|id| t.flows.get(id)).filter(|f| matches(f)).cloned().collect();
		let limit = paging.limit.unwrap_or(all.len());
		Ok(all.into_iter().skip(paging.offset).take(limit).collect())
	}

	async fn delete_flow(&self, id: FlowId) -> Result<bool, StorageError> {
		let mut t = self.tables.write().await;
		t.flow_order.retain(|f| *f != id);
		Ok(t.flows.remove(&id).is_some())
	}

	async fn clear_flows(&self) -> Result<(), StorageError> {
		let mut t = self.tables.write().await;
		t.flows.clear();
		t.flow_order.clear();
		Ok(())
	}

	async fn tag_flow(&self, id: FlowId, tags: Vec<String>) -> Result<bool, StorageError> {
		let mut t = self.tables.write().await;
		match t.flows.get_mut(&id) {
			Some(flow) => {
				flow.tags.extend(tags);
				Ok(true)
			}
			None => Ok(false),
		}
	}
}

#[async_trait]
impl RuleStore for InMemoryStore {
	async fn list_rules(&self) -> Result<Vec<Rule>, StorageError> {
		let t = self.tables.read().await;
		let mut rules: Vec<Rule> = t.rules.values().cloned().collect();
		rules.sort_by_key(|r| r.evaluation_key());
		Ok(rules)
	}

	async fn put_rule(&self, rule: Rule) -> Result<RuleId, StorageError> {
		let mut t = self.tables.write().await;
		let id = rule.id;
		t.rules.insert(id, rule);
		Ok(id)
	}

	async fn patch_rule(&self, id: RuleId, patch: RulePatch) -> Result<Option<Rule>, StorageError> {
		let mut t = self.tables.write().await;
		let Some(rule) = t.rules.get_mut(&id) else { return Ok(None) };
		if let Some(name) = patch.name {
			rule.name = name;
		}
		if let Some(enabled) = patch.enabled {
			rule.enabled = enabled;
		}
		if let Some(priority) = patch.priority {
			rule.priority = priority;
		}
		if let Some(pattern) = patch.match_pattern {
			rule.match_pattern = pattern;
		}
		if let Some(value) = patch.action_value {
			rule.action_value = value;
		}
		Ok(Some(rule.clone()))
	}

	async fn delete_rule(&self, id: RuleId) -> Result<bool, StorageError> {
		Ok(self.tables.write().await.rules.remove(&id).is_some())
	}

	async fn toggle_rule(&self, id: RuleId) -> Result<Option<bool>, StorageError> {
		let mut t = self.tables.write().await;
		let Some(rule) = t.rules.get_mut(&id) else { return Ok(None) };
		rule.enabled = !rule.enabled;
		Ok(Some(rule.enabled))
	}
}

#[async_trait]
impl AttackStore for InMemoryStore {
	async fn put_attack(&self, attack: IntruderAttack) -> Result<(), StorageError> {
		self.tables.write().await.attacks.insert(attack.id, attack);
		Ok(())
	}

	async fn get_attack(&self, id: crate::types::AttackId) -> Result<Option<IntruderAttack>, StorageError> {
		Ok(self.tables.read().await.attacks.get(&id).cloned())
	}

	async fn list_attacks(&self) -> Result<Vec<IntruderAttack>, StorageError> {
		Ok(self.tables.read().await.attacks.values().cloned().collect())
	}

	async fn put_result(&self, result: IntruderResult) -> Result<(), StorageError> {
		self.tables.write().await.attack_results.entry(result.attack_id).or_default().push(result);
		Ok(())
	}

	async fn list_results(&self, attack_id: crate::types::AttackId) -> Result<Vec<IntruderResult>, StorageError> {
		Ok(self.tables.read().await.attack_results.get(&attack_id).cloned().unwrap_or_default())
	}
}

#[async_trait]
impl SpiderStore for InMemoryStore {
	async fn put_session(&self, session: SpiderSession) -> Result<(), StorageError> {
		self.tables.write().await.spider_sessions.insert(session.id, session);
		Ok(())
	}

	async fn get_session(&self, id: crate::types::SessionId) -> Result<Option<SpiderSession>, StorageError> {
		Ok(self.tables.read().await.spider_sessions.get(&id).cloned())
	}

	async fn list_sessions(&self) -> Result<Vec<SpiderSession>, StorageError> {
		Ok(self.tables.read().await.spider_sessions.values().cloned().collect())
	}

	async fn put_url(&self, url: SpiderUrl) -> Result<(), StorageError> {
		self.tables.write().await.spider_urls.entry(url.session_id).or_default().push(url);
		Ok(())
	}

	async fn list_urls(&self, session_id: crate::types::SessionId) -> Result<Vec<SpiderUrl>, StorageError> {
		Ok(self.tables.read().await.spider_urls.get(&session_id).cloned().unwrap_or_default())
	}
}

#[async_trait]
impl ScanStore for InMemoryStore {
	async fn upsert_issue(&self, issue: ScanIssue) -> Result<(), StorageError> {
		let mut t = self.tables.write().await;
		let key = issue.dedup_key();
		match t.scan_issues.get_mut(&key) {
			Some(existing) => existing.last_seen_ns = issue.last_seen_ns,
			None => {
				t.scan_issues.insert(key, issue);
			}
		}
		Ok(())
	}

	async fn list_issues(&self) -> Result<Vec<ScanIssue>, StorageError> {
		Ok(self.tables.read().await.scan_issues.values().cloned().collect())
	}
}

#[async_trait]
impl SiteMapStore for InMemoryStore {
	async fn put_sitemap(&self, map: HostSiteMap) -> Result<(), StorageError> {
		self.tables.write().await.sitemaps.insert(map.host.clone(), map);
		Ok(())
	}

	async fn get_sitemap(&self, host: &str) -> Result<Option<HostSiteMap>, StorageError> {
		Ok(self.tables.read().await.sitemaps.get(host).cloned())
	}

	async fn list_sitemaps(&self) -> Result<Vec<HostSiteMap>, StorageError> {
		Ok(self.tables.read().await.sitemaps.values().cloned().collect())
	}
}

#[async_trait]
impl CollectionStore for InMemoryStore {
	async fn list_collections(&self) -> Result<Vec<Collection>, StorageError> {
		Ok(self.tables.read().await.collections.values().cloned().collect())
	}

	async fn put_collection(&self, mut collection: Collection) -> Result<CollectionId, StorageError> {
		let mut t = self.tables.write().await;
		if collection.id.0 == 0 {
			t.next_collection_id += 1;
			collection.id = CollectionId(t.next_collection_id);
		}
		let id = collection.id;
		t.collections.insert(id, collection);
		Ok(id)
	}

	async fn delete_collection(&self, id: CollectionId) -> Result<bool, StorageError> {
		Ok(self.tables.write().await.collections.remove(&id).is_some())
	}

	async fn add_item(&self, id: CollectionId, flow_id: FlowId) -> Result<Option<Collection>, StorageError> {
		let mut t = self.tables.write().await;
		let Some(collection) = t.collections.get_mut(&id) else { return Ok(None) };
		if !collection.item_flow_ids.contains(&flow_id) {
			collection.item_flow_ids.push(flow_id);
		}
		Ok(Some(collection.clone()))
	}

	async fn remove_item(&self, id: CollectionId, flow_id: FlowId) -> Result<Option<Collection>, StorageError> {
		let mut t = self.tables.write().await;
		let Some(collection) = t.collections.get_mut(&id) else { return Ok(None) };
		collection.item_flow_ids.retain(|f| *f != flow_id);
		Ok(Some(collection.clone()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::Scheme;

	fn flow(host: &str) -> Flow {
		Flow::new(Scheme::Https, "GET".into(), host.into(), 443, "/".into(), "".into(), 0)
	}

	#[tokio::test]
	async fn put_and_get_round_trips() {
		let store = InMemoryStore::new();
		let f = flow("a.test");
		let id = store.put_flow(f.clone()).await.unwrap();
		let got = store.get_flow(id).await.unwrap().unwrap();
		assert_eq!(got.host, "a.test");
	}

	#[tokio::test]
	async fn list_flows_filters_by_host_and_pages() {
		let store = InMemoryStore::new();
		store.put_flow(flow("a.test")).await.unwrap();
		store.put_flow(flow("b.test")).await.unwrap();
		store.put_flow(flow("a.test")).await.unwrap();
		let filter = FlowFilter { host: Some("a.test".into()), ..Default::default() };
		let results = store.list_flows(&filter, Paging::default()).await.unwrap();
		assert_eq!(results.len(), 2);
	}

	#[tokio::test]
	async fn scan_issue_upsert_deduplicates_and_bumps_last_seen() {
		let store = InMemoryStore::new();
		let mut issue = ScanIssue {
			id: crate::types::IssueId(1),
			check_id: "sqli".into(),
			url: "https://a.test/x".into(),
			parameter: Some("id".into()),
			evidence: "error".into(),
			severity: crate::types::Severity::High,
			confidence: crate::types::Confidence::Firm,
			payload: None,
			remediation: String::new(),
			status: crate::types::IssueStatus::New,
			first_seen_ns: 0,
			last_seen_ns: 0,
		};
		store.upsert_issue(issue.clone()).await.unwrap();
		issue.last_seen_ns = 100;
		issue.id = crate::types::IssueId(2);
		store.upsert_issue(issue).await.unwrap();
		let all = store.list_issues().await.unwrap();
		assert_eq!(all.len(), 1);
		assert_eq!(all[0].last_seen_ns, 100);
	}

	#[tokio::test]
	async fn collection_items_add_and_remove() {
		let store = InMemoryStore::new();
		let id = store.put_collection(Collection { id: CollectionId(0), name: "auth".into(), item_flow_ids: vec![] }).await.unwrap();
		let fid = FlowId::new();
		let collection = store.add_item(id, fid).await.unwrap().unwrap();
		assert_eq!(collection.item_flow_ids, vec![fid]);
		let collection = store.remove_item(id, fid).await.unwrap().unwrap();
		assert!(collection.item_flow_ids.is_empty());
	}
}

//! Site-map builder: maintains per-host path trees, updated incrementally on each finalized
//! flow and rebuildable from scratch from the flow store.

use std::sync::Arc;

use crate::error::StorageError;
use crate::store::{FlowStore, SiteMapStore};
use crate::types::{Flow, HostSiteMap};

#[derive(Clone)]
pub struct SiteMapBuilder {
	flow_store: Arc<dyn FlowStore>,
	sitemap_store: Arc<dyn SiteMapStore>,
}

impl SiteMapBuilder {
	pub fn new(flow_store: Arc<dyn FlowStore>, sitemap_store: Arc<dyn SiteMapStore>) -> Self {
		SiteMapBuilder { flow_store, sitemap_store }
	}

	/// Folds one finalized flow into its host's map. Called from the recorder write path.
	pub async fn record(&self, flow: &Flow) -> Result<(), StorageError> {
		let Some(status) = flow.response_status else { return Ok(()) };
		let mut map = self.sitemap_store.get_sitemap(&flow.host).await?.unwrap_or_else(|| HostSiteMap::new(flow.host.clone()));
		map.record(&flow.path, &flow.query, &flow.method, status);
		self.sitemap_store.put_sitemap(map).await
	}

	/// Rebuilds every host's map from scratch over all recorded flows. O(N) and idempotent: the
	/// result is identical regardless of how many times it runs against an unchanged flow store.
	pub async fn rebuild(&self) -> Result<usize, StorageError> {
		let flows = self.flow_store.list_flows(&crate::store::FlowFilter::default(), crate::store::Paging::default()).await?;
		let mut maps: std::collections::HashMap<String, HostSiteMap> = std::collections::HashMap::new();
		for flow in &flows {
			let Some(status) = flow.response_status else { continue };
			maps.entry(flow.host.clone()).or_insert_with(|| HostSiteMap::new(flow.host.clone())).record(&flow.path, &flow.query, &flow.method, status);
		}
		let count = maps.len();
		for map in maps.into_values() {
			self.sitemap_store.put_sitemap(map).await?;
		}
		Ok(count)
	}

	pub async fn get(&self, host: &str) -> Result<Option<HostSiteMap>, StorageError> {
		self.sitemap_store.get_sitemap(host).await
	}

	pub async fn list(&self) -> Result<Vec<HostSiteMap>, StorageError> {
		self.sitemap_store.list_sitemaps().await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::InMemoryStore;
	use crate::types::Scheme;

	fn flow(host: &str, path: &str, query: &str, status: u16) -> Flow {
		let mut f = Flow::new(Scheme::Http, "GET".into(), host.into(), 80, path.into(), query.into(), 0);
		f.response_status = Some(status);
		f
	}

	#[tokio::test]
	async fn record_accumulates_into_existing_map() {
		let store = Arc::new(InMemoryStore::new());
		let builder = SiteMapBuilder::new(store.clone(), store.clone());
		builder.record(&flow("a.test", "/x", "q=1", 200)).await.unwrap();
		builder.record(&flow("a.test", "/x", "q=2", 404)).await.unwrap();
		let map = builder.get("a.test").await.unwrap().unwrap();
		let node = map.root.children.get("x").unwrap();
		assert_eq!(node.status_codes, std::collections::BTreeSet::from([200, 404]));
	}

	#[tokio::test]
	async fn rebuild_is_idempotent_over_stored_flows() {
		let store = Arc::new(InMemoryStore::new());
		store.put_flow(flow("b.test", "/y", "", 200)).await.unwrap();
		let builder = SiteMapBuilder::new(store.clone(), store.clone());
		let first = builder.rebuild().await.unwrap();
		let map_after_first = builder.get("b.test").await.unwrap().unwrap();
		let second = builder.rebuild().await.unwrap();
		let map_after_second = builder.get("b.test").await.unwrap().unwrap();
		assert_eq!(first, second);
		assert_eq!(map_after_first.root.children.len(), map_after_second.root.children.len());
	}
}

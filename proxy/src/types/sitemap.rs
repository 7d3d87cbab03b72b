use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SiteMapNode {
	pub path: String,
	pub methods: BTreeSet<String>,
	pub status_codes: BTreeSet<u16>,
	pub parameters: BTreeSet<String>,
	pub children: BTreeMap<String, SiteMapNode>,
}

impl SiteMapNode {
	fn new(path: String) -> Self {
		SiteMapNode { path, ..Default::default() }
	}
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HostSiteMap {
	pub host: String,
	pub root: SiteMapNode,
}

impl HostSiteMap {
	pub fn new(host: impl Into<String>) -> Self {
		HostSiteMap {
			host: host.into(),
			root: SiteMapNode::new("/".to_string()),
		}
	}

	/// Contributes `/a/b/c?x=1` as nodes `/a`, `/a/b`, `/a/b/c`, merging query keys into the leaf.
	pub fn record(&mut self, path: &str, query: &str, method: &str, status: u16) {
		let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
		let mut node = &mut self.root;
		let mut acc = String::new();
		for seg in &segments {
			acc.push('/');
			acc.push_str(seg);
			node = node
				.children
				.entry((*seg).to_string())
				.or_insert_with(|| SiteMapNode::new(acc.clone()));
		}
		node.methods.insert(method.to_string());
		node.status_codes.insert(status);
		for pair in query.split('&').filter(|p| !p.is_empty()) {
			let key = pair.split('=').next().unwrap_or(pair);
			node.parameters.insert(key.to_string());
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn record_builds_intermediate_nodes_and_merges_leaf_query() {
		let mut map = HostSiteMap::new("example.test");
		map.record("/a/b/c", "x=1", "GET", 200);
		map.record("/a/b/c", "y=2", "POST", 404);
		map.record("/a/b", "", "GET", 200);

		let a = map.root.children.get("a").unwrap();
		assert_eq!(a.path, "/a");
		let b = a.children.get("b").unwrap();
		assert_eq!(b.methods, BTreeSet::from(["GET".to_string()]));
		let c = b.children.get("c").unwrap();
		assert_eq!(c.methods, BTreeSet::from(["GET".to_string(), "POST".to_string()]));
		assert_eq!(c.status_codes, BTreeSet::from([200, 404]));
		assert_eq!(c.parameters, BTreeSet::from(["x".to_string(), "y".to_string()]));
	}
}

use serde::{Deserialize, Serialize};

use super::flow::FlowId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionId(pub u64);

impl std::fmt::Display for CollectionId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// A named, operator-curated group of flows (e.g. "checkout flow", "auth endpoints").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Collection {
	pub id: CollectionId,
	pub name: String,
	pub item_flow_ids: Vec<FlowId>,
}

use serde::{Deserialize, Serialize};

use super::flow::Flow;
use super::rule::Phase;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModifiedBody {
	pub headers: Option<Vec<(String, String)>>,
	pub body: Option<Vec<u8>>,
	pub status: Option<u16>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum InterceptDecision {
	Forward,
	Drop,
	ForwardModified(ModifiedBody),
}

/// A pending pause point awaiting an operator decision.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InterceptSnapshot {
	pub flow_id: super::flow::FlowId,
	pub phase: InterceptPhase,
	pub flow: Flow,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterceptPhase {
	Request,
	Response,
}

impl From<Phase> for InterceptPhase {
	fn from(p: Phase) -> Self {
		match p {
			Phase::Request => InterceptPhase::Request,
			Phase::Response => InterceptPhase::Response,
		}
	}
}

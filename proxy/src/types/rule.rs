use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleId(pub u64);

impl std::fmt::Display for RuleId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
	Url,
	Header,
	Body,
	Method,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
	Replace,
	AddHeader,
	RemoveHeader,
	Block,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyTo {
	Request,
	Response,
	Both,
}

impl ApplyTo {
	pub fn applies_to_request(self) -> bool {
		matches!(self, ApplyTo::Request | ApplyTo::Both)
	}

	pub fn applies_to_response(self) -> bool {
		matches!(self, ApplyTo::Response | ApplyTo::Both)
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Rule {
	pub id: RuleId,
	pub name: String,
	pub enabled: bool,
	pub priority: i32,
	/// Monotonic insertion counter, used only as a stable tie-break for equal `priority`.
	pub sequence: u64,
	pub match_type: MatchType,
	pub match_pattern: String,
	pub match_regex: bool,
	pub action_type: ActionType,
	pub action_target: String,
	pub action_value: String,
	pub apply_to: ApplyTo,
}

impl Rule {
	/// Orders rules the way the engine evaluates them: priority ascending, then insertion order.
	pub fn evaluation_key(&self) -> (i32, u64) {
		(self.priority, self.sequence)
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
	Request,
	Response,
}

impl Phase {
	pub fn matches(self, apply_to: ApplyTo) -> bool {
		match self {
			Phase::Request => apply_to.applies_to_request(),
			Phase::Response => apply_to.applies_to_response(),
		}
	}
}

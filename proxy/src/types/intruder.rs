use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttackId(pub u64);

impl std::fmt::Display for AttackId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttackStatus {
	Configured,
	Running,
	Paused,
	Completed,
	Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackStrategy {
	Sniper,
	BatteringRam,
	Pitchfork,
	ClusterBomb,
}

/// A byte range `[start, end)` in the concatenated template, tagged with which payload set
/// (`index`) feeds it for `pitchfork`/`cluster_bomb`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Position {
	pub start: usize,
	pub end: usize,
	pub index: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttackTemplate {
	pub method: String,
	pub url_template: String,
	pub headers_template: Vec<(String, String)>,
	pub body_template: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttackConfig {
	pub threads: usize,
	pub delay_ms: u64,
	pub timeout_seconds: u64,
	pub follow_redirects: bool,
}

impl Default for AttackConfig {
	fn default() -> Self {
		AttackConfig {
			threads: 4,
			delay_ms: 0,
			timeout_seconds: 30,
			follow_redirects: false,
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IntruderAttack {
	pub id: AttackId,
	pub status: AttackStatus,
	pub template: AttackTemplate,
	pub positions: Vec<Position>,
	pub payload_sets: Vec<Vec<String>>,
	pub strategy: AttackStrategy,
	pub config: AttackConfig,
	pub total_requests: u64,
	pub completed_requests: u64,
	pub error_message: Option<String>,
}

impl IntruderAttack {
	/// Combinatorial cardinality per spec.md §4.7.
	pub fn cardinality(&self) -> anyhow::Result<u64> {
		let k = self.positions.len() as u64;
		match self.strategy {
			AttackStrategy::Sniper => {
				let s1 = self.payload_sets.first().map(|s| s.len()).unwrap_or(0) as u64;
				Ok(k * s1)
			},
			AttackStrategy::BatteringRam => Ok(self.payload_sets.first().map(|s| s.len()).unwrap_or(0) as u64),
			AttackStrategy::Pitchfork => self
				.payload_sets
				.iter()
				.map(|s| s.len() as u64)
				.min()
				.ok_or_else(|| anyhow::anyhow!("pitchfork requires at least one payload set")),
			AttackStrategy::ClusterBomb => {
				if self.payload_sets.is_empty() {
					return Ok(0);
				}
				self
					.payload_sets
					.iter()
					.try_fold(1u64, |acc, s| acc.checked_mul(s.len() as u64))
					.ok_or_else(|| anyhow::anyhow!("cluster_bomb cardinality overflow"))
			},
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IntruderResult {
	pub attack_id: AttackId,
	pub position_index: u64,
	pub payloads: Vec<String>,
	pub request_url: String,
	pub response_status: Option<u16>,
	pub response_length: Option<u64>,
	pub response_time_ms: Option<u64>,
	pub error: Option<String>,
	pub timestamp_ns: u64,
}

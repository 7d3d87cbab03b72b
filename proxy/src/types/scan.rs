use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IssueId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
	Info,
	Low,
	Medium,
	High,
	Critical,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
	Tentative,
	Firm,
	Certain,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckCategory {
	Passive,
	Active,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
	New,
	Confirmed,
	FalsePositive,
	Fixed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanIssue {
	pub id: IssueId,
	pub check_id: String,
	pub url: String,
	pub parameter: Option<String>,
	pub severity: Severity,
	pub confidence: Confidence,
	pub evidence: String,
	pub payload: Option<String>,
	pub remediation: String,
	pub status: IssueStatus,
	pub first_seen_ns: u64,
	pub last_seen_ns: u64,
}

impl ScanIssue {
	/// The tuple the store deduplicates on: repeated scans update `last_seen`, not create a new row.
	pub fn dedup_key(&self) -> (String, String, Option<String>, String) {
		(self.check_id.clone(), self.url.clone(), self.parameter.clone(), self.evidence.clone())
	}
}

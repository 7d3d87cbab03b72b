//! Pure rule evaluation over a flow snapshot.
//!
//! `evaluate` takes an immutable rule set and a flow, in priority order, and returns the
//! mutations to apply plus whether a `block` action fired. It never touches I/O or shared state,
//! so the engine can call it synchronously from the per-connection task.

use regex::RegexBuilder;
use tracing::warn;

use crate::error::RuleError;
use crate::types::{ActionType, Flow, MatchType, Phase, Rule};

/// Hard ceiling on rule evaluations per flow-phase; a misconfigured rule set cannot wedge a
/// connection forever.
const MAX_EVALUATIONS: usize = 100;

/// Caps compiled program size so a pathological pattern cannot exhaust memory building its DFA.
/// The `regex` crate already guarantees linear-time matching, so this bounds compile cost rather
/// than guarding against catastrophic backtracking.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

#[derive(Clone, Debug, PartialEq)]
pub enum AppliedMutation {
	ReplacedBody,
	HeaderAdded { name: String, value: String },
	HeaderRemoved { name: String, count: usize },
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RuleOutcome {
	pub mutations: Vec<AppliedMutation>,
	pub blocked: bool,
	pub evaluated: usize,
}

/// Evaluates `rules` against `flow` for `phase`, mutating `flow` in place and stopping as soon as
/// a `block` rule matches (or the evaluation budget is spent). A single rule's pattern-compile or
/// step-overrun error deactivates that rule for this flow and evaluation continues; it is never
/// fatal to the pipeline (§7).
pub fn evaluate(rules: &[Rule], flow: &mut Flow, phase: Phase) -> RuleOutcome {
	let mut ordered: Vec<&Rule> = rules.iter().filter(|r| r.enabled && phase.matches(r.apply_to)).collect();
	ordered.sort_by_key(|r| r.evaluation_key());

	let mut outcome = RuleOutcome::default();
	for rule in ordered {
		if outcome.evaluated >= MAX_EVALUATIONS {
			break;
		}
		outcome.evaluated += 1;

		let matched = match matches_rule(rule, flow, phase) {
			Ok(m) => m,
			Err(err) => {
				warn!(rule = %rule.id, error = %err, "rule deactivated for this flow");
				continue;
			}
		};
		if !matched {
			continue;
		}

		if rule.action_type == ActionType::Block {
			synthesize_block(flow);
			outcome.blocked = true;
			break;
		}

		if let Some(mutation) = apply_action(rule, flow, phase) {
			outcome.mutations.push(mutation);
		}
	}
	outcome
}

fn matches_rule(rule: &Rule, flow: &Flow, phase: Phase) -> Result<bool, RuleError> {
	let subject = match rule.match_type {
		MatchType::Url => flow.url(),
		MatchType::Method => flow.method.clone(),
		MatchType::Header => headers_for(flow, phase).to_wire_lines(),
		MatchType::Body => body_text_for(flow, phase),
	};
	if rule.match_regex {
		let re = RegexBuilder::new(&rule.match_pattern)
			.size_limit(REGEX_SIZE_LIMIT)
			.dfa_size_limit(REGEX_SIZE_LIMIT)
			.build()
			.map_err(|source| RuleError::PatternCompile { pattern: rule.match_pattern.clone(), source })?;
		Ok(re.is_match(&subject))
	} else {
		Ok(subject.contains(&rule.match_pattern))
	}
}

fn apply_action(rule: &Rule, flow: &mut Flow, phase: Phase) -> Option<AppliedMutation> {
	match rule.action_type {
		ActionType::Replace => {
			replace_target(rule, flow, phase);
			Some(AppliedMutation::ReplacedBody)
		}
		ActionType::AddHeader => {
			let headers = headers_for_mut(flow, phase);
			headers.add_idempotent(rule.action_target.clone(), rule.action_value.clone());
			Some(AppliedMutation::HeaderAdded {
				name: rule.action_target.clone(),
				value: rule.action_value.clone(),
			})
		}
		ActionType::RemoveHeader => {
			let headers = headers_for_mut(flow, phase);
			let count = headers.remove(&rule.action_target);
			Some(AppliedMutation::HeaderRemoved {
				name: rule.action_target.clone(),
				count,
			})
		}
		ActionType::Block => unreachable!("block is handled before apply_action"),
	}
}

/// Whole-field overwrite is only correct when the match itself was a body regex match against
/// the entire body; every other match type/kind gets a textual substitution at the matched span,
/// leaving the rest of the field (and any other header) untouched.
fn replace_target(rule: &Rule, flow: &mut Flow, phase: Phase) {
	let whole_field_replace = rule.match_type == MatchType::Body && rule.match_regex;

	if rule.action_target.eq_ignore_ascii_case("body") {
		let body = body_mut_for(flow, phase);
		let replaced = if whole_field_replace {
			rule.action_value.clone()
		} else {
			substitute_span(&String::from_utf8_lossy(&body.data), rule)
		};
		let cap = body.data.len().max(replaced.len());
		*body = crate::types::Body::from_full(replaced.into(), cap);
		flow.modified = true;
		return;
	}

	let headers = headers_for_mut(flow, phase);
	let current = headers.get(&rule.action_target).map(str::to_string).unwrap_or_default();
	let replaced = substitute_span(&current, rule);
	headers.remove(&rule.action_target);
	headers.push(rule.action_target.clone(), replaced);
	flow.modified = true;
}

/// Replaces the first matched span of `rule.match_pattern` in `text` with `rule.action_value`.
/// Leaves `text` untouched if the pattern doesn't match (the span it matched on elsewhere in the
/// flow may not recur verbatim in this particular field).
fn substitute_span(text: &str, rule: &Rule) -> String {
	if rule.match_regex {
		let Ok(re) = RegexBuilder::new(&rule.match_pattern).size_limit(REGEX_SIZE_LIMIT).dfa_size_limit(REGEX_SIZE_LIMIT).build() else {
			return text.to_string();
		};
		match re.find(text) {
			Some(m) => format!("{}{}{}", &text[..m.start()], rule.action_value, &text[m.end()..]),
			None => text.to_string(),
		}
	} else {
		match text.find(&rule.match_pattern) {
			Some(pos) => format!("{}{}{}", &text[..pos], rule.action_value, &text[pos + rule.match_pattern.len()..]),
			None => text.to_string(),
		}
	}
}

fn headers_for(flow: &Flow, phase: Phase) -> &crate::types::HeaderList {
	match phase {
		Phase::Request => &flow.request_headers,
		Phase::Response => &flow.response_headers,
	}
}

fn headers_for_mut(flow: &mut Flow, phase: Phase) -> &mut crate::types::HeaderList {
	flow.modified = true;
	match phase {
		Phase::Request => &mut flow.request_headers,
		Phase::Response => &mut flow.response_headers,
	}
}

fn body_mut_for(flow: &mut Flow, phase: Phase) -> &mut crate::types::Body {
	match phase {
		Phase::Request => &mut flow.request_body,
		Phase::Response => &mut flow.response_body,
	}
}

fn body_text_for(flow: &Flow, phase: Phase) -> String {
	let body = match phase {
		Phase::Request => &flow.request_body,
		Phase::Response => &flow.response_body,
	};
	String::from_utf8_lossy(&body.data).into_owned()
}

/// Synthesizes a 403 response in place, per the block-action contract: evaluation stops and the
/// flow never reaches upstream (or, in the response phase, the client never sees the real body).
fn synthesize_block(flow: &mut Flow) {
	flow.response_status = Some(403);
	flow.response_reason = Some("Forbidden".to_string());
	flow.response_headers = crate::types::HeaderList::new();
	flow.response_headers.push("Content-Type", "text/plain");
	flow.response_body = crate::types::Body::from_full("blocked by rule".into(), 64);
	flow.modified = true;
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::{ApplyTo, Scheme};

	fn flow() -> Flow {
		let mut f = Flow::new(Scheme::Https, "GET".into(), "example.test".into(), 443, "/admin".into(), "".into(), 0);
		f.request_headers.push("User-Agent", "curl/8.0");
		f
	}

	fn rule(id: u64, seq: u64, match_type: MatchType, pattern: &str, regex: bool, action: ActionType, target: &str, value: &str, apply_to: ApplyTo) -> Rule {
		Rule {
			id: crate::types::RuleId(id),
			name: format!("rule-{id}"),
			enabled: true,
			priority: 0,
			sequence: seq,
			match_type,
			match_pattern: pattern.to_string(),
			match_regex: regex,
			action_type: action,
			action_target: target.to_string(),
			action_value: value.to_string(),
			apply_to,
		}
	}

	#[test]
	fn url_substring_match_adds_header() {
		let mut f = flow();
		let r = rule(1, 0, MatchType::Url, "/admin", false, ActionType::AddHeader, "X-Flagged", "1", ApplyTo::Request);
		let outcome = evaluate(&[r], &mut f, Phase::Request);
		assert_eq!(outcome.mutations.len(), 1);
		assert_eq!(f.request_headers.get("X-Flagged"), Some("1"));
	}

	#[test]
	fn block_rule_synthesizes_403_and_stops_evaluation() {
		let mut f = flow();
		let block = rule(1, 0, MatchType::Method, "GET", false, ActionType::Block, "", "", ApplyTo::Request);
		let never = rule(2, 1, MatchType::Url, "/admin", false, ActionType::AddHeader, "X-Never", "1", ApplyTo::Request);
		let outcome = evaluate(&[never, block], &mut f, Phase::Request);
		assert!(outcome.blocked);
		assert_eq!(f.response_status, Some(403));
		assert!(f.request_headers.get("X-Never").is_none());
	}

	#[test]
	fn regex_match_type_header_uses_wire_form() {
		let mut f = flow();
		let r = rule(1, 0, MatchType::Header, r"(?i)user-agent: curl.*", true, ActionType::RemoveHeader, "User-Agent", "", ApplyTo::Request);
		let outcome = evaluate(&[r], &mut f, Phase::Request);
		assert_eq!(outcome.mutations.len(), 1);
		assert!(f.request_headers.get("User-Agent").is_none());
	}

	#[test]
	fn rules_outside_requested_phase_are_skipped() {
		let mut f = flow();
		let r = rule(1, 0, MatchType::Url, "/admin", false, ActionType::AddHeader, "X-Resp", "1", ApplyTo::Response);
		let outcome = evaluate(&[r], &mut f, Phase::Request);
		assert!(outcome.mutations.is_empty());
	}

	#[test]
	fn evaluation_count_is_capped() {
		let mut f = flow();
		let rules: Vec<Rule> = (0..150)
			.map(|i| rule(i, i as u64, MatchType::Url, "nonexistent", false, ActionType::AddHeader, "X-N", "1", ApplyTo::Request))
			.collect();
		let outcome = evaluate(&rules, &mut f, Phase::Request);
		assert_eq!(outcome.evaluated, MAX_EVALUATIONS);
	}

	#[test]
	fn body_regex_replace_overwrites_whole_body() {
		let mut f = flow();
		f.request_body = crate::types::Body::from_full("id=1&name=old".into(), 64);
		let r = rule(1, 0, MatchType::Body, r"id=\d+.*", true, ActionType::Replace, "body", "id=2&name=new", ApplyTo::Request);
		evaluate(&[r], &mut f, Phase::Request);
		assert_eq!(f.request_body.data.as_ref(), b"id=2&name=new");
	}

	#[test]
	fn non_regex_header_replace_edits_matched_span_only() {
		let mut f = flow();
		let r = rule(1, 0, MatchType::Header, "curl", false, ActionType::Replace, "User-Agent", "wget", ApplyTo::Request);
		evaluate(&[r], &mut f, Phase::Request);
		assert_eq!(f.request_headers.get("User-Agent"), Some("wget/8.0"));
	}

	#[test]
	fn non_regex_body_replace_edits_matched_span_only() {
		let mut f = flow();
		f.request_body = crate::types::Body::from_full("user=admin&pass=secret".into(), 64);
		let r = rule(1, 0, MatchType::Body, "admin", false, ActionType::Replace, "body", "guest", ApplyTo::Request);
		evaluate(&[r], &mut f, Phase::Request);
		assert_eq!(f.request_body.data.as_ref(), b"user=guest&pass=secret");
	}

	#[test]
	fn priority_and_sequence_determine_order() {
		let mut f = flow();
		let low_priority_late = Rule { priority: 5, ..rule(1, 0, MatchType::Url, "/admin", false, ActionType::AddHeader, "X-Order", "second", ApplyTo::Request) };
		let high_priority_first = Rule { priority: 1, ..rule(2, 1, MatchType::Url, "/admin", false, ActionType::AddHeader, "X-Order", "first", ApplyTo::Request) };
		evaluate(&[low_priority_late, high_priority_first], &mut f, Phase::Request);
		let values: Vec<_> = f.request_headers.get_all("X-Order").collect();
		assert_eq!(values, vec!["first", "second"]);
	}
}

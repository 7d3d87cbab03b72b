//! Intruder engine: expands an attack's position/payload-set combinatorics into an ordered
//! iteration sequence, dispatches it through a bounded worker pool, and records one result row
//! per request regardless of per-request success or failure.
//!
//! The worker pool and its pause/resume/stop handling mirrors the proxy engine's accept loop
//! shape: a dispatcher feeding a bounded channel, a `watch` channel carrying run/pause/stop
//! control signals, state transitions guarded by a single async lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http_body_util::Full;
use serde_json::json;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tracing::warn;

use crate::client::{Destination, UpstreamClient};
use crate::error::AttackError;
use crate::eventbus::{EventBus, Topic};
use crate::store::AttackStore;
use crate::types::{AttackId, AttackStatus, AttackStrategy, IntruderAttack, IntruderResult, Scheme};

fn now_ns() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0)
}

/// One iteration's substitution: `assignment[i]` is the payload for `attack.positions[i]`, or
/// `None` to keep that position's original template text.
type Assignment = Vec<Option<String>>;

/// Expands `attack`'s strategy into the ordered iteration list. Index in the returned vec is the
/// `position_index` recorded on each result.
pub fn expand_strategy(attack: &IntruderAttack) -> Result<Vec<Assignment>, AttackError> {
	let k = attack.positions.len();
	if k == 0 {
		return Err(AttackError::InvalidTemplate("attack defines no positions".into()));
	}
	let empty_set = || Err(AttackError::EmptyPayloadSet(attack.strategy));

	match attack.strategy {
		AttackStrategy::Sniper => {
			let Some(set) = attack.payload_sets.first() else { return empty_set() };
			if set.is_empty() {
				return empty_set();
			}
			let mut out = Vec::with_capacity(k * set.len());
			for pos in 0..k {
				for payload in set {
					let mut assignment = vec![None; k];
					assignment[pos] = Some(payload.clone());
					out.push(assignment);
				}
			}
			Ok(out)
		}
		AttackStrategy::BatteringRam => {
			let Some(set) = attack.payload_sets.first() else { return empty_set() };
			if set.is_empty() {
				return empty_set();
			}
			Ok(set.iter().map(|payload| vec![Some(payload.clone()); k]).collect())
		}
		AttackStrategy::Pitchfork => {
			if attack.payload_sets.len() != k || attack.payload_sets.iter().any(|s| s.is_empty()) {
				return empty_set();
			}
			let total = attack.payload_sets.iter().map(|s| s.len()).min().unwrap_or(0);
			let mut out = Vec::with_capacity(total);
			for i in 0..total {
				out.push(attack.payload_sets.iter().map(|s| Some(s[i].clone())).collect());
			}
			Ok(out)
		}
		AttackStrategy::ClusterBomb => {
			if attack.payload_sets.len() != k || attack.payload_sets.iter().any(|s| s.is_empty()) {
				return empty_set();
			}
			let mut out = Vec::new();
			let mut counters = vec![0usize; k];
			loop {
				out.push(counters.iter().zip(&attack.payload_sets).map(|(&i, set)| Some(set[i].clone())).collect());
				let mut carry = k;
				while carry > 0 {
					carry -= 1;
					counters[carry] += 1;
					if counters[carry] < attack.payload_sets[carry].len() {
						break;
					}
					counters[carry] = 0;
					if carry == 0 {
						return Ok(out);
					}
				}
			}
		}
	}
}

/// The rendered wire form of one iteration, ready to dispatch.
struct Rendered {
	method: String,
	url: String,
	headers: Vec<(String, String)>,
	body: String,
}

/// Applies `assignment` to `attack`'s template. Positions are byte ranges into the logical
/// concatenation `url_template + headers_template_lines + body_template`; substitution happens
/// within each section independently (by original-offset range) so replacement text of a
/// different length than the original never shifts a later section's boundaries.
fn render(attack: &IntruderAttack, assignment: &Assignment) -> Rendered {
	let headers_text = attack.template.headers_template.iter().map(|(n, v)| format!("{n}: {v}\r\n")).collect::<String>();
	let url_len = attack.template.url_template.len();
	let headers_len = headers_text.len();

	let url = substitute_section(&attack.template.url_template, 0, url_len, &attack.positions, assignment);
	let headers_rendered = substitute_section(&headers_text, url_len, url_len + headers_len, &attack.positions, assignment);
	let body = substitute_section(&attack.template.body_template, url_len + headers_len, url_len + headers_len + attack.template.body_template.len(), &attack.positions, assignment);

	let headers = headers_rendered
		.lines()
		.filter_map(|line| line.split_once(':').map(|(n, v)| (n.trim().to_string(), v.trim().to_string())))
		.collect();

	Rendered { method: attack.template.method.clone(), url, headers, body }
}

fn substitute_section(original: &str, section_start: usize, section_end: usize, positions: &[crate::types::Position], assignment: &Assignment) -> String {
	let mut edits: Vec<(usize, usize, &str)> = Vec::new();
	for (i, pos) in positions.iter().enumerate() {
		if pos.start >= section_start && pos.end <= section_end {
			if let Some(payload) = assignment[i].as_deref() {
				edits.push((pos.start - section_start, pos.end - section_start, payload));
			}
		}
	}
	edits.sort_by_key(|(start, ..)| std::cmp::Reverse(*start));

	let mut out = original.to_string();
	for (start, end, payload) in edits {
		if start <= out.len() && end <= out.len() && start <= end {
			out.replace_range(start..end, payload);
		}
	}
	out
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ControlSignal {
	Run,
	Pause,
	Stop,
}

struct RunHandle {
	control: watch::Sender<ControlSignal>,
}

struct Inner {
	client: UpstreamClient,
	store: Arc<dyn AttackStore>,
	bus: Arc<EventBus>,
	running: AsyncMutex<HashMap<AttackId, RunHandle>>,
	next_id: AtomicU64,
}

/// Runs intruder attacks against the shared upstream client, one worker pool per active attack.
#[derive(Clone)]
pub struct IntruderEngine(Arc<Inner>);

impl IntruderEngine {
	pub fn new(client: UpstreamClient, store: Arc<dyn AttackStore>, bus: Arc<EventBus>) -> Self {
		IntruderEngine(Arc::new(Inner { client, store, bus, running: AsyncMutex::new(HashMap::new()), next_id: AtomicU64::new(1) }))
	}

	/// Validates and persists a new attack in `configured` state; does not start it.
	pub async fn configure(&self, template: crate::types::AttackTemplate, positions: Vec<crate::types::Position>, payload_sets: Vec<Vec<String>>, strategy: AttackStrategy, config: crate::types::AttackConfig) -> Result<AttackId, AttackError> {
		let id = AttackId(self.0.next_id.fetch_add(1, Ordering::Relaxed));
		let mut attack = IntruderAttack {
			id,
			status: AttackStatus::Configured,
			template,
			positions,
			payload_sets,
			strategy,
			config,
			total_requests: 0,
			completed_requests: 0,
			error_message: None,
		};
		match attack.cardinality() {
			Ok(total) => attack.total_requests = total,
			Err(e) => return Err(AttackError::InvalidTemplate(e.to_string())),
		}
		self.0.store.put_attack(attack).await.map_err(|e| AttackError::InvalidTemplate(e.to_string()))?;
		Ok(id)
	}

	/// Starts (or resumes a paused) attack's worker pool.
	pub async fn start(&self, id: AttackId) -> Result<(), AttackError> {
		let Some(mut attack) = self.0.store.get_attack(id).await.ok().flatten() else {
			return Err(AttackError::InvalidTemplate(format!("unknown attack {}", id.0)));
		};

		if attack.status == AttackStatus::Running {
			return Ok(());
		}
		if attack.status == AttackStatus::Paused {
			if let Some(handle) = self.0.running.lock().await.get(&id) {
				let _ = handle.control.send(ControlSignal::Run);
				attack.status = AttackStatus::Running;
				let _ = self.0.store.put_attack(attack).await;
				return Ok(());
			}
			// No live worker pool (e.g. stop() tore it down): fall through and start fresh.
		}

		let assignments = match expand_strategy(&attack) {
			Ok(a) => a,
			Err(e) => {
				attack.status = AttackStatus::Error;
				attack.error_message = Some(e.to_string());
				let _ = self.0.store.put_attack(attack).await;
				return Err(e);
			}
		};

		attack.status = AttackStatus::Running;
		attack.completed_requests = 0;
		self.0.store.put_attack(attack.clone()).await.map_err(|e| AttackError::InvalidTemplate(e.to_string()))?;

		let (control_tx, control_rx) = watch::channel(ControlSignal::Run);
		self.0.running.lock().await.insert(id, RunHandle { control: control_tx });

		let this = self.clone();
		tokio::spawn(async move { this.run_pool(attack, assignments, control_rx).await });
		Ok(())
	}

	pub async fn pause(&self, id: AttackId) {
		if let Some(handle) = self.0.running.lock().await.get(&id) {
			let _ = handle.control.send(ControlSignal::Pause);
		}
		if let Some(mut attack) = self.0.store.get_attack(id).await.ok().flatten() {
			attack.status = AttackStatus::Paused;
			let _ = self.0.store.put_attack(attack).await;
		}
	}

	pub async fn stop(&self, id: AttackId) {
		if let Some(handle) = self.0.running.lock().await.remove(&id) {
			let _ = handle.control.send(ControlSignal::Stop);
		}
	}

	async fn run_pool(self, attack: IntruderAttack, assignments: Vec<Assignment>, mut control: watch::Receiver<ControlSignal>) {
		let attack = Arc::new(attack);
		let threads = attack.config.threads.max(1);
		let (tx, rx) = tokio::sync::mpsc::channel::<(u64, Assignment)>(threads * 2);
		let rx = Arc::new(AsyncMutex::new(rx));
		let completed = Arc::new(AtomicU64::new(0));

		let mut workers = Vec::with_capacity(threads);
		for _ in 0..threads {
			let rx = rx.clone();
			let this = self.clone();
			let attack = attack.clone();
			let completed = completed.clone();
			workers.push(tokio::spawn(async move { this.worker_loop(attack, rx, completed).await }));
		}

		let delay = Duration::from_millis(attack.config.delay_ms);
		'dispatch: for (index, assignment) in assignments.into_iter().enumerate() {
			loop {
				match *control.borrow() {
					ControlSignal::Stop => break 'dispatch,
					ControlSignal::Pause => {}
					ControlSignal::Run => break,
				}
				if control.changed().await.is_err() {
					break 'dispatch;
				}
			}
			if tx.send((index as u64, assignment)).await.is_err() {
				break;
			}
			if !delay.is_zero() {
				tokio::time::sleep(delay).await;
			}
		}
		drop(tx);
		for w in workers {
			let _ = w.await;
		}

		self.0.running.lock().await.remove(&attack.id);
		if let Some(mut stored) = self.0.store.get_attack(attack.id).await.ok().flatten() {
			stored.completed_requests = completed.load(Ordering::Relaxed);
			if stored.status != AttackStatus::Error {
				stored.status = if *control.borrow() == ControlSignal::Stop { AttackStatus::Paused } else { AttackStatus::Completed };
			}
			let _ = self.0.store.put_attack(stored).await;
		}
	}

	async fn worker_loop(self, attack: Arc<IntruderAttack>, rx: Arc<AsyncMutex<tokio::sync::mpsc::Receiver<(u64, Assignment)>>>, completed: Arc<AtomicU64>) {
		loop {
			let received = { rx.lock().await.recv().await };
			let Some((index, assignment)) = received else { break };
			let rendered = render(&attack, &assignment);
			let payloads: Vec<String> = assignment.iter().map(|p| p.clone().unwrap_or_default()).collect();
			let result = self.dispatch_one(&attack, index, &rendered, payloads).await;
			let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
			self.0.bus.publish(Topic::IntruderProgress, json!({"attack_id": attack.id.0, "completed": done, "total": attack.total_requests})).await;
			let payload = serde_json::to_value(&result).unwrap_or_else(|_| json!({}));
			self.0.bus.publish(Topic::IntruderResult, payload).await;
			if let Err(e) = self.0.store.put_result(result).await {
				warn!(error = %e, "failed to persist intruder result");
			}
		}
	}

	async fn dispatch_one(&self, attack: &IntruderAttack, index: u64, rendered: &Rendered, payloads: Vec<String>) -> IntruderResult {
		let started = std::time::Instant::now();
		let parsed = match rendered.url.parse::<http::Uri>() {
			Ok(u) => u,
			Err(e) => {
				return IntruderResult {
					attack_id: attack.id,
					position_index: index,
					payloads,
					request_url: rendered.url.clone(),
					response_status: None,
					response_length: None,
					response_time_ms: None,
					error: Some(e.to_string()),
					timestamp_ns: now_ns(),
				};
			}
		};
		let scheme = if parsed.scheme_str() == Some("https") { Scheme::Https } else { Scheme::Http };
		let host = parsed.host().unwrap_or_default().to_string();
		let port = parsed.port_u16().unwrap_or(if scheme == Scheme::Https { 443 } else { 80 });
		let dest = Destination::new(scheme, host, port);

		let mut builder = http::Request::builder().method(rendered.method.as_str()).uri(parsed);
		for (name, value) in &rendered.headers {
			builder = builder.header(name.as_str(), value.as_str());
		}
		let error_payloads = payloads.clone();
		let error = move |e: String| IntruderResult {
			attack_id: attack.id,
			position_index: index,
			payloads: error_payloads,
			request_url: rendered.url.clone(),
			response_status: None,
			response_length: None,
			response_time_ms: Some(started.elapsed().as_millis() as u64),
			error: Some(e),
			timestamp_ns: now_ns(),
		};
		let req = match builder.body(Full::new(Bytes::from(rendered.body.clone()))) {
			Ok(r) => r,
			Err(e) => return error(e.to_string()),
		};

		let client = self.0.client.clone().with_timeout(Duration::from_secs(attack.config.timeout_seconds)).with_follow_redirects(attack.config.follow_redirects);
		match client.dispatch(&dest, req).await {
			Ok(resp) => {
				let body = crate::client::collect_body(resp.body).await;
				let (len, err) = match body {
					Ok(b) => (Some(b.len() as u64), None),
					Err(e) => (None, Some(e.to_string())),
				};
				IntruderResult {
					attack_id: attack.id,
					position_index: index,
					payloads,
					request_url: rendered.url.clone(),
					response_status: Some(resp.status),
					response_length: len,
					response_time_ms: Some(started.elapsed().as_millis() as u64),
					error: err,
					timestamp_ns: now_ns(),
				}
			}
			Err(e) => error(e.to_string()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::{AttackConfig, AttackTemplate, Position};

	fn attack(strategy: AttackStrategy, positions: Vec<Position>, payload_sets: Vec<Vec<String>>) -> IntruderAttack {
		IntruderAttack {
			id: AttackId(1),
			status: AttackStatus::Configured,
			template: AttackTemplate { method: "GET".into(), url_template: "http://x/?id=X".into(), headers_template: vec![], body_template: String::new() },
			positions,
			payload_sets,
			strategy,
			config: AttackConfig::default(),
			total_requests: 0,
			completed_requests: 0,
			error_message: None,
		}
	}

	#[test]
	fn sniper_iterates_positions_outer_payloads_inner() {
		let a = attack(AttackStrategy::Sniper, vec![Position { start: 0, end: 1, index: 0 }, Position { start: 2, end: 3, index: 0 }], vec![vec!["a".into(), "b".into()]]);
		let out = expand_strategy(&a).unwrap();
		assert_eq!(out.len(), 4);
		assert_eq!(out[0], vec![Some("a".to_string()), None]);
		assert_eq!(out[1], vec![Some("b".to_string()), None]);
		assert_eq!(out[2], vec![None, Some("a".to_string())]);
	}

	#[test]
	fn cluster_bomb_matches_spec_example_order() {
		let a = attack(
			AttackStrategy::ClusterBomb,
			vec![Position { start: 0, end: 1, index: 0 }, Position { start: 2, end: 3, index: 1 }],
			vec![vec!["a".into(), "b".into()], vec!["1".into(), "2".into()]],
		);
		let out = expand_strategy(&a).unwrap();
		let flat: Vec<(String, String)> = out.iter().map(|a| (a[0].clone().unwrap(), a[1].clone().unwrap())).collect();
		assert_eq!(flat, vec![("a".into(), "1".into()), ("a".into(), "2".into()), ("b".into(), "1".into()), ("b".into(), "2".into())]);
	}

	#[test]
	fn battering_ram_replaces_all_positions_with_same_payload() {
		let a = attack(AttackStrategy::BatteringRam, vec![Position { start: 0, end: 1, index: 0 }, Position { start: 2, end: 3, index: 0 }], vec![vec!["z".into()]]);
		let out = expand_strategy(&a).unwrap();
		assert_eq!(out, vec![vec![Some("z".to_string()), Some("z".to_string())]]);
	}

	#[test]
	fn pitchfork_cardinality_is_shortest_set() {
		let a = attack(AttackStrategy::Pitchfork, vec![Position { start: 0, end: 1, index: 0 }, Position { start: 2, end: 3, index: 1 }], vec![vec!["a".into(), "b".into(), "c".into()], vec!["1".into()]]);
		let out = expand_strategy(&a).unwrap();
		assert_eq!(out.len(), 1);
	}

	#[test]
	fn render_substitutes_within_url_section_only() {
		let a = attack(AttackStrategy::Sniper, vec![Position { start: 12, end: 13, index: 0 }], vec![vec!["9".into()]]);
		let rendered = render(&a, &vec![Some("9".to_string())]);
		assert_eq!(rendered.url, "http://x/?id=9");
	}
}

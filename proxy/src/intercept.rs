//! The intercept coordinator: holds flows paused for an operator decision and resolves them
//! exactly once, in FIFO order per direction.
//!
//! Grounded on the drain-aware shutdown pattern already in `proxy-core`: cancellation and
//! shutdown both resolve every pending slot as `forward` rather than leaving a task parked.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{Mutex, oneshot};

use crate::error::InterceptError;
use crate::types::{Flow, FlowId, InterceptDecision, InterceptPhase, InterceptSnapshot};

struct PendingSlot {
	snapshot: InterceptSnapshot,
	resolver: oneshot::Sender<InterceptDecision>,
}

#[derive(Default)]
struct State {
	/// Insertion-ordered per (flow, phase); `submit`/`decide` key off this exact pair.
	pending: VecDeque<(FlowId, InterceptPhase)>,
	slots: HashMap<(FlowId, InterceptPhase), PendingSlot>,
	intercept_request: bool,
	intercept_response: bool,
}

/// Coordinates pause points between the proxy engine and operator-facing API.
pub struct InterceptCoordinator {
	state: Mutex<State>,
}

impl Default for InterceptCoordinator {
	fn default() -> Self {
		Self::new()
	}
}

impl InterceptCoordinator {
	pub fn new() -> Self {
		InterceptCoordinator { state: Mutex::new(State::default()) }
	}

	pub async fn toggle_intercept(&self, phase: InterceptPhase, enabled: bool) {
		let mut state = self.state.lock().await;
		match phase {
			InterceptPhase::Request => state.intercept_request = enabled,
			InterceptPhase::Response => state.intercept_response = enabled,
		}
	}

	pub async fn is_enabled(&self, phase: InterceptPhase) -> bool {
		let state = self.state.lock().await;
		match phase {
			InterceptPhase::Request => state.intercept_request,
			InterceptPhase::Response => state.intercept_response,
		}
	}

	/// Parks `flow` awaiting an operator decision. Resolves to `Forward` if the coordinator is
	/// shut down or the caller's receiver is dropped before `decide` runs.
	pub async fn submit(&self, flow: Flow, phase: InterceptPhase) -> InterceptDecision {
		let (tx, rx) = oneshot::channel();
		let key = (flow.id, phase);
		{
			let mut state = self.state.lock().await;
			state.slots.insert(
				key,
				PendingSlot {
					snapshot: InterceptSnapshot { flow_id: flow.id, phase, flow },
					resolver: tx,
				},
			);
			state.pending.push_back(key);
		}
		rx.await.unwrap_or(InterceptDecision::Forward)
	}

	/// Resolves the pending slot for `flow_id`/`phase` exactly once.
	pub async fn decide(&self, flow_id: FlowId, phase: InterceptPhase, decision: InterceptDecision) -> Result<(), InterceptError> {
		let mut state = self.state.lock().await;
		let key = (flow_id, phase);
		let slot = state.slots.remove(&key).ok_or(InterceptError::UnknownSlot(flow_id, phase))?;
		state.pending.retain(|k| *k != key);
		slot
			.resolver
			.send(decision)
			.map_err(|_| InterceptError::AlreadyResolved(flow_id, phase))
	}

	/// Lists pending slots in FIFO submission order.
	pub async fn list(&self) -> Vec<InterceptSnapshot> {
		let state = self.state.lock().await;
		state
			.pending
			.iter()
			.filter_map(|key| state.slots.get(key).map(|s| s.snapshot.clone()))
			.collect()
	}

	/// Resolves every pending slot as `Forward`. Called on client disconnect and on shutdown.
	pub async fn forward_all(&self) {
		let mut state = self.state.lock().await;
		state.pending.clear();
		for (_, slot) in state.slots.drain() {
			let _ = slot.resolver.send(InterceptDecision::Forward);
		}
	}

	/// Resolves a single flow's pending slots (both phases) as `Forward`, for per-connection
	/// disconnect handling without touching unrelated flows.
	pub async fn forward_flow(&self, flow_id: FlowId) {
		let mut state = self.state.lock().await;
		for phase in [InterceptPhase::Request, InterceptPhase::Response] {
			let key = (flow_id, phase);
			if let Some(slot) = state.slots.remove(&key) {
				state.pending.retain(|k| *k != key);
				let _ = slot.resolver.send(InterceptDecision::Forward);
			}
		}
	}
}

#[derive(Clone)]
pub struct SharedInterceptCoordinator(Arc<InterceptCoordinator>);

impl Default for SharedInterceptCoordinator {
	fn default() -> Self {
		SharedInterceptCoordinator(Arc::new(InterceptCoordinator::new()))
	}
}

impl std::ops::Deref for SharedInterceptCoordinator {
	type Target = InterceptCoordinator;
	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::Scheme;

	fn flow() -> Flow {
		Flow::new(Scheme::Https, "GET".into(), "example.test".into(), 443, "/".into(), "".into(), 0)
	}

	#[tokio::test]
	async fn decide_resolves_the_submitted_future() {
		let coord = Arc::new(InterceptCoordinator::new());
		let f = flow();
		let id = f.id;
		let coord2 = coord.clone();
		let handle = tokio::spawn(async move { coord2.submit(f, InterceptPhase::Request).await });
		// Give submit a moment to register the slot.
		tokio::time::sleep(std::time::Duration::from_millis(5)).await;
		coord.decide(id, InterceptPhase::Request, InterceptDecision::Drop).await.unwrap();
		let decision = handle.await.unwrap();
		assert!(matches!(decision, InterceptDecision::Drop));
	}

	#[tokio::test]
	async fn decide_on_unknown_slot_errors() {
		let coord = InterceptCoordinator::new();
		let err = coord.decide(FlowId::new(), InterceptPhase::Request, InterceptDecision::Forward).await;
		assert!(matches!(err, Err(InterceptError::UnknownSlot(_, _))));
	}

	#[tokio::test]
	async fn forward_all_resolves_every_pending_slot() {
		let coord = Arc::new(InterceptCoordinator::new());
		let mut handles = Vec::new();
		for _ in 0..3 {
			let coord = coord.clone();
			let f = flow();
			handles.push(tokio::spawn(async move { coord.submit(f, InterceptPhase::Request).await }));
		}
		tokio::time::sleep(std::time::Duration::from_millis(5)).await;
		coord.forward_all().await;
		for h in handles {
			assert!(matches!(h.await.unwrap(), InterceptDecision::Forward));
		}
	}

	#[tokio::test]
	async fn list_reflects_fifo_submission_order() {
		let coord = Arc::new(InterceptCoordinator::new());
		let f1 = flow();
		let f2 = flow();
		let (id1, id2) = (f1.id, f2.id);
		let c1 = coord.clone();
		let c2 = coord.clone();
		let h1 = tokio::spawn(async move { c1.submit(f1, InterceptPhase::Request).await });
		tokio::time::sleep(std::time::Duration::from_millis(2)).await;
		let h2 = tokio::spawn(async move { c2.submit(f2, InterceptPhase::Request).await });
		tokio::time::sleep(std::time::Duration::from_millis(5)).await;
		let listed = coord.list().await;
		assert_eq!(listed.iter().map(|s| s.flow_id).collect::<Vec<_>>(), vec![id1, id2]);
		coord.forward_all().await;
		h1.await.unwrap();
		h2.await.unwrap();
	}
}

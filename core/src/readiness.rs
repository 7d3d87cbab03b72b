// Originally derived from https://github.com/istio/ztunnel (Apache 2.0 licensed)

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::telemetry;

/// Tracks whether the process is ready to serve traffic: ready once every registered task has
/// dropped its [`BlockReady`] handle.
#[derive(Clone, Debug, Default)]
pub struct Ready(Arc<Mutex<HashSet<String>>>);

impl Ready {
	pub fn new() -> Ready {
		Ready::default()
	}

	pub fn register_task(&self, name: &str) -> BlockReady {
		self.0.lock().unwrap().insert(name.to_string());
		BlockReady {
			parent: self.clone(),
			name: name.to_string(),
		}
	}

	pub fn pending(&self) -> HashSet<String> {
		self.0.lock().unwrap().clone()
	}

	pub fn is_ready(&self) -> bool {
		self.pending().is_empty()
	}
}

pub struct BlockReady {
	parent: Ready,
	name: String,
}

impl BlockReady {
	pub fn subtask(&self, name: &str) -> BlockReady {
		self.parent.register_task(name)
	}
}

impl Drop for BlockReady {
	fn drop(&mut self) {
		let mut pending = self.parent.0.lock().unwrap();
		pending.remove(&self.name);
		let left = pending.len();
		let dur = telemetry::application_start_time().elapsed();
		if left == 0 {
			info!("task '{}' complete ({dur:?}), marking server ready", self.name);
		} else {
			info!("task '{}' complete ({dur:?}), still awaiting {left} tasks", self.name);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ready_once_all_tasks_drop() {
		let ready = Ready::new();
		let a = ready.register_task("a");
		let b = ready.register_task("b");
		assert!(!ready.is_ready());
		drop(a);
		assert!(!ready.is_ready());
		drop(b);
		assert!(ready.is_ready());
	}

	#[test]
	fn subtask_tracked_independently() {
		let ready = Ready::new();
		let parent = ready.register_task("parent");
		let child = parent.subtask("child");
		assert_eq!(ready.pending().len(), 2);
		drop(parent);
		assert_eq!(ready.pending().len(), 1);
		drop(child);
		assert!(ready.is_ready());
	}
}

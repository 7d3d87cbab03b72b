use std::time::Duration;

pub use internal::{DrainMode, ReleaseShutdown as DrainBlocker, Signal as DrainTrigger, Watch as DrainWatcher};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Constructs a new pair for draining.
/// * [`DrainTrigger`] starts a drain and waits for it to complete.
/// * [`DrainWatcher`] should be held by anything that wants to participate in the drain. It can be
///   cloned; a drain does not complete until all outstanding watchers are dropped.
pub fn new() -> (DrainTrigger, DrainWatcher) {
	internal::channel()
}

/// Runs `make_future` with graceful shutdown support. The future is handed a [`DrainWatcher`] and
/// a force-shutdown receiver: while holding the watcher, the component is marked active and
/// blocks a graceful drain; the force-shutdown channel fires once `deadline` elapses with
/// connections still outstanding.
pub async fn run_with_drain<F, O>(component: String, drain: DrainWatcher, deadline: Duration, make_future: F)
where
	F: AsyncFnOnce(DrainWatcher, watch::Receiver<()>) -> O,
	O: Send + 'static,
{
	let (sub_drain_signal, sub_drain) = new();
	let (trigger_force_shutdown, force_shutdown) = watch::channel(());
	let trigger_force_shutdown_cpy = trigger_force_shutdown.clone();
	let fut = make_future(sub_drain, force_shutdown);
	let watch = async move {
		let res = drain.wait_for_drain().await;
		if res.mode() == DrainMode::Graceful {
			info!(component, "drain started, waiting {:?} for connections to complete", deadline);
			if tokio::time::timeout(deadline, sub_drain_signal.start_drain_and_wait(DrainMode::Graceful))
				.await
				.is_err()
			{
				warn!(component, "drain deadline expired with pending work, forcing shutdown");
			}
		} else {
			debug!(component, "terminating");
		}
		let _ = trigger_force_shutdown.send(());
		info!(component, "shutdown complete");
	};
	tokio::select! {
		_ = fut => {
			let _ = trigger_force_shutdown_cpy.send(());
		},
		_ = watch => {}
	}
}

mod internal {
	use tokio::sync::{mpsc, watch};

	pub fn channel() -> (Signal, Watch) {
		let (signal_tx, signal_rx) = watch::channel(None);
		let (drained_tx, drained_rx) = mpsc::channel(1);
		(
			Signal { drained_rx, signal_tx },
			Watch { drained_tx, signal_rx },
		)
	}

	enum Never {}

	#[derive(Debug, Clone, Copy, PartialEq)]
	pub enum DrainMode {
		Immediate,
		Graceful,
	}

	/// Sends a drain command to all watchers and waits until they all release.
	pub struct Signal {
		drained_rx: mpsc::Receiver<Never>,
		signal_tx: watch::Sender<Option<DrainMode>>,
	}

	/// Watches for a drain command. All clones must be dropped for [`Signal::start_drain_and_wait`]
	/// to complete.
	#[derive(Clone)]
	pub struct Watch {
		drained_tx: mpsc::Sender<Never>,
		signal_rx: watch::Receiver<Option<DrainMode>>,
	}

	#[must_use = "DrainBlocker should be dropped explicitly to release the runtime"]
	#[derive(Clone)]
	#[allow(dead_code)]
	pub struct ReleaseShutdown(mpsc::Sender<Never>, DrainMode);

	impl ReleaseShutdown {
		pub fn mode(&self) -> DrainMode {
			self.1
		}
	}

	impl Signal {
		pub fn count(&self) -> usize {
			self.signal_tx.receiver_count()
		}

		/// Signals all watchers to begin draining and waits for every handle to be released.
		pub async fn start_drain_and_wait(mut self, mode: DrainMode) {
			let _ = self.signal_tx.send(Some(mode));
			match self.drained_rx.recv().await {
				None => {},
				Some(n) => match n {},
			}
		}
	}

	impl Watch {
		/// Returns a blocker handle after a drain has been signaled. Drop it once the shutdown
		/// action driven by it has completed.
		pub async fn wait_for_drain(mut self) -> ReleaseShutdown {
			let mode = self
				.signal_rx
				.wait_for(Option::is_some)
				.await
				.map(|mode| mode.expect("already asserted is_some"))
				.unwrap_or(DrainMode::Immediate);
			ReleaseShutdown(self.drained_tx, mode)
		}
	}

	impl std::fmt::Debug for Signal {
		fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
			f.debug_struct("Signal").finish_non_exhaustive()
		}
	}

	impl std::fmt::Debug for Watch {
		fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
			f.debug_struct("Watch").finish_non_exhaustive()
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;
	use crate::drain::DrainMode::Graceful;

	#[tokio::test]
	async fn drain_waits_for_all_watchers_to_release() {
		let (trigger, watcher) = new();
		let released = Arc::new(AtomicUsize::new(0));

		for i in 1..=3u64 {
			let watcher = watcher.clone();
			let released = released.clone();
			tokio::spawn(async move {
				tokio::time::sleep(Duration::from_millis(i * 5)).await;
				let blocker = watcher.wait_for_drain().await;
				released.fetch_add(1, Ordering::SeqCst);
				drop(blocker);
			});
		}
		drop(watcher);

		assert_eq!(released.load(Ordering::SeqCst), 0);
		tokio::select! {
			_ = tokio::time::sleep(Duration::from_millis(200)) => panic!("timeout"),
			_ = trigger.start_drain_and_wait(Graceful) => {
				assert_eq!(released.load(Ordering::SeqCst), 3);
			}
		}
	}

	#[tokio::test]
	async fn run_with_drain_completes_when_future_finishes_first() {
		let (trigger, watcher) = new();
		run_with_drain("test".to_string(), watcher, Duration::from_millis(50), async |_drain, _force| {
			tokio::time::sleep(Duration::from_millis(1)).await;
		})
		.await;
		drop(trigger);
	}
}

use std::sync::OnceLock;
use std::time::Instant;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

pub static APPLICATION_START_TIME: OnceLock<Instant> = OnceLock::new();

pub fn application_start_time() -> Instant {
	*APPLICATION_START_TIME.get_or_init(Instant::now)
}

/// Installs the global `tracing` subscriber. Safe to call more than once; later calls are no-ops.
///
/// Filter defaults to `info` and honors `RUST_LOG`.
pub fn init() {
	application_start_time();
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
	let _ = tracing_subscriber::registry().with(filter).with(fmt_layer).try_init();
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn start_time_is_stable_across_calls() {
		let a = application_start_time();
		let b = application_start_time();
		assert_eq!(a, b);
	}
}

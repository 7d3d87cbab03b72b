//! Shared foundation used by every crate in the workspace: the interned
//! string type, the prelude, graceful-shutdown primitives and process-wide
//! telemetry bootstrap.

pub mod drain;
pub mod prelude;
pub mod readiness;
pub mod strng;
pub mod telemetry;

pub use strng::Strng;

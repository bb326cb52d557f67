//! Eleanor: a DFIR/SIEM core engineering platform.
//!
//! Parses raw security telemetry into a normalized event model, buffers it
//! durably, matches it against Sigma detection rules and correlation
//! patterns in real time, and carries the resulting evidence and alerts
//! through a deterministic playbook engine. HTTP/auth/tenant/vendor-protocol
//! surfaces are out of scope — this crate is the core the outer service
//! wraps, reached through the `EventSource`, `ObjectStore`, and
//! `ActionExecutor` trait boundaries.

pub mod buffer;
pub mod cfg;
pub mod connectors;
pub mod core;
pub mod correlation;
pub mod err;
pub mod evidence;
pub mod logging;
pub mod parsers;
pub mod playbook;
pub mod processor;
pub mod sigma;

pub mod prelude {
    pub use crate::cfg::EleanorConfig;
    pub use crate::core::{NormalizedEvent, RawEvent};
    pub use crate::err::{EleanorError, Result};
}

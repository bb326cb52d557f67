pub mod engine;
pub mod rules;
pub mod state;

pub use engine::{dispatch_realtime, run_batch, CorrelationMatch, EventSource};
pub use rules::CorrelationRule;
pub use state::{CorrelationState, CorrelationStateStatus, CorrelationStateStore};

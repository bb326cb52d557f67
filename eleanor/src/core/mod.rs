pub mod event;
pub mod time;

pub use event::{get_nested, NormalizedEvent, RawEvent};

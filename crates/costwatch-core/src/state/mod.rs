//! Durable dedup state.
//!
//! The scheduler is the only writer. Writes go to a temp file that is
//! renamed over the record, so readers never see a partial document.

mod store;
mod types;

pub use store::{JsonStateStore, MemoryStateStore, StateStore};
pub use types::MonitorState;

//! File-backed persistence for the activity log and the state snapshot.
//!
//! Both are best-effort: callers count failures instead of propagating them.

pub mod activity_file;
pub mod snapshot;

pub use activity_file::{append_events, read_events};
pub use snapshot::{load_snapshot, save_snapshot, StateSnapshot};

//! Run-state ownership and durable snapshotting.

pub mod run_state;
pub mod store;

pub use run_state::RunState;
pub use store::{FailureDisposition, StateStore};

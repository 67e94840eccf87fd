//! Utility helpers

pub mod retry;

pub use retry::{is_transient, retry_on_conflict};

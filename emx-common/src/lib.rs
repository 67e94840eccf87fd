//! # EMX Common Library
//!
//! Shared code for the EMX session services including:
//! - Error type shared by every crate
//! - Root folder and bootstrap configuration
//! - SQLite initialization and the settings table
//! - Session event types broadcast over SSE
//! - Time helpers

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod sse;
pub mod time;

pub use error::{Error, Result};
pub use events::SessionEvent;

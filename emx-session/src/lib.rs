//! # EMX Session Engine
//!
//! Sequences a participant's steps for a study, records answers durably,
//! keeps a local snapshot for crash recovery, and decides quota admission
//! for participants who finish.
//!
//! - [`aggregator`]: builds the ordered step sequence from per-module sources
//! - [`ledger`]: idempotent answer storage per (study, participant)
//! - [`cache`]: local session snapshots and partial recording buffers
//! - [`navigator`]: per-session state machine and its actor
//! - [`admission`]: completion ranking against the study quota
//! - [`api`]: HTTP surface

pub mod admission;
pub mod aggregator;
pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod ledger;
pub mod navigator;
pub mod session;
pub mod state;
pub mod steps;
pub mod utils;

pub use error::{Error, Result};

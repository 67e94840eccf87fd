//! HTTP API for the session engine

pub mod error;
pub mod handlers;
pub mod server;
pub mod sse;

pub use error::{ApiError, ApiResult};
pub use server::{build_router, AppContext, BuildInfo};

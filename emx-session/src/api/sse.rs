//! Server-Sent Events endpoint

use crate::api::server::AppContext;
use axum::{
    extract::State,
    response::sse::{Event, Sse},
};
use emx_common::sse::session_event_stream;
use futures::stream::Stream;
use std::convert::Infallible;

/// GET /events - stream of session engine events
pub async fn event_stream(State(ctx): State<AppContext>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    session_event_stream(ctx.state.subscribe_events())
}

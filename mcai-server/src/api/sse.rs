//! Server-Sent Events for pipeline and cascade progress

use crate::AppState;
use axum::{
    extract::State,
    response::sse::{Event, Sse},
    routing::get,
    Router,
};
use futures::stream::Stream;
use std::convert::Infallible;

/// GET /events
///
/// Streams AnalysisCreated, AnalysisStateChanged, CascadeProgress and
/// CascadeFinished as they happen.
pub async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    mcai_common::sse::create_event_bus_sse_stream("mcai-server", &state.event_bus)
}

pub fn event_routes() -> Router<AppState> {
    Router::new().route("/events", get(event_stream))
}

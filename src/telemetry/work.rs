//! Dispatch span helpers.
//!
//! One span per delivered message; each step of the dispatch state machine
//! is recorded as an event on it.

use tracing::Span;

/// Start a span for dispatching one work item.
///
/// The `work.state` field is declared empty and is updated by
/// [`record_state_transition`].
pub fn start_dispatch_span(job_id: &str, queue: &str) -> Span {
    tracing::info_span!(
        "work.dispatch",
        "job.id" = job_id,
        "work.queue" = queue,
        "work.state" = tracing::field::Empty,
    )
}

/// Record a state transition on the span and emit an event for it.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("work.state", to);
    span.in_scope(|| {
        tracing::debug!(from = from, to = to, "state_transition");
    });
}

//! Run execution span helpers.
//!
//! Provides span creation and state-transition recording for runs flowing
//! through the executor.

use crate::model::run::RunId;
use tracing::Span;

/// Start a span for run execution.
///
/// The `run.state` field is declared empty and can be updated via
/// [`record_state_transition`].
pub fn start_run_span(workflow: &str, run_id: &RunId) -> Span {
    tracing::info_span!(
        "run.execute",
        "run.workflow" = workflow,
        "run.id" = %run_id,
        "run.state" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}

//! Metric instrument factories for conductor-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"conductor-rs"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for conductor-rs instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("conductor-rs")
}

/// Counter: notifications ingested.
/// Labels: `type`, `result` ("processed" | "duplicate" | "ignored" |
/// "rejected" | "busy").
pub fn events_ingested() -> Counter<u64> {
    meter()
        .u64_counter("conductor.events.ingested")
        .with_description("Number of notifications ingested")
        .build()
}

/// Counter: triage decisions.
/// Labels: `decision`.
pub fn triage_decisions() -> Counter<u64> {
    meter()
        .u64_counter("conductor.triage.decisions")
        .with_description("Number of triage decisions")
        .build()
}

/// Counter: runs started.
/// Labels: `reactivation` ("true" | "false").
pub fn runs_started() -> Counter<u64> {
    meter()
        .u64_counter("conductor.runs.started")
        .with_description("Number of runs started")
        .build()
}

/// Counter: run state transitions.
/// Labels: `from`, `to`.
pub fn run_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("conductor.runs.state_transitions")
        .with_description("Number of run state transitions")
        .build()
}

/// Counter: checkpoints written.
/// Labels: `status`.
pub fn checkpoints_written() -> Counter<u64> {
    meter()
        .u64_counter("conductor.checkpoints.written")
        .with_description("Number of checkpoint writes")
        .build()
}

/// Counter: lane-level queue operations (create, send, read, archive,
/// delete). Labels: `lane`, `operation`.
pub fn lane_operations() -> Counter<u64> {
    meter()
        .u64_counter("conductor.lanes.operations")
        .with_description("Number of queue lane operations")
        .build()
}

/// Counter: backoff re-enqueues scheduled.
/// Labels: `kind` ("transient" | "overloaded").
pub fn retries_scheduled() -> Counter<u64> {
    meter()
        .u64_counter("conductor.retries.scheduled")
        .with_description("Number of retry re-enqueues scheduled")
        .build()
}

/// Counter: messages parked on the dead-letter lane.
/// Labels: `original_lane`.
pub fn dead_letters() -> Counter<u64> {
    meter()
        .u64_counter("conductor.dead_letters")
        .with_description("Number of dead-letter entries written")
        .build()
}

/// Histogram: run duration in milliseconds.
pub fn run_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("conductor.runs.duration_ms")
        .with_description("Run duration in milliseconds")
        .with_unit("ms")
        .build()
}

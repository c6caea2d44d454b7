//! Core data model.
//!
//! A task is one upstream work item; a run is one execution attempt of its
//! workflow; a checkpoint is the smallest durably-recorded unit of progress
//! inside a run. Event records are the audit trail tying all of it back to
//! the notifications that caused it.

pub mod event;
pub mod run;
pub mod task;

pub use event::{
    EventKind, EventRecord, InboundEvent, InboundPayload, ReactivationTrigger, ValidatedEvent,
};
pub use run::{Run, RunId, RunStatus, StepRecord, StepStatus};
pub use task::{Task, TaskId, TaskStatus};

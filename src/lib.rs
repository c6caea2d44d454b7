//! # conductor-rs
//!
//! Idempotent, event-driven workflow orchestrator backed by Postgres.
//!
//! Change notifications about long-lived work items flow through dedup,
//! per-resource locking, and triage into durable tasks and runs. Runs are
//! dispatched over pgmq lanes and driven step by step with checkpoints;
//! failures retry with bounded backoff or land on the dead-letter lane.
//! At most one accepted run per logical change, and a process crash never
//! duplicates work.

pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod ingress;
pub mod llm;
pub mod model;
pub mod telemetry;
pub mod triage;

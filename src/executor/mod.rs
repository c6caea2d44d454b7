//! Workflow executor: the long-running consumer that drives runs through
//! their steps.
//!
//! One loop per worker; runs execute their steps sequentially while
//! different runs proceed fully concurrently across loops. Late
//! acknowledgement throughout: the work-lane message is archived only once
//! the run is terminal, explicitly suspended, or its replacement (a
//! delayed retry or a dead-letter copy) is durable. A crash mid-execution
//! therefore redelivers, and completed checkpoints make the redelivery
//! resume instead of redo.

pub mod steps;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::Notify;
use tracing::{Instrument, Span, debug, error, info, warn};

use crate::config::OrchestratorSettings;
use crate::db::Db;
use crate::db::lanes::{DISPATCH_CHANNEL, DeadLetter, LaneMessage};
use crate::db::runs::normalize_step_name;
use crate::dispatch::retry::{FailureKind, RetryDecision, RetryPolicy};
use crate::dispatch::{DispatchMessage, publish};
use crate::error::{Error, Result};
use crate::model::run::{Run, RunId, RunStatus, StepStatus};
use crate::model::task::TaskStatus;
use crate::telemetry::metrics;
use crate::telemetry::run::{record_state_transition, start_run_span};
use steps::{StepContext, StepOutcome, Workflow, WorkflowRegistry};

/// Configuration for the executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Base directory for per-run working directories.
    pub run_base_dir: PathBuf,
    /// Visibility timeout (seconds) for work-lane reads. Also the
    /// redelivery horizon after a crash.
    pub visibility_timeout: i32,
    /// Poll interval fallback when no NOTIFY arrives.
    pub poll_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            run_base_dir: PathBuf::from("/tmp/conductor-runs"),
            visibility_timeout: 60,
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// How one drive through the steps ended.
enum DriveOutcome {
    Completed(serde_json::Value),
    Suspended { reason: String },
    Failed {
        step: String,
        kind: FailureKind,
        message: String,
    },
}

/// The executor loop: claim dispatches, drive steps, retire runs.
pub struct Executor {
    db: Arc<Db>,
    registry: Arc<WorkflowRegistry>,
    config: ExecutorConfig,
    settings: OrchestratorSettings,
    retry: RetryPolicy,
    shutdown: Arc<Notify>,
    stopping: Arc<AtomicBool>,
    active_runs: Arc<AtomicUsize>,
    max_concurrent: usize,
}

impl Clone for Executor {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            registry: Arc::clone(&self.registry),
            config: self.config.clone(),
            settings: self.settings.clone(),
            retry: self.retry.clone(),
            shutdown: Arc::clone(&self.shutdown),
            stopping: Arc::clone(&self.stopping),
            active_runs: Arc::clone(&self.active_runs),
            max_concurrent: self.max_concurrent,
        }
    }
}

impl Executor {
    pub fn new(
        db: Arc<Db>,
        registry: Arc<WorkflowRegistry>,
        config: ExecutorConfig,
        settings: OrchestratorSettings,
        max_concurrent: usize,
    ) -> Self {
        let retry = RetryPolicy {
            max_retries: settings.max_retries,
            base_backoff: settings.base_backoff,
            overload_backoff: settings.overload_backoff,
        };
        Self {
            db,
            registry,
            config,
            settings,
            retry,
            shutdown: Arc::new(Notify::new()),
            stopping: Arc::new(AtomicBool::new(false)),
            active_runs: Arc::new(AtomicUsize::new(0)),
            max_concurrent,
        }
    }

    /// Signal every executor loop to shut down.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::Relaxed);
        self.shutdown.notify_waiters();
    }

    /// Run the executor loop until shutdown.
    pub async fn run(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.run_base_dir).await?;

        let mut listener = sqlx::postgres::PgListener::connect_with(self.db.pool()).await?;
        listener.listen(DISPATCH_CHANNEL).await?;

        info!("executor started, listening for dispatches");

        loop {
            if self.stopping.load(Ordering::Relaxed) {
                info!("executor shutting down");
                return Ok(());
            }

            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("executor shutting down");
                    return Ok(());
                }
                notif = listener.recv() => {
                    if let Err(e) = notif {
                        warn!("PgListener error: {e}, falling back to poll");
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            loop {
                match self.process_next().await {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(e) => {
                        error!("dispatch processing error: {e}");
                        break;
                    }
                }
            }
        }
    }

    /// Claim and drive one dispatch. Returns false when the lane is empty
    /// or the concurrency budget is spent.
    pub async fn process_next(&self) -> Result<bool> {
        if self.active_runs.load(Ordering::Relaxed) >= self.max_concurrent {
            return Ok(false);
        }

        let lane = &self.settings.lanes.work;
        let Some(msg) = self
            .db
            .read_from_lane(&lane.name, self.config.visibility_timeout)
            .await?
        else {
            return Ok(false);
        };

        if msg.is_expired(lane) {
            warn!(msg_id = msg.msg_id, lane = %lane.name, "dispatch outlived lane TTL, archiving");
            self.db.archive_message(&lane.name, msg.msg_id).await?;
            return Ok(true);
        }

        let dispatch: DispatchMessage = match serde_json::from_value(msg.message.clone()) {
            Ok(dispatch) => dispatch,
            Err(e) => {
                warn!(msg_id = msg.msg_id, "malformed dispatch, archiving: {e}");
                self.db.archive_message(&lane.name, msg.msg_id).await?;
                return Ok(true);
            }
        };

        let run = match self.db.get_run(dispatch.run_id).await {
            Ok(run) => run,
            Err(Error::NotFound(_)) => {
                warn!(run = %dispatch.run_id, "dispatch references unknown run, archiving");
                self.db.archive_message(&lane.name, msg.msg_id).await?;
                return Ok(true);
            }
            Err(e) => return Err(e),
        };

        // Redelivery of finished work is a no-op.
        if run.status.is_terminal() {
            debug!(run = %run.id, status = %run.status, "run already terminal, acknowledging");
            self.db.archive_message(&lane.name, msg.msg_id).await?;
            return Ok(true);
        }

        // A completed task ignores stray dispatches unless they explicitly
        // request reactivation.
        if let Some(task_id) = run.task_id {
            let task = self.db.get_task(task_id).await?;
            if task.status == TaskStatus::Completed && !dispatch.is_reactivation {
                debug!(run = %run.id, task = %task.id, "task already completed, acknowledging");
                self.db.archive_message(&lane.name, msg.msg_id).await?;
                return Ok(true);
            }
        }

        let span = start_run_span(&dispatch.workflow, &run.id);
        self.execute_dispatch(&msg, &dispatch, run)
            .instrument(span)
            .await?;
        Ok(true)
    }

    async fn execute_dispatch(
        &self,
        msg: &LaneMessage,
        dispatch: &DispatchMessage,
        run: Run,
    ) -> Result<()> {
        let Some(workflow) = self.registry.get(&dispatch.workflow) else {
            warn!(workflow = %dispatch.workflow, run = %run.id, "no workflow for routing key, dead-lettering");
            let outcome = DriveOutcome::Failed {
                step: "<route>".to_string(),
                kind: FailureKind::Business,
                message: format!("no workflow registered for {}", dispatch.workflow),
            };
            return self.retire(msg, dispatch, &run, outcome).await;
        };

        record_state_transition(&Span::current(), &run.status.to_string(), "running");
        self.db.mark_run_running(run.id).await?;

        self.active_runs.fetch_add(1, Ordering::Relaxed);
        let outcome = self.drive_steps(workflow, dispatch, &run).await;
        self.active_runs.fetch_sub(1, Ordering::Relaxed);

        self.retire(msg, dispatch, &run, outcome).await
    }

    /// Drive the steps sequentially, checkpointing around each. Database
    /// trouble while driving counts as a transient failure of the current
    /// step; the retry policy owns the consequences.
    async fn drive_steps(
        &self,
        workflow: &Workflow,
        dispatch: &DispatchMessage,
        run: &Run,
    ) -> DriveOutcome {
        let work_dir = self.config.run_base_dir.join(run.id.0.to_string());
        if let Err(e) = tokio::fs::create_dir_all(&work_dir).await {
            return DriveOutcome::Failed {
                step: "<setup>".to_string(),
                kind: FailureKind::Transient,
                message: format!("cannot create work dir: {e}"),
            };
        }

        // Authoritative task state; the snapshot in the message is only a
        // routing hint.
        let task = match run.task_id {
            Some(id) => match self.db.get_task(id).await {
                Ok(task) => Some(task),
                Err(e) => {
                    return DriveOutcome::Failed {
                        step: "<setup>".to_string(),
                        kind: FailureKind::Transient,
                        message: format!("cannot fetch task: {e}"),
                    };
                }
            },
            None => None,
        };

        let checkpoints: HashMap<String, _> = match self.db.list_steps(run.id).await {
            Ok(steps) => steps.into_iter().map(|s| (s.step_name.clone(), s)).collect(),
            Err(e) => {
                return DriveOutcome::Failed {
                    step: "<setup>".to_string(),
                    kind: FailureKind::Transient,
                    message: format!("cannot list checkpoints: {e}"),
                };
            }
        };

        let mut input = serde_json::json!({
            "task": task,
            "is_reactivation": dispatch.is_reactivation,
            "reactivation_context": dispatch.reactivation_context,
        });

        for handler in &workflow.steps {
            let name = normalize_step_name(handler.name());

            // Crash recovery: a completed checkpoint means this step
            // already ran under a previous delivery of the same dispatch.
            if let Some(prior) = checkpoints.get(&name) {
                if prior.status == StepStatus::Completed {
                    debug!(step = %name, run = %run.id, "checkpoint found, skipping");
                    input = prior
                        .output
                        .as_deref()
                        .and_then(|o| serde_json::from_str(o).ok())
                        .unwrap_or(serde_json::Value::Null);
                    continue;
                }
            }

            if let Err(e) = self
                .db
                .write_checkpoint(
                    run.id,
                    &name,
                    StepStatus::Running,
                    &input,
                    self.settings.checkpoint_cap_bytes,
                )
                .await
            {
                return DriveOutcome::Failed {
                    step: name,
                    kind: FailureKind::Transient,
                    message: format!("checkpoint write failed: {e}"),
                };
            }

            let ctx = StepContext {
                run_id: run.id,
                task: task.clone(),
                input: input.clone(),
                work_dir: work_dir.clone(),
            };

            match handler.execute(&ctx).await {
                Ok(StepOutcome::Completed(output)) => {
                    if let Err(e) = self
                        .db
                        .write_checkpoint(
                            run.id,
                            &name,
                            StepStatus::Completed,
                            &output,
                            self.settings.checkpoint_cap_bytes,
                        )
                        .await
                    {
                        return DriveOutcome::Failed {
                            step: name,
                            kind: FailureKind::Transient,
                            message: format!("checkpoint write failed: {e}"),
                        };
                    }
                    info!(step = %name, run = %run.id, "step completed");
                    input = output;
                }
                Ok(StepOutcome::Suspended { reason }) => {
                    return DriveOutcome::Suspended { reason };
                }
                Err(step_err) => {
                    let detail = serde_json::json!({
                        "error": step_err.message,
                        "kind": step_err.kind.as_str(),
                    });
                    if let Err(e) = self
                        .db
                        .write_checkpoint(
                            run.id,
                            &name,
                            StepStatus::Failed,
                            &detail,
                            self.settings.checkpoint_cap_bytes,
                        )
                        .await
                    {
                        warn!(step = %name, "failed-step checkpoint write failed: {e}");
                    }
                    return DriveOutcome::Failed {
                        step: name,
                        kind: step_err.kind,
                        message: step_err.message,
                    };
                }
            }
        }

        DriveOutcome::Completed(input)
    }

    /// Retire a dispatch: terminal write and acknowledgement, a backoff
    /// re-enqueue, or a dead-letter copy. The archive (acknowledgement)
    /// always comes after the replacement state is durable.
    async fn retire(
        &self,
        msg: &LaneMessage,
        dispatch: &DispatchMessage,
        run: &Run,
        outcome: DriveOutcome,
    ) -> Result<()> {
        let lane = &self.settings.lanes.work;

        match outcome {
            DriveOutcome::Completed(result) => {
                record_state_transition(&Span::current(), "running", "completed");
                match self
                    .db
                    .complete_run(run.id, RunStatus::Completed, Some(&result), None)
                    .await
                {
                    Ok(done) => {
                        info!(run = %run.id, duration_ms = done.duration_ms, "run completed");
                    }
                    // A concurrent delivery finished it first; ours is a no-op.
                    Err(Error::InvalidTransition { .. }) => {
                        warn!(run = %run.id, "run already terminal");
                    }
                    Err(e) => return Err(e),
                }
                self.db.archive_message(&lane.name, msg.msg_id).await?;
                self.cleanup_work_dir(run.id).await;
            }

            DriveOutcome::Suspended { reason } => {
                record_state_transition(&Span::current(), "running", "suspended");
                self.db.suspend_run(run.id, &reason).await?;
                info!(run = %run.id, reason, "run suspended");
                // Explicit suspension acknowledges the message; the work
                // dir stays for the resume.
                self.db.archive_message(&lane.name, msg.msg_id).await?;
            }

            DriveOutcome::Failed {
                step,
                kind,
                message,
            } => match self.retry.decide(kind, dispatch.attempt) {
                RetryDecision::Requeue { delay } => {
                    warn!(
                        run = %run.id,
                        step,
                        attempt = dispatch.attempt,
                        delay_secs = delay.as_secs(),
                        kind = kind.as_str(),
                        %message,
                        "re-enqueueing after failure"
                    );
                    let mut next = dispatch.clone();
                    next.attempt += 1;
                    // Send the replacement before acknowledging the
                    // original; the dispatch must never be lost between.
                    publish(&self.db, lane, &next, delay.as_secs() as i32).await?;
                    self.db.archive_message(&lane.name, msg.msg_id).await?;
                    metrics::retries_scheduled().add(1, &[KeyValue::new("kind", kind.as_str())]);
                }
                RetryDecision::DeadLetter => {
                    record_state_transition(&Span::current(), "running", "failed");
                    let error_text = format!("{step}: {message}");
                    match self
                        .db
                        .complete_run(run.id, RunStatus::Failed, None, Some(&error_text))
                        .await
                    {
                        Ok(_) => {}
                        Err(Error::InvalidTransition { .. }) => {
                            warn!(run = %run.id, "run already terminal");
                        }
                        Err(e) => return Err(e),
                    }
                    error!(
                        run = %run.id,
                        step,
                        kind = kind.as_str(),
                        %message,
                        "run failed, dead-lettering"
                    );
                    let entry = DeadLetter {
                        original_lane: lane.name.clone(),
                        reason: format!("{}: {error_text}", kind.as_str()),
                        run_id: Some(run.id.0),
                        task_id: run.task_id.map(|t| t.0),
                        dispatch_id: run.dispatch_id.clone(),
                        original: msg.message.clone(),
                    };
                    self.db
                        .send_to_dead_letter(&self.settings.lanes.dead_letter.name, &entry)
                        .await?;
                    self.db.archive_message(&lane.name, msg.msg_id).await?;
                    self.cleanup_work_dir(run.id).await;
                }
            },
        }

        Ok(())
    }

    async fn cleanup_work_dir(&self, run_id: RunId) {
        let dir = self.config.run_base_dir.join(run_id.0.to_string());
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(run = %run_id, "work dir cleanup failed: {e}");
            }
        }
    }
}

//! Run persistence: idempotent start, checkpoints, terminal writes.
//!
//! Everything here is transactional. The unique indexes on
//! (task_id, run_number) and (dispatch_id) are the correctness backstop
//! for gap-free numbering and dispatch adoption under races the
//! application-level locking doesn't cover.

use crate::error::{Error, Result};
use crate::model::run::{Run, RunId, RunStatus, StepRecord, StepStatus};
use crate::model::task::TaskId;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use uuid::Uuid;

/// Fixed progress increment per checkpointed step. Progress holds at 90
/// until the run goes terminal, then snaps to exactly 100 on success.
const PROGRESS_INCREMENT: i32 = 15;

/// Progress shown for a step: min(step_order × increment, 90).
pub fn progress_for_step(step_order: i32) -> i32 {
    (step_order.saturating_mul(PROGRESS_INCREMENT)).min(90)
}

/// Lowercase, trimmed, whitespace collapsed to dashes. "Generate Code"
/// and "generate  code" address the same checkpoint row.
pub fn normalize_step_name(name: &str) -> String {
    let lowered = name.trim().to_lowercase();
    lowered.split_whitespace().collect::<Vec<_>>().join("-")
}

/// Deterministic head truncation with an explicit marker. The result is
/// always ≤ cap bytes and valid UTF-8; the marker records the original
/// size so the loss is visible.
pub fn truncate_payload(text: &str, cap: usize) -> String {
    if text.len() <= cap {
        return text.to_string();
    }
    let marker = format!("…[truncated, original_size={}]", text.len());
    if marker.len() >= cap {
        // Degenerate cap: the marker alone is the record.
        let mut end = cap;
        while !marker.is_char_boundary(end) {
            end -= 1;
        }
        return marker[..end].to_string();
    }
    let mut end = cap - marker.len();
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{marker}", &text[..end])
}

/// Parameters for starting a run.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub task_id: Option<TaskId>,
    /// Correlation to the queue message. Unique; redelivery adopts.
    pub dispatch_id: String,
    pub is_reactivation: bool,
    pub reactivation_source: Option<String>,
}

/// What happened when a run start was requested.
#[derive(Debug)]
pub enum StartResult {
    /// A fresh run row was allocated.
    Created(Run),
    /// A run for this dispatch_id already existed and was adopted.
    Adopted(Run),
}

impl StartResult {
    pub fn run(&self) -> &Run {
        match self {
            StartResult::Created(run) | StartResult::Adopted(run) => run,
        }
    }
}

const RUN_COLUMNS: &str = "id, task_id, run_number, status, dispatch_id, progress, current_step, is_reactivation, reactivation_source, result, error, started_at, finished_at, duration_ms";

impl super::Db {
    /// Start a run, idempotently. If a run already exists for this
    /// dispatch_id it is adopted; otherwise the next run_number is
    /// allocated under the task-row lock (or the standalone sequence) so
    /// concurrent starts produce a gap-free {1..N}.
    pub async fn start_run(&self, new: NewRun) -> Result<StartResult> {
        let mut tx = self.pool.begin().await?;

        // Redelivery of the dispatch message adopts the existing run.
        if let Some(run) = fetch_by_dispatch_id(&mut *tx, &new.dispatch_id).await? {
            tx.commit().await?;
            return Ok(StartResult::Adopted(run));
        }

        let run_number: i32 = match new.task_id {
            Some(task_id) => {
                // Lock the task row to serialize numbering for this task.
                let locked: Option<(Uuid,)> =
                    sqlx::query_as("SELECT id FROM tasks WHERE id = $1 FOR UPDATE")
                        .bind(task_id.0)
                        .fetch_optional(&mut *tx)
                        .await?;
                if locked.is_none() {
                    return Err(Error::NotFound(format!("task {task_id}")));
                }
                let (next,): (i32,) = sqlx::query_as(
                    "SELECT COALESCE(MAX(run_number), 0) + 1 FROM runs WHERE task_id = $1",
                )
                .bind(task_id.0)
                .fetch_one(&mut *tx)
                .await?;
                next
            }
            None => {
                let (next,): (i64,) = sqlx::query_as("SELECT nextval('standalone_run_numbers')")
                    .fetch_one(&mut *tx)
                    .await?;
                next as i32
            }
        };

        let id = Uuid::new_v4();
        let now = chrono::Utc::now();
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            "INSERT INTO runs (id, task_id, run_number, status, dispatch_id, progress, is_reactivation, reactivation_source, started_at)
             VALUES ($1, $2, $3, 'started', $4, 0, $5, $6, $7)
             ON CONFLICT (dispatch_id) WHERE dispatch_id IS NOT NULL DO NOTHING
             RETURNING id",
        )
        .bind(id)
        .bind(new.task_id.map(|t| t.0))
        .bind(run_number)
        .bind(&new.dispatch_id)
        .bind(new.is_reactivation)
        .bind(&new.reactivation_source)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        if inserted.is_none() {
            // A concurrent start won the dispatch_id race; adopt its run.
            let run = fetch_by_dispatch_id(&mut *tx, &new.dispatch_id)
                .await?
                .ok_or_else(|| Error::Other(format!("dispatch {} vanished", new.dispatch_id)))?;
            tx.commit().await?;
            return Ok(StartResult::Adopted(run));
        }

        if let Some(task_id) = new.task_id {
            sqlx::query(
                "UPDATE tasks SET status = 'processing', last_run_id = $1, updated_at = $2 WHERE id = $3",
            )
            .bind(id)
            .bind(now)
            .bind(task_id.0)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        metrics::runs_started().add(
            1,
            &[KeyValue::new(
                "reactivation",
                new.is_reactivation.to_string(),
            )],
        );

        Ok(StartResult::Created(self.get_run(RunId(id)).await?))
    }

    /// Get a run by ID.
    pub async fn get_run(&self, id: RunId) -> Result<Run> {
        let row: Option<RunRow> =
            sqlx::query_as(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;

        row.ok_or_else(|| Error::NotFound(format!("run {id}")))?
            .into_run()
    }

    /// All runs of a task, in run_number order.
    pub async fn list_runs_for_task(&self, task_id: TaskId) -> Result<Vec<Run>> {
        let rows: Vec<RunRow> = sqlx::query_as(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE task_id = $1 ORDER BY run_number"
        ))
        .bind(task_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RunRow::into_run).collect()
    }

    /// Mark a run as actively executing. Idempotent for an already-running
    /// run (retries re-enter here); resuming a suspended run also lands
    /// here via operator re-dispatch.
    pub async fn mark_run_running(&self, id: RunId) -> Result<()> {
        let affected = sqlx::query(
            "UPDATE runs SET status = 'running' WHERE id = $1 AND status IN ('started', 'running', 'suspended')",
        )
        .bind(id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            let current = self.get_run(id).await?;
            return Err(Error::InvalidTransition {
                from: current.status.to_string(),
                to: RunStatus::Running.to_string(),
            });
        }
        Ok(())
    }

    /// Find-or-create the checkpoint row for (run, normalized step name)
    /// and upsert its content. The unique constraint turns concurrent
    /// first writes into updates; the same step never duplicates.
    /// Oversized payloads are truncated, not rejected.
    pub async fn write_checkpoint(
        &self,
        run_id: RunId,
        step_name: &str,
        status: StepStatus,
        payload: &serde_json::Value,
        cap_bytes: usize,
    ) -> Result<StepRecord> {
        let name = normalize_step_name(step_name);
        let snapshot = truncate_payload(&serde_json::to_string(payload)?, cap_bytes);
        let now = chrono::Utc::now();

        let mut tx = self.pool.begin().await?;

        // Order is assigned once, on first write; the upsert keeps the
        // existing order on re-writes.
        let (next_order,): (i32,) =
            sqlx::query_as("SELECT COALESCE(MAX(step_order), 0) + 1 FROM run_steps WHERE run_id = $1")
                .bind(run_id.0)
                .fetch_one(&mut *tx)
                .await?;

        let row: StepRow = sqlx::query_as(
            "INSERT INTO run_steps (run_id, step_name, step_order, status, input, output, created_at, updated_at)
             VALUES ($1, $2, $3, $4,
                     CASE WHEN $4 = 'running' THEN $5 END,
                     CASE WHEN $4 <> 'running' THEN $5 END,
                     $6, $6)
             ON CONFLICT (run_id, step_name) DO UPDATE SET
                 status = $4,
                 input = COALESCE(CASE WHEN $4 = 'running' THEN $5 END, run_steps.input),
                 output = COALESCE(CASE WHEN $4 <> 'running' THEN $5 END, run_steps.output),
                 updated_at = $6
             RETURNING run_id, step_name, step_order, status, input, output, created_at, updated_at",
        )
        .bind(run_id.0)
        .bind(&name)
        .bind(next_order)
        .bind(status.to_string())
        .bind(&snapshot)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        // Progress never decreases and never reaches 100 before terminal.
        sqlx::query(
            "UPDATE runs SET progress = GREATEST(progress, $1), current_step = $2
             WHERE id = $3 AND status NOT IN ('completed', 'failed')",
        )
        .bind(progress_for_step(row.step_order))
        .bind(&name)
        .bind(run_id.0)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        metrics::checkpoints_written().add(1, &[KeyValue::new("status", status.to_string())]);

        row.into_step()
    }

    /// Checkpoints of a run in execution order.
    pub async fn list_steps(&self, run_id: RunId) -> Result<Vec<StepRecord>> {
        let rows: Vec<StepRow> = sqlx::query_as(
            "SELECT run_id, step_name, step_order, status, input, output, created_at, updated_at
             FROM run_steps WHERE run_id = $1 ORDER BY step_order",
        )
        .bind(run_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StepRow::into_step).collect()
    }

    /// Terminal write: exactly one per run. Updates the parent task in the
    /// same transaction; duration is computed server-side from the stored
    /// start timestamp.
    pub async fn complete_run(
        &self,
        id: RunId,
        status: RunStatus,
        result: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> Result<Run> {
        if !status.is_terminal() {
            return Err(Error::InvalidTransition {
                from: "running".to_string(),
                to: status.to_string(),
            });
        }

        let mut tx = self.pool.begin().await?;

        let row: Option<RunRow> = sqlx::query_as(&format!(
            "UPDATE runs
             SET status = $2,
                 finished_at = now(),
                 duration_ms = (EXTRACT(EPOCH FROM (now() - started_at)) * 1000)::BIGINT,
                 progress = CASE WHEN $2 = 'completed' THEN 100 ELSE progress END,
                 result = $3,
                 error = $4
             WHERE id = $1 AND status NOT IN ('completed', 'failed')
             RETURNING {RUN_COLUMNS}"
        ))
        .bind(id.0)
        .bind(status.to_string())
        .bind(result)
        .bind(error)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            let current = self.get_run(id).await?;
            return Err(Error::InvalidTransition {
                from: current.status.to_string(),
                to: status.to_string(),
            });
        };

        // The parent task follows the run's terminal state. Guarded so a
        // reactivated task that has already moved on isn't stomped.
        if let Some(task_id) = row.task_id {
            let task_status = if status == RunStatus::Completed {
                "completed"
            } else {
                "failed"
            };
            sqlx::query(
                "UPDATE tasks SET status = $1, last_run_id = $2, updated_at = now()
                 WHERE id = $3 AND status IN ('pending', 'processing')",
            )
            .bind(task_status)
            .bind(id.0)
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        metrics::run_state_transitions().add(
            1,
            &[
                KeyValue::new("from", "running"),
                KeyValue::new("to", status.to_string()),
            ],
        );
        let run = row.into_run()?;
        if let Some(ms) = run.duration_ms {
            metrics::run_duration_ms().record(ms as f64, &[]);
        }
        Ok(run)
    }

    /// Park a run. Not terminal (an operator re-dispatch resumes it),
    /// but the queue message is acknowledged on suspension.
    pub async fn suspend_run(&self, id: RunId, reason: &str) -> Result<Run> {
        let row: Option<RunRow> = sqlx::query_as(&format!(
            "UPDATE runs SET status = 'suspended', error = $2
             WHERE id = $1 AND status IN ('started', 'running')
             RETURNING {RUN_COLUMNS}"
        ))
        .bind(id.0)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.into_run(),
            None => {
                let current = self.get_run(id).await?;
                Err(Error::InvalidTransition {
                    from: current.status.to_string(),
                    to: RunStatus::Suspended.to_string(),
                })
            }
        }
    }

    /// Snapshot reference recorded by the task's most recent completed
    /// run, if any. Used as the reactivation source.
    pub async fn last_snapshot_ref(&self, task_id: TaskId) -> Result<Option<String>> {
        let row: Option<(Option<serde_json::Value>,)> = sqlx::query_as(
            "SELECT result FROM runs
             WHERE task_id = $1 AND status = 'completed'
             ORDER BY run_number DESC LIMIT 1",
        )
        .bind(task_id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .and_then(|(result,)| result)
            .and_then(|v| v.get("snapshot_ref").and_then(|s| s.as_str()).map(String::from)))
    }
}

async fn fetch_by_dispatch_id(
    tx: &mut sqlx::PgConnection,
    dispatch_id: &str,
) -> Result<Option<Run>> {
    let row: Option<RunRow> = sqlx::query_as(&format!(
        "SELECT {RUN_COLUMNS} FROM runs WHERE dispatch_id = $1"
    ))
    .bind(dispatch_id)
    .fetch_optional(tx)
    .await?;

    row.map(RunRow::into_run).transpose()
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    task_id: Option<Uuid>,
    run_number: i32,
    status: String,
    dispatch_id: Option<String>,
    progress: i32,
    current_step: Option<String>,
    is_reactivation: bool,
    reactivation_source: Option<String>,
    result: Option<serde_json::Value>,
    error: Option<String>,
    started_at: chrono::DateTime<chrono::Utc>,
    finished_at: Option<chrono::DateTime<chrono::Utc>>,
    duration_ms: Option<i64>,
}

impl RunRow {
    fn into_run(self) -> Result<Run> {
        Ok(Run {
            id: RunId(self.id),
            task_id: self.task_id.map(TaskId),
            run_number: self.run_number,
            status: self.status.parse()?,
            dispatch_id: self.dispatch_id,
            progress: self.progress,
            current_step: self.current_step,
            is_reactivation: self.is_reactivation,
            reactivation_source: self.reactivation_source,
            result: self.result,
            error: self.error,
            started_at: self.started_at,
            finished_at: self.finished_at,
            duration_ms: self.duration_ms,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StepRow {
    run_id: Uuid,
    step_name: String,
    step_order: i32,
    status: String,
    input: Option<String>,
    output: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl StepRow {
    fn into_step(self) -> Result<StepRecord> {
        Ok(StepRecord {
            run_id: RunId(self.run_id),
            step_name: self.step_name,
            step_order: self.step_order,
            status: self.status.parse()?,
            input: self.input,
            output: self.output,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

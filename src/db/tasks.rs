//! Task persistence: create-or-update on external_id, lookups, lifecycle.

use crate::error::{Error, Result};
use crate::model::run::RunId;
use crate::model::task::{Task, TaskId, TaskStatus};
use uuid::Uuid;

/// Fields applied when creating or updating a task from an event. `None`
/// leaves the stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct TaskFields {
    pub title: Option<String>,
    pub description: Option<String>,
    pub target_ref: Option<String>,
    pub priority: Option<i32>,
    pub upstream_status: Option<String>,
}

const TASK_COLUMNS: &str = "id, external_id, title, description, target_ref, priority, upstream_status, status, reactivation_count, last_run_id, created_at, updated_at";

impl super::Db {
    /// Create-or-update a task keyed on external_id. The unique constraint
    /// collapses concurrent creates for the same upstream item onto one
    /// row; redelivered creates become plain field refreshes.
    pub async fn upsert_task(&self, external_id: &str, fields: &TaskFields) -> Result<Task> {
        let now = chrono::Utc::now();
        let row: TaskRow = sqlx::query_as(&format!(
            "INSERT INTO tasks (id, external_id, title, description, target_ref, priority, upstream_status, status, reactivation_count, created_at, updated_at)
             VALUES ($1, $2, COALESCE($3, ''), COALESCE($4, ''), $5, COALESCE($6, 0), $7, 'pending', 0, $8, $8)
             ON CONFLICT (external_id) DO UPDATE SET
                 title = COALESCE($3, tasks.title),
                 description = COALESCE($4, tasks.description),
                 target_ref = COALESCE($5, tasks.target_ref),
                 priority = COALESCE($6, tasks.priority),
                 upstream_status = COALESCE($7, tasks.upstream_status),
                 updated_at = $8
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(external_id)
        .bind(&fields.title)
        .bind(&fields.description)
        .bind(&fields.target_ref)
        .bind(fields.priority)
        .bind(&fields.upstream_status)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        row.into_task()
    }

    /// Get a task by ID.
    pub async fn get_task(&self, id: TaskId) -> Result<Task> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;

        row.ok_or_else(|| Error::NotFound(format!("task {id}")))?
            .into_task()
    }

    /// Look a task up by its upstream identifier.
    pub async fn find_task_by_external_id(&self, external_id: &str) -> Result<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE external_id = $1"
        ))
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TaskRow::into_task).transpose()
    }

    /// List tasks, newest first, optionally filtered by status.
    pub async fn list_tasks(&self, status: Option<TaskStatus>, limit: i64) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = match status {
            Some(s) => {
                sqlx::query_as(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = $1 ORDER BY updated_at DESC LIMIT $2"
                ))
                .bind(s.to_string())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks ORDER BY updated_at DESC LIMIT $1"
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(TaskRow::into_task).collect()
    }

    /// Move a terminal task back to processing, bumping the reactivation
    /// counter. Guarded: only fires from a terminal status.
    pub async fn reactivate_task(&self, id: TaskId) -> Result<Task> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "UPDATE tasks
             SET status = 'processing', reactivation_count = reactivation_count + 1, updated_at = now()
             WHERE id = $1 AND status IN ('completed', 'failed')
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.into_task(),
            None => {
                let current = self.get_task(id).await?;
                Err(Error::InvalidTransition {
                    from: current.status.to_string(),
                    to: TaskStatus::Processing.to_string(),
                })
            }
        }
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
pub(crate) struct TaskRow {
    id: Uuid,
    external_id: String,
    title: String,
    description: String,
    target_ref: Option<String>,
    priority: i32,
    upstream_status: Option<String>,
    status: String,
    reactivation_count: i32,
    last_run_id: Option<Uuid>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl TaskRow {
    pub(crate) fn into_task(self) -> Result<Task> {
        Ok(Task {
            id: TaskId(self.id),
            external_id: self.external_id,
            title: self.title,
            description: self.description,
            target_ref: self.target_ref,
            priority: self.priority,
            upstream_status: self.upstream_status,
            status: self.status.parse()?,
            reactivation_count: self.reactivation_count,
            last_run_id: self.last_run_id.map(RunId),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

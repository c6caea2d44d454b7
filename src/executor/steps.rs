//! Step handlers and the workflow registry.
//!
//! A workflow is an ordered list of named steps. The orchestrator treats
//! each step as an opaque unit with structured input/output. The shipped
//! handler shells out to a hook command; tests and embedders register
//! in-process handlers instead.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::dispatch::retry::FailureKind;
use crate::error::{Error, Result};
use crate::model::run::RunId;
use crate::model::task::Task;

/// Exit codes a hook uses to classify its own failure.
const EXIT_TRANSIENT: i32 = 75; // EX_TEMPFAIL
const EXIT_OVERLOADED: i32 = 69; // EX_UNAVAILABLE

/// Why a step failed, as the retry policy sees it.
#[derive(Debug)]
pub struct StepError {
    pub kind: FailureKind,
    pub message: String,
}

impl StepError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn overloaded(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Overloaded,
            message: message.into(),
        }
    }

    pub fn business(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Business,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.kind.as_str())
    }
}

/// What a step produced.
#[derive(Debug)]
pub enum StepOutcome {
    /// Step finished; the value becomes the checkpoint output and the
    /// input of the next step.
    Completed(serde_json::Value),
    /// Park the run. The dispatch is acknowledged; an operator
    /// re-dispatch resumes from the checkpoint.
    Suspended { reason: String },
}

/// Execution context handed to each step.
pub struct StepContext {
    pub run_id: RunId,
    /// Authoritative task state, freshly fetched. None for standalone runs.
    pub task: Option<Task>,
    /// Output of the previous step (the dispatch context for the first).
    pub input: serde_json::Value,
    /// Per-run scratch directory, persistent across redeliveries.
    pub work_dir: PathBuf,
}

#[async_trait]
pub trait StepHandler: Send + Sync {
    fn name(&self) -> &str;
    async fn execute(&self, ctx: &StepContext) -> std::result::Result<StepOutcome, StepError>;
}

/// A named, ordered pipeline of steps.
pub struct Workflow {
    pub name: String,
    pub steps: Vec<Arc<dyn StepHandler>>,
}

/// Registry of workflows, indexed by routing key.
pub struct WorkflowRegistry {
    workflows: HashMap<String, Workflow>,
}

impl WorkflowRegistry {
    /// Create an empty registry with no workflows.
    pub fn empty() -> Self {
        Self {
            workflows: HashMap::new(),
        }
    }

    pub fn register(&mut self, workflow: Workflow) {
        self.workflows.insert(workflow.name.clone(), workflow);
    }

    /// Look up a workflow by routing key.
    pub fn get(&self, name: &str) -> Option<&Workflow> {
        self.workflows.get(name)
    }

    /// Load all `.toml` files from a directory; each file defines one
    /// workflow of hook-command steps.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let mut registry = Self::empty();

        let entries = std::fs::read_dir(dir).map_err(|e| {
            Error::Config(format!("cannot read workflow dir {}: {e}", dir.display()))
        })?;

        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "toml") {
                let content = std::fs::read_to_string(&path)?;
                let config: WorkflowConfig = toml::from_str(&content).map_err(|e| {
                    Error::Config(format!("bad workflow config {}: {e}", path.display()))
                })?;
                let steps = config
                    .workflow
                    .steps
                    .into_iter()
                    .map(|step| {
                        Arc::new(CommandStep::new(step.name, step.command)) as Arc<dyn StepHandler>
                    })
                    .collect();
                registry.register(Workflow {
                    name: config.workflow.name,
                    steps,
                });
            }
        }

        Ok(registry)
    }
}

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct WorkflowConfig {
    workflow: WorkflowDef,
}

#[derive(Debug, Deserialize)]
struct WorkflowDef {
    name: String,
    #[serde(default, rename = "step")]
    steps: Vec<StepDef>,
}

#[derive(Debug, Deserialize)]
struct StepDef {
    name: String,
    command: PathBuf,
}

/// Step handler that runs an external hook command.
///
/// Contract: the step input is written to `input.json` in the run's work
/// dir before the hook runs; the hook writes `output.json`. Exit 0 is
/// success; 75 (EX_TEMPFAIL) signals a transient failure, 69
/// (EX_UNAVAILABLE) signals downstream overload, anything else is a
/// business failure. A hook parks the run by writing
/// `{"suspend": "<reason>"}` as its output.
pub struct CommandStep {
    name: String,
    command: PathBuf,
}

impl CommandStep {
    pub fn new(name: impl Into<String>, command: PathBuf) -> Self {
        Self {
            name: name.into(),
            command,
        }
    }
}

#[async_trait]
impl StepHandler for CommandStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StepContext) -> std::result::Result<StepOutcome, StepError> {
        let input_bytes = serde_json::to_vec_pretty(&ctx.input)
            .map_err(|e| StepError::business(format!("cannot serialize step input: {e}")))?;
        tokio::fs::write(ctx.work_dir.join("input.json"), input_bytes)
            .await
            .map_err(|e| StepError::transient(format!("cannot write input.json: {e}")))?;

        // Resolve relative command paths against the process CWD (project
        // root), not the work dir. Command::new + current_dir resolves
        // relative paths after chdir, which would look in the work dir.
        let abs_command = if self.command.is_relative() {
            std::env::current_dir()
                .map_err(|e| StepError::transient(format!("cannot resolve cwd: {e}")))?
                .join(&self.command)
        } else {
            self.command.clone()
        };

        debug!(
            step = %self.name,
            command = %abs_command.display(),
            run = %ctx.run_id,
            "running hook"
        );

        let mut command = tokio::process::Command::new(&abs_command);
        command
            .current_dir(&ctx.work_dir)
            .env("CONDUCTOR_WORK_DIR", &ctx.work_dir)
            .env("CONDUCTOR_RUN_ID", ctx.run_id.0.to_string())
            .env("CONDUCTOR_STEP", &self.name);
        if let Some(task) = &ctx.task {
            command.env("CONDUCTOR_TASK_ID", task.id.0.to_string());
            command.env("CONDUCTOR_EXTERNAL_ID", &task.external_id);
        }

        let status = command.status().await.map_err(|e| {
            StepError::business(format!("cannot spawn {}: {e}", abs_command.display()))
        })?;

        match status.code() {
            Some(0) => {
                let out_path = ctx.work_dir.join("output.json");
                let content = tokio::fs::read_to_string(&out_path)
                    .await
                    .map_err(|e| StepError::business(format!("missing output.json: {e}")))?;
                let value: serde_json::Value = serde_json::from_str(&content)
                    .map_err(|e| StepError::business(format!("bad output.json: {e}")))?;
                if let Some(reason) = value.get("suspend").and_then(|v| v.as_str()) {
                    return Ok(StepOutcome::Suspended {
                        reason: reason.to_string(),
                    });
                }
                Ok(StepOutcome::Completed(value))
            }
            Some(EXIT_TRANSIENT) => Err(StepError::transient(format!(
                "{} signalled a transient failure",
                self.name
            ))),
            Some(EXIT_OVERLOADED) => Err(StepError::overloaded(format!(
                "{} signalled provider overload",
                self.name
            ))),
            code => Err(StepError::business(format!(
                "{} exited with status {}",
                self.name,
                code.unwrap_or(-1)
            ))),
        }
    }
}

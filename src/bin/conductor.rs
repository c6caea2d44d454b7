//! conductor CLI — operator interface to the orchestrator.

use clap::{Parser, Subcommand};
use conductor_rs::config::Config;
use conductor_rs::db::Db;
use conductor_rs::executor::steps::WorkflowRegistry;
use conductor_rs::executor::{Executor, ExecutorConfig};
use conductor_rs::ingress::{IngestOutcome, Ingestor, IngressConsumer};
use conductor_rs::llm::anthropic_client;
use conductor_rs::model::event::InboundEvent;
use conductor_rs::model::run::RunId;
use conductor_rs::model::task::TaskStatus;
use conductor_rs::telemetry::{TelemetryConfig, init_telemetry};
use conductor_rs::triage::TriageRouter;
use conductor_rs::triage::intent::{IntentClassifier, KeywordClassifier, LlmClassifier};
use secrecy::ExposeSecret;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Parser)]
#[command(name = "conductor", about = "Idempotent event-driven workflow orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator: ingress consumer, executors, janitor
    Serve {
        /// Directory containing workflow TOML definitions
        #[arg(long, default_value = "workflows")]
        workflows: PathBuf,
        /// Number of executor loops
        #[arg(long, default_value_t = 2)]
        workers: usize,
        /// Global maximum concurrent runs
        #[arg(long, default_value_t = 4)]
        max_concurrent: usize,
    },
    /// Event operations
    Event {
        #[command(subcommand)]
        action: EventAction,
    },
    /// Task operations
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Run operations
    Run {
        #[command(subcommand)]
        action: RunAction,
    },
    /// Dead-letter lane operations
    DeadLetter {
        #[command(subcommand)]
        action: DeadLetterAction,
    },
}

#[derive(Subcommand)]
enum EventAction {
    /// Ingest a notification from a JSON file
    Inject {
        /// Path to a JSON-encoded inbound event
        file: PathBuf,
    },
    /// Show an event audit record
    Show {
        /// Event ID (full UUID)
        id: String,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// List tasks
    List {
        /// Filter by internal status
        #[arg(long)]
        status: Option<String>,
        /// Maximum tasks to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show a task and its runs
    Show {
        /// Task ID (full UUID or prefix)
        id: String,
    },
}

#[derive(Subcommand)]
enum RunAction {
    /// Show a run and its checkpoints
    Show {
        /// Run ID (full UUID)
        id: String,
    },
}

#[derive(Subcommand)]
enum DeadLetterAction {
    /// List dead-letter entries
    List {
        /// Maximum entries to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Re-publish an entry's original message to its original lane
    Replay {
        /// Dead-letter message id
        msg_id: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            workflows,
            workers,
            max_concurrent,
        } => cmd_serve(workflows, workers, max_concurrent).await,
        Command::Event { action } => {
            let (config, db) = connect().await?;
            match action {
                EventAction::Inject { file } => cmd_event_inject(&config, db, file).await,
                EventAction::Show { id } => cmd_event_show(&db, id).await,
            }
        }
        Command::Task { action } => {
            let (_, db) = connect().await?;
            match action {
                TaskAction::List { status, limit } => cmd_task_list(&db, status, limit).await,
                TaskAction::Show { id } => cmd_task_show(&db, id).await,
            }
        }
        Command::Run { action } => {
            let (_, db) = connect().await?;
            match action {
                RunAction::Show { id } => cmd_run_show(&db, id).await,
            }
        }
        Command::DeadLetter { action } => {
            let (config, db) = connect().await?;
            let lane = config.orchestrator.lanes.dead_letter.name.clone();
            match action {
                DeadLetterAction::List { limit } => cmd_dead_letter_list(&db, &lane, limit).await,
                DeadLetterAction::Replay { msg_id } => {
                    let new_id = db.replay_dead_letter(&lane, msg_id).await?;
                    println!("Replayed {msg_id} → new message {new_id}");
                    Ok(())
                }
            }
        }
    }
}

async fn connect() -> anyhow::Result<(Config, Arc<Db>)> {
    let config = Config::from_env()?;
    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    for lane in [
        &config.orchestrator.lanes.ingress,
        &config.orchestrator.lanes.work,
        &config.orchestrator.lanes.dead_letter,
    ] {
        db.create_lane(&lane.name).await?;
    }
    Ok((config, Arc::new(db)))
}

fn build_classifier(config: &Config) -> anyhow::Result<Arc<dyn IntentClassifier>> {
    match &config.anthropic_api_key {
        Some(key) => Ok(Arc::new(LlmClassifier::new(&anthropic_client(key)?))),
        None => {
            tracing::warn!("ANTHROPIC_API_KEY not set, intent classification is keyword-only");
            Ok(Arc::new(KeywordClassifier))
        }
    }
}

async fn cmd_serve(workflows: PathBuf, workers: usize, max_concurrent: usize) -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "conductor".to_string(),
    })?;

    let (config, db) = {
        let db = Db::connect(config.database_url.expose_secret()).await?;
        db.migrate().await?;
        for lane in [
            &config.orchestrator.lanes.ingress,
            &config.orchestrator.lanes.work,
            &config.orchestrator.lanes.dead_letter,
        ] {
            db.create_lane(&lane.name).await?;
        }
        (config, Arc::new(db))
    };

    let registry = Arc::new(WorkflowRegistry::load_from_dir(&workflows)?);
    let classifier = build_classifier(&config)?;
    let router = TriageRouter::new(
        Arc::clone(&db),
        classifier,
        config.orchestrator.default_snapshot_ref.clone(),
    );
    let ingestor = Arc::new(Ingestor::new(
        Arc::clone(&db),
        router,
        config.orchestrator.clone(),
        config.webhook_secret.clone(),
    ));

    let ingress = IngressConsumer::new(
        Arc::clone(&db),
        ingestor,
        config.orchestrator.lanes.ingress.clone(),
    );
    let executor = Executor::new(
        Arc::clone(&db),
        registry,
        ExecutorConfig::default(),
        config.orchestrator.clone(),
        max_concurrent,
    );

    let janitor_shutdown = Arc::new(Notify::new());
    {
        let ingress_shutdown = ingress.shutdown_handle();
        let executor_ctrl = executor.clone();
        let janitor_ctrl = Arc::clone(&janitor_shutdown);
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            ingress_shutdown.notify_one();
            executor_ctrl.shutdown();
            janitor_ctrl.notify_one();
        });
    }

    let mut handles = Vec::new();
    handles.push(tokio::spawn(async move { ingress.run().await }));
    for _ in 0..workers {
        let worker = executor.clone();
        handles.push(tokio::spawn(async move { worker.run().await }));
    }
    {
        let db = Arc::clone(&db);
        handles.push(tokio::spawn(async move {
            janitor_loop(db, janitor_shutdown).await
        }));
    }

    for handle in handles {
        if let Err(e) = handle.await? {
            tracing::error!("loop exited with error: {e}");
        }
    }
    Ok(())
}

const JANITOR_INTERVAL: Duration = Duration::from_secs(60);
/// Locks older than this with no release are treated as crashed holders.
const STALE_LOCK_MAX_AGE: Duration = Duration::from_secs(900);

/// Periodic maintenance: lease recovery and dedup ledger GC.
async fn janitor_loop(db: Arc<Db>, shutdown: Arc<Notify>) -> conductor_rs::error::Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.notified() => return Ok(()),
            _ = tokio::time::sleep(JANITOR_INTERVAL) => {}
        }

        match db.cleanup_stale_locks(STALE_LOCK_MAX_AGE).await {
            Ok(0) => {}
            Ok(n) => tracing::info!(reclaimed = n, "recovered stale resource locks"),
            Err(e) => tracing::warn!("lock cleanup failed: {e}"),
        }
        match db.purge_expired_dedup_keys().await {
            Ok(0) => {}
            Ok(n) => tracing::debug!(purged = n, "purged expired dedup keys"),
            Err(e) => tracing::warn!("dedup purge failed: {e}"),
        }
    }
}

async fn cmd_event_inject(config: &Config, db: Arc<Db>, file: PathBuf) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(&file)?;
    let event: InboundEvent = serde_json::from_str(&content)?;

    let classifier = build_classifier(config)?;
    let router = TriageRouter::new(
        Arc::clone(&db),
        classifier,
        config.orchestrator.default_snapshot_ref.clone(),
    );
    let ingestor = Ingestor::new(
        db,
        router,
        config.orchestrator.clone(),
        config.webhook_secret.clone(),
    );

    match ingestor.ingest(&event).await? {
        IngestOutcome::Processed { task_id, run_id } => {
            println!(
                "Processed: task {} run {}",
                task_id.map(|t| t.to_string()).unwrap_or("-".to_string()),
                run_id.map(|r| r.to_string()).unwrap_or("-".to_string()),
            );
        }
        IngestOutcome::Duplicate => println!("Duplicate: already seen"),
        IngestOutcome::Ignored { reason } => println!("Ignored: {reason}"),
        IngestOutcome::Busy => println!("Busy: resource locked, retry later"),
    }
    Ok(())
}

async fn cmd_event_show(db: &Db, id_str: String) -> anyhow::Result<()> {
    let id = uuid::Uuid::parse_str(&id_str)?;
    let event = db.get_event(id).await?;

    println!("ID:           {}", event.id);
    println!("Source:       {}", event.source);
    println!("Type:         {}", event.event_type);
    println!("Resource:     {}", event.resource_id);
    println!("Processed:    {}", event.processed);
    if let Some(error) = &event.error {
        println!("Error:        {error}");
    }
    println!(
        "Task:         {}",
        event
            .task_id
            .map(|t| t.0.to_string())
            .unwrap_or("-".to_string())
    );
    println!("Received:     {}", event.received_at);
    if let Some(at) = event.processed_at {
        println!("Processed at: {at}");
    }
    println!("Payload:      {}", serde_json::to_string_pretty(&event.payload)?);
    Ok(())
}

async fn cmd_task_list(db: &Db, status: Option<String>, limit: i64) -> anyhow::Result<()> {
    let status_filter: Option<TaskStatus> = match status {
        Some(s) => Some(
            s.parse()
                .map_err(|_| anyhow::anyhow!("invalid status: {s}"))?,
        ),
        None => None,
    };

    let tasks = db.list_tasks(status_filter, limit).await?;

    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<16}  {:<10}  {:<4}  {:<5}  {:<32}  UPDATED",
        "ID", "EXTERNAL", "STATUS", "PRI", "REACT", "TITLE"
    );
    println!("{}", "-".repeat(100));

    for task in &tasks {
        let title = if task.title.len() > 32 {
            &task.title[..32]
        } else {
            &task.title
        };
        println!(
            "{:<8}  {:<16}  {:<10}  {:<4}  {:<5}  {:<32}  {}",
            task.id.to_string(),
            task.external_id,
            task.status.to_string(),
            task.priority,
            task.reactivation_count,
            title,
            task.updated_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!("\n{} task(s)", tasks.len());
    Ok(())
}

async fn cmd_task_show(db: &Db, id_str: String) -> anyhow::Result<()> {
    // Support prefix matching: find the task whose ID starts with the
    // given string.
    let task = if id_str.len() < 36 {
        let tasks = db.list_tasks(None, 100).await?;
        let matches: Vec<_> = tasks
            .iter()
            .filter(|t| t.id.0.to_string().starts_with(&id_str))
            .collect();
        match matches.len() {
            0 => anyhow::bail!("no task matching prefix '{id_str}'"),
            1 => matches[0].clone(),
            n => anyhow::bail!("{n} tasks match prefix '{id_str}' — be more specific"),
        }
    } else {
        let uuid = uuid::Uuid::parse_str(&id_str)?;
        db.get_task(conductor_rs::model::task::TaskId(uuid)).await?
    };

    println!("ID:           {}", task.id.0);
    println!("External:     {}", task.external_id);
    println!("Title:        {}", task.title);
    println!("Status:       {}", task.status);
    println!(
        "Upstream:     {}",
        task.upstream_status.as_deref().unwrap_or("-")
    );
    println!("Priority:     {}", task.priority);
    println!("Reactivated:  {}x", task.reactivation_count);
    println!(
        "Target:       {}",
        task.target_ref.as_deref().unwrap_or("-")
    );
    println!("Created:      {}", task.created_at);
    println!("Updated:      {}", task.updated_at);

    let runs = db.list_runs_for_task(task.id).await?;
    if !runs.is_empty() {
        println!("---");
        println!(
            "{:<4}  {:<8}  {:<10}  {:<5}  {:<6}  STARTED",
            "#", "ID", "STATUS", "PROG", "REACT"
        );
        for run in &runs {
            println!(
                "{:<4}  {:<8}  {:<10}  {:<5}  {:<6}  {}",
                run.run_number,
                run.id.to_string(),
                run.status.to_string(),
                format!("{}%", run.progress),
                run.is_reactivation,
                run.started_at.format("%Y-%m-%d %H:%M")
            );
        }
    }
    Ok(())
}

async fn cmd_run_show(db: &Db, id_str: String) -> anyhow::Result<()> {
    let uuid = uuid::Uuid::parse_str(&id_str)?;
    let run = db.get_run(RunId(uuid)).await?;

    println!("ID:           {}", run.id.0);
    println!(
        "Task:         {}",
        run.task_id.map(|t| t.0.to_string()).unwrap_or("-".to_string())
    );
    println!("Number:       {}", run.run_number);
    println!("Status:       {}", run.status);
    println!("Progress:     {}%", run.progress);
    println!(
        "Step:         {}",
        run.current_step.as_deref().unwrap_or("-")
    );
    println!("Reactivation: {}", run.is_reactivation);
    if let Some(source) = &run.reactivation_source {
        println!("Source:       {source}");
    }
    println!("Started:      {}", run.started_at);
    if let Some(finished) = run.finished_at {
        println!("Finished:     {finished}");
    }
    if let Some(ms) = run.duration_ms {
        println!("Duration:     {ms}ms");
    }
    if let Some(error) = &run.error {
        println!("Error:        {error}");
    }
    if let Some(result) = &run.result {
        println!("Result:       {}", serde_json::to_string_pretty(result)?);
    }

    let steps = db.list_steps(run.id).await?;
    if !steps.is_empty() {
        println!("---");
        println!("{:<4}  {:<24}  {:<10}  UPDATED", "#", "STEP", "STATUS");
        for step in &steps {
            println!(
                "{:<4}  {:<24}  {:<10}  {}",
                step.step_order,
                step.step_name,
                step.status.to_string(),
                step.updated_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }
    Ok(())
}

async fn cmd_dead_letter_list(db: &Db, lane: &str, limit: i64) -> anyhow::Result<()> {
    let entries = db.list_dead_letters(lane, limit).await?;

    if entries.is_empty() {
        println!("Dead-letter lane is empty.");
        return Ok(());
    }

    println!("{:<8}  {:<10}  {:<10}  {:<40}  PARKED", "MSG", "LANE", "RUN", "REASON");
    println!("{}", "-".repeat(100));

    for entry in &entries {
        let parsed: Option<conductor_rs::db::lanes::DeadLetter> =
            serde_json::from_value(entry.message.clone()).ok();
        let (lane, run, reason) = match &parsed {
            Some(dl) => (
                dl.original_lane.as_str(),
                dl.run_id
                    .map(|r| r.to_string()[..8].to_string())
                    .unwrap_or("-".to_string()),
                dl.reason.as_str(),
            ),
            None => ("?", "-".to_string(), "unparseable entry"),
        };
        let reason_display = if reason.len() > 40 {
            &reason[..40]
        } else {
            reason
        };
        println!(
            "{:<8}  {:<10}  {:<10}  {:<40}  {}",
            entry.msg_id,
            lane,
            run,
            reason_display,
            entry.enqueued_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!("\n{} entry(ies)", entries.len());
    Ok(())
}

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use opsconductor_core::config::EngineConfig;
use opsconductor_core::OpsConfig;
use opsconductor_scheduler::{
    db, ApprovalRecord, ChannelEngine, DispatchSettings, Dispatcher, ExecutionEngine,
    ExecutionRequest, ExecutionTracker, HttpExecutionEngine, Job, NewSchedule, ScheduleStore,
    SqliteApprovalStore, SqliteJobCatalog, SystemClock,
};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::cli::{ApprovalCommand, Command, ExecutionCommand, JobCommand, ScheduleCommand};

/// Queue depth of the local engine used when no engine URL is configured.
const LOCAL_QUEUE_CAPACITY: usize = 256;

/// Run one CLI command against the configured database. Everything but
/// `run` prints its result as pretty JSON on stdout.
pub async fn execute(command: Command, config: OpsConfig) -> anyhow::Result<()> {
    let store = open_store(&config)?;
    match command {
        Command::Run => run(&config, store).await,
        other => {
            let output = handle(other, &config, &store).await?;
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
    }
}

pub fn open_store(config: &OpsConfig) -> anyhow::Result<ScheduleStore> {
    let path = &config.database.path;
    ensure_parent_dir(path);
    info!(path = %path, "opening SQLite database");
    let conn = db::open(path, Duration::from_millis(config.database.busy_timeout_ms))?;
    Ok(ScheduleStore::new(conn)?)
}

async fn run(config: &OpsConfig, store: ScheduleStore) -> anyhow::Result<()> {
    let dispatcher = build_dispatcher(config, store)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loop_handle = tokio::spawn(dispatcher.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    loop_handle.await?;
    Ok(())
}

async fn handle(
    command: Command,
    config: &OpsConfig,
    store: &ScheduleStore,
) -> anyhow::Result<Value> {
    match command {
        Command::Run => anyhow::bail!("`run` does not produce a single result"),
        Command::Tick => {
            let dispatcher = build_dispatcher(config, store.clone())?;
            to_json(&dispatcher.tick().await?)
        }
        Command::Job(cmd) => job(cmd, store),
        Command::Approval(cmd) => approval(cmd, store),
        Command::Schedule(cmd) => schedule(cmd, store),
        Command::Execution(cmd) => execution(cmd, store),
    }
}

fn job(cmd: JobCommand, store: &ScheduleStore) -> anyhow::Result<Value> {
    match cmd {
        JobCommand::Add {
            id,
            name,
            description,
            action,
            targets,
            timeout_secs,
            max_retries,
            retry_delay_secs,
            requires_approval,
            created_by,
        } => {
            let action_config: Value =
                serde_json::from_str(&action).context("--action must be valid JSON")?;
            let mut job = Job::new(name, action_config);
            if let Some(id) = id {
                job.id = id;
            }
            job.description = description;
            job.targets = targets;
            job.timeout_secs = timeout_secs;
            job.max_retries = max_retries;
            job.retry_delay_secs = retry_delay_secs;
            job.requires_approval = requires_approval;
            job.created_by = created_by;

            SqliteJobCatalog::new(store).register_job(&job, Utc::now())?;
            to_json(&job)
        }
    }
}

fn approval(cmd: ApprovalCommand, store: &ScheduleStore) -> anyhow::Result<Value> {
    match cmd {
        ApprovalCommand::Set {
            job,
            required,
            current,
            status,
        } => {
            let record = ApprovalRecord {
                job_id: job,
                required_approvals: required,
                current_approvals: current,
                status,
            };
            SqliteApprovalStore::new(store).record_approval(&record, Utc::now())?;
            to_json(&record)
        }
    }
}

fn schedule(cmd: ScheduleCommand, store: &ScheduleStore) -> anyhow::Result<Value> {
    let now = Utc::now();
    match cmd {
        ScheduleCommand::Create {
            job,
            name,
            description,
            rule,
            timezone,
            start,
            end,
            max_runs,
            paused,
            created_by,
        } => {
            let rule = rule
                .into_rule()
                .context("a recurrence rule is required: --cron, --interval or --once")?;
            let mut new = NewSchedule::new(job, name, rule);
            new.description = description;
            new.timezone = timezone;
            new.start_date = start;
            new.end_date = end;
            new.max_runs = max_runs;
            new.start_paused = paused;
            new.created_by = created_by;
            to_json(&store.create_schedule(new, now)?)
        }
        ScheduleCommand::List { status } => to_json(&store.list_schedules(status)?),
        ScheduleCommand::Show { id } => to_json(&store.get_schedule(&id)?),
        ScheduleCommand::Pause { id } => to_json(&store.pause(&id, now)?),
        ScheduleCommand::Resume { id } => to_json(&store.resume(&id, now)?),
        ScheduleCommand::Disable { id, reason } => to_json(&store.disable(&id, reason, now)?),
        ScheduleCommand::Update(args) => {
            let (id, update) = args.into_update();
            to_json(&store.update_schedule(&id, update, now)?)
        }
        ScheduleCommand::Delete { id } => {
            store.delete_schedule(&id)?;
            Ok(json!({ "deleted": id }))
        }
    }
}

fn execution(cmd: ExecutionCommand, store: &ScheduleStore) -> anyhow::Result<Value> {
    let tracker = ExecutionTracker::new(store, Arc::new(SystemClock));
    match cmd {
        ExecutionCommand::List { schedule, limit } => {
            to_json(&store.list_executions(&schedule, limit)?)
        }
        ExecutionCommand::Show { id } => to_json(&store.get_execution(&id)?),
        ExecutionCommand::Started { id } => to_json(&tracker.report_started(&id)?),
        ExecutionCommand::Completed { id, summary } => {
            to_json(&tracker.report_completed(&id, summary)?)
        }
        ExecutionCommand::Failed { id, error } => to_json(&tracker.report_failed(&id, error)?),
    }
}

fn build_dispatcher(config: &OpsConfig, store: ScheduleStore) -> anyhow::Result<Dispatcher> {
    let catalog = Arc::new(SqliteJobCatalog::new(&store));
    let approvals = Arc::new(SqliteApprovalStore::new(&store));
    let engine = build_engine(&config.engine)?;
    Ok(Dispatcher::new(
        store,
        catalog,
        approvals,
        engine,
        Arc::new(SystemClock),
        DispatchSettings::from(&config.scheduler),
    ))
}

/// HTTP engine when `engine.base_url` is set, otherwise a local queue whose
/// executions wait for `opsconductor execution started|completed|failed`.
fn build_engine(config: &EngineConfig) -> anyhow::Result<Arc<dyn ExecutionEngine>> {
    match &config.base_url {
        Some(url) => {
            info!(%url, "using HTTP execution engine");
            let engine = HttpExecutionEngine::new(
                url,
                config.token.clone(),
                Duration::from_millis(config.request_timeout_ms),
            )?;
            Ok(Arc::new(engine))
        }
        None => {
            warn!("no engine.base_url configured, executions are queued locally");
            let (engine, rx) = ChannelEngine::channel(LOCAL_QUEUE_CAPACITY);
            tokio::spawn(log_queued(rx));
            Ok(Arc::new(engine))
        }
    }
}

async fn log_queued(mut rx: mpsc::Receiver<ExecutionRequest>) {
    while let Some(request) = rx.recv().await {
        info!(
            execution_id = %request.execution_id,
            serial = %request.execution_serial,
            job_id = %request.job_id,
            targets = request.targets.len(),
            "execution queued, awaiting engine callbacks"
        );
    }
}

fn to_json<T: Serialize>(value: &T) -> anyhow::Result<Value> {
    Ok(serde_json::to_value(value)?)
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}

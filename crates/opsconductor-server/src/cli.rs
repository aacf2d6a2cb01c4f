use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use opsconductor_core::{ExecutionId, JobId, ScheduleId};
use opsconductor_scheduler::approval::ApprovalStatus;
use opsconductor_scheduler::{ScheduleRule, ScheduleStatus, ScheduleUpdate};

#[derive(Parser, Debug)]
#[command(
    name = "opsconductor",
    about = "OpsConductor job scheduler",
    version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("OPSCONDUCTOR_GIT_SHA"), ")")
)]
pub struct Cli {
    /// Config file (defaults to $OPSCONDUCTOR_CONFIG, then ~/.opsconductor/opsconductor.toml).
    #[arg(long, global = true, env = "OPSCONDUCTOR_CONFIG")]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the dispatch loop until Ctrl-C.
    Run,
    /// Run a single dispatch tick and print its report.
    Tick,
    /// Jobs the scheduler can fire.
    #[command(subcommand)]
    Job(JobCommand),
    /// Approval state of jobs that require it.
    #[command(subcommand)]
    Approval(ApprovalCommand),
    #[command(subcommand)]
    Schedule(ScheduleCommand),
    /// Execution history and engine callbacks.
    #[command(subcommand)]
    Execution(ExecutionCommand),
}

#[derive(Subcommand, Debug)]
pub enum JobCommand {
    /// Register a job (or replace one when --id is given).
    Add {
        #[arg(long)]
        id: Option<JobId>,
        #[arg(long)]
        name: String,
        #[arg(long)]
        description: Option<String>,
        /// Action definition as JSON, passed to the engine verbatim.
        #[arg(long, default_value = "{}")]
        action: String,
        /// Target identifier; repeat for several.
        #[arg(long = "target")]
        targets: Vec<String>,
        #[arg(long)]
        timeout_secs: Option<u64>,
        #[arg(long, default_value_t = 0)]
        max_retries: u32,
        #[arg(long, default_value_t = 0)]
        retry_delay_secs: u64,
        #[arg(long)]
        requires_approval: bool,
        #[arg(long)]
        created_by: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ApprovalCommand {
    /// Record a job's approval state.
    Set {
        #[arg(long)]
        job: JobId,
        #[arg(long, default_value_t = 1)]
        required: u32,
        #[arg(long)]
        current: u32,
        /// pending | approved | rejected
        #[arg(long)]
        status: ApprovalStatus,
    },
}

#[derive(Subcommand, Debug)]
pub enum ScheduleCommand {
    Create {
        #[arg(long)]
        job: JobId,
        #[arg(long)]
        name: String,
        #[arg(long)]
        description: Option<String>,
        #[command(flatten)]
        rule: RuleArgs,
        #[arg(long, default_value = "UTC")]
        timezone: String,
        /// RFC 3339, e.g. 2025-01-01T09:00:00Z
        #[arg(long)]
        start: Option<DateTime<Utc>>,
        #[arg(long)]
        end: Option<DateTime<Utc>>,
        #[arg(long)]
        max_runs: Option<u32>,
        /// Create paused instead of active.
        #[arg(long)]
        paused: bool,
        #[arg(long)]
        created_by: Option<String>,
    },
    List {
        /// active | paused | disabled | expired
        #[arg(long)]
        status: Option<ScheduleStatus>,
    },
    Show {
        id: ScheduleId,
    },
    Pause {
        id: ScheduleId,
    },
    Resume {
        id: ScheduleId,
    },
    Disable {
        id: ScheduleId,
        #[arg(long)]
        reason: Option<String>,
    },
    Update(UpdateArgs),
    /// Delete a schedule and its execution history.
    Delete {
        id: ScheduleId,
    },
}

/// Exactly one recurrence rule.
#[derive(Args, Debug, Clone, Default)]
#[group(multiple = false)]
pub struct RuleArgs {
    /// 5-field cron expression or @macro.
    #[arg(long)]
    pub cron: Option<String>,
    /// Fire every N seconds.
    #[arg(long)]
    pub interval: Option<u64>,
    /// Fire once at --start.
    #[arg(long)]
    pub once: bool,
}

impl RuleArgs {
    pub fn into_rule(self) -> Option<ScheduleRule> {
        if let Some(cron_expression) = self.cron {
            Some(ScheduleRule::Cron { cron_expression })
        } else if let Some(interval_seconds) = self.interval {
            Some(ScheduleRule::Interval { interval_seconds })
        } else if self.once {
            Some(ScheduleRule::OneTime)
        } else {
            None
        }
    }
}

#[derive(Args, Debug)]
pub struct UpdateArgs {
    pub id: ScheduleId,
    #[arg(long)]
    pub name: Option<String>,
    #[arg(long, conflicts_with = "clear_description")]
    pub description: Option<String>,
    #[arg(long)]
    pub clear_description: bool,
    #[command(flatten)]
    pub rule: RuleArgs,
    #[arg(long)]
    pub timezone: Option<String>,
    #[arg(long, conflicts_with = "clear_start")]
    pub start: Option<DateTime<Utc>>,
    #[arg(long)]
    pub clear_start: bool,
    #[arg(long, conflicts_with = "clear_end")]
    pub end: Option<DateTime<Utc>>,
    #[arg(long)]
    pub clear_end: bool,
    #[arg(long, conflicts_with = "clear_max_runs")]
    pub max_runs: Option<u32>,
    #[arg(long)]
    pub clear_max_runs: bool,
}

impl UpdateArgs {
    pub fn into_update(self) -> (ScheduleId, ScheduleUpdate) {
        let update = ScheduleUpdate {
            name: self.name,
            description: nullable(self.description, self.clear_description),
            rule: self.rule.into_rule(),
            timezone: self.timezone,
            start_date: nullable(self.start, self.clear_start),
            end_date: nullable(self.end, self.clear_end),
            max_runs: nullable(self.max_runs, self.clear_max_runs),
        };
        (self.id, update)
    }
}

/// `--x v` sets, `--clear-x` nulls, neither leaves the field alone.
fn nullable<T>(value: Option<T>, clear: bool) -> Option<Option<T>> {
    match (value, clear) {
        (Some(v), _) => Some(Some(v)),
        (None, true) => Some(None),
        (None, false) => None,
    }
}

#[derive(Subcommand, Debug)]
pub enum ExecutionCommand {
    /// Executions of one schedule, newest first.
    List {
        #[arg(long)]
        schedule: ScheduleId,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    Show {
        id: ExecutionId,
    },
    /// Engine callback: execution started.
    Started {
        id: ExecutionId,
    },
    /// Engine callback: execution succeeded.
    Completed {
        id: ExecutionId,
        #[arg(long)]
        summary: Option<String>,
    },
    /// Engine callback: execution failed.
    Failed {
        id: ExecutionId,
        #[arg(long)]
        error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_tree_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn create_with_cron_rule() {
        let job = JobId::new();
        let cli = Cli::try_parse_from([
            "opsconductor",
            "schedule",
            "create",
            "--job",
            &job.to_string(),
            "--name",
            "weekday report",
            "--cron",
            "0 9 * * MON-FRI",
            "--timezone",
            "Europe/Berlin",
            "--start",
            "2025-01-01T00:00:00Z",
        ])
        .unwrap();
        match cli.command {
            Command::Schedule(ScheduleCommand::Create {
                job: parsed,
                rule,
                timezone,
                start,
                ..
            }) => {
                assert_eq!(parsed, job);
                assert_eq!(timezone, "Europe/Berlin");
                assert!(start.is_some());
                assert_eq!(
                    rule.into_rule(),
                    Some(ScheduleRule::Cron {
                        cron_expression: "0 9 * * MON-FRI".into()
                    })
                );
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn conflicting_rules_are_refused() {
        let result = Cli::try_parse_from([
            "opsconductor",
            "schedule",
            "create",
            "--job",
            &JobId::new().to_string(),
            "--name",
            "x",
            "--cron",
            "* * * * *",
            "--interval",
            "60",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn update_distinguishes_clear_from_unchanged() {
        let id = ScheduleId::new();
        let cli = Cli::try_parse_from([
            "opsconductor",
            "schedule",
            "update",
            &id.to_string(),
            "--clear-end",
            "--max-runs",
            "5",
        ])
        .unwrap();
        let Command::Schedule(ScheduleCommand::Update(args)) = cli.command else {
            panic!("expected schedule update");
        };
        let (parsed, update) = args.into_update();
        assert_eq!(parsed, id);
        assert_eq!(update.end_date, Some(None));
        assert_eq!(update.start_date, None);
        assert_eq!(update.max_runs, Some(Some(5)));
        assert!(update.rule.is_none());
    }

    #[test]
    fn approval_status_parses() {
        let cli = Cli::try_parse_from([
            "opsconductor",
            "approval",
            "set",
            "--job",
            &JobId::new().to_string(),
            "--required",
            "2",
            "--current",
            "2",
            "--status",
            "approved",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Command::Approval(ApprovalCommand::Set {
                status: ApprovalStatus::Approved,
                ..
            })
        ));
    }
}

mod logging;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use ghsync_adapters::JobKind;
use ghsync_sync::jobs::{build_scheduler, load_jobs_file, run_jobs_once};
use ghsync_sync::reports::report_recent_markdown;
use ghsync_sync::{JobReport, JobRequest, SyncConfig, SyncPipeline};
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "ghsync")]
#[command(about = "Mirror GitHub issues, pull requests, milestones and runs into Notion databases")]
#[command(version)]
struct Cli {
    /// Log filter directive, e.g. `debug` or `ghsync_sync=trace`. Overrides RUST_LOG.
    #[arg(long, global = true)]
    log_level: Option<String>,
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Issues carrying the task label.
    Tasks(JobArgs),
    Issues(JobArgs),
    PullRequests(JobArgs),
    /// Milestones and classic repository projects.
    Projects(JobArgs),
    /// The workflow run in the event payload.
    Runs(JobArgs),
    /// The discussion in the event payload.
    Discussions(JobArgs),
    Repositories(JobArgs),
    /// Run the jobs listed in a YAML file.
    Jobs {
        #[arg(long, default_value = "sync-jobs.yaml")]
        file: PathBuf,
        /// Keep running and trigger each job on its cron schedule.
        #[arg(long)]
        schedule: bool,
        #[arg(long)]
        fail_on_item_errors: bool,
    },
    /// Summarize recent runs from the reports directory.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
        /// Defaults to GHSYNC_REPORTS_DIR.
        #[arg(long)]
        reports_dir: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Args)]
struct JobArgs {
    /// Target database id; defaults to the job's NOTION_*_DB_ID variable.
    #[arg(long)]
    database_id: Option<String>,
    /// Property holding the GitHub identifier; defaults to NOTION_ID_PROPERTY.
    #[arg(long)]
    id_property: Option<String>,
    /// Resolve and coerce everything but write nothing.
    #[arg(long)]
    dry_run: bool,
    /// `owner/name`; defaults to GITHUB_REPOSITORY.
    #[arg(long)]
    repo: Option<String>,
    /// Event payload file; defaults to GITHUB_EVENT_PATH.
    #[arg(long)]
    event_path: Option<PathBuf>,
    /// Exit 1 when any item failed.
    #[arg(long)]
    fail_on_item_errors: bool,
}

impl JobArgs {
    fn request(&self, job: JobKind) -> JobRequest {
        JobRequest {
            job,
            database_id: self.database_id.clone(),
            id_property: self.id_property.clone(),
            dry_run: self.dry_run,
            repository: self.repo.clone(),
            event_path: self.event_path.clone(),
        }
    }
}

impl Commands {
    fn job(&self) -> Option<(JobKind, &JobArgs)> {
        let job = match self {
            Self::Tasks(args) => (JobKind::Tasks, args),
            Self::Issues(args) => (JobKind::Issues, args),
            Self::PullRequests(args) => (JobKind::PullRequests, args),
            Self::Projects(args) => (JobKind::Projects, args),
            Self::Runs(args) => (JobKind::Runs, args),
            Self::Discussions(args) => (JobKind::Discussions, args),
            Self::Repositories(args) => (JobKind::Repositories, args),
            Self::Jobs { .. } | Self::Report { .. } => return None,
        };
        Some(job)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::from(2)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    if let Err(err) = logging::init(cli.log_level.as_deref(), cli.json_logs) {
        eprintln!("error: {err:#}");
        return ExitCode::from(1);
    }

    match run(cli.command).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "ghsync failed");
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(command: Commands) -> Result<ExitCode> {
    if let Some((job, args)) = command.job() {
        let pipeline = SyncPipeline::new(SyncConfig::from_env())?;
        let report = pipeline.run_job(&args.request(job)).await?;
        print_report(&report)?;
        return Ok(exit_code(std::slice::from_ref(&report), args.fail_on_item_errors));
    }

    match command {
        Commands::Jobs {
            file,
            schedule,
            fail_on_item_errors,
        } => {
            let jobs = load_jobs_file(&file)?;
            let pipeline = Arc::new(SyncPipeline::new(SyncConfig::from_env())?);

            if schedule {
                let mut sched = build_scheduler(Arc::clone(&pipeline), &jobs).await?;
                sched.start().await.context("starting scheduler")?;
                info!(file = %file.display(), "scheduler running; ctrl-c to stop");
                tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
                sched.shutdown().await.context("stopping scheduler")?;
                return Ok(ExitCode::SUCCESS);
            }

            let mut reports = Vec::new();
            let mut fatal = false;
            for run in run_jobs_once(&pipeline, &jobs).await {
                match run.result {
                    Ok(report) => {
                        print_report(&report)?;
                        reports.push(report);
                    }
                    Err(err) => {
                        eprintln!("error: job `{}`: {err}", run.name);
                        fatal = true;
                    }
                }
            }
            if fatal {
                return Ok(ExitCode::from(1));
            }
            Ok(exit_code(&reports, fail_on_item_errors))
        }
        Commands::Report { runs, reports_dir } => {
            let dir = reports_dir
                .or_else(|| SyncConfig::from_env().reports_dir)
                .context("no reports directory; set GHSYNC_REPORTS_DIR or pass --reports-dir")?;
            println!("{}", report_recent_markdown(&dir, runs)?);
            Ok(ExitCode::SUCCESS)
        }
        _ => Ok(ExitCode::SUCCESS),
    }
}

fn print_report(report: &JobReport) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("serializing run summary")?;
    println!("{json}");
    Ok(())
}

/// Item failures only fail the process when asked to.
fn exit_code(reports: &[JobReport], fail_on_item_errors: bool) -> ExitCode {
    if fail_on_item_errors && reports.iter().any(|r| r.summary.has_failures()) {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}

//! `sync-jobs.yaml`: a list of jobs to run once or on a cron schedule.
//!
//! ```yaml
//! jobs:
//!   - name: issues
//!     job: issues
//!     database_id: 0f3c...
//!     schedule: "0 */6 * * *"
//!   - job: pull-requests
//!     dry_run: true
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use ghsync_adapters::JobKind;
use serde::Deserialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::{ConfigError, JobRequest};
use crate::pipeline::{JobReport, SyncPipeline};
use crate::SyncError;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JobsFile {
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobSpec {
    #[serde(default)]
    pub name: Option<String>,
    pub job: JobKind,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub database_id: Option<String>,
    #[serde(default)]
    pub id_property: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub event_path: Option<PathBuf>,
    /// Cron expression used by `jobs --schedule`.
    #[serde(default)]
    pub schedule: Option<String>,
}

fn enabled_by_default() -> bool {
    true
}

impl JobSpec {
    pub fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.job.to_string())
    }

    pub fn request(&self) -> JobRequest {
        JobRequest {
            job: self.job,
            database_id: self.database_id.clone(),
            id_property: self.id_property.clone(),
            dry_run: self.dry_run,
            repository: self.repository.clone(),
            event_path: self.event_path.clone(),
        }
    }
}

impl JobsFile {
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &JobSpec> {
        self.jobs.iter().filter(|j| j.enabled)
    }
}

pub fn load_jobs_file(path: &Path) -> Result<JobsFile, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::File {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    JobsFile::from_yaml(&text).map_err(|e| ConfigError::File {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

pub struct JobRun {
    pub name: String,
    pub result: Result<JobReport, SyncError>,
}

/// Run every enabled job in order. A fatal error in one job does not stop the others.
pub async fn run_jobs_once(pipeline: &SyncPipeline, file: &JobsFile) -> Vec<JobRun> {
    let mut runs = Vec::new();
    for spec in file.enabled() {
        let name = spec.label();
        let result = pipeline.run_job(&spec.request()).await;
        if let Err(err) = &result {
            error!(job = %name, error = %err, "job failed");
        }
        runs.push(JobRun { name, result });
    }
    runs
}

/// Register every enabled job that has a schedule. The caller starts the scheduler.
pub async fn build_scheduler(
    pipeline: Arc<SyncPipeline>,
    file: &JobsFile,
) -> anyhow::Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let mut registered = 0usize;

    for spec in file.enabled() {
        let name = spec.label();
        let Some(cron) = spec.schedule.as_ref() else {
            warn!(job = %name, "no schedule; not registered");
            continue;
        };
        let request = spec.request();
        let pipeline = Arc::clone(&pipeline);
        let job_name = name.clone();

        let job = Job::new_async(cron, move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            let request = request.clone();
            let name = job_name.clone();
            Box::pin(async move {
                match pipeline.run_job(&request).await {
                    Ok(report) => info!(
                        job = %name,
                        created = report.summary.created,
                        updated = report.summary.updated,
                        failed = report.summary.failed,
                        "scheduled run finished"
                    ),
                    Err(err) => error!(job = %name, error = %err, "scheduled run failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job `{name}` for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        registered += 1;
    }

    if registered == 0 {
        anyhow::bail!("no enabled job has a schedule");
    }
    info!(jobs = registered, "scheduler ready");
    Ok(sched)
}

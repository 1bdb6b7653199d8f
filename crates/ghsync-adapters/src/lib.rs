//! GitHub source adapters: one per sync job, each pairing a fetch strategy
//! with the per-kind normalizers.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use ghsync_core::{EntityKind, NormalizedEntity};
use ghsync_storage::TransportError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub mod client;
pub mod normalize;

pub use client::{GitHubClient, Pages};
pub use normalize::normalizer_for;

pub const CRATE_NAME: &str = "ghsync-adapters";

#[derive(Debug, Error)]
pub enum SourceFetchError {
    #[error("GitHub API error ({status}) for {url}: {body}")]
    Status { status: u16, url: String, body: String },
    #[error(transparent)]
    Transport(TransportError),
    #[error("invalid event payload: {0}")]
    Payload(String),
    #[error("no {0} configured for this job")]
    MissingScope(&'static str),
}

impl From<TransportError> for SourceFetchError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::HttpStatus { status, url, body } => Self::Status { status, url, body },
            other => Self::Transport(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("record is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("record is not a JSON object")]
    NotAnObject,
}

/// One unit of sync work, selectable from the CLI or a jobs file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    Tasks,
    Issues,
    PullRequests,
    Projects,
    Runs,
    Discussions,
    Repositories,
}

impl JobKind {
    pub const ALL: [JobKind; 7] = [
        JobKind::Tasks,
        JobKind::Issues,
        JobKind::PullRequests,
        JobKind::Projects,
        JobKind::Runs,
        JobKind::Discussions,
        JobKind::Repositories,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tasks => "tasks",
            Self::Issues => "issues",
            Self::PullRequests => "pull-requests",
            Self::Projects => "projects",
            Self::Runs => "runs",
            Self::Discussions => "discussions",
            Self::Repositories => "repositories",
        }
    }

    pub fn needs_repository(self) -> bool {
        matches!(
            self,
            Self::Tasks | Self::Issues | Self::PullRequests | Self::Projects
        )
    }

    pub fn needs_event_payload(self) -> bool {
        matches!(self, Self::Runs | Self::Discussions)
    }

    /// Jobs read from an event payload never call the GitHub API.
    pub fn needs_github_token(self) -> bool {
        !self.needs_event_payload()
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|job| job.as_str() == s)
            .ok_or_else(|| format!("unknown job `{s}`"))
    }
}

/// Scope a job fetches within.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceContext {
    /// `owner/name`.
    pub repository: Option<String>,
    pub organization: Option<String>,
    pub event_path: Option<PathBuf>,
    /// Label selecting issues for the tasks job; `None` matches any label containing "task".
    pub task_label: Option<String>,
}

impl SourceContext {
    fn repository(&self) -> Result<&str, SourceFetchError> {
        self.repository
            .as_deref()
            .ok_or(SourceFetchError::MissingScope("repository"))
    }

    fn event_path(&self) -> Result<&Path, SourceFetchError> {
        self.event_path
            .as_deref()
            .ok_or(SourceFetchError::MissingScope("event payload path"))
    }
}

/// A raw source record tagged with the kind whose normalizer applies to it.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub kind: EntityKind,
    pub value: JsonValue,
}

impl RawRecord {
    pub fn new(kind: EntityKind, value: JsonValue) -> Self {
        Self { kind, value }
    }

    /// Best-effort identifier for reporting records that failed to normalize.
    pub fn identifier_hint(&self) -> String {
        normalize::external_id(&self.value).unwrap_or_else(|_| {
            self.value
                .get("number")
                .map(|n| format!("{}#{n}", self.kind))
                .unwrap_or_else(|| format!("{}:<unknown>", self.kind))
        })
    }
}

/// A source record that could not be normalized; counted as a failed item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedRecord {
    pub identifier: String,
    pub message: String,
}

pub type Candidate = Result<NormalizedEntity, RejectedRecord>;

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn job(&self) -> JobKind;

    /// Every raw record for the job, fully paginated. Any failure aborts the job.
    async fn fetch(
        &self,
        github: &GitHubClient,
        ctx: &SourceContext,
    ) -> Result<Vec<RawRecord>, SourceFetchError>;

    fn normalize(&self, record: &RawRecord) -> Result<Option<NormalizedEntity>, NormalizeError> {
        normalizer_for(record.kind)(&record.value)
    }
}

/// Normalize a fetched batch, keeping malformed records as rejections so the
/// rest of the batch still syncs.
pub fn normalize_batch(adapter: &dyn SourceAdapter, records: &[RawRecord]) -> Vec<Candidate> {
    let mut out = Vec::with_capacity(records.len());
    for record in records {
        match adapter.normalize(record) {
            Ok(Some(entity)) => out.push(Ok(entity)),
            Ok(None) => debug!(kind = %record.kind, "record excluded by normalizer"),
            Err(err) => {
                let identifier = record.identifier_hint();
                warn!(%identifier, error = %err, "rejecting malformed source record");
                out.push(Err(RejectedRecord {
                    identifier,
                    message: err.to_string(),
                }));
            }
        }
    }
    out
}

#[derive(Debug, Clone, Copy)]
struct IssuesAdapter;

#[derive(Debug, Clone, Copy)]
struct TasksAdapter;

#[derive(Debug, Clone, Copy)]
struct PullRequestsAdapter;

#[derive(Debug, Clone, Copy)]
struct ProjectsAdapter;

#[derive(Debug, Clone, Copy)]
struct EventPayloadAdapter {
    job: JobKind,
    kind: EntityKind,
    key: &'static str,
}

#[derive(Debug, Clone, Copy)]
struct RepositoriesAdapter;

fn tag(kind: EntityKind, values: Vec<JsonValue>) -> Vec<RawRecord> {
    values.into_iter().map(|v| RawRecord::new(kind, v)).collect()
}

pub fn has_task_label(raw: &JsonValue, task_label: Option<&str>) -> bool {
    let labels = raw
        .get("labels")
        .and_then(JsonValue::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|l| l.get("name").and_then(JsonValue::as_str))
                .map(str::to_lowercase)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    match task_label.map(str::to_lowercase) {
        Some(wanted) => labels.iter().any(|l| *l == wanted),
        None => labels.iter().any(|l| l.contains("task")),
    }
}

#[async_trait]
impl SourceAdapter for IssuesAdapter {
    fn job(&self) -> JobKind {
        JobKind::Issues
    }

    async fn fetch(
        &self,
        github: &GitHubClient,
        ctx: &SourceContext,
    ) -> Result<Vec<RawRecord>, SourceFetchError> {
        let url = github.repo_listing_url(ctx.repository()?, "issues");
        Ok(tag(EntityKind::Issue, github.list(url).await?))
    }
}

#[async_trait]
impl SourceAdapter for TasksAdapter {
    fn job(&self) -> JobKind {
        JobKind::Tasks
    }

    async fn fetch(
        &self,
        github: &GitHubClient,
        ctx: &SourceContext,
    ) -> Result<Vec<RawRecord>, SourceFetchError> {
        let url = github.repo_listing_url(ctx.repository()?, "issues");
        let issues = github
            .list(url)
            .await?
            .into_iter()
            .filter(|raw| has_task_label(raw, ctx.task_label.as_deref()))
            .collect();
        Ok(tag(EntityKind::Issue, issues))
    }
}

#[async_trait]
impl SourceAdapter for PullRequestsAdapter {
    fn job(&self) -> JobKind {
        JobKind::PullRequests
    }

    async fn fetch(
        &self,
        github: &GitHubClient,
        ctx: &SourceContext,
    ) -> Result<Vec<RawRecord>, SourceFetchError> {
        let url = github.repo_listing_url(ctx.repository()?, "pulls");
        Ok(tag(EntityKind::PullRequest, github.list(url).await?))
    }
}

#[async_trait]
impl SourceAdapter for ProjectsAdapter {
    fn job(&self) -> JobKind {
        JobKind::Projects
    }

    async fn fetch(
        &self,
        github: &GitHubClient,
        ctx: &SourceContext,
    ) -> Result<Vec<RawRecord>, SourceFetchError> {
        let repository = ctx.repository()?;
        let milestones = github
            .list(github.repo_listing_url(repository, "milestones"))
            .await?;
        let projects = github
            .list_optional(
                github.repo_listing_url(repository, "projects"),
                client::ACCEPT_PROJECTS_PREVIEW,
            )
            .await?;

        let mut records = tag(EntityKind::Milestone, milestones);
        records.extend(tag(EntityKind::Project, projects));
        Ok(records)
    }
}

#[async_trait]
impl SourceAdapter for EventPayloadAdapter {
    fn job(&self) -> JobKind {
        self.job
    }

    async fn fetch(
        &self,
        _github: &GitHubClient,
        ctx: &SourceContext,
    ) -> Result<Vec<RawRecord>, SourceFetchError> {
        let payload = read_event_payload(ctx.event_path()?).await?;
        match payload.get(self.key) {
            Some(record) if record.is_object() => Ok(vec![RawRecord::new(self.kind, record.clone())]),
            _ => Err(SourceFetchError::Payload(format!(
                "event payload has no `{}` object",
                self.key
            ))),
        }
    }
}

#[async_trait]
impl SourceAdapter for RepositoriesAdapter {
    fn job(&self) -> JobKind {
        JobKind::Repositories
    }

    async fn fetch(
        &self,
        github: &GitHubClient,
        ctx: &SourceContext,
    ) -> Result<Vec<RawRecord>, SourceFetchError> {
        let url = github.repositories_url(ctx.organization.as_deref());
        Ok(tag(EntityKind::Repository, github.list(url).await?))
    }
}

/// Job → adapter strategy table.
pub fn adapter_for_job(job: JobKind) -> Box<dyn SourceAdapter> {
    match job {
        JobKind::Tasks => Box::new(TasksAdapter),
        JobKind::Issues => Box::new(IssuesAdapter),
        JobKind::PullRequests => Box::new(PullRequestsAdapter),
        JobKind::Projects => Box::new(ProjectsAdapter),
        JobKind::Runs => Box::new(EventPayloadAdapter {
            job,
            kind: EntityKind::WorkflowRun,
            key: "workflow_run",
        }),
        JobKind::Discussions => Box::new(EventPayloadAdapter {
            job,
            kind: EntityKind::Discussion,
            key: "discussion",
        }),
        JobKind::Repositories => Box::new(RepositoriesAdapter),
    }
}

pub async fn read_event_payload(path: &Path) -> Result<JsonValue, SourceFetchError> {
    let data = tokio::fs::read_to_string(path).await.map_err(|e| {
        SourceFetchError::Payload(format!("reading {}: {e}", path.display()))
    })?;
    serde_json::from_str(&data)
        .map_err(|e| SourceFetchError::Payload(format!("parsing {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn offline_client() -> GitHubClient {
        let transport = ghsync_storage::HttpTransport::new(Default::default()).expect("transport");
        GitHubClient::new(Arc::new(transport), "http://127.0.0.1:9", "unused")
    }

    #[test]
    fn job_names_round_trip() {
        for job in JobKind::ALL {
            assert_eq!(job.as_str().parse::<JobKind>().unwrap(), job);
            assert_eq!(adapter_for_job(job).job(), job);
        }
        assert!("milestones".parse::<JobKind>().is_err());
    }

    #[test]
    fn task_label_matching() {
        let raw = json!({"labels": [{"name": "Task"}, {"name": "bug"}]});
        assert!(has_task_label(&raw, Some("task")));
        assert!(!has_task_label(&raw, Some("chore")));
        assert!(has_task_label(&json!({"labels": [{"name": "subtask"}]}), None));
        assert!(!has_task_label(&json!({"labels": []}), None));
    }

    #[test]
    fn malformed_records_become_rejections() {
        let adapter = adapter_for_job(JobKind::Issues);
        let records = vec![
            RawRecord::new(EntityKind::Issue, json!({"id": "I_1", "title": "ok", "state": "open"})),
            RawRecord::new(EntityKind::Issue, json!({"id": "I_2", "state": "open"})),
            RawRecord::new(
                EntityKind::Issue,
                json!({"id": "I_3", "title": "pr", "pull_request": {}}),
            ),
        ];

        let candidates = normalize_batch(adapter.as_ref(), &records);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].as_ref().unwrap().external_id, "I_1");
        let rejected = candidates[1].as_ref().unwrap_err();
        assert_eq!(rejected.identifier, "I_2");
        assert!(rejected.message.contains("title"));
    }

    #[tokio::test]
    async fn run_payload_without_workflow_run_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("event.json");
        std::fs::write(&path, r#"{"action": "completed"}"#).unwrap();

        let ctx = SourceContext {
            event_path: Some(path),
            ..SourceContext::default()
        };
        let err = adapter_for_job(JobKind::Runs)
            .fetch(&offline_client(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceFetchError::Payload(_)));
    }

    #[tokio::test]
    async fn repository_jobs_require_a_scope() {
        let err = adapter_for_job(JobKind::PullRequests)
            .fetch(&offline_client(), &SourceContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SourceFetchError::MissingScope("repository")));
    }
}

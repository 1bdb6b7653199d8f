use std::collections::HashMap;
use std::path::PathBuf;

use ghsync_adapters::{JobKind, SourceContext};
use thiserror::Error;

pub const DEFAULT_ID_PROPERTY: &str = "GitHub ID";
pub const DEFAULT_NOTION_API_URL: &str = "https://api.notion.com/v1";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing {what}; set {env}")]
    Missing { what: &'static str, env: String },
    #[error("invalid repository `{0}`; expected owner/name")]
    InvalidRepository(String),
    #[error("database {database_id} has no `{property}` property{suggestion}")]
    MissingIdentifierProperty {
        database_id: String,
        property: String,
        suggestion: String,
    },
    #[error("{}: {message}", path.display())]
    File { path: PathBuf, message: String },
}

/// Environment-derived settings shared by every job.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub github_token: Option<String>,
    pub notion_token: Option<String>,
    pub repository: Option<String>,
    pub organization: Option<String>,
    pub github_api_url: String,
    pub notion_api_url: String,
    pub event_path: Option<PathBuf>,
    pub database_ids: HashMap<JobKind, String>,
    pub id_property: String,
    pub task_label: Option<String>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub page_index_path: Option<PathBuf>,
    pub reports_dir: Option<PathBuf>,
    pub layout_path: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let database_ids = JobKind::ALL
            .into_iter()
            .filter_map(|job| get(database_env_var(job)).map(|id| (job, id)))
            .collect();

        Self {
            github_token: get("GITHUB_TOKEN"),
            notion_token: get("NOTION_TOKEN"),
            repository: get("GITHUB_REPOSITORY"),
            organization: get("GITHUB_ORG"),
            github_api_url: get("GITHUB_API_URL")
                .unwrap_or_else(|| ghsync_adapters::client::DEFAULT_API_URL.to_string()),
            notion_api_url: get("NOTION_API_URL").unwrap_or_else(|| DEFAULT_NOTION_API_URL.to_string()),
            event_path: get("GITHUB_EVENT_PATH").map(PathBuf::from),
            database_ids,
            id_property: get("NOTION_ID_PROPERTY").unwrap_or_else(|| DEFAULT_ID_PROPERTY.to_string()),
            task_label: get("NOTION_TASK_LABEL"),
            http_timeout_secs: get("GHSYNC_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            user_agent: get("GHSYNC_USER_AGENT")
                .unwrap_or_else(|| format!("ghsync/{}", env!("CARGO_PKG_VERSION"))),
            page_index_path: get("GHSYNC_PAGE_INDEX").map(PathBuf::from),
            reports_dir: get("GHSYNC_REPORTS_DIR").map(PathBuf::from),
            layout_path: get("GHSYNC_LAYOUT").map(PathBuf::from),
        }
    }

    /// Merge per-run overrides with the environment and validate everything
    /// the selected job needs before any item is processed.
    pub fn resolve(&self, request: &JobRequest) -> Result<ResolvedJob, ConfigError> {
        let job = request.job;

        if self.notion_token.is_none() {
            return Err(ConfigError::Missing {
                what: "Notion token",
                env: "NOTION_TOKEN".to_string(),
            });
        }
        if job.needs_github_token() && self.github_token.is_none() {
            return Err(ConfigError::Missing {
                what: "GitHub token",
                env: "GITHUB_TOKEN".to_string(),
            });
        }

        let database_id = request
            .database_id
            .clone()
            .or_else(|| self.database_ids.get(&job).cloned())
            .ok_or_else(|| ConfigError::Missing {
                what: "target database id",
                env: format!("{} or pass --database-id", database_env_var(job)),
            })?;

        let repository = request.repository.clone().or_else(|| self.repository.clone());
        if job.needs_repository() {
            match repository.as_deref() {
                None => {
                    return Err(ConfigError::Missing {
                        what: "repository",
                        env: "GITHUB_REPOSITORY or pass --repo".to_string(),
                    })
                }
                Some(repo) if !is_valid_repository(repo) => {
                    return Err(ConfigError::InvalidRepository(repo.to_string()))
                }
                Some(_) => {}
            }
        }

        let event_path = request.event_path.clone().or_else(|| self.event_path.clone());
        if job.needs_event_payload() && event_path.is_none() {
            return Err(ConfigError::Missing {
                what: "event payload path",
                env: "GITHUB_EVENT_PATH or pass --event-path".to_string(),
            });
        }

        Ok(ResolvedJob {
            job,
            database_id,
            id_property: request
                .id_property
                .clone()
                .unwrap_or_else(|| self.id_property.clone()),
            dry_run: request.dry_run,
            source: SourceContext {
                repository,
                organization: self.organization.clone(),
                event_path,
                task_label: self.task_label.clone(),
            },
        })
    }
}

pub fn database_env_var(job: JobKind) -> &'static str {
    match job {
        JobKind::Tasks => "NOTION_TASK_DB_ID",
        JobKind::Issues => "NOTION_ISSUES_DB_ID",
        JobKind::PullRequests => "NOTION_PR_DB_ID",
        JobKind::Projects => "NOTION_PROJECTS_DB_ID",
        JobKind::Runs => "NOTION_RUNS_BOARD_ID",
        JobKind::Discussions => "NOTION_DISCUSSIONS_DB_ID",
        JobKind::Repositories => "NOTION_REPOSITORIES_DB_ID",
    }
}

fn is_valid_repository(repo: &str) -> bool {
    let mut parts = repo.split('/');
    matches!(
        (parts.next(), parts.next(), parts.next()),
        (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty()
    )
}

/// Per-invocation overrides (CLI flags or one jobs-file entry).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub job: JobKind,
    pub database_id: Option<String>,
    pub id_property: Option<String>,
    pub dry_run: bool,
    pub repository: Option<String>,
    pub event_path: Option<PathBuf>,
}

impl JobRequest {
    pub fn new(job: JobKind) -> Self {
        Self {
            job,
            database_id: None,
            id_property: None,
            dry_run: false,
            repository: None,
            event_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedJob {
    pub job: JobKind,
    pub database_id: String,
    pub id_property: String,
    pub dry_run: bool,
    pub source: SourceContext,
}

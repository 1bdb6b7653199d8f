use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ghsync_adapters::{adapter_for_job, normalize_batch, GitHubClient, JobKind};
use ghsync_core::ReconciliationSummary;
use ghsync_storage::{HttpClientConfig, HttpTransport, PageIndexStore, TokenBucketConfig};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

use crate::config::{JobRequest, ResolvedJob, SyncConfig};
use crate::engine::ReconciliationEngine;
use crate::layout::LayoutOverrides;
use crate::reports::write_run_report;
use crate::target::{NotionApi, TargetApi};
use crate::SyncError;

/// Notion allows roughly three requests per second per integration.
const NOTION_BURST: u32 = 3;
const NOTION_REFILL: Duration = Duration::from_millis(334);

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job: JobKind,
    pub summary: ReconciliationSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_dir: Option<PathBuf>,
    /// Index or report writes that failed after the run's remote writes
    /// went through. They never discard the summary.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub persist_errors: Vec<String>,
}

/// Runs jobs end to end: fetch, normalize, reconcile, persist.
pub struct SyncPipeline {
    config: SyncConfig,
    github_http: Arc<HttpTransport>,
    notion_http: Arc<HttpTransport>,
    layouts: LayoutOverrides,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self, SyncError> {
        let base = HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        };
        let github_http = HttpTransport::new(base.clone())?;
        let notion_http = HttpTransport::new(HttpClientConfig {
            token_bucket: Some(TokenBucketConfig {
                capacity: NOTION_BURST,
                refill_every: NOTION_REFILL,
            }),
            ..base
        })?;
        let layouts = match &config.layout_path {
            Some(path) => LayoutOverrides::load(path)?,
            None => LayoutOverrides::default(),
        };

        Ok(Self {
            config,
            github_http: Arc::new(github_http),
            notion_http: Arc::new(notion_http),
            layouts,
        })
    }

    pub async fn run_job(&self, request: &JobRequest) -> Result<JobReport, SyncError> {
        let notion = NotionApi::new(
            Arc::clone(&self.notion_http),
            &self.config.notion_api_url,
            self.config.notion_token.clone().unwrap_or_default(),
        );
        self.run_with_target(request, &notion).await
    }

    /// Same as [`run_job`](Self::run_job) against any target implementation.
    pub async fn run_with_target(
        &self,
        request: &JobRequest,
        target: &dyn TargetApi,
    ) -> Result<JobReport, SyncError> {
        let resolved = self.config.resolve(request)?;
        let span = info_span!(
            "sync_run",
            job = %resolved.job,
            database_id = %resolved.database_id,
            dry_run = resolved.dry_run
        );
        self.execute(resolved, target).instrument(span).await
    }

    async fn execute(&self, job: ResolvedJob, target: &dyn TargetApi) -> Result<JobReport, SyncError> {
        let database_id = job.database_id.as_str();
        let mut engine =
            ReconciliationEngine::new(target, job.id_property.clone()).with_layouts(self.layouts.clone());

        // schema problems are fatal, so check them before spending GitHub quota
        engine.prepare(database_id).await?;

        let github = GitHubClient::new(
            Arc::clone(&self.github_http),
            &self.config.github_api_url,
            self.config.github_token.clone().unwrap_or_default(),
        );
        let adapter = adapter_for_job(job.job);
        let records = adapter.fetch(&github, &job.source).await?;
        let candidates = normalize_batch(adapter.as_ref(), &records);
        info!(
            fetched = records.len(),
            candidates = candidates.len(),
            "source records ready"
        );

        let store = self.config.page_index_path.as_ref().map(PageIndexStore::new);
        let persisted = match &store {
            Some(store) => {
                let index = store.load().await?;
                engine.seed_index(database_id, index.entries_for(database_id));
                Some(index)
            }
            None => None,
        };

        let summary = engine.reconcile(candidates, database_id, job.dry_run).await?;
        let mut persist_errors = Vec::new();

        if let (Some(store), Some(mut index)) = (store, persisted) {
            if !job.dry_run {
                index.replace(database_id, engine.index_entries(database_id));
                if let Err(err) = store.save(&index).await {
                    warn!(error = %format!("{err:#}"), "page index not saved");
                    persist_errors.push(format!("{err:#}"));
                }
            }
        }

        let report_dir = match &self.config.reports_dir {
            Some(dir) => match write_run_report(dir, job.job, &summary).await {
                Ok(path) => Some(path),
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "run report not written");
                    persist_errors.push(format!("{err:#}"));
                    None
                }
            },
            None => None,
        };

        Ok(JobReport {
            job: job.job,
            summary,
            report_dir,
            persist_errors,
        })
    }
}

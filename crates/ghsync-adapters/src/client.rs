//! Read-only GitHub REST client with `Link`-header pagination.

use std::sync::Arc;

use ghsync_storage::{ApiRequest, HttpTransport};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::SourceFetchError;

pub const DEFAULT_API_URL: &str = "https://api.github.com";
const ACCEPT_JSON: &str = "application/vnd.github+json";
/// Classic repository projects are still served behind a preview media type.
pub const ACCEPT_PROJECTS_PREVIEW: &str = "application/vnd.github.inertia-preview+json";
const API_VERSION: &str = "2022-11-28";
const PER_PAGE: u32 = 100;

#[derive(Debug, Clone)]
pub struct GitHubClient {
    transport: Arc<HttpTransport>,
    base_url: String,
    token: String,
}

impl GitHubClient {
    pub fn new(transport: Arc<HttpTransport>, base_url: &str, token: impl Into<String>) -> Self {
        Self {
            transport,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    /// `{base}/repos/{owner}/{name}/{resource}?state=all&per_page=100`
    pub fn repo_listing_url(&self, repository: &str, resource: &str) -> String {
        format!(
            "{}/repos/{}/{}?state=all&per_page={PER_PAGE}",
            self.base_url, repository, resource
        )
    }

    pub fn repositories_url(&self, organization: Option<&str>) -> String {
        match organization {
            Some(org) => format!("{}/orgs/{org}/repos?type=all&per_page={PER_PAGE}", self.base_url),
            None => format!("{}/user/repos?type=all&per_page={PER_PAGE}", self.base_url),
        }
    }

    pub fn paginate(&self, url: impl Into<String>) -> Pages<'_> {
        self.paginate_as(url, ACCEPT_JSON)
    }

    pub fn paginate_as(&self, url: impl Into<String>, accept: &'static str) -> Pages<'_> {
        Pages {
            client: self,
            next: Some(url.into()),
            accept,
        }
    }

    pub async fn list(&self, url: impl Into<String>) -> Result<Vec<JsonValue>, SourceFetchError> {
        self.paginate(url).collect_all().await
    }

    /// Like [`GitHubClient::list`], but a 404/410 (feature disabled on the
    /// repository) is an empty listing.
    pub async fn list_optional(
        &self,
        url: impl Into<String>,
        accept: &'static str,
    ) -> Result<Vec<JsonValue>, SourceFetchError> {
        match self.paginate_as(url, accept).collect_all().await {
            Err(SourceFetchError::Status { status, url, .. }) if status == 404 || status == 410 => {
                debug!(status, %url, "optional resource unavailable; treating as empty");
                Ok(Vec::new())
            }
            other => other,
        }
    }

    fn request(&self, url: &str, accept: &str) -> ApiRequest {
        ApiRequest::get(url)
            .bearer(&self.token)
            .header("Accept", accept)
            .header("X-GitHub-Api-Version", API_VERSION)
    }
}

/// Lazy cursor over a paginated listing. Each call to [`Pages::next_page`]
/// issues at most one request and follows `rel="next"` until it is absent.
#[derive(Debug)]
pub struct Pages<'a> {
    client: &'a GitHubClient,
    next: Option<String>,
    accept: &'static str,
}

impl Pages<'_> {
    pub async fn next_page(&mut self) -> Result<Option<Vec<JsonValue>>, SourceFetchError> {
        let Some(url) = self.next.take() else {
            return Ok(None);
        };
        let response = self
            .client
            .transport
            .send(&self.client.request(&url, self.accept))
            .await?;
        self.next = response.next_link;

        let records = match response.body {
            JsonValue::Array(items) => items,
            JsonValue::Null => Vec::new(),
            other => vec![other],
        };
        debug!(%url, count = records.len(), more = self.next.is_some(), "fetched page");
        Ok(Some(records))
    }

    pub async fn collect_all(mut self) -> Result<Vec<JsonValue>, SourceFetchError> {
        let mut out = Vec::new();
        while let Some(page) = self.next_page().await? {
            out.extend(page);
        }
        Ok(out)
    }
}

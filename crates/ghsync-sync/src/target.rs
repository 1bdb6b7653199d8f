//! Notion database API: the write side of a sync run.

use std::sync::Arc;

use async_trait::async_trait;
use ghsync_storage::{ApiRequest, HttpTransport, TransportError};
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;

pub const NOTION_VERSION: &str = "2022-06-28";
const PAGE_SIZE: u32 = 100;

/// Property name → typed property payload, as sent in create/update bodies.
pub type PropertyMap = Map<String, JsonValue>;

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("Notion API error ({status}) for {url}: {body}")]
    Status { status: u16, url: String, body: String },
    #[error(transparent)]
    Transport(TransportError),
    #[error("unexpected Notion response: {0}")]
    Malformed(String),
}

impl From<TransportError> for TargetError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::HttpStatus { status, url, body } => Self::Status { status, url, body },
            other => Self::Transport(other),
        }
    }
}

impl TargetError {
    /// The page no longer accepts writes: deleted (404) or archived (400).
    pub fn is_missing_page(&self) -> bool {
        match self {
            Self::Status { status: 404, .. } => true,
            Self::Status { status: 400, body, .. } => body.contains("archived"),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryPage {
    pub results: Vec<JsonValue>,
    pub next_cursor: Option<String>,
}

#[async_trait]
pub trait TargetApi: Send + Sync {
    async fn retrieve_database(&self, database_id: &str) -> Result<JsonValue, TargetError>;

    async fn query_database(
        &self,
        database_id: &str,
        filter: Option<JsonValue>,
        start_cursor: Option<String>,
    ) -> Result<QueryPage, TargetError>;

    /// Returns the new page id.
    async fn create_page(
        &self,
        database_id: &str,
        properties: &PropertyMap,
    ) -> Result<String, TargetError>;

    /// Partial update: properties absent from `properties` are left untouched.
    async fn update_page(&self, page_id: &str, properties: &PropertyMap) -> Result<(), TargetError>;
}

#[derive(Debug, Clone)]
pub struct NotionApi {
    transport: Arc<HttpTransport>,
    base_url: String,
    token: String,
}

impl NotionApi {
    pub fn new(transport: Arc<HttpTransport>, base_url: &str, token: impl Into<String>) -> Self {
        Self {
            transport,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn authorize(&self, request: ApiRequest) -> ApiRequest {
        request
            .bearer(&self.token)
            .header("Notion-Version", NOTION_VERSION)
    }
}

#[async_trait]
impl TargetApi for NotionApi {
    async fn retrieve_database(&self, database_id: &str) -> Result<JsonValue, TargetError> {
        let url = format!("{}/databases/{database_id}", self.base_url);
        let response = self.transport.send(&self.authorize(ApiRequest::get(url))).await?;
        Ok(response.body)
    }

    async fn query_database(
        &self,
        database_id: &str,
        filter: Option<JsonValue>,
        start_cursor: Option<String>,
    ) -> Result<QueryPage, TargetError> {
        let url = format!("{}/databases/{database_id}/query", self.base_url);
        let mut body = json!({ "page_size": PAGE_SIZE });
        if let Some(filter) = filter {
            body["filter"] = filter;
        }
        if let Some(cursor) = start_cursor {
            body["start_cursor"] = JsonValue::String(cursor);
        }

        let request = self.authorize(ApiRequest::post(url, body).read_only());
        let response = self.transport.send(&request).await?;

        let results = response
            .body
            .get("results")
            .and_then(JsonValue::as_array)
            .cloned()
            .ok_or_else(|| TargetError::Malformed("query response has no `results`".into()))?;
        let has_more = response
            .body
            .get("has_more")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false);
        let next_cursor = if has_more {
            response
                .body
                .get("next_cursor")
                .and_then(JsonValue::as_str)
                .map(str::to_string)
        } else {
            None
        };
        Ok(QueryPage { results, next_cursor })
    }

    async fn create_page(
        &self,
        database_id: &str,
        properties: &PropertyMap,
    ) -> Result<String, TargetError> {
        let url = format!("{}/pages", self.base_url);
        let body = json!({
            "parent": { "database_id": database_id },
            "properties": properties,
        });
        let response = self.transport.send(&self.authorize(ApiRequest::post(url, body))).await?;
        page_id_of(&response.body)
            .map(str::to_string)
            .ok_or_else(|| TargetError::Malformed("created page has no `id`".into()))
    }

    async fn update_page(&self, page_id: &str, properties: &PropertyMap) -> Result<(), TargetError> {
        let url = format!("{}/pages/{page_id}", self.base_url);
        let body = json!({ "properties": properties });
        self.transport
            .send(&self.authorize(ApiRequest::patch(url, body)))
            .await?;
        Ok(())
    }
}

pub fn page_id_of(page: &JsonValue) -> Option<&str> {
    page.get("id").and_then(JsonValue::as_str).filter(|id| !id.is_empty())
}

//! HTTP transport and persisted page-index storage for ghsync.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ghsync-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Retry classification for a response status. Non-idempotent requests only
/// retry on 429, where the server guarantees the request was not applied.
pub fn classify_status(status: StatusCode, idempotent: bool) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS || (idempotent && status.is_server_error()) {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error, idempotent: bool) -> RetryDisposition {
    // a failed connect never reached the server
    if err.is_connect() || (idempotent && err.is_timeout()) {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some(format!("ghsync/{}", env!("CARGO_PKG_VERSION"))),
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if self.refill_every.as_millis() > 0 && elapsed >= self.refill_every {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

/// One outbound API call. Rebuilt into a fresh `reqwest` request per attempt.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub bearer: Option<String>,
    pub body: Option<JsonValue>,
    pub idempotent: bool,
}

impl ApiRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url, None)
    }

    pub fn post(url: impl Into<String>, body: JsonValue) -> Self {
        Self::new(Method::POST, url, Some(body))
    }

    pub fn patch(url: impl Into<String>, body: JsonValue) -> Self {
        Self::new(Method::PATCH, url, Some(body))
    }

    fn new(method: Method, url: impl Into<String>, body: Option<JsonValue>) -> Self {
        let idempotent = method != Method::POST;
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            bearer: None,
            body,
            idempotent,
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn bearer(mut self, token: &str) -> Self {
        self.bearer = Some(token.to_string());
        self
    }

    /// Mark a POST that only reads (search, query) as safe to retry.
    pub fn read_only(mut self) -> Self {
        self.idempotent = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub final_url: String,
    pub body: JsonValue,
    pub next_link: Option<String>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl TransportError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Extract the `rel="next"` target from an RFC 8288 `Link` header.
pub fn parse_next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        let mut segments = part.split(';');
        let target = segments.next()?.trim();
        let is_next = segments.any(|param| {
            let param = param.trim();
            param == "rel=\"next\"" || param == "rel=next"
        });
        if !is_next {
            return None;
        }
        target
            .strip_prefix('<')
            .and_then(|t| t.strip_suffix('>'))
            .map(str::to_string)
    })
}

#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

impl HttpTransport {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            token_bucket,
            backoff: config.backoff,
        })
    }

    pub async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let span = info_span!("http_request", method = %request.method, url = %request.url);
        self.send_with_retries(request).instrument(span).await
    }

    async fn send_with_retries(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let mut attempt = 0;
        loop {
            if let Some(bucket) = &self.token_bucket {
                bucket.take().await;
            }

            let (disposition, error) = match self.build(request).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let next_link = resp
                        .headers()
                        .get(reqwest::header::LINK)
                        .and_then(|v| v.to_str().ok())
                        .and_then(parse_next_link);
                    let text = resp.text().await.map_err(|source| TransportError::Request {
                        url: final_url.clone(),
                        source,
                    })?;

                    if status.is_success() {
                        let body = if text.trim().is_empty() {
                            JsonValue::Null
                        } else {
                            serde_json::from_str(&text).map_err(|source| TransportError::Decode {
                                url: final_url.clone(),
                                source,
                            })?
                        };
                        return Ok(ApiResponse {
                            status: status.as_u16(),
                            final_url,
                            body,
                            next_link,
                        });
                    }

                    let disposition = classify_status(status, request.idempotent);
                    let error = TransportError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        body: text,
                    };
                    (disposition, error)
                }
                Err(source) => (
                    classify_reqwest_error(&source, request.idempotent),
                    TransportError::Request {
                        url: request.url.clone(),
                        source,
                    },
                ),
            };

            if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries {
                let delay = self.backoff.delay_for_attempt(attempt);
                warn!(attempt, ?delay, %error, "retrying request");
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }
            return Err(error);
        }
    }

    fn build(&self, request: &ApiRequest) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(request.method.clone(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        builder
    }
}

/// External id → page id entries, scoped by target database id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedPageIndex {
    #[serde(default)]
    pub databases: BTreeMap<String, BTreeMap<String, String>>,
}

impl PersistedPageIndex {
    pub fn entries_for(&self, database_id: &str) -> BTreeMap<String, String> {
        self.databases.get(database_id).cloned().unwrap_or_default()
    }

    pub fn replace(&mut self, database_id: &str, entries: BTreeMap<String, String>) {
        self.databases.insert(database_id.to_string(), entries);
    }
}

/// JSON file holding a [`PersistedPageIndex`] across runs.
#[derive(Debug, Clone)]
pub struct PageIndexStore {
    path: PathBuf,
}

impl PageIndexStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// A missing file yields an empty index.
    pub async fn load(&self) -> anyhow::Result<PersistedPageIndex> {
        if !fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking page index {}", self.path.display()))?
        {
            debug!(path = %self.path.display(), "no persisted page index");
            return Ok(PersistedPageIndex::default());
        }
        let raw = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading page index {}", self.path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parsing page index {}", self.path.display()))
    }

    /// Write through a temp file in the same directory, then rename over the target.
    pub async fn save(&self, index: &PersistedPageIndex) -> anyhow::Result<()> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating page index directory {}", parent.display()))?;

        let bytes = serde_json::to_vec_pretty(index).context("serializing page index")?;
        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp page index {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp page index {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp page index {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn fast_transport(max_retries: usize) -> HttpTransport {
        HttpTransport::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: None,
            backoff: BackoffPolicy {
                max_retries,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            token_bucket: None,
        })
        .expect("transport")
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn creation_is_only_retried_on_rate_limit() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, false),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY, false),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY, true),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND, true),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn next_link_is_extracted_from_link_header() {
        let header = r#"<https://api.github.com/repositories/1/issues?page=2>; rel="next", <https://api.github.com/repositories/1/issues?page=5>; rel="last""#;
        assert_eq!(
            parse_next_link(header).as_deref(),
            Some("https://api.github.com/repositories/1/issues?page=2")
        );
        let last_page = r#"<https://api.github.com/x?page=1>; rel="prev", <https://api.github.com/x?page=1>; rel="first""#;
        assert_eq!(parse_next_link(last_page), None);
    }

    #[tokio::test]
    async fn page_index_round_trips_through_disk() {
        let dir = tempdir().expect("tempdir");
        let store = PageIndexStore::new(dir.path().join("state").join("page-index.json"));

        assert_eq!(store.load().await.expect("empty load"), PersistedPageIndex::default());

        let mut index = PersistedPageIndex::default();
        index.replace(
            "db-1",
            BTreeMap::from([("I_1".to_string(), "page-1".to_string())]),
        );
        store.save(&index).await.expect("save");
        store.save(&index).await.expect("overwrite");

        let loaded = store.load().await.expect("load");
        assert_eq!(loaded.entries_for("db-1").get("I_1").map(String::as_str), Some("page-1"));
        assert!(loaded.entries_for("db-2").is_empty());

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("state"))
            .expect("read dir")
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn reads_are_retried_on_server_errors() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/flaky")
            .with_status(503)
            .with_body("unavailable")
            .expect(3)
            .create_async()
            .await;

        let transport = fast_transport(2);
        let err = transport
            .send(&ApiRequest::get(format!("{}/flaky", server.url())))
            .await
            .expect_err("should exhaust retries");

        assert_eq!(err.status(), Some(503));
        assert!(err.to_string().contains("unavailable"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn creates_are_not_retried_on_server_errors() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/pages")
            .with_status(502)
            .expect(1)
            .create_async()
            .await;

        let transport = fast_transport(3);
        let err = transport
            .send(&ApiRequest::post(format!("{}/pages", server.url()), json!({})))
            .await
            .expect_err("502 surfaces");

        assert_eq!(err.status(), Some(502));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn success_decodes_json_and_link() {
        let mut server = mockito::Server::new_async().await;
        let next = format!("{}/items?page=2", server.url());
        let mock = server
            .mock("GET", "/items")
            .match_header("authorization", "Bearer secret")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_header("link", &format!("<{next}>; rel=\"next\""))
            .with_body(r#"[{"id": 1}]"#)
            .create_async()
            .await;

        let transport = fast_transport(0);
        let response = transport
            .send(&ApiRequest::get(format!("{}/items", server.url())).bearer("secret"))
            .await
            .expect("ok");

        assert_eq!(response.status, 200);
        assert_eq!(response.body, json!([{"id": 1}]));
        assert_eq!(response.next_link.as_deref(), Some(next.as_str()));
        mock.assert_async().await;
    }
}

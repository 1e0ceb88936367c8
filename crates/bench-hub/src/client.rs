use anyhow::{anyhow, Context, Result};
use bench_core::{atomic_write_bytes, optional_env, parse_optional_positive_u64_env, Task};
use reqwest::blocking::{Client as HttpClient, Response};
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::fetch::ContentSource;

const HF_ENDPOINT_ENV: &str = "HF_ENDPOINT";
const HF_TOKEN_ENV: &str = "HF_TOKEN";
const HF_DATASETS_SERVER_ENV: &str = "HF_DATASETS_SERVER";
const BENCH_HUB_RETRY_MAX_ATTEMPTS_ENV: &str = "BENCH_HUB_RETRY_MAX_ATTEMPTS";
const BENCH_HUB_RETRY_BASE_BACKOFF_MS_ENV: &str = "BENCH_HUB_RETRY_BASE_BACKOFF_MS";
const DEFAULT_HF_ENDPOINT: &str = "https://huggingface.co";
const DEFAULT_DATASETS_SERVER: &str = "https://datasets-server.huggingface.co";
const DEFAULT_REVISION: &str = "main";
const HUB_RETRY_MAX_ATTEMPTS_DEFAULT: usize = 3;
const HUB_RETRY_BASE_BACKOFF_MS_DEFAULT: u64 = 200;
const HUB_CONNECT_TIMEOUT_MS: u64 = 10_000;
const HUB_REQUEST_TIMEOUT_MS: u64 = 300_000;
const ROWS_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Copy)]
pub struct RetrySettings {
    pub max_attempts: usize,
    pub base_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: HUB_RETRY_MAX_ATTEMPTS_DEFAULT,
            base_backoff_ms: HUB_RETRY_BASE_BACKOFF_MS_DEFAULT,
        }
    }
}

pub fn resolve_retry_settings_from_env() -> Result<RetrySettings> {
    let mut settings = RetrySettings::default();
    if let Some(max_attempts) = parse_optional_positive_u64_env(BENCH_HUB_RETRY_MAX_ATTEMPTS_ENV)? {
        settings.max_attempts = max_attempts as usize;
    }
    if let Some(base_backoff_ms) =
        parse_optional_positive_u64_env(BENCH_HUB_RETRY_BASE_BACKOFF_MS_ENV)?
    {
        settings.base_backoff_ms = base_backoff_ms;
    }
    Ok(settings)
}

impl RetrySettings {
    fn backoff_delay(&self, attempt: usize) -> Duration {
        let shift = attempt.saturating_sub(1).min(8) as u32;
        let multiplier = 1u64 << shift;
        Duration::from_millis(self.base_backoff_ms.saturating_mul(multiplier))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HubRequestErrorKind {
    Retryable,
    Fatal,
}

#[derive(Debug)]
struct HubRequestError {
    kind: HubRequestErrorKind,
    message: String,
}

impl HubRequestError {
    fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: HubRequestErrorKind::Retryable,
            message: message.into(),
        }
    }

    fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: HubRequestErrorKind::Fatal,
            message: message.into(),
        }
    }

    fn is_retryable(&self) -> bool {
        self.kind == HubRequestErrorKind::Retryable
    }
}

impl std::fmt::Display for HubRequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for HubRequestError {}

fn is_retryable_http_status(status: u16) -> bool {
    matches!(status, 408 | 425 | 429 | 500 | 502 | 503 | 504)
}

fn truncate_error_body(raw: &str) -> String {
    const MAX_ERROR_BODY_CHARS: usize = 512;
    let normalized = raw.replace('\n', " ");
    if normalized.chars().count() <= MAX_ERROR_BODY_CHARS {
        return normalized;
    }
    normalized.chars().take(MAX_ERROR_BODY_CHARS).collect()
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent.
pub(crate) fn call_with_retry<T>(
    settings: RetrySettings,
    op_name: &str,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let attempts = settings.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) => {
                let retryable = err
                    .downcast_ref::<HubRequestError>()
                    .map(HubRequestError::is_retryable)
                    .unwrap_or(false);
                if retryable && attempt < attempts {
                    let delay = settings.backoff_delay(attempt);
                    warn!(op = op_name, attempt, ?delay, error = %err, "hub request failed, retrying");
                    thread::sleep(delay);
                    attempt += 1;
                    continue;
                }
                if retryable {
                    return Err(anyhow!(
                        "hub {} failed after {} attempts: {}",
                        op_name,
                        attempt,
                        err
                    ));
                }
                return Err(err);
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RowsPage {
    rows: Vec<RowEntry>,
    #[serde(default)]
    num_rows_total: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RowEntry {
    row: Value,
}

/// Parses one datasets-server `/rows` page into tasks plus the reported
/// total row count.
pub fn parse_rows_page(body: &str) -> Result<(Vec<Task>, Option<usize>)> {
    let page: RowsPage =
        serde_json::from_str(body).with_context(|| "invalid datasets-server rows payload")?;
    let mut tasks = Vec::with_capacity(page.rows.len());
    for (idx, entry) in page.rows.into_iter().enumerate() {
        let task: Task = serde_json::from_value(entry.row)
            .with_context(|| format!("failed to parse task row {}", idx))?;
        tasks.push(task);
    }
    Ok((tasks, page.num_rows_total))
}

#[derive(Clone)]
pub struct HubClient {
    endpoint: String,
    datasets_server: String,
    revision: String,
    token: Option<String>,
    client: HttpClient,
    retry: RetrySettings,
}

impl HubClient {
    pub fn new(endpoint: &str, datasets_server: &str, token: Option<String>) -> Result<Self> {
        let endpoint = endpoint.trim().trim_end_matches('/').to_string();
        if endpoint.is_empty() {
            return Err(anyhow!("hub endpoint must not be empty"));
        }
        let client = HttpClient::builder()
            .connect_timeout(Duration::from_millis(HUB_CONNECT_TIMEOUT_MS))
            .timeout(Duration::from_millis(HUB_REQUEST_TIMEOUT_MS))
            .build()?;
        Ok(Self {
            endpoint,
            datasets_server: datasets_server.trim().trim_end_matches('/').to_string(),
            revision: DEFAULT_REVISION.to_string(),
            token,
            client,
            retry: resolve_retry_settings_from_env()?,
        })
    }

    pub fn from_env() -> Result<Self> {
        let endpoint = optional_env(HF_ENDPOINT_ENV).unwrap_or_else(|| DEFAULT_HF_ENDPOINT.to_string());
        let datasets_server = optional_env(HF_DATASETS_SERVER_ENV)
            .unwrap_or_else(|| DEFAULT_DATASETS_SERVER.to_string());
        Self::new(&endpoint, &datasets_server, optional_env(HF_TOKEN_ENV))
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = revision.into();
        self
    }

    pub fn resolve_url(&self, repo_id: &str, filename: &str) -> String {
        format!(
            "{}/datasets/{}/resolve/{}/{}",
            self.endpoint,
            repo_id.trim_matches('/'),
            self.revision,
            filename.trim_start_matches('/')
        )
    }

    fn get(&self, url: &str, query: &[(&str, String)]) -> Result<Response> {
        let mut builder = self.client.get(url).query(query);
        if let Some(token) = self.token.as_ref() {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().map_err(|err| {
            let detail = format!("hub GET {} transport error: {}", url, err);
            let classified = if err.is_timeout() || err.is_connect() || err.is_request() {
                HubRequestError::retryable(detail)
            } else {
                HubRequestError::fatal(detail)
            };
            anyhow!(classified)
        })?;
        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            let body = response
                .text()
                .map(|value| truncate_error_body(&value))
                .unwrap_or_else(|_| "<response body unavailable>".to_string());
            let detail = format!("hub GET {} failed: status={} body={}", url, code, body);
            let classified = if is_retryable_http_status(code) {
                HubRequestError::retryable(detail)
            } else {
                HubRequestError::fatal(detail)
            };
            return Err(anyhow!(classified));
        }
        Ok(response)
    }

    pub fn download_bytes(&self, repo_id: &str, filename: &str) -> Result<Vec<u8>> {
        let url = self.resolve_url(repo_id, filename);
        call_with_retry(self.retry, "download", || {
            let response = self.get(&url, &[])?;
            let bytes = response.bytes().map_err(|err| {
                anyhow!(HubRequestError::retryable(format!(
                    "hub GET {} body read failed: {}",
                    url, err
                )))
            })?;
            Ok(bytes.to_vec())
        })
    }

    /// Pages through the datasets-server rows API until every row of the
    /// split has been collected.
    pub fn fetch_tasks(&self, repo_id: &str, config: &str, split: &str) -> Result<Vec<Task>> {
        let url = format!("{}/rows", self.datasets_server);
        let mut tasks: Vec<Task> = Vec::new();
        loop {
            let offset = tasks.len();
            let query = [
                ("dataset", repo_id.to_string()),
                ("config", config.to_string()),
                ("split", split.to_string()),
                ("offset", offset.to_string()),
                ("length", ROWS_PAGE_SIZE.to_string()),
            ];
            let body = call_with_retry(self.retry, "rows", || {
                let response = self.get(&url, &query)?;
                response.text().map_err(|err| {
                    anyhow!(HubRequestError::retryable(format!(
                        "hub GET {} body read failed: {}",
                        url, err
                    )))
                })
            })?;
            let (page, total) = parse_rows_page(&body)?;
            let page_len = page.len();
            tasks.extend(page);
            debug!(offset, page_len, ?total, "fetched task rows page");
            let done = match total {
                Some(total) => tasks.len() >= total,
                None => page_len < ROWS_PAGE_SIZE,
            };
            if done || page_len == 0 {
                break;
            }
        }
        info!(repo_id, config, split, count = tasks.len(), "loaded tasks from hub");
        Ok(tasks)
    }
}

impl ContentSource for HubClient {
    fn download(&self, repo_id: &str, filename: &str, local_dir: &Path) -> Result<PathBuf> {
        let bytes = self.download_bytes(repo_id, filename)?;
        let dest = local_dir.join(filename);
        atomic_write_bytes(&dest, &bytes)
            .with_context(|| format!("failed to write {}", dest.display()))?;
        debug!(filename, size_bytes = bytes.len(), "downloaded context file");
        Ok(dest)
    }
}

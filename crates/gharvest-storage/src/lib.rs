//! Durable state files + HTTP fetch utilities for the harvester.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, TimeZone, Utc};
use gharvest_core::{Checkpoint, CHECKPOINT_VERSION};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gharvest-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct StoredFile {
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
}

/// Replace `path` with `bytes` through a sibling temp file, fsync and rename.
///
/// Readers see either the previous file or the new one, never a torn write.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<StoredFile> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }

    Ok(StoredFile {
        path: path.to_path_buf(),
        content_hash: sha256_hex(bytes),
        byte_size: bytes.len(),
    })
}

pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<StoredFile> {
    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serializing {}", path.display()))?;
    write_atomic(path, &bytes).await
}

/// `Ok(None)` when the file does not exist.
pub async fn read_json_optional<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    if !fs::try_exists(path)
        .await
        .with_context(|| format!("checking {}", path.display()))?
    {
        return Ok(None);
    }
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let value = serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(value))
}

/// Single-writer owner of the checkpoint file.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the last checkpoint, or an empty one in `collecting` when absent.
    pub async fn load(&self) -> anyhow::Result<Checkpoint> {
        let Some(checkpoint) = read_json_optional::<Checkpoint>(&self.path).await? else {
            return Ok(Checkpoint::default());
        };
        if checkpoint.version > CHECKPOINT_VERSION {
            anyhow::bail!(
                "checkpoint {} has version {}, this build understands up to {}",
                self.path.display(),
                checkpoint.version,
                CHECKPOINT_VERSION
            );
        }
        Ok(checkpoint)
    }

    pub async fn save(&self, checkpoint: &Checkpoint) -> anyhow::Result<StoredFile> {
        let stored = write_json_atomic(&self.path, checkpoint)
            .await
            .with_context(|| format!("persisting checkpoint {}", self.path.display()))?;
        debug!(
            path = %stored.path.display(),
            bytes = stored.byte_size,
            repositories = checkpoint.repositories.len(),
            completed_tasks = checkpoint.completed_tasks.len(),
            "checkpoint written"
        );
        Ok(stored)
    }
}

/// How a failed call should be treated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    QuotaExhausted,
    NotFound,
    Transient,
}

pub fn classify_status(status: StatusCode) -> Disposition {
    if status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS {
        Disposition::QuotaExhausted
    } else if status == StatusCode::NOT_FOUND {
        Disposition::NotFound
    } else {
        Disposition::Transient
    }
}

/// Budget a response is metered against. Search has its own, much
/// smaller bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QuotaResource {
    #[default]
    Core,
    Search,
}

impl QuotaResource {
    pub fn as_str(self) -> &'static str {
        match self {
            QuotaResource::Core => "core",
            QuotaResource::Search => "search",
        }
    }

    fn from_header(value: &str) -> Self {
        match value {
            "search" => QuotaResource::Search,
            _ => QuotaResource::Core,
        }
    }
}

/// Rate-limit headers observed on a response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitSnapshot {
    pub resource: QuotaResource,
    pub remaining: Option<u32>,
    pub reset_at: Option<DateTime<Utc>>,
}

impl RateLimitSnapshot {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .map(ToString::to_string)
        };
        Self {
            resource: header("x-ratelimit-resource")
                .map(|v| QuotaResource::from_header(&v))
                .unwrap_or_default(),
            remaining: header("x-ratelimit-remaining").and_then(|v| v.parse().ok()),
            reset_at: header("x-ratelimit-reset")
                .and_then(|v| v.parse::<i64>().ok())
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub bearer_token: Option<String>,
    pub accept: Option<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            bearer_token: None,
            accept: None,
            global_concurrency: 16,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    pub rate_limit: RateLimitSnapshot,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus {
        status: u16,
        url: String,
        rate_limit: RateLimitSnapshot,
    },
}

impl FetchError {
    pub fn disposition(&self) -> Disposition {
        match self {
            FetchError::Request(_) => Disposition::Transient,
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(Disposition::Transient),
        }
    }

    pub fn rate_limit(&self) -> RateLimitSnapshot {
        match self {
            FetchError::Request(_) => RateLimitSnapshot::default(),
            FetchError::HttpStatus { rate_limit, .. } => *rate_limit,
        }
    }
}

/// Bounded-concurrency GET client. One attempt per call; retry policy
/// belongs to the caller.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    bearer_token: Option<String>,
    accept: Option<String>,
    last_rate_limit: StdMutex<BTreeMap<QuotaResource, RateLimitSnapshot>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            bearer_token: config.bearer_token.filter(|t| !t.trim().is_empty()),
            accept: config.accept,
            last_rate_limit: StdMutex::new(BTreeMap::new()),
        })
    }

    pub fn has_credential(&self) -> bool {
        self.bearer_token.is_some()
    }

    /// Most recent rate-limit headers seen for `resource`.
    pub fn last_rate_limit(&self, resource: QuotaResource) -> Option<RateLimitSnapshot> {
        self.last_rate_limit
            .lock()
            .ok()
            .and_then(|guard| guard.get(&resource).copied())
    }

    fn record_rate_limit(&self, snapshot: RateLimitSnapshot) {
        if snapshot.remaining.is_none() {
            return;
        }
        if let Ok(mut guard) = self.last_rate_limit.lock() {
            guard.insert(snapshot.resource, snapshot);
        }
    }

    pub async fn get(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");

        let span = info_span!("http_fetch", url);
        self.send(url, query).instrument(span).await
    }

    async fn send(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let mut request = self.client.get(url).query(query);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        if let Some(accept) = &self.accept {
            request = request.header(reqwest::header::ACCEPT, accept);
        }

        let resp = request.send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        let rate_limit = RateLimitSnapshot::from_headers(resp.headers());
        self.record_rate_limit(rate_limit);

        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
                rate_limit,
            });
        }

        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
            rate_limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gharvest_core::{HarvestedRepo, Phase, RepoKey};
    use reqwest::header::HeaderValue;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn content_hashing_is_stable() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn atomic_writes_replace_and_leave_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("state.json");

        write_atomic(&path, b"first").await.expect("first write");
        let second = write_atomic(&path, b"second version").await.expect("second write");

        assert_eq!(std::fs::read(&path).unwrap(), b"second version");
        assert_eq!(second.byte_size, 14);
        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn missing_checkpoint_loads_as_empty_collecting_plan() {
        let dir = tempdir().expect("tempdir");
        let store = CheckpointStore::new(dir.path().join("checkpoint.json"));
        let checkpoint = store.load().await.expect("load");
        assert_eq!(checkpoint, Checkpoint::default());
        assert_eq!(checkpoint.phase, Phase::Collecting);
    }

    #[tokio::test]
    async fn checkpoint_survives_save_and_reload() {
        let dir = tempdir().expect("tempdir");
        let store = CheckpointStore::new(dir.path().join("checkpoint.json"));

        let mut checkpoint = Checkpoint::default();
        checkpoint.completed_tasks.insert("top_repos".to_string());
        checkpoint.filtered_count = 7;
        let key = RepoKey::new("a/b");
        let mut repo = HarvestedRepo::new(key.clone(), json!({"full_name": "a/b", "id": 1}));
        repo.sources.insert("top_starred".to_string());
        checkpoint.repositories.insert(key, repo);

        store.save(&checkpoint).await.expect("save");
        let reloaded = store.load().await.expect("reload");
        assert_eq!(reloaded, checkpoint);
    }

    #[tokio::test]
    async fn newer_checkpoint_versions_are_refused() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("checkpoint.json");
        std::fs::write(&path, r#"{"version": 99}"#).unwrap();
        let err = CheckpointStore::new(&path).load().await.unwrap_err();
        assert!(err.to_string().contains("version 99"));
    }

    #[test]
    fn status_classification_separates_quota_from_transient() {
        assert_eq!(classify_status(StatusCode::FORBIDDEN), Disposition::QuotaExhausted);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            Disposition::QuotaExhausted
        );
        assert_eq!(classify_status(StatusCode::NOT_FOUND), Disposition::NotFound);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), Disposition::Transient);
    }

    #[test]
    fn rate_limit_headers_are_parsed() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("42"));
        headers.insert("x-ratelimit-reset", HeaderValue::from_static("1767225600"));
        let snapshot = RateLimitSnapshot::from_headers(&headers);
        assert_eq!(snapshot.remaining, Some(42));
        assert_eq!(snapshot.resource, QuotaResource::Core);
        assert_eq!(snapshot.reset_at.unwrap().timestamp(), 1_767_225_600);

        headers.insert("x-ratelimit-resource", HeaderValue::from_static("search"));
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("3"));
        let search = RateLimitSnapshot::from_headers(&headers);
        assert_eq!(search.resource, QuotaResource::Search);
        assert_eq!(search.remaining, Some(3));

        assert_eq!(
            RateLimitSnapshot::from_headers(&HeaderMap::new()),
            RateLimitSnapshot::default()
        );
    }
}

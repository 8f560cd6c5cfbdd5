//! Remote search service contract + GitHub and fixture-backed implementations.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use gharvest_core::{json_str, json_u64, RepoKey, SubFetch};
use gharvest_storage::{Disposition, FetchError, HttpClientConfig, HttpFetcher};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub mod readme;
pub mod validate;

pub use gharvest_storage::QuotaResource;
pub use readme::ReadmeCleaner;
pub use validate::{CoarseFilter, ItemValidator, RejectReason, ValidationConfig, Verdict};

pub const CRATE_NAME: &str = "gharvest-adapters";

/// Hard page size of the search endpoint.
pub const MAX_PAGE_SIZE: u32 = 100;
/// The search endpoint serves at most this many pages per query.
pub const MAX_SEARCH_PAGES: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Stars,
    Forks,
    Updated,
    HelpWantedIssues,
}

impl SortOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            SortOrder::Stars => "stars",
            SortOrder::Forks => "forks",
            SortOrder::Updated => "updated",
            SortOrder::HelpWantedIssues => "help-wanted-issues",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub sort: SortOrder,
    pub page: u32,
    pub per_page: u32,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SearchPage {
    pub items: Vec<JsonValue>,
    pub total_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub remaining: u32,
    pub limit: u32,
    pub reset_at: Option<DateTime<Utc>>,
}

/// Long-form content of a repository, already decoded from base64.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReadmeDocument {
    pub name: Option<String>,
    pub download_url: Option<String>,
    pub content: Option<String>,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("rate limit exhausted")]
    QuotaExhausted { reset_at: Option<DateTime<Utc>> },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ServiceError {
    pub fn is_quota_exhausted(&self) -> bool {
        matches!(self, ServiceError::QuotaExhausted { .. })
    }
}

impl From<FetchError> for ServiceError {
    fn from(err: FetchError) -> Self {
        match err.disposition() {
            Disposition::QuotaExhausted => ServiceError::QuotaExhausted {
                reset_at: err.rate_limit().reset_at,
            },
            Disposition::NotFound => ServiceError::NotFound(err.to_string()),
            Disposition::Transient => ServiceError::Transient(err.to_string()),
        }
    }
}

/// The remote search service: paginated search, quota endpoint and the
/// per-repository sub-endpoints used by enrichment.
#[async_trait]
pub trait RepoService: Send + Sync {
    fn service_id(&self) -> &'static str;

    fn has_credential(&self) -> bool;

    /// Remaining `resource` quota as last observed on a response, without a call.
    fn observed_remaining(&self, resource: QuotaResource) -> Option<u32>;

    async fn rate_limit(&self, resource: QuotaResource) -> Result<RateLimitStatus, ServiceError>;

    async fn search(&self, request: &SearchRequest) -> Result<SearchPage, ServiceError>;

    async fn repo_detail(&self, key: &RepoKey) -> Result<JsonValue, ServiceError>;

    async fn repo_languages(&self, key: &RepoKey) -> Result<BTreeMap<String, u64>, ServiceError>;

    async fn repo_readme(&self, key: &RepoKey) -> Result<ReadmeDocument, ServiceError>;
}

pub fn decode_readme(payload: &JsonValue) -> ReadmeDocument {
    let content = match (json_str(payload, &["content"]), json_str(payload, &["encoding"])) {
        (Some(encoded), Some("base64")) => {
            let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
            match base64::engine::general_purpose::STANDARD.decode(compact.as_bytes()) {
                Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
                Err(err) => {
                    debug!(error = %err, "undecodable readme content");
                    None
                }
            }
        }
        (Some(plain), None) => Some(plain.to_string()),
        _ => None,
    };
    ReadmeDocument {
        name: json_str(payload, &["name"]).map(ToString::to_string),
        download_url: json_str(payload, &["download_url"]).map(ToString::to_string),
        content,
    }
}

pub fn parse_languages(payload: &JsonValue) -> Result<BTreeMap<String, u64>, ServiceError> {
    let obj = payload
        .as_object()
        .ok_or_else(|| ServiceError::Malformed("languages payload is not an object".into()))?;
    Ok(obj
        .iter()
        .filter_map(|(lang, bytes)| bytes.as_u64().map(|b| (lang.clone(), b)))
        .collect())
}

#[derive(Debug, Clone)]
pub struct GithubConfig {
    pub api_base: String,
    pub token: Option<String>,
    pub user_agent: String,
    pub timeout: std::time::Duration,
}

/// GitHub REST implementation of [`RepoService`].
#[derive(Debug)]
pub struct GithubService {
    api_base: String,
    http: HttpFetcher,
}

impl GithubService {
    pub fn new(config: GithubConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.timeout,
            user_agent: Some(config.user_agent),
            bearer_token: config.token,
            accept: Some("application/vnd.github.v3+json".to_string()),
            ..Default::default()
        })?;
        Ok(Self {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn repo_url(&self, key: &RepoKey, suffix: &str) -> Result<String, ServiceError> {
        let (owner, name) = key
            .owner_and_name()
            .ok_or_else(|| ServiceError::Malformed(format!("key {key} has no owner/name")))?;
        Ok(format!("{}/repos/{owner}/{name}{suffix}", self.api_base))
    }

    async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<JsonValue, ServiceError> {
        let resp = self.http.get(url, query).await?;
        serde_json::from_slice(&resp.body)
            .map_err(|e| ServiceError::Malformed(format!("{url}: {e}")))
    }
}

#[async_trait]
impl RepoService for GithubService {
    fn service_id(&self) -> &'static str {
        "github"
    }

    fn has_credential(&self) -> bool {
        self.http.has_credential()
    }

    fn observed_remaining(&self, resource: QuotaResource) -> Option<u32> {
        self.http
            .last_rate_limit(resource)
            .and_then(|snapshot| snapshot.remaining)
    }

    async fn rate_limit(&self, resource: QuotaResource) -> Result<RateLimitStatus, ServiceError> {
        let url = format!("{}/rate_limit", self.api_base);
        let value = self.get_json(&url, &[]).await?;
        let field = |name: &str| json_u64(&value, &["resources", resource.as_str(), name]);
        let remaining = field("remaining").ok_or_else(|| {
            ServiceError::Malformed(format!("rate_limit without {}.remaining", resource.as_str()))
        })?;
        Ok(RateLimitStatus {
            remaining: remaining.min(u32::MAX as u64) as u32,
            limit: field("limit").unwrap_or(0).min(u32::MAX as u64) as u32,
            reset_at: field("reset").and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single()),
        })
    }

    async fn search(&self, request: &SearchRequest) -> Result<SearchPage, ServiceError> {
        let url = format!("{}/search/repositories", self.api_base);
        let query = [
            ("q", request.query.clone()),
            ("sort", request.sort.as_str().to_string()),
            ("order", "desc".to_string()),
            ("per_page", request.per_page.min(MAX_PAGE_SIZE).to_string()),
            ("page", request.page.to_string()),
        ];
        let value = self.get_json(&url, &query).await?;
        let items = value
            .get("items")
            .and_then(|v| v.as_array())
            .cloned()
            .ok_or_else(|| ServiceError::Malformed("search response without items".into()))?;
        Ok(SearchPage {
            items,
            total_count: json_u64(&value, &["total_count"]).unwrap_or(0),
        })
    }

    async fn repo_detail(&self, key: &RepoKey) -> Result<JsonValue, ServiceError> {
        let url = self.repo_url(key, "")?;
        self.get_json(&url, &[]).await
    }

    async fn repo_languages(&self, key: &RepoKey) -> Result<BTreeMap<String, u64>, ServiceError> {
        let url = self.repo_url(key, "/languages")?;
        let value = self.get_json(&url, &[]).await?;
        parse_languages(&value)
    }

    async fn repo_readme(&self, key: &RepoKey) -> Result<ReadmeDocument, ServiceError> {
        let url = self.repo_url(key, "/readme")?;
        let value = self.get_json(&url, &[]).await?;
        Ok(decode_readme(&value))
    }
}

/// Offline bundle served by [`FixtureService`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub fixture_id: String,
    #[serde(default)]
    pub notes: Option<String>,
    /// Call budget; `None` never runs out.
    #[serde(default)]
    pub quota: Option<u32>,
    #[serde(default)]
    pub reset_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub searches: Vec<FixtureSearch>,
    #[serde(default)]
    pub details: BTreeMap<String, JsonValue>,
    #[serde(default)]
    pub languages: BTreeMap<String, BTreeMap<String, u64>>,
    #[serde(default)]
    pub readmes: BTreeMap<String, String>,
    #[serde(default)]
    pub faults: Vec<FixtureFault>,
}

/// Items returned, in remote order, for any query starting with `query`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureSearch {
    pub query: String,
    #[serde(default)]
    pub items: Vec<JsonValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    QuotaExhausted,
    Transient,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum FixtureFault {
    SearchPage { page: u32, kind: FaultKind },
    SubFetch { repo: String, endpoint: SubFetch, kind: FaultKind },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixtureCall {
    RateLimit { resource: QuotaResource },
    Search { query: String, page: u32 },
    SubFetch { repo: String, endpoint: SubFetch },
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Deterministic in-memory [`RepoService`] with a call budget and
/// injectable faults.
#[derive(Debug)]
pub struct FixtureService {
    bundle: FixtureBundle,
    remaining: Mutex<Option<u32>>,
    calls: Mutex<Vec<FixtureCall>>,
}

impl FixtureService {
    pub fn new(bundle: FixtureBundle) -> Self {
        let remaining = Mutex::new(bundle.quota);
        Self {
            bundle,
            remaining,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load_fixture_bundle(path)?))
    }

    pub fn with_quota(self, quota: u32) -> Self {
        if let Ok(mut guard) = self.remaining.lock() {
            *guard = Some(quota);
        }
        self
    }

    pub fn with_fault(mut self, fault: FixtureFault) -> Self {
        self.bundle.faults.push(fault);
        self
    }

    pub fn calls(&self) -> Vec<FixtureCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Highest page number requested for queries starting with `query_prefix`.
    pub fn max_page_requested(&self, query_prefix: &str) -> u32 {
        self.calls()
            .iter()
            .filter_map(|call| match call {
                FixtureCall::Search { query, page } if query.starts_with(query_prefix) => Some(*page),
                _ => None,
            })
            .max()
            .unwrap_or(0)
    }

    fn record(&self, call: FixtureCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn spend(&self) -> Result<(), ServiceError> {
        let mut guard = self
            .remaining
            .lock()
            .map_err(|_| ServiceError::Transient("fixture quota lock poisoned".into()))?;
        match guard.as_mut() {
            None => Ok(()),
            Some(0) => Err(ServiceError::QuotaExhausted {
                reset_at: self.bundle.reset_at,
            }),
            Some(n) => {
                *n -= 1;
                Ok(())
            }
        }
    }

    fn fault_error(&self, kind: FaultKind, what: String) -> ServiceError {
        match kind {
            FaultKind::QuotaExhausted => ServiceError::QuotaExhausted {
                reset_at: self.bundle.reset_at,
            },
            FaultKind::Transient => ServiceError::Transient(format!("injected failure: {what}")),
            FaultKind::NotFound => ServiceError::NotFound(what),
        }
    }

    fn sub_fetch_fault(&self, key: &RepoKey, endpoint: SubFetch) -> Option<ServiceError> {
        self.bundle.faults.iter().find_map(|fault| match fault {
            FixtureFault::SubFetch {
                repo,
                endpoint: e,
                kind,
            } if repo == key.as_str() && *e == endpoint => {
                Some(self.fault_error(*kind, format!("{key} {endpoint:?}")))
            }
            _ => None,
        })
    }

    fn begin_sub_fetch(&self, key: &RepoKey, endpoint: SubFetch) -> Result<(), ServiceError> {
        self.record(FixtureCall::SubFetch {
            repo: key.to_string(),
            endpoint,
        });
        if let Some(err) = self.sub_fetch_fault(key, endpoint) {
            return Err(err);
        }
        self.spend()
    }

    fn matching_search(&self, query: &str) -> Option<&FixtureSearch> {
        self.bundle
            .searches
            .iter()
            .filter(|s| query.starts_with(s.query.as_str()))
            .max_by_key(|s| s.query.len())
    }
}

#[async_trait]
impl RepoService for FixtureService {
    fn service_id(&self) -> &'static str {
        "fixture"
    }

    fn has_credential(&self) -> bool {
        false
    }

    /// One budget backs every resource.
    fn observed_remaining(&self, _resource: QuotaResource) -> Option<u32> {
        self.remaining.lock().ok().and_then(|g| *g)
    }

    async fn rate_limit(&self, resource: QuotaResource) -> Result<RateLimitStatus, ServiceError> {
        self.record(FixtureCall::RateLimit { resource });
        let remaining = self.observed_remaining(resource).unwrap_or(5000);
        Ok(RateLimitStatus {
            remaining,
            limit: self.bundle.quota.unwrap_or(5000),
            reset_at: self.bundle.reset_at,
        })
    }

    async fn search(&self, request: &SearchRequest) -> Result<SearchPage, ServiceError> {
        self.record(FixtureCall::Search {
            query: request.query.clone(),
            page: request.page,
        });
        let fault = self.bundle.faults.iter().find_map(|fault| match fault {
            FixtureFault::SearchPage { page, kind } if *page == request.page => Some(*kind),
            _ => None,
        });
        if let Some(kind) = fault {
            return Err(self.fault_error(kind, format!("page {}", request.page)));
        }
        self.spend()?;

        let Some(search) = self.matching_search(&request.query) else {
            return Ok(SearchPage::default());
        };
        let per_page = request.per_page.clamp(1, MAX_PAGE_SIZE) as usize;
        let start = (request.page.max(1) as usize - 1) * per_page;
        let items = search
            .items
            .iter()
            .skip(start)
            .take(per_page)
            .cloned()
            .collect();
        Ok(SearchPage {
            items,
            total_count: search.items.len() as u64,
        })
    }

    async fn repo_detail(&self, key: &RepoKey) -> Result<JsonValue, ServiceError> {
        self.begin_sub_fetch(key, SubFetch::Detail)?;
        self.bundle
            .details
            .get(key.as_str())
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(key.to_string()))
    }

    async fn repo_languages(&self, key: &RepoKey) -> Result<BTreeMap<String, u64>, ServiceError> {
        self.begin_sub_fetch(key, SubFetch::Languages)?;
        Ok(self
            .bundle
            .languages
            .get(key.as_str())
            .cloned()
            .unwrap_or_default())
    }

    async fn repo_readme(&self, key: &RepoKey) -> Result<ReadmeDocument, ServiceError> {
        self.begin_sub_fetch(key, SubFetch::Readme)?;
        let text = self
            .bundle
            .readmes
            .get(key.as_str())
            .ok_or_else(|| ServiceError::NotFound(format!("{key} readme")))?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(text.as_bytes());
        Ok(decode_readme(&serde_json::json!({
            "name": "README.md",
            "content": encoded,
            "encoding": "base64",
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn repo(full_name: &str, stars: u64) -> JsonValue {
        json!({"full_name": full_name, "stargazers_count": stars})
    }

    fn bundle_with(items: Vec<JsonValue>) -> FixtureBundle {
        FixtureBundle {
            fixture_id: "unit".into(),
            searches: vec![FixtureSearch {
                query: "topic:rust".into(),
                items,
            }],
            ..Default::default()
        }
    }

    fn request(query: &str, page: u32, per_page: u32) -> SearchRequest {
        SearchRequest {
            query: query.into(),
            sort: SortOrder::Stars,
            page,
            per_page,
        }
    }

    #[test]
    fn readme_payload_is_base64_decoded_across_line_breaks() {
        let payload = json!({
            "name": "README.md",
            "download_url": "https://example.test/README.md",
            "encoding": "base64",
            "content": "IyBIZWxs\nbyB3b3Js\nZA==\n",
        });
        let doc = decode_readme(&payload);
        assert_eq!(doc.content.as_deref(), Some("# Hello world"));
        assert_eq!(doc.name.as_deref(), Some("README.md"));

        let garbage = json!({"encoding": "base64", "content": "%%%"});
        assert_eq!(decode_readme(&garbage).content, None);
    }

    #[test]
    fn languages_payload_must_be_an_object() {
        let parsed = parse_languages(&json!({"Rust": 1200, "Shell": 30})).unwrap();
        assert_eq!(parsed.get("Rust"), Some(&1200));
        assert!(parse_languages(&json!(["Rust"])).is_err());
    }

    #[tokio::test]
    async fn fixture_search_paginates_by_longest_prefix() {
        let items = (0..250).map(|i| repo(&format!("o/r{i}"), 1000 - i)).collect();
        let service = FixtureService::new(bundle_with(items));

        let first = service
            .search(&request("topic:rust stars:>=10", 1, 100))
            .await
            .unwrap();
        assert_eq!(first.items.len(), 100);
        assert_eq!(first.total_count, 250);

        let third = service
            .search(&request("topic:rust stars:>=10", 3, 100))
            .await
            .unwrap();
        assert_eq!(third.items.len(), 50);

        let empty = service.search(&request("topic:go", 1, 100)).await.unwrap();
        assert!(empty.items.is_empty());
        assert_eq!(service.max_page_requested("topic:rust"), 3);
    }

    #[tokio::test]
    async fn fixture_quota_runs_out() {
        let service = FixtureService::new(bundle_with(vec![repo("o/a", 10)])).with_quota(1);
        assert!(service.search(&request("topic:rust", 1, 100)).await.is_ok());
        let err = service
            .search(&request("topic:rust", 2, 100))
            .await
            .unwrap_err();
        assert!(err.is_quota_exhausted());
        assert_eq!(service.observed_remaining(QuotaResource::Search), Some(0));
    }

    #[tokio::test]
    async fn injected_sub_fetch_fault_only_hits_its_endpoint() {
        let mut bundle = bundle_with(vec![]);
        bundle.details.insert("o/a".into(), repo("o/a", 10));
        bundle.readmes.insert("o/a".into(), "hello".into());
        let service = FixtureService::new(bundle).with_fault(FixtureFault::SubFetch {
            repo: "o/a".into(),
            endpoint: SubFetch::Readme,
            kind: FaultKind::QuotaExhausted,
        });
        let key = RepoKey::new("o/a");
        assert!(service.repo_detail(&key).await.is_ok());
        assert!(service.repo_readme(&key).await.unwrap_err().is_quota_exhausted());
    }
}

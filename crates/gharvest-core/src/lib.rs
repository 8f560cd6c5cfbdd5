//! Core domain model for the repository harvester.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "gharvest-core";

pub const CHECKPOINT_VERSION: u32 = 1;

/// Stable identity of a harvested repository.
///
/// Built from `full_name` when the payload carries one (needed to address the
/// per-repository endpoints), else from `owner.login` + `name`, else from the
/// numeric `id`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoKey(String);

impl RepoKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn from_item(item: &JsonValue) -> Option<Self> {
        if let Some(full_name) = json_str(item, &["full_name"]).filter(|s| s.contains('/')) {
            return Some(Self(full_name.to_string()));
        }
        let owner = json_str(item, &["owner", "login"]).or_else(|| json_str(item, &["owner"]));
        if let (Some(owner), Some(name)) = (owner, json_str(item, &["name"])) {
            return Some(Self(format!("{owner}/{name}")));
        }
        json_u64(item, &["id"]).map(|id| Self(format!("id:{id}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `(owner, name)` when the key is an owner/name pair.
    pub fn owner_and_name(&self) -> Option<(&str, &str)> {
        let (owner, name) = self.0.split_once('/')?;
        if owner.is_empty() || name.is_empty() {
            None
        } else {
            Some((owner, name))
        }
    }
}

impl fmt::Display for RepoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Boolean facets a collection task can attach to a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Facet {
    Gsoc,
    Hacktoberfest,
    GoodFirstIssues,
    Underrated,
}

impl Facet {
    pub const ALL: [Facet; 4] = [
        Facet::Gsoc,
        Facet::Hacktoberfest,
        Facet::GoodFirstIssues,
        Facet::Underrated,
    ];

    /// Whether a task carrying this facet actually sets it on `item`.
    ///
    /// Category facets are unconditional. `Underrated` is derived per item:
    /// modest star count with outsized fork or watcher engagement.
    pub fn applies_to(self, item: &JsonValue) -> bool {
        match self {
            Facet::Gsoc | Facet::Hacktoberfest | Facet::GoodFirstIssues => true,
            Facet::Underrated => {
                let stars = json_u64(item, &["stargazers_count"]).unwrap_or(0);
                let forks = json_u64(item, &["forks_count"]).unwrap_or(0);
                let watchers = json_u64(item, &["watchers_count"]).unwrap_or(0);
                stars < 2000 && (forks > 20 || watchers > 50)
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Facet::Gsoc => "gsoc",
            Facet::Hacktoberfest => "hacktoberfest",
            Facet::GoodFirstIssues => "good_first_issues",
            Facet::Underrated => "underrated",
        }
    }
}

/// What one collection task contributes to every repository it yields.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Provenance {
    pub tag: String,
    pub facet: Option<Facet>,
    pub topics: Vec<String>,
    pub languages: Vec<String>,
}

impl Provenance {
    pub fn tagged(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Default::default()
        }
    }

    pub fn with_facet(mut self, facet: Facet) -> Self {
        self.facet = Some(facet);
        self
    }
}

/// The per-repository sub-fetches issued during enrichment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubFetch {
    Detail,
    Languages,
    Readme,
}

impl SubFetch {
    pub const ALL: [SubFetch; 3] = [SubFetch::Detail, SubFetch::Languages, SubFetch::Readme];
}

/// Detail attached to a repository once its enrichment sub-fetches ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentRecord {
    #[serde(default)]
    pub detail: Option<JsonValue>,
    #[serde(default)]
    pub languages_breakdown: BTreeMap<String, u64>,
    #[serde(default)]
    pub readme: String,
    #[serde(default)]
    pub readme_name: Option<String>,
    #[serde(default)]
    pub readme_url: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub primary_language: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    /// Sub-fetches that returned nothing usable; their fields stay empty.
    #[serde(default)]
    pub absent: BTreeSet<SubFetch>,
    pub enriched_at: DateTime<Utc>,
}

impl EnrichmentRecord {
    pub fn empty(enriched_at: DateTime<Utc>) -> Self {
        Self {
            detail: None,
            languages_breakdown: BTreeMap::new(),
            readme: String::new(),
            readme_name: None,
            readme_url: None,
            license: None,
            primary_language: None,
            topics: Vec::new(),
            absent: BTreeSet::new(),
            enriched_at,
        }
    }

    pub fn is_partial(&self) -> bool {
        !self.absent.is_empty()
    }
}

/// One deduplicated repository with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestedRepo {
    pub key: RepoKey,
    pub raw: JsonValue,
    #[serde(default)]
    pub sources: BTreeSet<String>,
    #[serde(default)]
    pub facets: BTreeSet<Facet>,
    #[serde(default)]
    pub topics: BTreeSet<String>,
    #[serde(default)]
    pub languages: BTreeSet<String>,
    #[serde(default)]
    pub enrichment: Option<EnrichmentRecord>,
}

impl HarvestedRepo {
    pub fn new(key: RepoKey, raw: JsonValue) -> Self {
        Self {
            key,
            raw,
            sources: BTreeSet::new(),
            facets: BTreeSet::new(),
            topics: BTreeSet::new(),
            languages: BTreeSet::new(),
            enrichment: None,
        }
    }

    pub fn is_enriched(&self) -> bool {
        self.enrichment.is_some()
    }

    pub fn has_facet(&self, facet: Facet) -> bool {
        self.facets.contains(&facet)
    }
}

/// Run phase. Moves one way: `collecting` -> `enriching`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Collecting,
    Enriching,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Collecting => f.write_str("collecting"),
            Phase::Enriching => f.write_str("enriching"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounters {
    pub collected: usize,
    pub filtered_out: u64,
    pub completed_at: DateTime<Utc>,
}

/// Durable projection of a run: entities, task marks, phase and counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub completed_tasks: BTreeSet<String>,
    #[serde(default)]
    pub task_counters: BTreeMap<String, TaskCounters>,
    #[serde(default)]
    pub filtered_count: u64,
    #[serde(default)]
    pub repositories: BTreeMap<RepoKey, HarvestedRepo>,
    #[serde(default)]
    pub last_run_id: Option<Uuid>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            phase: Phase::Collecting,
            completed_tasks: BTreeSet::new(),
            task_counters: BTreeMap::new(),
            filtered_count: 0,
            repositories: BTreeMap::new(),
            last_run_id: None,
            updated_at: None,
        }
    }
}

impl Checkpoint {
    pub fn enriched_count(&self) -> usize {
        self.repositories.values().filter(|r| r.is_enriched()).count()
    }
}

/// Filtering thresholds recorded in dataset metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilteringCriteria {
    pub min_stars: u64,
    pub min_forks: u64,
    pub max_fork_star_ratio: f64,
    pub min_description_len: usize,
    pub requires_license: bool,
    pub requires_description: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DatasetMetadata {
    #[serde(default)]
    pub total_repos: usize,
    #[serde(default)]
    pub fetched_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enriched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub token_used: bool,
    #[serde(default)]
    pub completed_tasks: Vec<String>,
    #[serde(default)]
    pub filtered_count: u64,
    #[serde(default)]
    pub filtering_criteria: Option<FilteringCriteria>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub merged_from_files: bool,
}

/// Collection-phase output: the keyed entity map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDataset {
    pub metadata: DatasetMetadata,
    pub repositories: BTreeMap<RepoKey, HarvestedRepo>,
}

/// Flattened, enriched repository as handed to downstream consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DatasetRecord {
    pub id: Option<u64>,
    pub name: Option<String>,
    pub full_name: Option<String>,
    pub owner: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub homepage: Option<String>,
    pub language: Option<String>,
    pub topics: Vec<String>,
    pub stars: Option<u64>,
    pub forks: Option<u64>,
    pub open_issues: Option<u64>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub license: Option<String>,
    pub has_issues: Option<bool>,
    pub has_wiki: Option<bool>,
    pub default_branch: Option<String>,
    pub readme: String,
    pub languages: Vec<String>,
    pub is_gsoc: bool,
    pub is_hacktoberfest: bool,
    pub is_underrated: bool,
    pub has_good_first_issues: bool,
    pub sources: Vec<String>,
    /// Name, description, language, topics and readme joined for text models.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub combined_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EnrichedDataset {
    #[serde(default)]
    pub metadata: DatasetMetadata,
    #[serde(default)]
    pub repositories: Vec<DatasetRecord>,
}

fn json_path<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

pub fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_path(value, path)?.as_str()
}

pub fn json_u64(value: &JsonValue, path: &[&str]) -> Option<u64> {
    json_path(value, path)?.as_u64()
}

pub fn json_bool(value: &JsonValue, path: &[&str]) -> Option<bool> {
    json_path(value, path)?.as_bool()
}

pub fn json_string_vec(value: &JsonValue, path: &[&str]) -> Vec<String> {
    json_path(value, path)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(ToString::to_string))
                .collect()
        })
        .unwrap_or_default()
}

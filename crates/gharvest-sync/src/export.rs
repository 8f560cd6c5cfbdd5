//! Dataset files: raw entity map, flattened enriched records, parquet snapshot.

use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::Utc;
use gharvest_adapters::ReadmeCleaner;
use gharvest_core::{
    json_bool, json_str, json_string_vec, json_u64, DatasetMetadata, DatasetRecord, EnrichedDataset,
    Facet, FilteringCriteria, HarvestedRepo, RawDataset,
};
use gharvest_storage::{read_json_optional, sha256_hex, write_json_atomic, StoredFile};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::enrich::ranked_languages;
use crate::state::HarvestState;

pub const RAW_FILE: &str = "raw_repositories.json";
pub const ENRICHED_FILE: &str = "enriched_repositories.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct DatasetExporter {
    output_dir: PathBuf,
    token_used: bool,
    criteria: FilteringCriteria,
}

impl DatasetExporter {
    pub fn new(output_dir: impl Into<PathBuf>, token_used: bool, criteria: FilteringCriteria) -> Self {
        Self {
            output_dir: output_dir.into(),
            token_used,
            criteria,
        }
    }

    pub fn raw_path(&self) -> PathBuf {
        self.output_dir.join(RAW_FILE)
    }

    pub fn enriched_path(&self) -> PathBuf {
        self.output_dir.join(ENRICHED_FILE)
    }

    fn metadata(&self, state: &HarvestState, total_repos: usize) -> DatasetMetadata {
        DatasetMetadata {
            total_repos,
            fetched_at: Some(Utc::now()),
            enriched_at: None,
            token_used: self.token_used,
            completed_tasks: state.registry().completed().iter().cloned().collect(),
            filtered_count: state.filtered_count(),
            filtering_criteria: Some(self.criteria.clone()),
            merged_from_files: false,
        }
    }

    pub async fn write_raw(&self, state: &HarvestState) -> Result<StoredFile> {
        let dataset = RawDataset {
            metadata: self.metadata(state, state.repositories().len()),
            repositories: state.repositories().clone(),
        };
        let stored = write_json_atomic(&self.raw_path(), &dataset).await?;
        info!(path = %stored.path.display(), repositories = dataset.metadata.total_repos, "raw dataset written");
        Ok(stored)
    }

    /// Writes only entities that carry an enrichment record.
    pub async fn write_enriched(&self, state: &HarvestState) -> Result<StoredFile> {
        let repositories: Vec<DatasetRecord> = state
            .repositories()
            .values()
            .filter(|r| r.is_enriched())
            .map(format_record)
            .collect();
        let mut metadata = self.metadata(state, repositories.len());
        metadata.enriched_at = Some(Utc::now());
        let dataset = EnrichedDataset {
            metadata,
            repositories,
        };
        write_json_atomic(&self.enriched_path(), &dataset).await
    }

    pub async fn write_snapshot(&self, state: &HarvestState) -> Result<PathBuf> {
        let snapshot_dir = self.output_dir.join("snapshots");
        tokio::fs::create_dir_all(&snapshot_dir)
            .await
            .with_context(|| format!("creating {}", snapshot_dir.display()))?;

        let repos: Vec<&HarvestedRepo> = state.repositories().values().collect();
        let repositories_path = snapshot_dir.join("repositories.parquet");
        let sources_path = snapshot_dir.join("repository_sources.parquet");
        write_repositories_parquet(&repositories_path, &repos)?;
        write_sources_parquet(&sources_path, &repos)?;

        let manifest = ParquetManifest {
            schema_version: 1,
            files: vec![
                manifest_entry("repositories", &self.output_dir, &repositories_path)?,
                manifest_entry("repository_sources", &self.output_dir, &sources_path)?,
            ],
        };
        let manifest_path = snapshot_dir.join("manifest.json");
        write_json_atomic(&manifest_path, &manifest).await?;
        info!(path = %manifest_path.display(), repositories = repos.len(), "parquet snapshot written");
        Ok(manifest_path)
    }
}

/// Flatten one entity for downstream consumers. Enrichment detail wins over
/// the search payload where both carry a field.
pub fn format_record(repo: &HarvestedRepo) -> DatasetRecord {
    let enrichment = repo.enrichment.as_ref();
    let d = enrichment
        .and_then(|e| e.detail.as_ref())
        .unwrap_or(&repo.raw);
    let text = |path: &[&str]| json_str(d, path).map(ToString::to_string);

    let mut topics = enrichment.map(|e| e.topics.clone()).unwrap_or_default();
    if topics.is_empty() {
        topics = json_string_vec(d, &["topics"]);
    }
    if topics.is_empty() {
        topics = repo.topics.iter().cloned().collect();
    }

    let languages = match enrichment {
        Some(e) if !e.languages_breakdown.is_empty() => ranked_languages(&e.languages_breakdown),
        _ => repo.languages.iter().cloned().collect(),
    };

    DatasetRecord {
        id: json_u64(d, &["id"]),
        name: text(&["name"]),
        full_name: text(&["full_name"]).or_else(|| Some(repo.key.to_string())),
        owner: text(&["owner", "login"]),
        description: text(&["description"]),
        url: text(&["html_url"]),
        homepage: text(&["homepage"]).filter(|h| !h.is_empty()),
        language: enrichment
            .and_then(|e| e.primary_language.clone())
            .or_else(|| text(&["language"])),
        topics,
        stars: json_u64(d, &["stargazers_count"]),
        forks: json_u64(d, &["forks_count"]),
        open_issues: json_u64(d, &["open_issues_count"]),
        created_at: text(&["created_at"]),
        updated_at: text(&["updated_at"]),
        license: enrichment
            .and_then(|e| e.license.clone())
            .or_else(|| text(&["license", "name"])),
        has_issues: json_bool(d, &["has_issues"]),
        has_wiki: json_bool(d, &["has_wiki"]),
        default_branch: text(&["default_branch"]),
        readme: enrichment.map(|e| e.readme.clone()).unwrap_or_default(),
        languages,
        is_gsoc: repo.has_facet(Facet::Gsoc),
        is_hacktoberfest: repo.has_facet(Facet::Hacktoberfest),
        is_underrated: repo.has_facet(Facet::Underrated),
        has_good_first_issues: repo.has_facet(Facet::GoodFirstIssues),
        sources: repo.sources.iter().cloned().collect(),
        combined_text: None,
    }
}

pub async fn load_enriched_dataset(path: &Path) -> Result<EnrichedDataset> {
    read_json_optional(path)
        .await?
        .with_context(|| format!("dataset {} does not exist", path.display()))
}

fn merge_key(record: &DatasetRecord) -> Option<String> {
    record
        .id
        .map(|id| format!("id:{id}"))
        .or_else(|| record.full_name.clone())
}

/// Union two dataset files keyed by repository id. Metadata comes from `a`.
/// Records with neither id nor full name cannot be matched and are dropped.
pub fn merge_datasets(a: EnrichedDataset, b: EnrichedDataset) -> EnrichedDataset {
    let mut metadata = a.metadata;
    let mut merged: Vec<DatasetRecord> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut unkeyed = 0usize;

    for record in a.repositories.into_iter().chain(b.repositories) {
        let Some(key) = merge_key(&record) else {
            unkeyed += 1;
            continue;
        };
        match index.get(&key) {
            Some(&pos) => {
                let existing = &mut merged[pos];
                let sources: BTreeSet<String> =
                    existing.sources.drain(..).chain(record.sources).collect();
                existing.sources = sources.into_iter().collect();
                if record.readme.len() > existing.readme.len() {
                    existing.readme = record.readme;
                }
            }
            None => {
                index.insert(key, merged.len());
                merged.push(record);
            }
        }
    }

    if unkeyed > 0 {
        warn!(dropped = unkeyed, "records without id or full_name left out of the merge");
    }
    metadata.total_repos = merged.len();
    metadata.merged_from_files = true;
    EnrichedDataset {
        metadata,
        repositories: merged,
    }
}

/// Clean every readme and attach the combined text block.
pub fn clean_dataset(mut dataset: EnrichedDataset, cleaner: &ReadmeCleaner) -> EnrichedDataset {
    for record in &mut dataset.repositories {
        record.readme = cleaner.clean(&record.readme);
        record.combined_text = Some(cleaner.combined_text(record));
    }
    dataset
}

/// One batch per file; snapshots are small enough for a single row group.
fn write_parquet(path: &Path, table: &str, batch: RecordBatch) -> Result<()> {
    let rows = batch.num_rows();
    let file = File::create(path)
        .with_context(|| format!("creating {table} snapshot {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening {table} parquet writer"))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing {rows} {table} rows"))?;
    writer
        .close()
        .with_context(|| format!("finishing {}", path.display()))?;
    debug!(table, rows, path = %path.display(), "parquet table written");
    Ok(())
}

fn write_repositories_parquet(path: &Path, repos: &[&HarvestedRepo]) -> Result<()> {
    let records: Vec<DatasetRecord> = repos.iter().map(|r| format_record(r)).collect();
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("repo_key", DataType::Utf8, false),
        ArrowField::new("language", DataType::Utf8, true),
        ArrowField::new("license", DataType::Utf8, true),
        ArrowField::new("stars", DataType::UInt64, true),
        ArrowField::new("forks", DataType::UInt64, true),
        ArrowField::new("is_gsoc", DataType::Boolean, false),
        ArrowField::new("is_hacktoberfest", DataType::Boolean, false),
        ArrowField::new("is_underrated", DataType::Boolean, false),
        ArrowField::new("has_good_first_issues", DataType::Boolean, false),
        ArrowField::new("enriched", DataType::Boolean, false),
    ]));

    let keys = StringArray::from(repos.iter().map(|r| Some(r.key.as_str())).collect::<Vec<_>>());
    let languages = StringArray::from(records.iter().map(|r| r.language.as_deref()).collect::<Vec<_>>());
    let licenses = StringArray::from(records.iter().map(|r| r.license.as_deref()).collect::<Vec<_>>());
    let stars = UInt64Array::from(records.iter().map(|r| r.stars).collect::<Vec<_>>());
    let forks = UInt64Array::from(records.iter().map(|r| r.forks).collect::<Vec<_>>());
    let gsoc = BooleanArray::from(records.iter().map(|r| r.is_gsoc).collect::<Vec<_>>());
    let hacktoberfest = BooleanArray::from(records.iter().map(|r| r.is_hacktoberfest).collect::<Vec<_>>());
    let underrated = BooleanArray::from(records.iter().map(|r| r.is_underrated).collect::<Vec<_>>());
    let first_issues =
        BooleanArray::from(records.iter().map(|r| r.has_good_first_issues).collect::<Vec<_>>());
    let enriched = BooleanArray::from(repos.iter().map(|r| r.is_enriched()).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(keys),
            Arc::new(languages),
            Arc::new(licenses),
            Arc::new(stars),
            Arc::new(forks),
            Arc::new(gsoc),
            Arc::new(hacktoberfest),
            Arc::new(underrated),
            Arc::new(first_issues),
            Arc::new(enriched),
        ],
    )
    .context("building repositories record batch")?;
    write_parquet(path, "repositories", batch)
}

fn write_sources_parquet(path: &Path, repos: &[&HarvestedRepo]) -> Result<()> {
    let rows = repos
        .iter()
        .flat_map(|r| r.sources.iter().map(move |s| (r.key.as_str(), s.as_str())))
        .collect::<Vec<_>>();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("repo_key", DataType::Utf8, false),
        ArrowField::new("source", DataType::Utf8, false),
    ]));
    let keys = StringArray::from(rows.iter().map(|(k, _)| Some(*k)).collect::<Vec<_>>());
    let sources = StringArray::from(rows.iter().map(|(_, s)| Some(*s)).collect::<Vec<_>>());
    let batch = RecordBatch::try_new(schema, vec![Arc::new(keys), Arc::new(sources)])
        .context("building repository_sources record batch")?;
    write_parquet(path, "repository_sources", batch)
}

fn manifest_entry(name: &str, root: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path.strip_prefix(root).unwrap_or(path).display().to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TaskPlan;
    use gharvest_core::{Checkpoint, EnrichmentRecord, Provenance, RepoKey};
    use gharvest_storage::CheckpointStore;
    use serde_json::json;
    use tempfile::tempdir;

    fn criteria() -> FilteringCriteria {
        FilteringCriteria {
            min_stars: 10,
            min_forks: 3,
            max_fork_star_ratio: 2.0,
            min_description_len: 20,
            requires_license: true,
            requires_description: true,
        }
    }

    fn state(dir: &Path) -> HarvestState {
        let mut state = HarvestState::from_checkpoint(
            CheckpointStore::new(dir.join("checkpoint.json")),
            &TaskPlan::default(),
            Checkpoint::default(),
        );
        state.aggregator_mut().ingest(
            vec![
                json!({"id": 1, "full_name": "o/one", "name": "one", "language": "Go", "stargazers_count": 40}),
                json!({"id": 2, "full_name": "o/two", "name": "two"}),
            ],
            &Provenance::tagged("top_starred").with_facet(Facet::Gsoc),
        );
        let mut record = EnrichmentRecord::empty(Utc::now());
        record.detail = Some(json!({
            "id": 1,
            "full_name": "o/one",
            "name": "one",
            "language": "Go",
            "stargazers_count": 55,
            "license": {"name": "Apache License 2.0"},
        }));
        record.license = Some("Apache License 2.0".into());
        record.languages_breakdown = [("Go".to_string(), 10u64), ("Shell".to_string(), 90)].into();
        record.readme = "# one".into();
        state
            .aggregator_mut()
            .apply_enrichment(&RepoKey::new("o/one"), record);
        state
    }

    #[test]
    fn record_prefers_enrichment_over_search_payload() {
        let dir = tempdir().expect("tempdir");
        let state = state(dir.path());
        let record = format_record(&state.repositories()[&RepoKey::new("o/one")]);
        assert_eq!(record.stars, Some(55));
        assert_eq!(record.license.as_deref(), Some("Apache License 2.0"));
        assert_eq!(record.languages, vec!["Shell", "Go"]);
        assert_eq!(record.readme, "# one");
        assert!(record.is_gsoc);
        assert_eq!(record.sources, vec!["top_starred"]);

        let bare = format_record(&state.repositories()[&RepoKey::new("o/two")]);
        assert_eq!(bare.id, Some(2));
        assert!(bare.readme.is_empty());
        assert!(bare.license.is_none());
    }

    #[tokio::test]
    async fn enriched_dataset_holds_only_enriched_entities() {
        let dir = tempdir().expect("tempdir");
        let state = state(dir.path());
        let exporter = DatasetExporter::new(dir.path().join("out"), false, criteria());

        exporter.write_raw(&state).await.expect("raw");
        exporter.write_enriched(&state).await.expect("enriched");

        let raw: RawDataset = read_json_optional(&exporter.raw_path())
            .await
            .expect("read raw")
            .expect("raw exists");
        assert_eq!(raw.metadata.total_repos, 2);
        assert_eq!(raw.metadata.filtering_criteria, Some(criteria()));

        let enriched = load_enriched_dataset(&exporter.enriched_path())
            .await
            .expect("read enriched");
        assert_eq!(enriched.metadata.total_repos, 1);
        assert!(enriched.metadata.enriched_at.is_some());
        assert_eq!(enriched.repositories[0].full_name.as_deref(), Some("o/one"));
    }

    #[tokio::test]
    async fn snapshot_manifest_hashes_every_file() {
        let dir = tempdir().expect("tempdir");
        let state = state(dir.path());
        let exporter = DatasetExporter::new(dir.path().join("out"), true, criteria());

        let manifest_path = exporter.write_snapshot(&state).await.expect("snapshot");
        let manifest: ParquetManifest =
            serde_json::from_str(&std::fs::read_to_string(&manifest_path).expect("manifest"))
                .expect("parse manifest");
        assert_eq!(manifest.files.len(), 2);
        for file in &manifest.files {
            let bytes = std::fs::read(dir.path().join("out").join(&file.path)).expect("parquet file");
            assert_eq!(file.sha256, sha256_hex(&bytes));
            assert_eq!(file.bytes, bytes.len() as u64);
        }
    }

    fn dataset(records: Vec<DatasetRecord>) -> EnrichedDataset {
        EnrichedDataset {
            metadata: DatasetMetadata {
                total_repos: records.len(),
                token_used: true,
                ..Default::default()
            },
            repositories: records,
        }
    }

    #[test]
    fn merge_unions_sources_and_keeps_the_longer_readme() {
        let a = dataset(vec![
            DatasetRecord {
                id: Some(7),
                sources: vec!["gsoc".into()],
                readme: String::new(),
                ..Default::default()
            },
            DatasetRecord {
                id: Some(8),
                readme: "long enough readme".into(),
                ..Default::default()
            },
        ]);
        let b = dataset(vec![
            DatasetRecord {
                id: Some(7),
                sources: vec!["language_Go".into(), "gsoc".into()],
                readme: "from b".into(),
                ..Default::default()
            },
            DatasetRecord {
                id: Some(8),
                readme: "short".into(),
                ..Default::default()
            },
            DatasetRecord {
                id: Some(9),
                ..Default::default()
            },
            DatasetRecord {
                name: Some("no identity".into()),
                readme: "orphaned readme".into(),
                ..Default::default()
            },
        ]);

        let merged = merge_datasets(a, b);
        assert_eq!(merged.metadata.total_repos, 3);
        assert_eq!(merged.repositories.len(), 3);
        assert!(merged.repositories.iter().all(|r| r.id.is_some()));
        assert!(merged.metadata.merged_from_files);
        assert!(merged.metadata.token_used);
        assert_eq!(merged.repositories[0].sources, vec!["gsoc", "language_Go"]);
        assert_eq!(merged.repositories[0].readme, "from b");
        assert_eq!(merged.repositories[1].readme, "long enough readme");
    }

    #[test]
    fn cleaning_a_dataset_attaches_combined_text() {
        let cleaned = clean_dataset(
            dataset(vec![DatasetRecord {
                name: Some("tool".into()),
                readme: "## License\n\nMIT".into(),
                ..Default::default()
            }]),
            &ReadmeCleaner::default(),
        );
        let record = &cleaned.repositories[0];
        assert_eq!(record.readme, "");
        assert_eq!(record.combined_text.as_deref(), Some("Repository: tool"));
    }
}

//! Second phase: per-repository detail, language and readme fetches.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, StreamExt};
use gharvest_adapters::{ReadmeCleaner, ReadmeDocument, RepoService, ServiceError};
use gharvest_core::{json_str, json_string_vec, EnrichmentRecord, RepoKey, SubFetch};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::export::DatasetExporter;
use crate::quota::{Capacity, QuotaGate};
use crate::state::HarvestState;

/// Calls one entity needs: detail, languages, readme.
const CALLS_PER_ENTITY: u32 = SubFetch::ALL.len() as u32;

#[derive(Debug, Clone, PartialEq)]
pub enum EnrichOutcome {
    Enriched(EnrichmentRecord),
    /// Every sub-fetch failed without a quota signal; retried next run.
    Failed { reason: String },
    /// Every sub-fetch was refused for quota; the run must stop.
    QuotaExhausted { reset_at: Option<DateTime<Utc>> },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EnrichmentSummary {
    pub enriched: usize,
    pub partial: usize,
    pub failed: usize,
    pub batches: usize,
    pub remaining: usize,
    pub stopped_for_quota: bool,
    pub reset_at: Option<DateTime<Utc>>,
}

enum SubResult<T> {
    Got(T),
    Missing,
    Quota(Option<DateTime<Utc>>),
    Failed(String),
}

impl<T> SubResult<T> {
    fn from_call(endpoint: SubFetch, key: &RepoKey, result: Result<T, ServiceError>) -> Self {
        match result {
            Ok(value) => SubResult::Got(value),
            Err(ServiceError::NotFound(_)) => SubResult::Missing,
            Err(ServiceError::QuotaExhausted { reset_at }) => SubResult::Quota(reset_at),
            Err(err) => {
                warn!(repo = %key, ?endpoint, error = %err, "sub-fetch failed");
                SubResult::Failed(err.to_string())
            }
        }
    }

    fn value(self) -> Option<T> {
        match self {
            SubResult::Got(value) => Some(value),
            _ => None,
        }
    }
}

/// Fans the sub-fetches of each entity out concurrently and bounds how many
/// entities are in flight.
pub struct EnrichmentScheduler {
    service: Arc<dyn RepoService>,
    cleaner: Option<ReadmeCleaner>,
    concurrency: usize,
}

impl EnrichmentScheduler {
    pub fn new(service: Arc<dyn RepoService>) -> Self {
        Self {
            service,
            cleaner: None,
            concurrency: 10,
        }
    }

    pub fn with_cleaner(mut self, cleaner: Option<ReadmeCleaner>) -> Self {
        self.cleaner = cleaner;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub async fn enrich_one(&self, key: &RepoKey) -> EnrichOutcome {
        let (detail, languages, readme) = tokio::join!(
            self.service.repo_detail(key),
            self.service.repo_languages(key),
            self.service.repo_readme(key),
        );
        let detail = SubResult::from_call(SubFetch::Detail, key, detail);
        let languages = SubResult::from_call(SubFetch::Languages, key, languages);
        let readme = SubResult::from_call(SubFetch::Readme, key, readme);

        let mut quota_hits = 0;
        let mut reset_at = None;
        let mut failures = Vec::new();
        for (endpoint, state) in [
            (SubFetch::Detail, sub_state(&detail)),
            (SubFetch::Languages, sub_state(&languages)),
            (SubFetch::Readme, sub_state(&readme)),
        ] {
            match state {
                SubState::Quota(at) => {
                    quota_hits += 1;
                    reset_at = reset_at.or(at);
                }
                SubState::Failed(reason) => failures.push(format!("{endpoint:?}: {reason}")),
                SubState::Answered => {}
            }
        }

        if quota_hits == SubFetch::ALL.len() {
            return EnrichOutcome::QuotaExhausted { reset_at };
        }
        if quota_hits + failures.len() == SubFetch::ALL.len() && !failures.is_empty() {
            return EnrichOutcome::Failed {
                reason: failures.join("; "),
            };
        }

        let mut record = EnrichmentRecord::empty(Utc::now());
        if !matches!(detail, SubResult::Got(_)) {
            record.absent.insert(SubFetch::Detail);
        }
        if !matches!(languages, SubResult::Got(_)) {
            record.absent.insert(SubFetch::Languages);
        }
        let readme_found = matches!(&readme, SubResult::Got(doc) if doc.content.is_some());
        if !readme_found {
            record.absent.insert(SubFetch::Readme);
        }

        if let Some(detail) = detail.value() {
            apply_detail(&mut record, detail);
        }
        record.languages_breakdown = languages.value().unwrap_or_default();
        if let Some(doc) = readme.value() {
            self.apply_readme(&mut record, doc);
        }
        EnrichOutcome::Enriched(record)
    }

    /// Enrich `keys`, yielding each result as soon as it completes.
    pub fn enrich(&self, keys: Vec<RepoKey>) -> impl Stream<Item = (RepoKey, EnrichOutcome)> + '_ {
        stream::iter(keys)
            .map(move |key| async move {
                let outcome = self.enrich_one(&key).await;
                (key, outcome)
            })
            .buffer_unordered(self.concurrency)
    }

    /// Enrich every pending entity of `state` in batches, persisting the
    /// checkpoint and the enriched dataset after each batch.
    pub async fn run(
        &self,
        state: &mut HarvestState,
        gate: &QuotaGate,
        exporter: &DatasetExporter,
        batch_size: usize,
        limit: Option<usize>,
    ) -> Result<EnrichmentSummary> {
        let mut pending = state.aggregator().pending_enrichment();
        if let Some(limit) = limit {
            pending.truncate(limit);
        }
        let mut summary = EnrichmentSummary::default();
        info!(
            pending = pending.len(),
            already_enriched = state.aggregator().len() - state.aggregator().pending_enrichment().len(),
            "enrichment starting"
        );

        for batch in pending.chunks(batch_size.max(1)) {
            if gate.ensure_capacity(CALLS_PER_ENTITY).await == Capacity::Stop {
                summary.stopped_for_quota = true;
                summary.reset_at = gate.reset_at();
                state.persist().await?;
                warn!(reset_at = ?summary.reset_at, "rate limit too low to start the next batch");
                break;
            }

            let mut stop = None;
            {
                let mut results = Box::pin(self.enrich(batch.to_vec()));
                while let Some((key, outcome)) = results.next().await {
                    match outcome {
                        EnrichOutcome::Enriched(record) => {
                            if record.is_partial() {
                                summary.partial += 1;
                            }
                            summary.enriched += 1;
                            state.aggregator_mut().apply_enrichment(&key, record);
                        }
                        EnrichOutcome::Failed { reason } => {
                            warn!(repo = %key, %reason, "enrichment failed; will retry next run");
                            summary.failed += 1;
                        }
                        EnrichOutcome::QuotaExhausted { reset_at } => {
                            stop = Some(reset_at);
                            break;
                        }
                    }
                }
            }

            summary.batches += 1;
            state.persist().await?;
            exporter.write_enriched(state).await?;
            debug!(batch = summary.batches, enriched = summary.enriched, "batch persisted");

            if let Some(reset_at) = stop {
                gate.mark_exhausted(reset_at);
                summary.stopped_for_quota = true;
                summary.reset_at = gate.reset_at();
                warn!(reset_at = ?summary.reset_at, "rate limit exhausted during enrichment");
                break;
            }
        }

        summary.remaining = state.aggregator().pending_enrichment().len();
        info!(
            enriched = summary.enriched,
            partial = summary.partial,
            failed = summary.failed,
            remaining = summary.remaining,
            "enrichment pass finished"
        );
        Ok(summary)
    }

    fn apply_readme(&self, record: &mut EnrichmentRecord, doc: ReadmeDocument) {
        record.readme_name = doc.name;
        record.readme_url = doc.download_url;
        let content = doc.content.unwrap_or_default();
        record.readme = match &self.cleaner {
            Some(cleaner) => cleaner.clean(&content),
            None => content,
        };
    }
}

enum SubState {
    Answered,
    Quota(Option<DateTime<Utc>>),
    Failed(String),
}

fn sub_state<T>(result: &SubResult<T>) -> SubState {
    match result {
        SubResult::Got(_) | SubResult::Missing => SubState::Answered,
        SubResult::Quota(at) => SubState::Quota(*at),
        SubResult::Failed(reason) => SubState::Failed(reason.clone()),
    }
}

fn apply_detail(record: &mut EnrichmentRecord, detail: JsonValue) {
    record.license = json_str(&detail, &["license", "name"]).map(ToString::to_string);
    record.primary_language = json_str(&detail, &["language"]).map(ToString::to_string);
    record.topics = json_string_vec(&detail, &["topics"]);
    record.detail = Some(detail);
}

/// Language names ordered by byte count, largest first.
pub fn ranked_languages(breakdown: &BTreeMap<String, u64>) -> Vec<String> {
    let mut langs: Vec<(&String, &u64)> = breakdown.iter().collect();
    langs.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    langs.into_iter().map(|(name, _)| name.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gharvest_adapters::{FaultKind, FixtureBundle, FixtureFault, FixtureService};
    use serde_json::json;

    fn bundle() -> FixtureBundle {
        let mut bundle = FixtureBundle {
            fixture_id: "enrich".into(),
            ..Default::default()
        };
        for name in ["o/a", "o/b", "o/c"] {
            bundle.details.insert(
                name.into(),
                json!({
                    "full_name": name,
                    "language": "Rust",
                    "license": {"name": "MIT License"},
                    "topics": ["cli"],
                }),
            );
            bundle
                .languages
                .insert(name.into(), [("Rust".to_string(), 900u64), ("C".to_string(), 50)].into());
            bundle
                .readmes
                .insert(name.into(), format!("# {name}\n\nA command line tool."));
        }
        bundle
    }

    fn scheduler(service: FixtureService) -> EnrichmentScheduler {
        EnrichmentScheduler::new(Arc::new(service))
    }

    #[tokio::test]
    async fn all_sub_fetches_populate_the_record() {
        let outcome = scheduler(FixtureService::new(bundle()))
            .enrich_one(&RepoKey::new("o/a"))
            .await;
        let EnrichOutcome::Enriched(record) = outcome else {
            panic!("expected enrichment, got {outcome:?}");
        };
        assert!(!record.is_partial());
        assert_eq!(record.license.as_deref(), Some("MIT License"));
        assert_eq!(record.primary_language.as_deref(), Some("Rust"));
        assert_eq!(record.topics, vec!["cli"]);
        assert_eq!(record.readme, "# o/a\n\nA command line tool.");
        assert_eq!(ranked_languages(&record.languages_breakdown), vec!["Rust", "C"]);
    }

    #[tokio::test]
    async fn quota_on_readme_alone_leaves_a_partial_record() {
        let service = FixtureService::new(bundle()).with_fault(FixtureFault::SubFetch {
            repo: "o/a".into(),
            endpoint: SubFetch::Readme,
            kind: FaultKind::QuotaExhausted,
        });
        let outcome = scheduler(service).enrich_one(&RepoKey::new("o/a")).await;
        let EnrichOutcome::Enriched(record) = outcome else {
            panic!("expected partial enrichment, got {outcome:?}");
        };
        assert!(record.detail.is_some());
        assert_eq!(record.license.as_deref(), Some("MIT License"));
        assert!(record.readme.is_empty());
        assert!(record.absent.contains(&SubFetch::Readme));
    }

    #[tokio::test]
    async fn quota_on_every_sub_fetch_stops() {
        let mut service = FixtureService::new(bundle());
        for endpoint in SubFetch::ALL {
            service = service.with_fault(FixtureFault::SubFetch {
                repo: "o/b".into(),
                endpoint,
                kind: FaultKind::QuotaExhausted,
            });
        }
        let outcome = scheduler(service).enrich_one(&RepoKey::new("o/b")).await;
        assert!(matches!(outcome, EnrichOutcome::QuotaExhausted { .. }));
    }

    #[tokio::test]
    async fn transient_failures_everywhere_mark_the_entity_failed() {
        let mut service = FixtureService::new(bundle());
        for endpoint in SubFetch::ALL {
            service = service.with_fault(FixtureFault::SubFetch {
                repo: "o/c".into(),
                endpoint,
                kind: FaultKind::Transient,
            });
        }
        let outcome = scheduler(service).enrich_one(&RepoKey::new("o/c")).await;
        assert!(matches!(outcome, EnrichOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn missing_endpoints_still_count_as_enriched() {
        let outcome = scheduler(FixtureService::new(bundle()))
            .enrich_one(&RepoKey::new("o/unknown"))
            .await;
        let EnrichOutcome::Enriched(record) = outcome else {
            panic!("expected enrichment, got {outcome:?}");
        };
        assert!(record.detail.is_none());
        assert!(record.absent.contains(&SubFetch::Detail));
        assert!(record.absent.contains(&SubFetch::Readme));
    }

    #[tokio::test]
    async fn stream_yields_every_key_once() {
        let sched = scheduler(FixtureService::new(bundle())).with_concurrency(2);
        let keys = vec![RepoKey::new("o/a"), RepoKey::new("o/b"), RepoKey::new("o/c")];
        let mut seen: Vec<RepoKey> = sched.enrich(keys.clone()).map(|(k, _)| k).collect().await;
        seen.sort();
        assert_eq!(seen, keys);
    }

    #[tokio::test]
    async fn run_skips_enriched_entities_and_stops_on_exhaustion() {
        use crate::registry::TaskPlan;
        use gharvest_core::{Checkpoint, FilteringCriteria, Provenance};
        use gharvest_storage::CheckpointStore;

        let dir = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(dir.path().join("checkpoint.json"));
        let mut state =
            HarvestState::from_checkpoint(store.clone(), &TaskPlan::default(), Checkpoint::default());
        state.aggregator_mut().ingest(
            vec![
                json!({"full_name": "o/a"}),
                json!({"full_name": "o/b"}),
                json!({"full_name": "o/c"}),
            ],
            &Provenance::tagged("top_starred"),
        );
        state
            .aggregator_mut()
            .apply_enrichment(&RepoKey::new("o/a"), EnrichmentRecord::empty(Utc::now()));

        let mut service = FixtureService::new(bundle());
        for endpoint in SubFetch::ALL {
            service = service.with_fault(FixtureFault::SubFetch {
                repo: "o/c".into(),
                endpoint,
                kind: FaultKind::QuotaExhausted,
            });
        }
        let service = Arc::new(service);
        let gate = QuotaGate::new(service.clone());
        let exporter = DatasetExporter::new(
            dir.path().join("out"),
            false,
            FilteringCriteria {
                min_stars: 10,
                min_forks: 3,
                max_fork_star_ratio: 2.0,
                min_description_len: 20,
                requires_license: true,
                requires_description: true,
            },
        );

        let summary = EnrichmentScheduler::new(service.clone())
            .with_concurrency(1)
            .run(&mut state, &gate, &exporter, 1, None)
            .await
            .expect("run");

        assert!(summary.stopped_for_quota);
        assert_eq!(summary.enriched, 1);
        assert_eq!(summary.remaining, 1);
        assert_eq!(gate.remaining(), 0);
        assert!(!service.calls().iter().any(|call| matches!(
            call,
            gharvest_adapters::FixtureCall::SubFetch { repo, .. } if repo == "o/a"
        )));

        let saved = store.load().await.expect("checkpoint");
        assert_eq!(saved.enriched_count(), 2);
        assert!(!saved.repositories[&RepoKey::new("o/c")].is_enriched());
    }

    #[tokio::test]
    async fn cleaner_is_applied_when_wired_in() {
        let mut b = bundle();
        b.readmes.insert(
            "o/a".into(),
            "# tool\n\n## License\n\nMIT licensed for everyone who ever wanted a tool like this one.\n".into(),
        );
        let sched = scheduler(FixtureService::new(b)).with_cleaner(Some(ReadmeCleaner::default()));
        let EnrichOutcome::Enriched(record) = sched.enrich_one(&RepoKey::new("o/a")).await else {
            panic!("expected enrichment");
        };
        assert_eq!(record.readme, "");
    }

    #[tokio::test]
    async fn stop_before_the_first_batch_still_writes_the_checkpoint() {
        use crate::registry::TaskPlan;
        use gharvest_core::{Checkpoint, FilteringCriteria, Provenance};
        use gharvest_storage::CheckpointStore;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("checkpoint.json");
        let store = CheckpointStore::new(&path);
        let mut state =
            HarvestState::from_checkpoint(store.clone(), &TaskPlan::default(), Checkpoint::default());
        state
            .aggregator_mut()
            .ingest(vec![json!({"full_name": "o/a"})], &Provenance::tagged("top_starred"));

        let service = Arc::new(FixtureService::new(bundle()).with_quota(2));
        let gate = QuotaGate::new(service.clone());
        let exporter = DatasetExporter::new(
            dir.path().join("out"),
            false,
            FilteringCriteria {
                min_stars: 10,
                min_forks: 3,
                max_fork_star_ratio: 2.0,
                min_description_len: 20,
                requires_license: true,
                requires_description: true,
            },
        );
        assert!(!path.exists());

        let summary = EnrichmentScheduler::new(service.clone())
            .run(&mut state, &gate, &exporter, 10, None)
            .await
            .expect("run");

        assert!(summary.stopped_for_quota);
        assert_eq!(summary.batches, 0);
        assert_eq!(summary.remaining, 1);
        assert!(!service
            .calls()
            .iter()
            .any(|call| matches!(call, gharvest_adapters::FixtureCall::SubFetch { .. })));
        let saved = store.load().await.expect("checkpoint");
        assert_eq!(saved.repositories.len(), 1);
    }
}

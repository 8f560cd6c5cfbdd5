//! Deduplicating entity map keyed by repository identity.

use std::cmp::Ordering;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use gharvest_core::{json_str, EnrichmentRecord, Facet, HarvestedRepo, Provenance, RepoKey};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub inserted: usize,
    pub merged: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregateStats {
    pub total: usize,
    pub enriched: usize,
    pub partially_enriched: usize,
    pub facets: BTreeMap<&'static str, usize>,
}

/// Single-owner entity map. Merges are unions, so the final map does not
/// depend on the order tasks were ingested in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregator {
    repositories: BTreeMap<RepoKey, HarvestedRepo>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(repositories: BTreeMap<RepoKey, HarvestedRepo>) -> Self {
        Self { repositories }
    }

    pub fn len(&self) -> usize {
        self.repositories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repositories.is_empty()
    }

    pub fn get(&self, key: &RepoKey) -> Option<&HarvestedRepo> {
        self.repositories.get(key)
    }

    pub fn repositories(&self) -> &BTreeMap<RepoKey, HarvestedRepo> {
        &self.repositories
    }

    pub fn into_map(self) -> BTreeMap<RepoKey, HarvestedRepo> {
        self.repositories
    }

    pub fn ingest(&mut self, items: Vec<JsonValue>, provenance: &Provenance) -> IngestStats {
        let mut stats = IngestStats::default();
        for item in items {
            let Some(key) = RepoKey::from_item(&item) else {
                stats.skipped += 1;
                continue;
            };
            let facet = provenance.facet.filter(|f| f.applies_to(&item));

            let repo = match self.repositories.entry(key) {
                Entry::Occupied(slot) => {
                    stats.merged += 1;
                    let existing = slot.into_mut();
                    if payload_cmp(&item, &existing.raw) == Ordering::Greater {
                        existing.raw = item;
                    }
                    existing
                }
                Entry::Vacant(slot) => {
                    stats.inserted += 1;
                    let key = slot.key().clone();
                    slot.insert(HarvestedRepo::new(key, item))
                }
            };

            repo.sources.insert(provenance.tag.clone());
            repo.facets.extend(facet);
            repo.topics.extend(provenance.topics.iter().cloned());
            repo.languages.extend(provenance.languages.iter().cloned());
        }
        debug!(
            tag = %provenance.tag,
            inserted = stats.inserted,
            merged = stats.merged,
            skipped = stats.skipped,
            "ingested task results"
        );
        stats
    }

    /// Attach an enrichment record. Returns false for unknown keys.
    pub fn apply_enrichment(&mut self, key: &RepoKey, record: EnrichmentRecord) -> bool {
        match self.repositories.get_mut(key) {
            Some(repo) => {
                repo.enrichment = Some(record);
                true
            }
            None => false,
        }
    }

    /// Keys still lacking an enrichment record, in key order.
    pub fn pending_enrichment(&self) -> Vec<RepoKey> {
        self.repositories
            .values()
            .filter(|r| !r.is_enriched())
            .map(|r| r.key.clone())
            .collect()
    }

    pub fn stats(&self) -> AggregateStats {
        let mut stats = AggregateStats {
            total: self.repositories.len(),
            ..Default::default()
        };
        for facet in Facet::ALL {
            stats.facets.insert(facet.as_str(), 0);
        }
        for repo in self.repositories.values() {
            if let Some(record) = &repo.enrichment {
                stats.enriched += 1;
                if record.is_partial() {
                    stats.partially_enriched += 1;
                }
            }
            for facet in &repo.facets {
                *stats.facets.entry(facet.as_str()).or_default() += 1;
            }
        }
        stats
    }
}

/// Total order on payloads used to pick the one kept on collision: more
/// populated top-level fields first, then the later `updated_at`, then the
/// canonical serialization as a final tiebreak.
fn payload_cmp(a: &JsonValue, b: &JsonValue) -> Ordering {
    populated_fields(a)
        .cmp(&populated_fields(b))
        .then_with(|| json_str(a, &["updated_at"]).cmp(&json_str(b, &["updated_at"])))
        .then_with(|| a.to_string().cmp(&b.to_string()))
}

fn populated_fields(value: &JsonValue) -> usize {
    value
        .as_object()
        .map(|obj| obj.values().filter(|v| !v.is_null()).count())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::collection::vec;
    use proptest::prelude::*;
    use serde_json::json;

    fn provenance(tag: &str, facet: Option<Facet>) -> Provenance {
        Provenance {
            tag: tag.into(),
            facet,
            ..Default::default()
        }
    }

    #[test]
    fn later_ingestion_unions_tags_and_facets() {
        let mut agg = Aggregator::new();
        agg.ingest(vec![json!({"id": 1})], &provenance("A", None));
        agg.ingest(
            vec![json!({"id": 1, "stargazers_count": 300, "forks_count": 40})],
            &provenance("B", Some(Facet::Underrated)),
        );

        assert_eq!(agg.len(), 1);
        let repo = agg.get(&RepoKey::new("id:1")).unwrap();
        assert_eq!(
            repo.sources.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["A", "B"]
        );
        assert!(repo.has_facet(Facet::Underrated));
        assert_eq!(repo.raw["forks_count"], 40);
    }

    #[test]
    fn narrower_task_never_clears_an_earlier_facet() {
        let mut agg = Aggregator::new();
        let item = json!({"full_name": "org/tool", "stargazers_count": 300, "forks_count": 40});
        agg.ingest(vec![item.clone()], &provenance("gsoc", Some(Facet::Gsoc)));
        agg.ingest(vec![item], &provenance("language_Rust", None));
        let repo = agg.get(&RepoKey::new("org/tool")).unwrap();
        assert!(repo.has_facet(Facet::Gsoc));
        assert_eq!(repo.sources.len(), 2);
    }

    #[test]
    fn underrated_is_only_set_when_the_item_qualifies() {
        let mut agg = Aggregator::new();
        agg.ingest(
            vec![json!({"full_name": "big/star", "stargazers_count": 9000, "forks_count": 900})],
            &provenance("underrated", Some(Facet::Underrated)),
        );
        let repo = agg.get(&RepoKey::new("big/star")).unwrap();
        assert!(!repo.has_facet(Facet::Underrated));
        assert!(repo.sources.contains("underrated"));
    }

    #[test]
    fn topic_and_language_lists_accumulate() {
        let mut agg = Aggregator::new();
        let item = json!({"full_name": "org/tool"});
        let mut topic = provenance("topic_devops", None);
        topic.topics = vec!["devops".into()];
        let mut lang = provenance("language_Go", None);
        lang.languages = vec!["Go".into()];
        agg.ingest(vec![item.clone()], &topic);
        agg.ingest(vec![item.clone()], &lang);
        agg.ingest(vec![item, json!({"name": "no-owner"})], &topic);

        let repo = agg.get(&RepoKey::new("org/tool")).unwrap();
        assert!(repo.topics.contains("devops"));
        assert!(repo.languages.contains("Go"));
        assert_eq!(agg.len(), 1);
    }

    #[test]
    fn enrichment_marks_entities_done() {
        let mut agg = Aggregator::new();
        agg.ingest(
            vec![json!({"full_name": "a/one"}), json!({"full_name": "a/two"})],
            &provenance("top_starred", None),
        );
        assert_eq!(agg.pending_enrichment().len(), 2);
        let record = EnrichmentRecord::empty(chrono::Utc::now());
        assert!(agg.apply_enrichment(&RepoKey::new("a/one"), record.clone()));
        assert!(!agg.apply_enrichment(&RepoKey::new("a/missing"), record));
        assert_eq!(agg.pending_enrichment(), vec![RepoKey::new("a/two")]);
        assert_eq!(agg.stats().enriched, 1);
    }

    fn item_strategy() -> impl Strategy<Value = JsonValue> {
        (
            0u64..6,
            0u64..3000,
            0u64..60,
            0u64..120,
            proptest::option::of("[a-z]{1,8}"),
        )
            .prop_map(|(id, stars, forks, watchers, description)| {
                let mut item = json!({
                    "id": id,
                    "full_name": format!("org/r{id}"),
                    "stargazers_count": stars,
                    "forks_count": forks,
                    "watchers_count": watchers,
                });
                if let Some(description) = description {
                    item["description"] = json!(description);
                }
                item
            })
    }

    fn task_strategy() -> impl Strategy<Value = (Vec<JsonValue>, Provenance)> {
        (
            vec(item_strategy(), 0..6),
            "[a-z]{1,6}",
            proptest::option::of(proptest::sample::select(Facet::ALL.to_vec())),
            vec("[a-z]{1,5}", 0..3),
            vec("[A-Z][a-z]{1,5}", 0..2),
        )
            .prop_map(|(items, tag, facet, topics, languages)| {
                (
                    items,
                    Provenance {
                        tag,
                        facet,
                        topics,
                        languages,
                    },
                )
            })
    }

    fn ingest_all(tasks: Vec<(Vec<JsonValue>, Provenance)>) -> Aggregator {
        let mut agg = Aggregator::new();
        for (items, provenance) in tasks {
            agg.ingest(items, &provenance);
        }
        agg
    }

    proptest! {
        #[test]
        fn ingestion_order_does_not_change_the_result(
            (tasks, shuffled) in vec(task_strategy(), 1..6)
                .prop_flat_map(|tasks| (Just(tasks.clone()), Just(tasks).prop_shuffle()))
        ) {
            prop_assert_eq!(ingest_all(tasks), ingest_all(shuffled));
        }
    }
}

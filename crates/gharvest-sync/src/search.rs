//! Paginated query execution and per-strategy orchestration.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use gharvest_adapters::{
    CoarseFilter, ItemValidator, RepoService, SearchRequest, ServiceError, SortOrder, Verdict,
    MAX_PAGE_SIZE, MAX_SEARCH_PAGES,
};
use gharvest_core::RepoKey;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::quota::{Capacity, QuotaGate};

/// Pages fetched concurrently within one batch.
pub const PAGE_BATCH_WIDTH: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub enum PageResult {
    Ok {
        items: Vec<JsonValue>,
        filtered_out: u64,
        total_count: u64,
    },
    QuotaExhausted {
        reset_at: Option<DateTime<Utc>>,
    },
    TransientError {
        detail: String,
    },
}

/// Fetches single pages and applies the per-item validator.
pub struct QueryExecutor {
    service: Arc<dyn RepoService>,
    validator: ItemValidator,
}

impl QueryExecutor {
    pub fn new(service: Arc<dyn RepoService>, validator: ItemValidator) -> Self {
        Self { service, validator }
    }

    pub async fn fetch_page(
        &self,
        query: &str,
        page: u32,
        per_page: u32,
        sort: SortOrder,
    ) -> PageResult {
        let request = SearchRequest {
            query: query.to_string(),
            sort,
            page,
            per_page: per_page.clamp(1, MAX_PAGE_SIZE),
        };
        match self.service.search(&request).await {
            Ok(found) => {
                let mut filtered_out = 0u64;
                let mut items = Vec::with_capacity(found.items.len());
                for item in found.items {
                    let identified = RepoKey::from_item(&item).is_some();
                    match self.validator.validate(&item) {
                        Verdict::Legitimate if identified => items.push(item),
                        Verdict::Legitimate => {
                            debug!(page, "dropping item without identity");
                            filtered_out += 1;
                        }
                        Verdict::Rejected(reason) => {
                            debug!(page, %reason, "item rejected");
                            filtered_out += 1;
                        }
                    }
                }
                PageResult::Ok {
                    items,
                    filtered_out,
                    total_count: found.total_count,
                }
            }
            Err(ServiceError::QuotaExhausted { reset_at }) => PageResult::QuotaExhausted { reset_at },
            Err(err) => PageResult::TransientError {
                detail: err.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryResult {
    pub items: Vec<JsonValue>,
    pub filtered_out: u64,
    pub pages_fetched: u32,
    pub failed_pages: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Completed(QueryResult),
    QuotaExhausted { reset_at: Option<DateTime<Utc>> },
}

/// Number of pages needed for `target_count` items, within the protocol ceiling.
pub fn pages_for(target_count: usize, per_page: u32) -> u32 {
    let per_page = per_page.clamp(1, MAX_PAGE_SIZE) as usize;
    let pages = target_count.div_ceil(per_page);
    pages.min(MAX_SEARCH_PAGES as usize) as u32
}

/// Drives one query to completion in concurrent page batches.
pub struct SearchOrchestrator {
    executor: QueryExecutor,
    coarse: CoarseFilter,
    batch_width: usize,
    per_page: u32,
}

impl SearchOrchestrator {
    pub fn new(executor: QueryExecutor, coarse: CoarseFilter) -> Self {
        Self {
            executor,
            coarse,
            batch_width: PAGE_BATCH_WIDTH,
            per_page: MAX_PAGE_SIZE,
        }
    }

    pub fn with_batch_width(mut self, width: usize) -> Self {
        self.batch_width = width.max(1);
        self
    }

    pub fn with_page_size(mut self, per_page: u32) -> Self {
        self.per_page = per_page.clamp(1, MAX_PAGE_SIZE);
        self
    }

    /// Collect up to `target_count` validated items for `base_query`.
    ///
    /// Items come back in page order then remote order. Any exhausted page
    /// discards everything fetched so far for this query.
    pub async fn run_query(
        &self,
        gate: &QuotaGate,
        base_query: &str,
        target_count: usize,
        sort: SortOrder,
    ) -> QueryOutcome {
        let query = self.coarse.build_query(base_query);
        let last_page = pages_for(target_count, self.per_page);
        info!(query = %query, target_count, pages = last_page, "searching");

        let mut result = QueryResult::default();
        let mut next_page = 1u32;

        'batches: while next_page <= last_page && result.items.len() < target_count {
            let batch_end = (next_page + self.batch_width as u32 - 1).min(last_page);
            let width = batch_end - next_page + 1;

            if gate.ensure_capacity(width).await == Capacity::Stop {
                warn!(
                    query = %query,
                    collected = result.items.len(),
                    "rate limit reached mid-query"
                );
                return QueryOutcome::QuotaExhausted {
                    reset_at: gate.reset_at(),
                };
            }

            let mut in_flight = Box::pin(
                stream::iter(next_page..=batch_end)
                    .map(|page| {
                        let query = query.as_str();
                        async move {
                            let outcome = self
                                .executor
                                .fetch_page(query, page, self.per_page, sort)
                                .await;
                            (page, outcome)
                        }
                    })
                    .buffer_unordered(width as usize),
            );

            let mut pages = Vec::with_capacity(width as usize);
            while let Some((page, outcome)) = in_flight.next().await {
                match outcome {
                    PageResult::Ok {
                        items,
                        filtered_out,
                        ..
                    } => pages.push((page, items, filtered_out)),
                    PageResult::QuotaExhausted { reset_at } => {
                        // dropping the stream cancels the rest of the batch
                        drop(in_flight);
                        gate.mark_exhausted(reset_at);
                        warn!(query = %query, page, "rate limit exceeded");
                        return QueryOutcome::QuotaExhausted {
                            reset_at: gate.reset_at(),
                        };
                    }
                    PageResult::TransientError { detail } => {
                        warn!(query = %query, page, error = %detail, "page failed; skipping");
                        result.failed_pages += 1;
                    }
                }
            }

            pages.sort_by_key(|(page, _, _)| *page);
            for (page, items, filtered_out) in pages {
                result.pages_fetched += 1;
                result.filtered_out += filtered_out;
                if items.is_empty() && filtered_out == 0 {
                    debug!(query = %query, page, "no more results");
                    break 'batches;
                }
                result.items.extend(items);
            }
            next_page = batch_end + 1;
        }

        result.items.truncate(target_count);
        info!(
            query = %query,
            collected = result.items.len(),
            filtered_out = result.filtered_out,
            "search complete"
        );
        QueryOutcome::Completed(result)
    }
}

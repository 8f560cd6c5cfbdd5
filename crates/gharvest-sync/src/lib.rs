//! Resumable harvest pipeline: collection tasks, then enrichment, then export.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use gharvest_adapters::{
    CoarseFilter, FixtureService, GithubConfig, GithubService, ItemValidator, QuotaResource,
    ReadmeCleaner, RepoService, ValidationConfig,
};
use gharvest_core::Phase;
use gharvest_storage::CheckpointStore;
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod aggregate;
pub mod enrich;
pub mod export;
pub mod quota;
pub mod registry;
pub mod search;
pub mod state;

pub use aggregate::{AggregateStats, Aggregator, IngestStats};
pub use enrich::{EnrichOutcome, EnrichmentScheduler, EnrichmentSummary};
pub use export::{clean_dataset, format_record, load_enriched_dataset, merge_datasets, DatasetExporter};
pub use quota::{Capacity, QuotaGate, Refresh};
pub use registry::{PhaseError, TaskPlan, TaskRegistry, TaskSpec};
pub use search::{PageResult, QueryExecutor, QueryOutcome, QueryResult, SearchOrchestrator};
pub use state::HarvestState;

pub const CRATE_NAME: &str = "gharvest-sync";

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub token: Option<String>,
    pub api_base: String,
    pub state_path: PathBuf,
    pub output_dir: PathBuf,
    pub plan_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub enrich_batch: usize,
    pub enrich_concurrency: usize,
    pub clean_readmes: bool,
    pub validation: ValidationConfig,
    pub coarse: CoarseFilter,
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        Self {
            token: std::env::var("GITHUB_TOKEN").ok().filter(|t| !t.trim().is_empty()),
            api_base: std::env::var("GHARVEST_API_BASE")
                .unwrap_or_else(|_| "https://api.github.com".to_string()),
            state_path: std::env::var("GHARVEST_STATE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./state/checkpoint.json")),
            output_dir: std::env::var("GHARVEST_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./output")),
            plan_path: std::env::var("GHARVEST_PLAN_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./plan.yaml")),
            user_agent: std::env::var("GHARVEST_USER_AGENT")
                .unwrap_or_else(|_| "gharvest/0.1".to_string()),
            http_timeout_secs: std::env::var("GHARVEST_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            enrich_batch: std::env::var("GHARVEST_ENRICH_BATCH")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            enrich_concurrency: std::env::var("GHARVEST_ENRICH_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            clean_readmes: std::env::var("GHARVEST_CLEAN_READMES")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            validation: ValidationConfig::default(),
            coarse: CoarseFilter::default(),
        }
    }

    /// Config rooted in `dir`, without reading the environment.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            token: None,
            api_base: "https://api.github.com".to_string(),
            state_path: dir.join("state").join("checkpoint.json"),
            output_dir: dir.join("output"),
            plan_path: dir.join("plan.yaml"),
            user_agent: "gharvest/0.1".to_string(),
            http_timeout_secs: 30,
            enrich_batch: 10,
            enrich_concurrency: 10,
            clean_readmes: false,
            validation: ValidationConfig::default(),
            coarse: CoarseFilter::default(),
        }
    }

    pub fn github_config(&self) -> GithubConfig {
        GithubConfig {
            api_base: self.api_base.clone(),
            token: self.token.clone(),
            user_agent: self.user_agent.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
        }
    }
}

/// GitHub unless `fixture` names an offline bundle.
pub fn build_service(config: &HarvestConfig, fixture: Option<&Path>) -> Result<Arc<dyn RepoService>> {
    if let Some(path) = fixture {
        let service = FixtureService::from_path(path)
            .with_context(|| format!("loading fixture bundle {}", path.display()))?;
        info!(fixture = %path.display(), "using offline fixture service");
        return Ok(Arc::new(service));
    }
    if config.token.is_none() {
        warn!("GITHUB_TOKEN not set; unauthenticated requests are limited to 60 per hour");
    }
    Ok(Arc::new(GithubService::new(config.github_config())?))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    QuotaExhausted { reset_at: Option<DateTime<Utc>> },
    /// Some tasks or entities failed without a quota signal and stay
    /// pending; rerunning retries them.
    Incomplete { failures: usize },
}

impl RunStatus {
    fn after_enrichment(summary: &EnrichmentSummary) -> Self {
        if summary.stopped_for_quota {
            RunStatus::QuotaExhausted {
                reset_at: summary.reset_at,
            }
        } else if summary.failed > 0 && summary.remaining > 0 {
            RunStatus::Incomplete {
                failures: summary.failed,
            }
        } else {
            RunStatus::Completed
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub phase: Phase,
    pub tasks_completed: Vec<String>,
    pub tasks_pending: Vec<String>,
    pub repositories: usize,
    pub filtered_count: u64,
    pub enrichment: Option<EnrichmentSummary>,
    pub output_dir: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub phase: Phase,
    pub completed_tasks: Vec<String>,
    pub pending_tasks: Vec<String>,
    pub filtered_count: u64,
    pub stats: AggregateStats,
    pub state_path: String,
}

pub struct HarvestPipeline {
    config: HarvestConfig,
    service: Arc<dyn RepoService>,
    plan: Option<TaskPlan>,
}

impl HarvestPipeline {
    pub fn new(config: HarvestConfig, service: Arc<dyn RepoService>) -> Self {
        Self {
            config,
            service,
            plan: None,
        }
    }

    pub fn with_plan(mut self, plan: TaskPlan) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    async fn plan(&self) -> Result<TaskPlan> {
        match &self.plan {
            Some(plan) => Ok(plan.clone()),
            None => TaskPlan::load(&self.config.plan_path).await,
        }
    }

    async fn load_state(&self, plan: &TaskPlan) -> Result<HarvestState> {
        HarvestState::load(CheckpointStore::new(&self.config.state_path), plan).await
    }

    fn exporter(&self) -> DatasetExporter {
        DatasetExporter::new(
            &self.config.output_dir,
            self.service.has_credential(),
            self.config.validation.filtering_criteria(&self.config.coarse),
        )
    }

    fn orchestrator(&self) -> SearchOrchestrator {
        SearchOrchestrator::new(
            QueryExecutor::new(
                self.service.clone(),
                ItemValidator::new(self.config.validation.clone()),
            ),
            self.config.coarse,
        )
    }

    fn search_gate(&self) -> QuotaGate {
        QuotaGate::for_resource(self.service.clone(), QuotaResource::Search)
    }

    fn scheduler(&self) -> EnrichmentScheduler {
        EnrichmentScheduler::new(self.service.clone())
            .with_concurrency(self.config.enrich_concurrency)
            .with_cleaner(self.config.clean_readmes.then(ReadmeCleaner::default))
    }

    /// Collect whatever is pending, then enrich if collection finished.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let plan = self.plan().await?;
        let mut state = self.load_state(&plan).await?;
        info!(
            service = self.service.service_id(),
            run_id = %state.run_id(),
            phase = %state.phase(),
            tasks = plan.tasks.len(),
            "harvest run starting"
        );
        let exporter = self.exporter();

        let mut status = self
            .collect_into(&mut state, &plan, &self.search_gate(), &exporter)
            .await?;
        let mut enrichment = None;
        if state.phase() == Phase::Enriching {
            let summary = self
                .enrich_into(&mut state, &QuotaGate::new(self.service.clone()), &exporter, None)
                .await?;
            status = RunStatus::after_enrichment(&summary);
            enrichment = Some(summary);
        }
        Ok(self.summarize(&state, started_at, status, enrichment))
    }

    /// Run the collection phase only.
    pub async fn collect(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let plan = self.plan().await?;
        let mut state = self.load_state(&plan).await?;
        let status = self
            .collect_into(&mut state, &plan, &self.search_gate(), &self.exporter())
            .await?;
        Ok(self.summarize(&state, started_at, status, None))
    }

    /// Run the enrichment phase only. Refused while collection is pending.
    pub async fn enrich(&self, limit: Option<usize>) -> Result<RunSummary> {
        let started_at = Utc::now();
        let plan = self.plan().await?;
        let mut state = self.load_state(&plan).await?;
        if state.phase() != Phase::Enriching {
            let pending = state.registry().pending();
            anyhow::bail!(
                "collection is not finished: {} task(s) pending; run `collect` first",
                pending.len()
            );
        }
        let gate = QuotaGate::new(self.service.clone());
        let summary = self
            .enrich_into(&mut state, &gate, &self.exporter(), limit)
            .await?;
        let status = RunStatus::after_enrichment(&summary);
        Ok(self.summarize(&state, started_at, status, Some(summary)))
    }

    pub async fn status(&self) -> Result<StatusReport> {
        let plan = self.plan().await?;
        let state = self.load_state(&plan).await?;
        Ok(StatusReport {
            phase: state.phase(),
            completed_tasks: state.registry().completed().iter().cloned().collect(),
            pending_tasks: state.registry().pending().into_iter().map(String::from).collect(),
            filtered_count: state.filtered_count(),
            stats: state.aggregator().stats(),
            state_path: self.config.state_path.display().to_string(),
        })
    }

    async fn collect_into(
        &self,
        state: &mut HarvestState,
        plan: &TaskPlan,
        gate: &QuotaGate,
        exporter: &DatasetExporter,
    ) -> Result<RunStatus> {
        if state.phase() == Phase::Enriching {
            info!("collection already finished");
            return Ok(RunStatus::Completed);
        }

        let orchestrator = self.orchestrator();
        let mut failed_tasks = 0;
        for task in &plan.tasks {
            if state.registry().is_done(&task.name) {
                info!(task = %task.name, "skipping completed task");
                continue;
            }
            let span = info_span!("task", name = %task.name, tag = %task.tag);
            let outcome = run_task(&orchestrator, gate, task).instrument(span).await;
            match outcome {
                TaskOutcome::Done(result) => {
                    let collected = result.items.len();
                    let stats = state
                        .aggregator_mut()
                        .ingest(result.items, &task.provenance());
                    info!(
                        task = %task.name,
                        inserted = stats.inserted,
                        merged = stats.merged,
                        total = state.aggregator().len(),
                        "task results ingested"
                    );
                    state
                        .complete_task(&task.name, collected, result.filtered_out)
                        .await?;
                }
                TaskOutcome::QuotaExhausted { reset_at } => {
                    warn!(
                        task = %task.name,
                        reset_at = ?reset_at,
                        completed = state.registry().completed().len(),
                        "rate limit exhausted; stopping collection"
                    );
                    state.persist().await?;
                    exporter.write_raw(state).await?;
                    return Ok(RunStatus::QuotaExhausted { reset_at });
                }
                TaskOutcome::Unreachable { query, failed_pages } => {
                    warn!(
                        task = %task.name,
                        query = %query,
                        failed_pages,
                        "no page of the query could be fetched; task stays pending"
                    );
                    failed_tasks += 1;
                    state.persist().await?;
                }
            }
        }

        if failed_tasks > 0 {
            exporter.write_raw(state).await?;
            return Ok(RunStatus::Incomplete {
                failures: failed_tasks,
            });
        }
        if state.registry().all_done() {
            state.advance_phase().await?;
        }
        exporter.write_raw(state).await?;
        Ok(RunStatus::Completed)
    }

    async fn enrich_into(
        &self,
        state: &mut HarvestState,
        gate: &QuotaGate,
        exporter: &DatasetExporter,
        limit: Option<usize>,
    ) -> Result<EnrichmentSummary> {
        let summary = self
            .scheduler()
            .run(state, gate, exporter, self.config.enrich_batch, limit)
            .await?;
        if summary.remaining == 0 && !summary.stopped_for_quota {
            exporter.write_enriched(state).await?;
            exporter.write_snapshot(state).await?;
        }
        Ok(summary)
    }

    fn summarize(
        &self,
        state: &HarvestState,
        started_at: DateTime<Utc>,
        status: RunStatus,
        enrichment: Option<EnrichmentSummary>,
    ) -> RunSummary {
        RunSummary {
            run_id: state.run_id(),
            started_at,
            finished_at: Utc::now(),
            status,
            phase: state.phase(),
            tasks_completed: state.registry().completed().iter().cloned().collect(),
            tasks_pending: state.registry().pending().into_iter().map(String::from).collect(),
            repositories: state.aggregator().len(),
            filtered_count: state.filtered_count(),
            enrichment,
            output_dir: self.config.output_dir.display().to_string(),
        }
    }
}

enum TaskOutcome {
    Done(QueryResult),
    QuotaExhausted { reset_at: Option<DateTime<Utc>> },
    /// A query fetched no page at all; the task must not count as done.
    Unreachable { query: String, failed_pages: u32 },
}

/// Run every query of `task`; any quota stop or unreachable query discards
/// the task's items.
async fn run_task(orchestrator: &SearchOrchestrator, gate: &QuotaGate, task: &TaskSpec) -> TaskOutcome {
    let per_query = task.per_query_limit();
    let mut combined = QueryResult::default();
    for query in &task.queries {
        match orchestrator.run_query(gate, query, per_query, task.sort).await {
            QueryOutcome::Completed(result) if result.pages_fetched == 0 && result.failed_pages > 0 => {
                return TaskOutcome::Unreachable {
                    query: query.clone(),
                    failed_pages: result.failed_pages,
                };
            }
            QueryOutcome::Completed(result) => {
                combined.items.extend(result.items);
                combined.filtered_out += result.filtered_out;
                combined.pages_fetched += result.pages_fetched;
                combined.failed_pages += result.failed_pages;
            }
            QueryOutcome::QuotaExhausted { reset_at } => {
                return TaskOutcome::QuotaExhausted { reset_at };
            }
        }
    }
    TaskOutcome::Done(combined)
}

pub async fn run_from_env(fixture: Option<&Path>) -> Result<RunSummary> {
    let config = HarvestConfig::from_env();
    let service = build_service(&config, fixture)?;
    HarvestPipeline::new(config, service).run_once().await
}

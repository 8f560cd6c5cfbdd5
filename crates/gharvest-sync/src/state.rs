//! In-memory run state and its checkpoint projection.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::Utc;
use gharvest_core::{Checkpoint, HarvestedRepo, Phase, RepoKey, TaskCounters};
use gharvest_storage::CheckpointStore;
use tracing::{debug, info};
use uuid::Uuid;

use crate::aggregate::Aggregator;
use crate::registry::{TaskPlan, TaskRegistry};

/// Owns the registry, the entity map and the counters for one run. Every
/// mutation that must survive a crash goes through [`HarvestState::persist`].
pub struct HarvestState {
    store: CheckpointStore,
    registry: TaskRegistry,
    aggregator: Aggregator,
    task_counters: BTreeMap<String, TaskCounters>,
    filtered_count: u64,
    run_id: Uuid,
}

impl HarvestState {
    pub async fn load(store: CheckpointStore, plan: &TaskPlan) -> Result<Self> {
        let checkpoint = store.load().await?;
        info!(
            path = %store.path().display(),
            phase = %checkpoint.phase,
            repositories = checkpoint.repositories.len(),
            completed_tasks = checkpoint.completed_tasks.len(),
            "checkpoint loaded"
        );
        Ok(Self::from_checkpoint(store, plan, checkpoint))
    }

    pub fn from_checkpoint(store: CheckpointStore, plan: &TaskPlan, checkpoint: Checkpoint) -> Self {
        Self {
            store,
            registry: TaskRegistry::new(plan, checkpoint.completed_tasks, checkpoint.phase),
            aggregator: Aggregator::from_map(checkpoint.repositories),
            task_counters: checkpoint.task_counters,
            filtered_count: checkpoint.filtered_count,
            run_id: Uuid::new_v4(),
        }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    pub fn aggregator_mut(&mut self) -> &mut Aggregator {
        &mut self.aggregator
    }

    pub fn repositories(&self) -> &BTreeMap<RepoKey, HarvestedRepo> {
        self.aggregator.repositories()
    }

    pub fn phase(&self) -> Phase {
        self.registry.current_phase()
    }

    pub fn filtered_count(&self) -> u64 {
        self.filtered_count
    }

    pub fn task_counters(&self) -> &BTreeMap<String, TaskCounters> {
        &self.task_counters
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Mark `name` done and persist in the same write as the entities
    /// ingested for it. Completing a done task is a no-op.
    pub async fn complete_task(&mut self, name: &str, collected: usize, filtered_out: u64) -> Result<bool> {
        if !self.registry.complete(name) {
            debug!(task = name, "task already complete");
            return Ok(false);
        }
        self.filtered_count += filtered_out;
        self.task_counters.insert(
            name.to_string(),
            TaskCounters {
                collected,
                filtered_out,
                completed_at: Utc::now(),
            },
        );
        self.persist()
            .await
            .with_context(|| format!("recording completion of task {name}"))?;
        info!(task = name, collected, filtered_out, "task complete");
        Ok(true)
    }

    /// Flip to `enriching` once every planned task is done, and persist.
    pub async fn advance_phase(&mut self) -> Result<Phase> {
        let phase = self.registry.advance_phase()?;
        self.persist().await.context("recording phase change")?;
        info!(%phase, "phase advanced");
        Ok(phase)
    }

    pub fn to_checkpoint(&self) -> Checkpoint {
        Checkpoint {
            phase: self.registry.current_phase(),
            completed_tasks: self.registry.completed().clone(),
            task_counters: self.task_counters.clone(),
            filtered_count: self.filtered_count,
            repositories: self.aggregator.repositories().clone(),
            last_run_id: Some(self.run_id),
            updated_at: Some(Utc::now()),
            ..Checkpoint::default()
        }
    }

    pub async fn persist(&self) -> Result<()> {
        self.store.save(&self.to_checkpoint()).await?;
        Ok(())
    }
}

//! Collection plan, task completion marks and the run phase.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use gharvest_adapters::SortOrder;
use gharvest_core::{Facet, Phase, Provenance};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_TASK_LIMIT: usize = 500;

const PLAN_TOPICS: &[&str] = &[
    "machine-learning",
    "web-development",
    "data-science",
    "artificial-intelligence",
    "blockchain",
    "cybersecurity",
    "mobile-development",
    "devops",
    "open-source",
];

const PLAN_LANGUAGES: &[&str] = &[
    "Python",
    "JavaScript",
    "TypeScript",
    "Java",
    "Go",
    "Rust",
    "C++",
    "Ruby",
    "PHP",
    "Swift",
];

fn default_limit() -> usize {
    DEFAULT_TASK_LIMIT
}

/// One named collection task. `limit` is shared evenly by its queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub tag: String,
    pub queries: Vec<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub sort: SortOrder,
    #[serde(default)]
    pub facet: Option<Facet>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub languages: Vec<String>,
}

impl TaskSpec {
    fn new(name: &str, tag: &str, queries: &[&str], limit: usize) -> Self {
        Self {
            name: name.to_string(),
            tag: tag.to_string(),
            queries: queries.iter().map(|q| q.to_string()).collect(),
            limit,
            sort: SortOrder::Stars,
            facet: None,
            topics: Vec::new(),
            languages: Vec::new(),
        }
    }

    fn with_facet(mut self, facet: Facet) -> Self {
        self.facet = Some(facet);
        self
    }

    pub fn per_query_limit(&self) -> usize {
        if self.queries.is_empty() {
            0
        } else {
            (self.limit / self.queries.len()).max(1)
        }
    }

    pub fn provenance(&self) -> Provenance {
        Provenance {
            tag: self.tag.clone(),
            facet: self.facet,
            topics: self.topics.clone(),
            languages: self.languages.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPlan {
    pub tasks: Vec<TaskSpec>,
}

impl Default for TaskPlan {
    fn default() -> Self {
        let mut tasks = vec![
            TaskSpec::new("top_repos", "top_starred", &["help-wanted-issues:>5"], 10_000),
            TaskSpec::new(
                "gsoc_repos",
                "gsoc",
                &[
                    "gsoc in:name,description",
                    "google-summer-of-code in:name,description",
                    "topic:gsoc",
                    "topic:google-summer-of-code",
                ],
                DEFAULT_TASK_LIMIT,
            )
            .with_facet(Facet::Gsoc),
            TaskSpec::new(
                "hacktoberfest_repos",
                "hacktoberfest",
                &["hacktoberfest in:name,description", "topic:hacktoberfest"],
                DEFAULT_TASK_LIMIT,
            )
            .with_facet(Facet::Hacktoberfest),
        ];

        for topic in PLAN_TOPICS {
            let name = format!("topic_{topic}");
            let query = format!("topic:{topic}");
            let mut task = TaskSpec::new(&name, &name, &[query.as_str()], DEFAULT_TASK_LIMIT);
            task.topics.push(topic.to_string());
            tasks.push(task);
        }
        for language in PLAN_LANGUAGES {
            let name = format!("language_{language}");
            let query = format!("language:{language}");
            let mut task = TaskSpec::new(&name, &name, &[query.as_str()], DEFAULT_TASK_LIMIT);
            task.languages.push(language.to_string());
            tasks.push(task);
        }

        tasks.push(
            TaskSpec::new(
                "good_first_issue",
                "good_first_issue",
                &["good-first-issue in:name,description", "help-wanted in:name,description"],
                DEFAULT_TASK_LIMIT,
            )
            .with_facet(Facet::GoodFirstIssues),
        );
        let mut underrated = TaskSpec::new(
            "underrated",
            "underrated",
            &[
                "stars:100..1000 forks:>20",
                "stars:500..2000 pushed:>2024-01-01",
                "stars:200..1500 watchers:>50",
            ],
            DEFAULT_TASK_LIMIT,
        )
        .with_facet(Facet::Underrated);
        underrated.sort = SortOrder::Updated;
        tasks.push(underrated);

        Self { tasks }
    }
}

impl TaskPlan {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let plan: TaskPlan = serde_yaml::from_str(yaml).context("parsing task plan yaml")?;
        plan.validate()?;
        Ok(plan)
    }

    /// Load `path` when it exists, otherwise the built-in plan.
    pub async fn load(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(Self::default());
        }
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("loading plan {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for task in &self.tasks {
            if !seen.insert(task.name.as_str()) {
                anyhow::bail!("duplicate task name {}", task.name);
            }
            if task.queries.is_empty() {
                anyhow::bail!("task {} has no queries", task.name);
            }
        }
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tasks.iter().map(|t| t.name.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PhaseError {
    #[error("cannot start enriching: {pending} planned task(s) pending, first is {first}")]
    TasksPending { pending: usize, first: String },
    #[error("phase is already {0}")]
    AlreadyAdvanced(Phase),
}

/// Completion marks for the planned tasks plus the one-way phase flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRegistry {
    planned: Vec<String>,
    completed: BTreeSet<String>,
    phase: Phase,
}

impl TaskRegistry {
    pub fn new(plan: &TaskPlan, completed: BTreeSet<String>, phase: Phase) -> Self {
        Self {
            planned: plan.names().map(ToString::to_string).collect(),
            completed,
            phase,
        }
    }

    pub fn is_done(&self, name: &str) -> bool {
        self.completed.contains(name)
    }

    /// Returns true when the mark is new.
    pub fn complete(&mut self, name: &str) -> bool {
        self.completed.insert(name.to_string())
    }

    pub fn current_phase(&self) -> Phase {
        self.phase
    }

    pub fn completed(&self) -> &BTreeSet<String> {
        &self.completed
    }

    pub fn pending(&self) -> Vec<&str> {
        self.planned
            .iter()
            .filter(|name| !self.completed.contains(name.as_str()))
            .map(String::as_str)
            .collect()
    }

    pub fn all_done(&self) -> bool {
        self.pending().is_empty()
    }

    pub fn advance_phase(&mut self) -> Result<Phase, PhaseError> {
        if self.phase != Phase::Collecting {
            return Err(PhaseError::AlreadyAdvanced(self.phase));
        }
        let pending = self.pending();
        if let Some(first) = pending.first() {
            return Err(PhaseError::TasksPending {
                pending: pending.len(),
                first: first.to_string(),
            });
        }
        self.phase = Phase::Enriching;
        Ok(self.phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_task_plan() -> TaskPlan {
        TaskPlan::from_yaml_str(
            r#"
tasks:
  - name: gsoc_repos
    tag: gsoc
    queries: ["topic:gsoc", "gsoc in:name,description"]
    facet: gsoc
  - name: underrated
    tag: underrated
    queries: ["stars:100..1000 forks:>20"]
    limit: 90
    sort: updated
    facet: underrated
"#,
        )
        .expect("plan")
    }

    #[test]
    fn default_plan_covers_every_strategy_once() {
        let plan = TaskPlan::default();
        plan.validate().expect("unique names");
        assert_eq!(plan.tasks.len(), 3 + 9 + 10 + 2);
        assert_eq!(plan.tasks[0].name, "top_repos");
        assert_eq!(plan.tasks[0].tag, "top_starred");

        let gsoc = &plan.tasks[1];
        assert_eq!(gsoc.per_query_limit(), 125);
        assert_eq!(gsoc.provenance().facet, Some(Facet::Gsoc));

        let rust = plan.tasks.iter().find(|t| t.name == "language_Rust").unwrap();
        assert_eq!(rust.queries, vec!["language:Rust"]);
        assert_eq!(rust.languages, vec!["Rust"]);

        let underrated = plan.tasks.last().unwrap();
        assert_eq!(underrated.sort, SortOrder::Updated);
        assert_eq!(underrated.per_query_limit(), 166);
    }

    #[test]
    fn yaml_plan_fills_defaults_and_rejects_duplicates() {
        let plan = two_task_plan();
        assert_eq!(plan.tasks[0].limit, 500);
        assert_eq!(plan.tasks[0].sort, SortOrder::Stars);
        assert_eq!(plan.tasks[1].sort, SortOrder::Updated);

        let dup = "tasks:\n  - {name: a, tag: a, queries: [x]}\n  - {name: a, tag: b, queries: [y]}\n";
        assert!(TaskPlan::from_yaml_str(dup).is_err());
    }

    #[test]
    fn completing_twice_equals_completing_once() {
        let plan = two_task_plan();
        let mut once = TaskRegistry::new(&plan, BTreeSet::new(), Phase::Collecting);
        assert!(once.complete("gsoc_repos"));
        let mut twice = once.clone();
        assert!(!twice.complete("gsoc_repos"));
        assert_eq!(once, twice);
    }

    #[test]
    fn phase_advances_only_when_every_planned_task_is_done() {
        let plan = two_task_plan();
        let mut registry = TaskRegistry::new(&plan, BTreeSet::new(), Phase::Collecting);
        registry.complete("gsoc_repos");
        assert_eq!(
            registry.advance_phase(),
            Err(PhaseError::TasksPending {
                pending: 1,
                first: "underrated".into()
            })
        );
        registry.complete("underrated");
        assert_eq!(registry.advance_phase(), Ok(Phase::Enriching));
        assert_eq!(
            registry.advance_phase(),
            Err(PhaseError::AlreadyAdvanced(Phase::Enriching))
        );
    }

    #[test]
    fn unknown_completed_names_do_not_block_the_plan() {
        let plan = two_task_plan();
        let completed = ["retired_task", "gsoc_repos", "underrated"]
            .into_iter()
            .map(String::from)
            .collect();
        let registry = TaskRegistry::new(&plan, completed, Phase::Collecting);
        assert!(registry.all_done());
        assert!(registry.is_done("retired_task"));
    }
}

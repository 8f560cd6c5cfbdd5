//! Two-tier filtering: remote query qualifiers + per-item legitimacy checks.

use std::fmt;
use std::sync::LazyLock;

use gharvest_core::{json_str, json_u64, FilteringCriteria};
use regex::{RegexSet, RegexSetBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

const TUTORIAL_PATTERNS: &[&str] = &[
    r"\btutorial\b",
    r"\bexample\b",
    r"\bdemo\b",
    r"\bsample\b",
    r"\bboilerplate\b",
    r"\btemplate\b",
    r"\bstarter\b",
    r"\blearning\b",
    r"\bcourse\b",
    r"\bworkshop\b",
    r"\bpractice\b",
    r"\bexercise\b",
];

const PORTFOLIO_PATTERNS: &[&str] = &[
    r"\bportfolio\b",
    r"\bresume\b",
    r"\bcv\b",
    r"\bpersonal[\s-]?site\b",
    r"\bmy[\s-]?website\b",
    r"\bprofile\b",
];

const CURATED_LIST_PATTERNS: &[&str] = &[
    r"^awesome[\s-]",
    r"\bawesome[\s-]list\b",
    r"\bcurated[\s-]list\b",
    r"\bresources\b.*\blist\b",
    r"\bcollection\b",
];

fn pattern_set(patterns: &[&str]) -> RegexSet {
    RegexSetBuilder::new(patterns)
        .case_insensitive(true)
        .build()
        .expect("static filter patterns compile")
}

static TUTORIAL: LazyLock<RegexSet> = LazyLock::new(|| pattern_set(TUTORIAL_PATTERNS));
static PORTFOLIO: LazyLock<RegexSet> = LazyLock::new(|| pattern_set(PORTFOLIO_PATTERNS));
static CURATED_LIST: LazyLock<RegexSet> = LazyLock::new(|| pattern_set(CURATED_LIST_PATTERNS));

/// Eligibility qualifiers evaluated by the remote search itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoarseFilter {
    pub min_stars: u64,
    pub min_forks: u64,
}

impl Default for CoarseFilter {
    fn default() -> Self {
        Self {
            min_stars: 10,
            min_forks: 3,
        }
    }
}

impl CoarseFilter {
    pub fn build_query(&self, base_query: &str) -> String {
        let filters = format!(
            "stars:>={} forks:>={} is:public archived:false",
            self.min_stars, self.min_forks
        );
        let base = base_query.trim();
        if base.is_empty() {
            filters
        } else {
            format!("{base} {filters}")
        }
    }
}

/// Thresholds for the per-item check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationConfig {
    pub requires_license: bool,
    pub min_description_len: usize,
    pub max_fork_star_ratio: f64,
    /// Above this many stars, fewer than `min_watchers` watchers rejects.
    pub watcher_rule_min_stars: u64,
    pub min_watchers: u64,
    /// Above this many stars, zero open issues and fewer than
    /// `activity_rule_min_forks` forks rejects.
    pub activity_rule_min_stars: u64,
    pub activity_rule_min_forks: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            requires_license: true,
            min_description_len: 20,
            max_fork_star_ratio: 2.0,
            watcher_rule_min_stars: 50,
            min_watchers: 2,
            activity_rule_min_stars: 100,
            activity_rule_min_forks: 5,
        }
    }
}

impl ValidationConfig {
    pub fn filtering_criteria(&self, coarse: &CoarseFilter) -> FilteringCriteria {
        FilteringCriteria {
            min_stars: coarse.min_stars,
            min_forks: coarse.min_forks,
            max_fork_star_ratio: self.max_fork_star_ratio,
            min_description_len: self.min_description_len,
            requires_license: self.requires_license,
            requires_description: self.min_description_len > 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NoLicense,
    NoMeaningfulDescription,
    TutorialProject,
    PortfolioProject,
    CuratedList,
    HighForkStarRatio { forks: u64, stars: u64 },
    LowWatcherEngagement,
    NoActivity,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::NoLicense => f.write_str("no license"),
            RejectReason::NoMeaningfulDescription => f.write_str("no meaningful description"),
            RejectReason::TutorialProject => f.write_str("tutorial/demo/example project"),
            RejectReason::PortfolioProject => f.write_str("portfolio/personal project"),
            RejectReason::CuratedList => f.write_str("curated list/awesome collection"),
            RejectReason::HighForkStarRatio { forks, stars } => {
                write!(f, "high fork/star ratio ({forks}/{stars})")
            }
            RejectReason::LowWatcherEngagement => f.write_str("low engagement (watchers)"),
            RejectReason::NoActivity => f.write_str("low engagement (no issues/forks)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Legitimate,
    Rejected(RejectReason),
}

impl Verdict {
    pub fn is_legitimate(&self) -> bool {
        matches!(self, Verdict::Legitimate)
    }

    pub fn reason(&self) -> Option<RejectReason> {
        match self {
            Verdict::Legitimate => None,
            Verdict::Rejected(reason) => Some(*reason),
        }
    }
}

/// Pure per-item legitimacy predicate. Holds no mutable state, so the
/// verdict for an item never depends on what was checked before it.
#[derive(Debug, Clone, Default)]
pub struct ItemValidator {
    config: ValidationConfig,
}

impl ItemValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    pub fn validate(&self, item: &JsonValue) -> Verdict {
        match self.first_rejection(item) {
            Some(reason) => Verdict::Rejected(reason),
            None => Verdict::Legitimate,
        }
    }

    pub fn is_legitimate(&self, item: &JsonValue) -> (bool, Option<RejectReason>) {
        let verdict = self.validate(item);
        (verdict.is_legitimate(), verdict.reason())
    }

    fn first_rejection(&self, item: &JsonValue) -> Option<RejectReason> {
        let cfg = &self.config;

        let has_license = item.get("license").is_some_and(|l| !l.is_null());
        if cfg.requires_license && !has_license {
            return Some(RejectReason::NoLicense);
        }

        let description = json_str(item, &["description"]).unwrap_or("");
        if description.trim().chars().count() < cfg.min_description_len {
            return Some(RejectReason::NoMeaningfulDescription);
        }

        let name = json_str(item, &["name"]).unwrap_or("");
        let combined = format!("{name} {description}");
        if TUTORIAL.is_match(&combined) {
            return Some(RejectReason::TutorialProject);
        }
        if PORTFOLIO.is_match(&combined) {
            return Some(RejectReason::PortfolioProject);
        }
        if CURATED_LIST.is_match(&combined) {
            return Some(RejectReason::CuratedList);
        }

        let stars = json_u64(item, &["stargazers_count"]).unwrap_or(0);
        let forks = json_u64(item, &["forks_count"]).unwrap_or(0);
        let watchers = json_u64(item, &["watchers_count"]).unwrap_or(0);
        let open_issues = json_u64(item, &["open_issues_count"]).unwrap_or(0);

        if stars > 0 && forks as f64 / stars as f64 > cfg.max_fork_star_ratio {
            return Some(RejectReason::HighForkStarRatio { forks, stars });
        }
        if stars > cfg.watcher_rule_min_stars && watchers < cfg.min_watchers {
            return Some(RejectReason::LowWatcherEngagement);
        }
        if stars > cfg.activity_rule_min_stars
            && open_issues == 0
            && forks < cfg.activity_rule_min_forks
        {
            return Some(RejectReason::NoActivity);
        }
        None
    }
}

//! README normalisation for downstream text consumers.

use std::collections::HashSet;
use std::sync::LazyLock;

use gharvest_core::DatasetRecord;
use regex::Regex;

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static readme pattern compiles")
}

fn compile_all(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().map(|p| compile(p)).collect()
}

static BADGES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile_all(&[
        r"(?i)\[!\[.*?\]\(.*?\)\]\(.*?\)",
        r"(?i)!\[.*?\]\(https?://.*?badge.*?\)",
        r"(?i)!\[.*?\]\(https?://.*?shields\.io.*?\)",
        r"(?i)\[!\[.*?\]\]",
    ])
});

static HTML_COMMENT: LazyLock<Regex> = LazyLock::new(|| compile(r"(?s)<!--.*?-->"));
static HTML_TAG: LazyLock<Regex> = LazyLock::new(|| compile(r"<[^>]+>"));

static CODE: LazyLock<Vec<Regex>> =
    LazyLock::new(|| compile_all(&[r"```[\s\S]*?```", r"~~~[\s\S]*?~~~", r"`[^`\n]+`"]));

static SECTION_HEADER: LazyLock<Regex> = LazyLock::new(|| compile(r"^##?\s+"));
static TOP_HEADER: LazyLock<Regex> = LazyLock::new(|| compile(r"^#\s+"));
static DROPPED_SECTION: LazyLock<Regex> = LazyLock::new(|| {
    compile(
        r"(?i)##?\s*(?:installation|install|getting started|setup|license|licensing|acknowledgments?|credits|contributors?|thanks|badges?|build status|downloads?|contributing|contribution|how to contribute|support|sponsorship|donate)",
    )
});

static BOILERPLATE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile_all(&[
        r"(?i)(?:made|built|crafted) with (?:❤️?|♥|love).*",
        r"(?i)build status:.*",
        r"(?i)downloads:.*",
        r"(?i)version:.*",
        r"(?i)npm version.*",
        r"(?i)pypi version.*",
        r"(?i)license:.*",
        r"(?i)coverage:.*",
        r"(?i)documentation:.*",
        r"(?i)\[view on github\]",
        r"(?i)\[(?:⭐️?\s*)?star us on github\]",
        r"(?i)if you (?:find this useful|like this project).*please (?:star|give).*",
    ])
});

static MD_LINK: LazyLock<Regex> = LazyLock::new(|| compile(r"\[([^\]]+)\]\([^)]+\)"));
static ANGLE_URL: LazyLock<Regex> = LazyLock::new(|| compile(r"<https?://[^>]+>"));
static BARE_URL: LazyLock<Regex> = LazyLock::new(|| compile(r"https?://\S+"));

static INLINE_SPACE: LazyLock<Regex> = LazyLock::new(|| compile(r"[ \t]+"));
static BLANK_RUN: LazyLock<Regex> = LazyLock::new(|| compile(r"\n{3,}"));

static REPO_TAG: LazyLock<Regex> =
    LazyLock::new(|| compile(r"(?i)\[(?:WIP|BETA|ALPHA|DEPRECATED|ARCHIVED)\]"));
static TRAILING_PUNCT: LazyLock<Regex> = LazyLock::new(|| compile(r"[,;:]+$"));
static ANY_SPACE: LazyLock<Regex> = LazyLock::new(|| compile(r"\s+"));
static WORD: LazyLock<Regex> = LazyLock::new(|| compile(r"\b\w+\b"));

/// Strips README markdown down to prose. Pure; returns an empty string when
/// what is left is too short or too repetitive to be useful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadmeCleaner {
    pub min_length: usize,
    pub max_length: usize,
    pub min_words: usize,
    /// Unique words over total words, in percent.
    pub min_unique_percent: usize,
}

impl Default for ReadmeCleaner {
    fn default() -> Self {
        Self {
            min_length: 50,
            max_length: 5000,
            min_words: 10,
            min_unique_percent: 30,
        }
    }
}

impl ReadmeCleaner {
    pub fn clean(&self, readme: &str) -> String {
        if readme.trim().is_empty() {
            return String::new();
        }

        let mut text = readme.to_string();
        for badge in BADGES.iter() {
            text = badge.replace_all(&text, "").into_owned();
        }
        text = HTML_COMMENT.replace_all(&text, "").into_owned();
        text = HTML_TAG.replace_all(&text, "").into_owned();
        for code in CODE.iter() {
            text = code.replace_all(&text, "").into_owned();
        }
        text = drop_sections(&text);
        for phrase in BOILERPLATE.iter() {
            text = phrase.replace_all(&text, "").into_owned();
        }
        text = MD_LINK.replace_all(&text, "$1").into_owned();
        text = ANGLE_URL.replace_all(&text, "").into_owned();
        text = BARE_URL.replace_all(&text, "").into_owned();
        text = normalize_whitespace(&text);

        if text.chars().count() > self.max_length {
            text = text.chars().take(self.max_length).collect::<String>() + "...";
        }

        if self.is_meaningful(&text) {
            text
        } else {
            String::new()
        }
    }

    pub fn clean_description(&self, description: &str) -> String {
        let text = REPO_TAG.replace_all(description, "");
        let text = TRAILING_PUNCT.replace_all(text.trim_end(), "");
        ANY_SPACE.replace_all(&text, " ").trim().to_string()
    }

    /// Joins the descriptive fields of a record into one text block.
    pub fn combined_text(&self, record: &DatasetRecord) -> String {
        let mut parts = Vec::new();
        if let Some(name) = record.name.as_deref().filter(|n| !n.is_empty()) {
            parts.push(format!("Repository: {name}"));
        }
        if let Some(description) = record.description.as_deref() {
            let cleaned = self.clean_description(description);
            if !cleaned.is_empty() {
                parts.push(cleaned);
            }
        }
        if let Some(language) = record.language.as_deref().filter(|l| !l.is_empty()) {
            parts.push(format!("Primary language: {language}"));
        }
        if !record.topics.is_empty() {
            let topics: Vec<&str> = record.topics.iter().take(10).map(String::as_str).collect();
            parts.push(format!("Topics: {}", topics.join(", ")));
        }
        if !record.readme.is_empty() {
            parts.push(record.readme.clone());
        }
        parts.join("\n\n")
    }

    pub fn is_meaningful(&self, text: &str) -> bool {
        if text.chars().count() < self.min_length {
            return false;
        }
        let words: Vec<&str> = WORD.find_iter(text).map(|m| m.as_str()).collect();
        if words.len() < self.min_words.max(1) {
            return false;
        }
        let unique: HashSet<&str> = words.iter().copied().collect();
        unique.len() * 100 >= words.len() * self.min_unique_percent
    }
}

/// Drops level-1/2 sections whose heading names install/license/credits
/// style content. A level-1 heading always ends the skip.
fn drop_sections(text: &str) -> String {
    let mut kept = Vec::new();
    let mut skipping = false;
    for line in text.split('\n') {
        if SECTION_HEADER.is_match(line) {
            skipping = DROPPED_SECTION.is_match(line);
        }
        if skipping && TOP_HEADER.is_match(line) {
            skipping = false;
        }
        if !skipping {
            kept.push(line);
        }
    }
    kept.join("\n")
}

fn normalize_whitespace(text: &str) -> String {
    let text = INLINE_SPACE.replace_all(text, " ");
    let text = BLANK_RUN.replace_all(&text, "\n\n");
    text.split('\n')
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

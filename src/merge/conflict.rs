//! Conflict detection between existing and incoming statements.
//!
//! Two statements conflict only when they talk about the same subject (shared
//! content terms). Among those, opposite polarity is a contradiction,
//! different years a temporal supersession, different figures a matter of
//! interpretation, and absolute vs hedged wording a scope mismatch.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dedup::key_terms;

/// Negation markers, including contractions.
static NEGATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(not|no|never|cannot|none|neither|nor|without)\b|\b\w+n't\b").unwrap()
});

/// Universal quantifiers.
static ABSOLUTE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(always|never|all|every|none|invariably|without exception|in all cases)\b")
        .unwrap()
});

/// Hedged or partial quantifiers.
static HEDGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(some|sometimes|often|usually|may|might|many|several|occasionally|in some cases|most|partly|partially)\b")
        .unwrap()
});

static YEAR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(1[89]\d{2}|20\d{2})\b").unwrap());

static FIGURE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+(?:[.,]\d+)?%?").unwrap());

static SENTENCE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^.!?]+[.!?]*").unwrap());

/// Tokens that carry polarity or quantity rather than subject
const NON_SUBJECT: &[&str] = &[
    "never", "cannot", "none", "neither", "nor", "without", "doesn", "isn", "aren", "wasn",
    "weren", "don", "didn", "won", "hasn", "haven", "hadn", "couldn", "shouldn", "wouldn",
    "always", "every", "invariably", "sometimes", "often", "usually", "many", "several",
    "occasionally", "partly", "partially",
];

/// Opposite pairs; the second word is read as the negated first word
const ANTONYMS: &[(&str, &str)] = &[
    ("increase", "decrease"),
    ("increased", "decreased"),
    ("higher", "lower"),
    ("rise", "fall"),
    ("improve", "worsen"),
    ("effective", "ineffective"),
    ("safe", "unsafe"),
    ("support", "refute"),
    ("benefit", "harm"),
    ("true", "false"),
    ("present", "absent"),
];

/// Minimum share of the smaller term set two statements must share
const SUBJECT_OVERLAP: f64 = 0.6;

/// Kind of conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Opposite polarity on the same subject
    Contradiction,

    /// Same claim tied to different points in time
    Temporal,

    /// Universal claim against a hedged one
    Scope,

    /// Same claim with different figures
    Interpretation,
}

impl std::fmt::Display for ConflictType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConflictType::Contradiction => "contradiction",
            ConflictType::Temporal => "temporal",
            ConflictType::Scope => "scope",
            ConflictType::Interpretation => "interpretation",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    #[default]
    Unresolved,
    Resolved,
    Dismissed,
}

/// A conflict surfaced by a merge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeConflict {
    pub id: Uuid,
    pub conflict_type: ConflictType,
    pub severity: Severity,

    /// Heading of the section the conflict was found in
    pub section: String,

    /// Statement already in the artifact
    pub existing: String,

    /// Statement being merged in
    pub incoming: String,

    pub description: String,

    #[serde(default)]
    pub status: ResolutionStatus,
}

impl MergeConflict {
    pub fn new(
        detected: DetectedConflict,
        section: impl Into<String>,
        existing: impl Into<String>,
        incoming: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            conflict_type: detected.conflict_type,
            severity: detected.severity,
            section: section.into(),
            existing: existing.into(),
            incoming: incoming.into(),
            description: detected.description,
            status: ResolutionStatus::Unresolved,
        }
    }

    pub fn is_unresolved(&self) -> bool {
        self.status == ResolutionStatus::Unresolved
    }
}

/// Result of comparing two statements
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedConflict {
    pub conflict_type: ConflictType,
    pub severity: Severity,
    pub description: String,
}

/// What a statement says, reduced to comparable parts
#[derive(Debug, Clone, Default, PartialEq)]
struct StatementProfile {
    negative: bool,
    absolute: bool,
    hedged: bool,
    years: BTreeSet<String>,
    figures: BTreeSet<String>,
    terms: BTreeSet<String>,
}

impl StatementProfile {
    fn of(text: &str) -> Self {
        let mut flips = NEGATION_RE.find_iter(text).count();
        let mut terms = BTreeSet::new();

        for term in key_terms(text) {
            if NON_SUBJECT.contains(&term.as_str()) || term.chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            let term = stem(&term);
            match ANTONYMS.iter().find(|(_, negated)| *negated == term) {
                Some((positive, _)) => {
                    flips += 1;
                    terms.insert((*positive).to_string());
                }
                None => {
                    terms.insert(term);
                }
            }
        }

        let years: BTreeSet<String> = YEAR_RE.find_iter(text).map(|m| m.as_str().to_string()).collect();
        let figures = FIGURE_RE
            .find_iter(text)
            .map(|m| m.as_str().replace(',', "."))
            .filter(|f| !years.contains(f))
            .collect();

        Self {
            negative: flips % 2 == 1,
            absolute: ABSOLUTE_RE.is_match(text),
            hedged: HEDGE_RE.is_match(text),
            years,
            figures,
            terms,
        }
    }

    fn same_subject(&self, other: &Self) -> bool {
        let shared = self.terms.intersection(&other.terms).count();
        let smaller = self.terms.len().min(other.terms.len());
        shared >= 2 && shared as f64 / smaller as f64 >= SUBJECT_OVERLAP
    }
}

/// Crude plural/third-person stemming: "increases" -> "increase"
fn stem(term: &str) -> String {
    if term.len() > 3 && term.ends_with('s') && !term.ends_with("ss") {
        term[..term.len() - 1].to_string()
    } else {
        term.to_string()
    }
}

/// Split a paragraph into sentences
pub fn split_statements(paragraph: &str) -> Vec<&str> {
    SENTENCE_RE
        .find_iter(paragraph)
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Compare an existing statement with an incoming one
pub fn detect_conflict(existing: &str, incoming: &str) -> Option<DetectedConflict> {
    let a = StatementProfile::of(existing);
    let b = StatementProfile::of(incoming);

    if !a.same_subject(&b) {
        return None;
    }

    if a.negative != b.negative {
        let severity = if a.absolute || b.absolute {
            Severity::Critical
        } else {
            Severity::High
        };
        return Some(DetectedConflict {
            conflict_type: ConflictType::Contradiction,
            severity,
            description: format!("Opposite claims: '{}' vs '{}'", existing, incoming),
        });
    }

    if !a.years.is_empty() && !b.years.is_empty() && a.years != b.years {
        return Some(DetectedConflict {
            conflict_type: ConflictType::Temporal,
            severity: Severity::Medium,
            description: format!("Claims tied to different dates: '{}' vs '{}'", existing, incoming),
        });
    }

    if !a.figures.is_empty() && !b.figures.is_empty() && a.figures != b.figures {
        return Some(DetectedConflict {
            conflict_type: ConflictType::Interpretation,
            severity: Severity::Medium,
            description: format!("Different figures: '{}' vs '{}'", existing, incoming),
        });
    }

    if (a.absolute && b.hedged && !b.absolute) || (b.absolute && a.hedged && !a.absolute) {
        return Some(DetectedConflict {
            conflict_type: ConflictType::Scope,
            severity: Severity::Low,
            description: format!("Universal vs partial claim: '{}' vs '{}'", existing, incoming),
        });
    }

    None
}

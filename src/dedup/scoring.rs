//! Similarity signals used by deduplication.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Words ignored when extracting key terms
const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "was", "were", "with", "that", "this", "these", "those", "from",
    "into", "onto", "what", "which", "who", "whom", "whose", "when", "where", "why", "how", "does",
    "did", "has", "have", "had", "can", "could", "should", "would", "will", "shall", "may",
    "might", "must", "about", "over", "under", "than", "then", "there", "their", "they", "them",
    "its", "our", "your", "you", "not", "but", "any", "all", "more", "most", "some", "such", "been",
    "being", "also", "very", "just", "only", "other", "between", "after", "before", "during",
];

/// Weights of the composite similarity score
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    /// Weight of topic-tag overlap (default: 0.4)
    #[serde(default = "default_topic_weight")]
    pub topic: f64,

    /// Weight of content similarity (default: 0.4)
    #[serde(default = "default_content_weight")]
    pub content: f64,

    /// Weight of question overlap (default: 0.2)
    #[serde(default = "default_question_weight")]
    pub question: f64,
}

fn default_topic_weight() -> f64 {
    0.4
}
fn default_content_weight() -> f64 {
    0.4
}
fn default_question_weight() -> f64 {
    0.2
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            topic: default_topic_weight(),
            content: default_content_weight(),
            question: default_question_weight(),
        }
    }
}

impl ScoreWeights {
    /// Weighted sum of the three signals
    pub fn composite(&self, topic: f64, content: f64, question: f64) -> f64 {
        self.topic * topic + self.content * content + self.question * question
    }

    /// Check the weights are non-negative and sum to 1
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.topic < 0.0 || self.content < 0.0 || self.question < 0.0 {
            anyhow::bail!("similarity weights must be non-negative");
        }
        let sum = self.topic + self.content + self.question;
        if (sum - 1.0).abs() > 1e-6 {
            anyhow::bail!("similarity weights must sum to 1.0, got {}", sum);
        }
        Ok(())
    }
}

/// Which signal contributed most to a composite score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    TopicOverlap,
    ContentSimilarity,
    QuestionOverlap,
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Signal::TopicOverlap => "topic overlap",
            Signal::ContentSimilarity => "content similarity",
            Signal::QuestionOverlap => "question overlap",
        };
        write!(f, "{}", s)
    }
}

/// Signal with the largest weighted contribution. Ties favour content, then topics.
pub fn dominant_signal(weights: &ScoreWeights, topic: f64, content: f64, question: f64) -> Signal {
    let contributions = [
        (Signal::ContentSimilarity, weights.content * content),
        (Signal::TopicOverlap, weights.topic * topic),
        (Signal::QuestionOverlap, weights.question * question),
    ];
    let mut best = contributions[0];
    for candidate in &contributions[1..] {
        if candidate.1 > best.1 {
            best = *candidate;
        }
    }
    best.0
}

/// Jaccard overlap of two tag lists, compared case-insensitively
///
/// Two empty lists have no overlap.
pub fn topic_overlap(a: &[String], b: &[String]) -> f64 {
    let a = normalize_tags(a);
    let b = normalize_tags(b);
    jaccard(&a, &b)
}

/// Best key-term overlap between a query and any of the given questions
pub fn question_overlap(query: &str, questions: &[String]) -> f64 {
    let query_terms = key_terms(query);
    if query_terms.is_empty() {
        return 0.0;
    }
    questions
        .iter()
        .map(|q| jaccard(&query_terms, &key_terms(q)))
        .fold(0.0, f64::max)
}

/// Lowercased alphanumeric terms of at least three characters, minus stopwords
pub fn key_terms(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(|w| w.to_lowercase())
        .filter(|w| w.chars().count() >= 3 && !STOPWORDS.contains(&w.as_str()))
        .collect()
}

fn normalize_tags(tags: &[String]) -> BTreeSet<String> {
    tags.iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Leading `max_chars` characters of `text`
pub fn prefix(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

//! Knowledge artifacts produced by research sessions.
//!
//! An artifact is the persisted unit of knowledge: a titled document made of
//! sections, plus the metadata deduplication needs (topics, the questions that
//! produced it, confidence and source count).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::research::{clamp_unit, Synthesis};

/// Artifact identifier (SHA256(seed)[0:16])
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactId(String);

impl ArtifactId {
    /// Derive an ID from a seed string
    pub fn from_seed(seed: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(seed.as_bytes());
        let result = hasher.finalize();

        // First 8 bytes (16 hex chars)
        Self(hex::encode(&result[..8]))
    }

    /// Wrap an existing ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Descriptive metadata supplied with new content
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    /// Human-readable title
    pub title: String,

    /// Topic tags
    #[serde(default)]
    pub topics: Vec<String>,

    /// Why the artifact exists
    #[serde(default)]
    pub purpose: String,
}

/// A section of an artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    /// Section heading
    pub heading: String,

    /// Paragraphs, in order. Each paragraph is kept verbatim.
    #[serde(default)]
    pub paragraphs: Vec<String>,
}

impl Section {
    /// Create a section
    pub fn new(heading: impl Into<String>, paragraphs: Vec<String>) -> Self {
        Self {
            heading: heading.into(),
            paragraphs,
        }
    }

    /// First paragraph, or empty
    pub fn lead(&self) -> &str {
        self.paragraphs.first().map(String::as_str).unwrap_or("")
    }

    /// Heading plus lead paragraph, used for section matching
    pub fn match_text(&self) -> String {
        format!("{}\n{}", self.heading, self.lead())
    }
}

/// A persisted knowledge document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Artifact identifier
    pub id: ArtifactId,

    /// Title, topics, purpose
    pub metadata: ArtifactMetadata,

    /// Research questions that produced or extended this artifact
    #[serde(default)]
    pub questions: Vec<String>,

    /// Aggregate confidence, in [0, 1]
    pub confidence: f64,

    /// Number of distinct sources behind the content
    pub source_count: usize,

    /// Document body
    pub sections: Vec<Section>,

    /// When the artifact was created
    pub created_at: DateTime<Utc>,

    /// When the artifact last changed
    pub updated_at: DateTime<Utc>,

    /// Incremented on every update or merge
    #[serde(default)]
    pub revision: u32,
}

impl Artifact {
    /// Build a brand-new artifact from new content
    pub fn from_content(content: &NewContent) -> Self {
        let now = Utc::now();
        let seed = format!("{}:{}", content.metadata.title, now.to_rfc3339());
        let sections = content.sections();

        Self {
            id: ArtifactId::from_seed(&seed),
            metadata: content.metadata.clone(),
            questions: content.question.iter().cloned().collect(),
            confidence: clamp_unit(content.confidence),
            source_count: content.source_count,
            sections,
            created_at: now,
            updated_at: now,
            revision: 0,
        }
    }

    /// Every paragraph in document order
    pub fn statements(&self) -> impl Iterator<Item = &str> {
        self.sections
            .iter()
            .flat_map(|s| s.paragraphs.iter().map(String::as_str))
    }

    /// Plain text used for embedding the whole artifact
    pub fn index_text(&self) -> String {
        let mut text = self.metadata.title.clone();
        for section in &self.sections {
            text.push('\n');
            text.push_str(&section.heading);
            for paragraph in &section.paragraphs {
                text.push('\n');
                text.push_str(paragraph);
            }
        }
        text
    }

    /// Render as markdown
    pub fn to_markdown(&self) -> String {
        let mut out = format!("# {}\n\n", self.metadata.title);

        if !self.metadata.purpose.is_empty() {
            out.push_str(&format!("_{}_\n\n", self.metadata.purpose));
        }
        out.push_str(&format!("- **Topics:** {}\n", self.metadata.topics.join(", ")));
        out.push_str(&format!("- **Confidence:** {:.2}\n", self.confidence));
        out.push_str(&format!("- **Sources:** {}\n", self.source_count));
        out.push_str(&format!("- **Revision:** {}\n", self.revision));
        for question in &self.questions {
            out.push_str(&format!("- **Question:** {}\n", question));
        }

        for section in &self.sections {
            out.push_str(&format!("\n## {}\n", section.heading));
            for paragraph in &section.paragraphs {
                out.push_str(&format!("\n{}\n", paragraph));
            }
        }

        out
    }
}

/// One finding to be written into an artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// Preferred section heading, if known
    #[serde(default)]
    pub heading: Option<String>,

    /// Finding text
    pub text: String,
}

impl Finding {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            heading: None,
            text: text.into(),
        }
    }

    pub fn under(heading: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            heading: Some(heading.into()),
            text: text.into(),
        }
    }
}

/// Freshly synthesized content that may become, update or merge into an artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewContent {
    /// Title, topics, purpose
    pub metadata: ArtifactMetadata,

    /// Originating research question
    #[serde(default)]
    pub question: Option<String>,

    /// Findings, in order
    pub findings: Vec<Finding>,

    /// Confidence of the findings
    pub confidence: f64,

    /// Number of distinct sources behind the findings
    pub source_count: usize,
}

impl NewContent {
    /// Default heading for findings without one
    pub const FINDINGS_HEADING: &'static str = "Key Findings";

    /// Build content from a session synthesis
    pub fn from_synthesis(
        metadata: ArtifactMetadata,
        question: &str,
        synthesis: &Synthesis,
        source_count: usize,
    ) -> Self {
        let mut findings: Vec<Finding> = synthesis
            .key_findings
            .iter()
            .map(|f| Finding::under(Self::FINDINGS_HEADING, f.clone()))
            .collect();
        findings.extend(
            synthesis
                .remaining_gaps
                .iter()
                .map(|g| Finding::under("Open Questions", g.clone())),
        );
        findings.extend(
            synthesis
                .recommendations
                .iter()
                .map(|r| Finding::under("Recommendations", r.clone())),
        );

        Self {
            metadata,
            question: Some(question.to_string()),
            findings,
            confidence: synthesis.confidence,
            source_count,
        }
    }

    /// Findings grouped into sections, preserving first-seen heading order
    pub fn sections(&self) -> Vec<Section> {
        let mut sections: Vec<Section> = Vec::new();
        for finding in &self.findings {
            let heading = finding
                .heading
                .clone()
                .unwrap_or_else(|| Self::FINDINGS_HEADING.to_string());
            match sections.iter_mut().find(|s| s.heading == heading) {
                Some(section) => section.paragraphs.push(finding.text.clone()),
                None => sections.push(Section::new(heading, vec![finding.text.clone()])),
            }
        }
        sections
    }

    /// Plain text body, used as the deduplication query
    pub fn body(&self) -> String {
        let mut text = self.metadata.title.clone();
        for finding in &self.findings {
            text.push('\n');
            text.push_str(&finding.text);
        }
        text
    }
}

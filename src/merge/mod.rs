//! Merging new findings into existing artifacts.
//!
//! Merges are additive: existing paragraphs are never edited or removed.
//! `Append` adds one new section. `Integrate` routes each finding to the
//! semantically closest section and surfaces conflicts with the statements
//! already there instead of overwriting them.

pub mod conflict;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::research::clamp_unit;
use crate::domain::{Artifact, NewContent, Section};
use crate::index::{Embedder, EntryMetadata, MemoryIndex, SimilarityIndex};

pub use conflict::{
    detect_conflict, split_statements, ConflictType, DetectedConflict, MergeConflict,
    ResolutionStatus, Severity,
};

/// Prefix of paragraphs holding a conflicting statement
pub const CONFLICT_MARKER: &str = "**Conflicting reports";

/// How new content is merged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Add the new content as one new section
    Append,

    /// Route each finding to its best-matching section
    Integrate,
}

/// Merge settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeSettings {
    /// Minimum section similarity for a finding to join a section (default: 0.60)
    #[serde(default = "default_section_match")]
    pub section_match_threshold: f64,
}

fn default_section_match() -> f64 {
    0.60
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            section_match_threshold: default_section_match(),
        }
    }
}

/// Structural changes made by a merge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuralDiff {
    pub sections_added: usize,

    /// Always 0: merges never remove sections
    pub sections_removed: usize,

    /// Pre-existing sections that received new paragraphs
    pub sections_modified: usize,

    pub statements_added: usize,
}

impl StructuralDiff {
    pub fn is_empty(&self) -> bool {
        self.sections_added == 0 && self.sections_modified == 0 && self.statements_added == 0
    }
}

impl std::fmt::Display for StructuralDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "+{} sections, -{} sections, ~{} sections, +{} statements",
            self.sections_added, self.sections_removed, self.sections_modified, self.statements_added
        )
    }
}

/// Result of a merge
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub artifact: Artifact,
    pub conflicts: Vec<MergeConflict>,
    pub diff: StructuralDiff,

    /// Non-fatal problems (e.g. section matching unavailable)
    pub warnings: Vec<String>,
}

impl MergeOutcome {
    pub fn unresolved_conflicts(&self) -> impl Iterator<Item = &MergeConflict> {
        self.conflicts.iter().filter(|c| c.is_unresolved())
    }
}

/// Merges new content into artifacts
pub struct MergeEngine {
    embedder: Arc<dyn Embedder>,
    settings: MergeSettings,
}

impl MergeEngine {
    pub fn new(embedder: Arc<dyn Embedder>, settings: MergeSettings) -> Self {
        Self { embedder, settings }
    }

    pub async fn merge(
        &self,
        existing: &Artifact,
        incoming: &NewContent,
        strategy: MergeStrategy,
    ) -> MergeOutcome {
        let outcome = match strategy {
            MergeStrategy::Append => append(existing, incoming),
            MergeStrategy::Integrate => self.integrate(existing, incoming).await,
        };
        info!(
            artifact = %existing.id,
            ?strategy,
            diff = %outcome.diff,
            conflicts = outcome.conflicts.len(),
            "Merged new content"
        );
        outcome
    }

    async fn integrate(&self, existing: &Artifact, incoming: &NewContent) -> MergeOutcome {
        let mut merged = existing.clone();
        let original_sections = merged.sections.len();
        let mut warnings = Vec::new();
        let mut conflicts = Vec::new();
        let mut modified: BTreeSet<usize> = BTreeSet::new();
        let mut statements_added = 0;

        let sections = MemoryIndex::new(self.embedder.clone());
        let mut matching = true;
        for (idx, section) in merged.sections.iter().enumerate() {
            if let Err(e) = sections
                .upsert(&idx.to_string(), &section.match_text(), EntryMetadata::default())
                .await
            {
                warn!(error = %e, "Section matching unavailable, adding findings as new sections");
                warnings.push(format!("Section matching unavailable: {}", e));
                matching = false;
                break;
            }
        }

        let date = Utc::now().format("%Y-%m-%d").to_string();
        for finding in &incoming.findings {
            let text = finding.text.trim();
            if text.is_empty() || merged.statements().any(|s| s == text) {
                continue;
            }

            let mut target = None;
            if matching {
                match sections.query(text, 1).await {
                    Ok(hits) => {
                        target = hits
                            .first()
                            .filter(|hit| hit.score >= self.settings.section_match_threshold)
                            .and_then(|hit| hit.id.parse::<usize>().ok())
                            .filter(|idx| *idx < merged.sections.len());
                    }
                    Err(e) => {
                        warn!(error = %e, "Section matching failed");
                        warnings.push(format!("Section matching failed: {}", e));
                        matching = false;
                    }
                }
            }
            if !matching {
                // Without embeddings, a contradicted section still counts as the match
                target = merged.sections[..original_sections]
                    .iter()
                    .position(|section| find_conflict(section, text).is_some());
            }

            match target {
                Some(idx) => {
                    let section = &mut merged.sections[idx];
                    match find_conflict(section, text) {
                        Some((paragraph, statement, detected)) => {
                            debug!(section = %section.heading, kind = %detected.conflict_type, "Conflict detected");
                            let annotated = annotate(detected.conflict_type, text, &statement);
                            conflicts.push(MergeConflict::new(detected, section.heading.clone(), statement, text));
                            section.paragraphs.insert(paragraph + 1, annotated);
                        }
                        None => section.paragraphs.push(text.to_string()),
                    }
                    if idx < original_sections {
                        modified.insert(idx);
                    }
                }
                None => {
                    let heading = finding
                        .heading
                        .clone()
                        .unwrap_or_else(|| NewContent::FINDINGS_HEADING.to_string());
                    let heading = if merged.sections[..original_sections]
                        .iter()
                        .any(|s| s.heading.eq_ignore_ascii_case(&heading))
                    {
                        format!("{} (update {})", heading, date)
                    } else {
                        heading
                    };

                    match merged.sections[original_sections..]
                        .iter_mut()
                        .find(|s| s.heading == heading)
                    {
                        Some(section) => section.paragraphs.push(text.to_string()),
                        None => {
                            let section = Section::new(heading, vec![text.to_string()]);
                            let idx = merged.sections.len();
                            if matching {
                                if let Err(e) = sections
                                    .upsert(&idx.to_string(), &section.match_text(), EntryMetadata::default())
                                    .await
                                {
                                    warnings.push(format!("Section matching unavailable: {}", e));
                                    matching = false;
                                }
                            }
                            merged.sections.push(section);
                        }
                    }
                }
            }
            statements_added += 1;
        }

        let diff = StructuralDiff {
            sections_added: merged.sections.len() - original_sections,
            sections_removed: 0,
            sections_modified: modified.len(),
            statements_added,
        };
        absorb_metadata(&mut merged, incoming);

        MergeOutcome {
            artifact: merged,
            conflicts,
            diff,
            warnings,
        }
    }
}

fn append(existing: &Artifact, incoming: &NewContent) -> MergeOutcome {
    let mut merged = existing.clone();
    let paragraphs: Vec<String> = incoming
        .findings
        .iter()
        .map(|f| f.text.trim())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();

    let mut diff = StructuralDiff::default();
    if !paragraphs.is_empty() {
        let heading = match incoming.metadata.title.trim() {
            "" => format!("Update {}", Utc::now().format("%Y-%m-%d")),
            title => format!("Update {}: {}", Utc::now().format("%Y-%m-%d"), title),
        };
        diff.sections_added = 1;
        diff.statements_added = paragraphs.len();
        merged.sections.push(Section::new(heading, paragraphs));
    }
    absorb_metadata(&mut merged, incoming);

    MergeOutcome {
        artifact: merged,
        conflicts: Vec::new(),
        diff,
        warnings: Vec::new(),
    }
}

/// First statement in `section` that conflicts with `text`: (paragraph index,
/// statement, conflict)
fn find_conflict(section: &Section, text: &str) -> Option<(usize, String, DetectedConflict)> {
    let incoming = split_statements(text);
    for (idx, paragraph) in section.paragraphs.iter().enumerate() {
        if paragraph.starts_with(CONFLICT_MARKER) {
            continue;
        }
        for statement in split_statements(paragraph) {
            for candidate in &incoming {
                if let Some(detected) = detect_conflict(statement, candidate) {
                    return Some((idx, statement.to_string(), detected));
                }
            }
        }
    }
    None
}

fn annotate(conflict_type: ConflictType, incoming: &str, existing: &str) -> String {
    format!(
        "{} ({}):** {} _(conflicts with: \"{}\")_",
        CONFLICT_MARKER, conflict_type, incoming, existing
    )
}

/// Union topics and questions, weight confidence by source count, bump revision
fn absorb_metadata(merged: &mut Artifact, incoming: &NewContent) {
    for topic in &incoming.metadata.topics {
        let topic = topic.trim();
        if !topic.is_empty()
            && !merged
                .metadata
                .topics
                .iter()
                .any(|t| t.eq_ignore_ascii_case(topic))
        {
            merged.metadata.topics.push(topic.to_string());
        }
    }
    if let Some(question) = &incoming.question {
        if !merged.questions.contains(question) {
            merged.questions.push(question.clone());
        }
    }

    let total = merged.source_count + incoming.source_count;
    merged.confidence = if total == 0 {
        clamp_unit((merged.confidence + incoming.confidence) / 2.0)
    } else {
        clamp_unit(
            (merged.confidence * merged.source_count as f64
                + incoming.confidence * incoming.source_count as f64)
                / total as f64,
        )
    };
    merged.source_count = total;
    merged.revision += 1;
    merged.updated_at = Utc::now();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ArtifactMetadata, Finding};

    fn artifact() -> Artifact {
        let content = NewContent {
            metadata: ArtifactMetadata {
                title: "Coffee".to_string(),
                topics: vec!["health".to_string()],
                purpose: String::new(),
            },
            question: Some("Is coffee healthy?".to_string()),
            findings: vec![Finding::new("Coffee contains caffeine.")],
            confidence: 0.8,
            source_count: 3,
        };
        Artifact::from_content(&content)
    }

    fn incoming(findings: Vec<Finding>) -> NewContent {
        NewContent {
            metadata: ArtifactMetadata {
                title: "Coffee update".to_string(),
                topics: vec!["Health".to_string(), "nutrition".to_string()],
                purpose: String::new(),
            },
            question: Some("Does coffee affect sleep?".to_string()),
            findings,
            confidence: 0.4,
            source_count: 1,
        }
    }

    #[test]
    fn test_append_adds_one_section() {
        let existing = artifact();
        let outcome = append(
            &existing,
            &incoming(vec![Finding::new("Caffeine delays sleep."), Finding::new("  ")]),
        );

        assert_eq!(outcome.diff.sections_added, 1);
        assert_eq!(outcome.diff.statements_added, 1);
        assert!(outcome.conflicts.is_empty());
        assert_eq!(outcome.artifact.sections[0], existing.sections[0]);
        assert!(outcome.artifact.sections[1].heading.starts_with("Update "));
    }

    #[test]
    fn test_metadata_absorbed() {
        let existing = artifact();
        let outcome = append(&existing, &incoming(vec![Finding::new("Caffeine delays sleep.")]));
        let merged = &outcome.artifact;

        assert_eq!(merged.metadata.topics, vec!["health".to_string(), "nutrition".to_string()]);
        assert_eq!(merged.questions.len(), 2);
        assert_eq!(merged.source_count, 4);
        assert!((merged.confidence - 0.7).abs() < 1e-12);
        assert_eq!(merged.revision, existing.revision + 1);
    }

    #[test]
    fn test_annotation_keeps_incoming_text() {
        let note = annotate(ConflictType::Contradiction, "B is false.", "B is true.");
        assert!(note.starts_with(CONFLICT_MARKER));
        assert!(note.contains("B is false."));
        assert!(note.contains("contradiction"));
    }

    #[test]
    fn test_diff_display() {
        let diff = StructuralDiff {
            sections_added: 1,
            sections_removed: 0,
            sections_modified: 2,
            statements_added: 3,
        };
        assert_eq!(diff.to_string(), "+1 sections, -0 sections, ~2 sections, +3 statements");
        assert!(StructuralDiff::default().is_empty());
    }
}

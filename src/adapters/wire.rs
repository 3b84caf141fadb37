//! JSON wire shapes for reasoning providers.
//!
//! Providers answer in loosely structured JSON, often wrapped in prose or code
//! fences. Everything here turns raw text into a typed `Reply`: anything that
//! does not fit the expected shape becomes `Reply::Malformed`.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use super::Reply;
use crate::domain::{Evidence, Hypothesis, HypothesisResult, Plan, Synthesis, TestMethod};

/// Hypothesis as a provider writes it
#[derive(Debug, Clone, Deserialize)]
struct HypothesisWire {
    #[serde(default)]
    topic: Option<String>,
    statement: String,
    #[serde(default, alias = "confidence")]
    prior_confidence: Option<f64>,
    #[serde(default)]
    required_evidence: Option<String>,
    #[serde(default)]
    test_method: Option<TestMethod>,
}

impl HypothesisWire {
    fn into_hypothesis(self, default_topic: &str) -> Option<Hypothesis> {
        let statement = self.statement.trim();
        if statement.is_empty() {
            return None;
        }
        let topic = self
            .topic
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| default_topic.to_string());

        let mut hypothesis = Hypothesis::new(topic, statement)
            .with_prior(self.prior_confidence.unwrap_or(0.5))
            .with_method(self.test_method.unwrap_or_default());
        if let Some(required) = self.required_evidence {
            hypothesis = hypothesis.with_required_evidence(required);
        }
        Some(hypothesis)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct PlanWire {
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    hypotheses: Vec<HypothesisWire>,
    #[serde(default)]
    success_criteria: Vec<String>,
    #[serde(default)]
    estimated_hops: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum HypothesesWire {
    List(Vec<HypothesisWire>),
    Wrapped { hypotheses: Vec<HypothesisWire> },
}

#[derive(Debug, Clone, Deserialize)]
struct TestWire {
    #[serde(alias = "confidence")]
    posterior_confidence: f64,
    #[serde(default)]
    supporting: Vec<String>,
    #[serde(default)]
    contradicting: Vec<String>,
    #[serde(default)]
    verdict: String,
}

#[derive(Debug, Clone, Deserialize)]
struct SynthesisWire {
    #[serde(default, alias = "findings")]
    key_findings: Vec<String>,
    confidence: f64,
    #[serde(default, alias = "gaps")]
    remaining_gaps: Vec<String>,
    #[serde(default)]
    recommendations: Vec<String>,
}

/// Locate the JSON payload inside a provider answer
///
/// Strips markdown code fences and surrounding prose by taking the outermost
/// object or array.
pub fn extract_json(raw: &str) -> Option<&str> {
    let start = raw.find(|c: char| c == '{' || c == '[')?;
    let open = raw[start..].chars().next()?;
    let close = if open == '{' { '}' } else { ']' };
    let end = raw.rfind(close)?;
    if end < start {
        return None;
    }
    Some(&raw[start..=end])
}

fn decode<T: DeserializeOwned>(raw: &str) -> Result<T, String> {
    let payload = extract_json(raw).ok_or_else(|| truncate(raw))?;
    serde_json::from_str(payload).map_err(|e| format!("{}: {}", e, truncate(raw)))
}

fn truncate(raw: &str) -> String {
    const MAX: usize = 200;
    if raw.len() <= MAX {
        return raw.to_string();
    }
    let mut cut = MAX;
    while !raw.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &raw[..cut])
}

/// Parse a plan answer
///
/// An empty plan still parses; deciding whether it is usable is the caller's job.
pub fn parse_plan(raw: &str, query: &str) -> Reply<Plan> {
    let wire: PlanWire = match decode(raw) {
        Ok(wire) => wire,
        Err(e) => return Reply::Malformed(e),
    };

    let topics: Vec<String> = wire
        .topics
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    let default_topic = topics.first().cloned().unwrap_or_else(|| query.trim().to_string());

    let hypotheses = wire
        .hypotheses
        .into_iter()
        .filter_map(|h| h.into_hypothesis(&default_topic))
        .collect();

    Reply::Parsed(Plan {
        topics,
        hypotheses,
        success_criteria: wire.success_criteria,
        estimated_hops: wire.estimated_hops.unwrap_or(1),
    })
}

/// Parse a hypothesis-generation answer (bare array or `{"hypotheses": [...]}`)
pub fn parse_hypotheses(raw: &str, topic: &str) -> Reply<Vec<Hypothesis>> {
    let wire: HypothesesWire = match decode(raw) {
        Ok(wire) => wire,
        Err(e) => return Reply::Malformed(e),
    };
    let list = match wire {
        HypothesesWire::List(list) => list,
        HypothesesWire::Wrapped { hypotheses } => hypotheses,
    };

    Reply::Parsed(
        list.into_iter()
            .filter_map(|h| h.into_hypothesis(topic))
            .collect(),
    )
}

/// Parse a hypothesis-test answer
///
/// Source locators the provider cites but that were not in the evidence it was
/// given are dropped. When nothing usable is left, the whole evidence set is
/// attributed by the direction of the confidence change, so the assessment
/// still counts toward the hop's confidence.
pub fn parse_test(raw: &str, hypothesis: &Hypothesis, evidence: &[Evidence]) -> Reply<HypothesisResult> {
    let wire: TestWire = match decode(raw) {
        Ok(wire) => wire,
        Err(e) => return Reply::Malformed(e),
    };
    if !wire.posterior_confidence.is_finite() {
        return Reply::Malformed(format!("non-finite confidence: {}", truncate(raw)));
    }

    let cited = wire.supporting.len() + wire.contradicting.len();
    let known = |source: &String| evidence.iter().any(|e| &e.source == source);
    let mut supporting: Vec<String> = wire.supporting.into_iter().filter(known).collect();
    let mut contradicting: Vec<String> = wire.contradicting.into_iter().filter(known).collect();

    let verdict = if wire.verdict.trim().is_empty() {
        "no verdict given".to_string()
    } else {
        wire.verdict
    };

    let result = HypothesisResult::new(hypothesis, wire.posterior_confidence, verdict);
    if supporting.is_empty() && contradicting.is_empty() && !evidence.is_empty() {
        warn!(
            hypothesis = %hypothesis.id,
            cited,
            evidence = evidence.len(),
            "Test reply cited none of the given sources, attributing all evidence"
        );
        let all = evidence.iter().map(|e| e.source.clone()).collect();
        if result.confidence_change() < 0.0 {
            contradicting = all;
        } else {
            supporting = all;
        }
    }

    Reply::Parsed(result.with_split(supporting, contradicting))
}

/// Parse a synthesis answer
pub fn parse_synthesis(raw: &str) -> Reply<Synthesis> {
    let wire: SynthesisWire = match decode(raw) {
        Ok(wire) => wire,
        Err(e) => return Reply::Malformed(e),
    };
    if !wire.confidence.is_finite() {
        return Reply::Malformed(format!("non-finite confidence: {}", truncate(raw)));
    }

    Reply::Parsed(Synthesis {
        key_findings: wire.key_findings,
        confidence: crate::domain::clamp_unit(wire.confidence),
        remaining_gaps: wire.remaining_gaps,
        recommendations: wire.recommendations,
    })
}

/// Request payload for planning
pub fn plan_request(query: &str) -> Value {
    json!({
        "task": "plan",
        "query": query,
        "respond_with": {
            "topics": ["string"],
            "hypotheses": [{"topic": "string", "statement": "string", "prior_confidence": 0.5,
                            "required_evidence": "string", "test_method": "evidence_review"}],
            "success_criteria": ["string"],
            "estimated_hops": 1
        }
    })
}

/// Request payload for hypothesis generation
pub fn hypotheses_request(topic: &str) -> Value {
    json!({
        "task": "generate_hypotheses",
        "topic": topic,
        "respond_with": {"hypotheses": [{"statement": "string", "prior_confidence": 0.5}]}
    })
}

/// Request payload for hypothesis testing
pub fn test_request(hypothesis: &Hypothesis, evidence: &[Evidence]) -> Value {
    json!({
        "task": "test_hypothesis",
        "hypothesis": hypothesis,
        "evidence": evidence,
        "respond_with": {
            "posterior_confidence": 0.5,
            "supporting": ["source locator"],
            "contradicting": ["source locator"],
            "verdict": "string"
        }
    })
}

/// Request payload for synthesis
pub fn synthesis_request(results: &[HypothesisResult]) -> Value {
    json!({
        "task": "synthesize",
        "results": results,
        "respond_with": {
            "key_findings": ["string"],
            "confidence": 0.5,
            "remaining_gaps": ["string"],
            "recommendations": ["string"]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_from_fenced_answer() {
        let raw = "Sure! Here you go:\n```json\n{\"a\": [1, 2]}\n```\nAnything else?";
        assert_eq!(extract_json(raw), Some("{\"a\": [1, 2]}"));
        assert_eq!(extract_json("no json here"), None);
    }

    #[test]
    fn test_parse_plan_assigns_default_topic() {
        let raw = r#"{"topics": ["  battery chemistry "], "hypotheses": [{"statement": "LFP lasts longer"}, {"statement": "  "}]}"#;
        let plan = parse_plan(raw, "query").parsed().unwrap();

        assert_eq!(plan.topics, vec!["battery chemistry".to_string()]);
        assert_eq!(plan.hypotheses.len(), 1);
        assert_eq!(plan.hypotheses[0].topic, "battery chemistry");
        assert_eq!(plan.estimated_hops, 1);
    }

    #[test]
    fn test_parse_plan_garbage_is_malformed() {
        assert!(matches!(parse_plan("I cannot help with that", "q"), Reply::Malformed(_)));
        assert!(matches!(parse_plan("{\"topics\": 3}", "q"), Reply::Malformed(_)));
    }

    #[test]
    fn test_parse_hypotheses_both_shapes() {
        let bare = r#"[{"statement": "a"}, {"statement": "b", "confidence": 0.9}]"#;
        let wrapped = r#"{"hypotheses": [{"statement": "a"}]}"#;

        let list = parse_hypotheses(bare, "t").parsed().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].prior_confidence, 0.9);
        assert_eq!(parse_hypotheses(wrapped, "t").parsed().unwrap().len(), 1);
    }

    #[test]
    fn test_parse_test_drops_unknown_sources() {
        let h = Hypothesis::new("t", "claim");
        let evidence = vec![Evidence::new("x", "https://a", 0.5)];
        let raw = r#"{"posterior_confidence": 1.4, "supporting": ["https://a", "https://made-up"], "verdict": "supported"}"#;

        let result = parse_test(raw, &h, &evidence).parsed().unwrap();
        assert_eq!(result.supporting, vec!["https://a".to_string()]);
        assert_eq!(result.posterior_confidence, 1.0);
        assert_eq!(result.verdict, "supported");
    }

    #[test]
    fn test_parse_test_unmatched_citations_follow_confidence_change() {
        let h = Hypothesis::new("t", "claim").with_prior(0.5);
        let evidence = vec![
            Evidence::new("x", "https://a", 0.5),
            Evidence::new("y", "https://b", 0.5),
        ];
        let all = vec!["https://a".to_string(), "https://b".to_string()];

        let raised = r#"{"posterior_confidence": 0.8, "supporting": ["https://elsewhere"], "verdict": "supported"}"#;
        let result = parse_test(raised, &h, &evidence).parsed().unwrap();
        assert_eq!(result.supporting, all);
        assert!(result.contradicting.is_empty());
        assert!(result.has_evidence());

        let lowered = r#"{"posterior_confidence": 0.2, "contradicting": ["https://elsewhere"], "verdict": "refuted"}"#;
        let result = parse_test(lowered, &h, &evidence).parsed().unwrap();
        assert!(result.supporting.is_empty());
        assert_eq!(result.contradicting, all);

        // Nothing to attribute without evidence
        let result = parse_test(raised, &h, &[]).parsed().unwrap();
        assert!(!result.has_evidence());
    }

    #[test]
    fn test_parse_synthesis_aliases() {
        let raw = r#"{"findings": ["f1"], "confidence": 0.75, "gaps": ["g1"]}"#;
        let synthesis = parse_synthesis(raw).parsed().unwrap();
        assert_eq!(synthesis.key_findings, vec!["f1".to_string()]);
        assert_eq!(synthesis.remaining_gaps, vec!["g1".to_string()]);
        assert_eq!(synthesis.confidence, 0.75);
    }
}

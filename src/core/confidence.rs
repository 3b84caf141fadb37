//! Confidence aggregation.
//!
//! Pure functions over hop results. Session confidence is the mean, over the
//! distinct topics addressed so far, of the confidence of the most recent hop
//! synthesis covering each topic. Later hops therefore supersede earlier ones
//! per topic instead of diluting them.

use std::collections::BTreeMap;

use crate::domain::research::clamp_unit;
use crate::domain::{HopResult, HypothesisResult, ReasoningContext};

/// Confidence of a single hop
///
/// Mean posterior of the hypotheses actually tested against evidence. A hop
/// without evidence scores 0.0.
pub fn hop_confidence(results: &[HypothesisResult]) -> f64 {
    let tested: Vec<f64> = results
        .iter()
        .filter(|r| r.has_evidence())
        .map(|r| r.posterior_confidence)
        .collect();

    if tested.is_empty() {
        return 0.0;
    }
    clamp_unit(tested.iter().sum::<f64>() / tested.len() as f64)
}

/// Latest synthesis confidence per topic
///
/// A hop that produced no findings (provider failures, budget cut) does not
/// override an earlier hop that did.
pub fn topic_confidences(hops: &[HopResult]) -> BTreeMap<String, f64> {
    let mut latest = BTreeMap::new();
    for hop in hops {
        let productive = !hop.synthesis.key_findings.is_empty();
        for topic in &hop.topics {
            if productive || !latest.contains_key(topic) {
                latest.insert(topic.clone(), clamp_unit(hop.synthesis.confidence));
            }
        }
    }
    latest
}

/// Overall confidence of a session, in [0, 1]
pub fn session_confidence(hops: &[HopResult]) -> f64 {
    let latest = topic_confidences(hops);
    if latest.is_empty() {
        return 0.0;
    }
    clamp_unit(latest.values().sum::<f64>() / latest.len() as f64)
}

/// Topics whose latest confidence is below `target`, in first-seen order
pub fn topics_below(context: &ReasoningContext, target: f64) -> Vec<String> {
    let latest = topic_confidences(context.hops());
    context
        .topics_addressed()
        .into_iter()
        .filter(|topic| latest.get(topic).copied().unwrap_or(0.0) < target)
        .collect()
}

/// Whether the loop should stop on confidence grounds
///
/// True once overall confidence reaches `early_stop`, or once it reaches
/// `target` with the latest hop leaving no open gaps.
pub fn should_stop(context: &ReasoningContext, target: f64, early_stop: f64) -> bool {
    let Some(last) = context.last_hop() else {
        return false;
    };

    let confidence = session_confidence(context.hops());
    if confidence >= early_stop {
        return true;
    }
    confidence >= target && last.synthesis.remaining_gaps.is_empty()
}

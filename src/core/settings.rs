//! Research loop settings.
//!
//! Settings are plain serde structs with per-field defaults so they can be
//! embedded in the YAML config file and partially overridden.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Settings for the hypothesis loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchSettings {
    /// Maximum number of hops per session (default: 5)
    #[serde(default = "default_max_hops")]
    pub max_hops: u32,

    /// Confidence considered good enough to conclude (default: 0.70)
    #[serde(default = "default_confidence_target")]
    pub confidence_target: f64,

    /// Confidence at which further hops add no value (default: 0.85)
    #[serde(default = "default_early_stop")]
    pub early_stop_confidence: f64,

    /// Hypotheses tested per hop (default: 3)
    #[serde(default = "default_max_hypotheses")]
    pub max_hypotheses_per_hop: usize,

    /// Evidence items requested per hypothesis (default: 5)
    #[serde(default = "default_max_evidence")]
    pub max_evidence_per_hypothesis: usize,

    /// Timeout for each provider call in seconds (default: 60)
    #[serde(default = "default_call_timeout")]
    pub call_timeout_seconds: u64,

    /// Retry policy for transient provider failures
    #[serde(default)]
    pub retry_policy: RetryPolicy,

    /// Estimated cost per provider call
    #[serde(default)]
    pub costs: CostModel,
}

fn default_max_hops() -> u32 {
    5
}
fn default_confidence_target() -> f64 {
    0.70
}
fn default_early_stop() -> f64 {
    0.85
}
fn default_max_hypotheses() -> usize {
    3
}
fn default_max_evidence() -> usize {
    5
}
fn default_call_timeout() -> u64 {
    60
}

impl Default for ResearchSettings {
    fn default() -> Self {
        Self {
            max_hops: default_max_hops(),
            confidence_target: default_confidence_target(),
            early_stop_confidence: default_early_stop(),
            max_hypotheses_per_hop: default_max_hypotheses(),
            max_evidence_per_hypothesis: default_max_evidence(),
            call_timeout_seconds: default_call_timeout(),
            retry_policy: RetryPolicy::default(),
            costs: CostModel::default(),
        }
    }
}

impl ResearchSettings {
    /// Timeout applied to every provider call
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_seconds)
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("confidence_target", self.confidence_target),
            ("early_stop_confidence", self.early_stop_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                anyhow::bail!("{} must be within [0, 1], got {}", name, value);
            }
        }

        if self.early_stop_confidence < self.confidence_target {
            anyhow::bail!(
                "early_stop_confidence ({}) must not be below confidence_target ({})",
                self.early_stop_confidence,
                self.confidence_target
            );
        }

        if self.max_hypotheses_per_hop == 0 {
            anyhow::bail!("max_hypotheses_per_hop must be at least 1");
        }

        if self.call_timeout_seconds == 0 {
            anyhow::bail!("call_timeout_seconds must be at least 1");
        }

        self.costs.validate()
    }
}

/// Estimated USD cost of one provider call, reserved against the budget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostModel {
    /// One evidence search (default: $0.005)
    #[serde(default = "default_search_cost")]
    pub search_call_usd: f64,

    /// One reasoning call (default: $0.02)
    #[serde(default = "default_reasoning_cost")]
    pub reasoning_call_usd: f64,
}

fn default_search_cost() -> f64 {
    0.005
}
fn default_reasoning_cost() -> f64 {
    0.02
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            search_call_usd: default_search_cost(),
            reasoning_call_usd: default_reasoning_cost(),
        }
    }
}

impl CostModel {
    fn validate(&self) -> Result<()> {
        if !(self.search_call_usd >= 0.0 && self.reasoning_call_usd >= 0.0) {
            anyhow::bail!("call costs must be non-negative");
        }
        Ok(())
    }
}

/// Retry policy for transiently failing provider calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    2
}
fn default_initial_delay() -> u64 {
    500
}
fn default_max_delay() -> u64 {
    5000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = ResearchSettings::default();
        assert_eq!(settings.max_hops, 5);
        assert_eq!(settings.confidence_target, 0.70);
        assert_eq!(settings.early_stop_confidence, 0.85);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let settings: ResearchSettings = serde_yaml::from_str("max_hops: 2\ncosts:\n  search_call_usd: 0.0\n").unwrap();
        assert_eq!(settings.max_hops, 2);
        assert_eq!(settings.max_evidence_per_hypothesis, 5);
        assert_eq!(settings.costs.search_call_usd, 0.0);
        assert_eq!(settings.costs.reasoning_call_usd, 0.02);
    }

    #[test]
    fn test_early_stop_below_target_rejected() {
        let settings = ResearchSettings {
            confidence_target: 0.9,
            early_stop_confidence: 0.8,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_retry_policy_delays() {
        let policy = RetryPolicy {
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 10000,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(10000)); // Capped
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
        assert!(!RetryPolicy::no_retry().should_retry(1));
    }
}

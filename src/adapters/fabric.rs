//! Fabric-backed reasoning provider.
//!
//! Each reasoning call runs a Fabric pattern as a subprocess (`fabric -p
//! <pattern>`), writes a JSON request to stdin and parses the JSON answer from
//! stdout.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::wire;
use super::{ProviderError, ReasoningProvider, Reply};
use crate::domain::{Evidence, Hypothesis, HypothesisResult, Plan, Synthesis};

/// Pattern names used for each reasoning task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FabricPatterns {
    #[serde(default = "default_plan_pattern")]
    pub plan: String,

    #[serde(default = "default_hypotheses_pattern")]
    pub hypotheses: String,

    #[serde(default = "default_test_pattern")]
    pub test: String,

    #[serde(default = "default_synthesis_pattern")]
    pub synthesis: String,
}

fn default_plan_pattern() -> String {
    "research_plan".to_string()
}
fn default_hypotheses_pattern() -> String {
    "research_hypotheses".to_string()
}
fn default_test_pattern() -> String {
    "research_test_hypothesis".to_string()
}
fn default_synthesis_pattern() -> String {
    "research_synthesize".to_string()
}

impl Default for FabricPatterns {
    fn default() -> Self {
        Self {
            plan: default_plan_pattern(),
            hypotheses: default_hypotheses_pattern(),
            test: default_test_pattern(),
            synthesis: default_synthesis_pattern(),
        }
    }
}

/// Reasoning provider using the Fabric CLI in subprocess mode
pub struct FabricReasoner {
    /// Path to the fabric binary
    binary_path: String,

    /// Pattern per reasoning task
    patterns: FabricPatterns,

    /// Subprocess timeout
    call_timeout: Duration,
}

impl FabricReasoner {
    /// Create a reasoner running `binary_path` (from `providers.fabric_binary`)
    pub fn with_binary_path(
        binary_path: impl Into<String>,
        patterns: FabricPatterns,
        call_timeout: Duration,
    ) -> Self {
        Self {
            binary_path: binary_path.into(),
            patterns,
            call_timeout,
        }
    }

    /// Run a pattern with a JSON request on stdin, returning stdout
    async fn execute_subprocess(&self, pattern: &str, request: &Value) -> Result<String, ProviderError> {
        let input = request.to_string();

        let mut child = Command::new(&self.binary_path)
            .args(["-p", pattern])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ProviderError::unavailable(
                    self.name(),
                    format!("failed to spawn fabric for pattern '{}': {}", pattern, e),
                )
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes()).await.map_err(|e| {
                ProviderError::unavailable(self.name(), format!("failed to write to fabric stdin: {}", e))
            })?;
            // Drop stdin to signal EOF
        }

        let output = timeout(self.call_timeout, child.wait_with_output())
            .await
            .map_err(|_| ProviderError::Timeout {
                provider: self.name().to_string(),
                timeout: self.call_timeout,
            })?
            .map_err(|e| {
                ProviderError::unavailable(
                    self.name(),
                    format!("failed to wait for fabric pattern '{}': {}", pattern, e),
                )
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            return Err(ProviderError::unavailable(
                self.name(),
                format!(
                    "pattern '{}' failed with exit code {}: {}",
                    pattern,
                    exit_code,
                    stderr.trim()
                ),
            ));
        }

        debug!(pattern, bytes = output.stdout.len(), "Fabric pattern completed");
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ReasoningProvider for FabricReasoner {
    fn name(&self) -> &str {
        "fabric"
    }

    async fn plan(&self, query: &str) -> Reply<Plan> {
        match self
            .execute_subprocess(&self.patterns.plan, &wire::plan_request(query))
            .await
        {
            Ok(raw) => wire::parse_plan(&raw, query),
            Err(e) => Reply::Failed(e),
        }
    }

    async fn generate_hypotheses(&self, topic: &str) -> Reply<Vec<Hypothesis>> {
        match self
            .execute_subprocess(&self.patterns.hypotheses, &wire::hypotheses_request(topic))
            .await
        {
            Ok(raw) => wire::parse_hypotheses(&raw, topic),
            Err(e) => Reply::Failed(e),
        }
    }

    async fn test_hypothesis(
        &self,
        hypothesis: &Hypothesis,
        evidence: &[Evidence],
    ) -> Reply<HypothesisResult> {
        match self
            .execute_subprocess(&self.patterns.test, &wire::test_request(hypothesis, evidence))
            .await
        {
            Ok(raw) => wire::parse_test(&raw, hypothesis, evidence),
            Err(e) => Reply::Failed(e),
        }
    }

    async fn synthesize(&self, results: &[HypothesisResult]) -> Reply<Synthesis> {
        match self
            .execute_subprocess(&self.patterns.synthesis, &wire::synthesis_request(results))
            .await
        {
            Ok(raw) => wire::parse_synthesis(&raw),
            Err(e) => Reply::Failed(e),
        }
    }
}

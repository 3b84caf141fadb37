//! HTTP evidence provider for SearxNG-compatible search endpoints.
//!
//! Calls `GET {base_url}/search?q=<query>&format=json` and maps the `results`
//! array into evidence items.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{EvidenceProvider, ProviderError};
use crate::domain::Evidence;

/// Search response body
#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    score: Option<f64>,
}

/// Evidence provider backed by a JSON search API
pub struct HttpSearchProvider {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpSearchProvider {
    /// Create a provider for the given base URL
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    /// Base URL requests are sent to
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Convert raw hits into evidence
///
/// Scores are normalized by the best score in the batch. Hits without a score
/// get a rank-based relevance.
fn hits_to_evidence(hits: Vec<SearchHit>, max_results: usize) -> Vec<Evidence> {
    let best = hits
        .iter()
        .filter_map(|h| h.score)
        .filter(|s| s.is_finite() && *s > 0.0)
        .fold(0.0f64, f64::max);

    hits.into_iter()
        .filter(|h| !h.url.trim().is_empty())
        .take(max_results)
        .enumerate()
        .map(|(rank, hit)| {
            let relevance = match hit.score {
                Some(score) if best > 0.0 && score.is_finite() => score / best,
                _ => 1.0 / (rank as f64 + 1.0),
            };
            let text = match (hit.title.trim(), hit.content.trim()) {
                ("", content) => content.to_string(),
                (title, "") => title.to_string(),
                (title, content) => format!("{}: {}", title, content),
            };
            Evidence::new(text, hit.url, relevance)
        })
        .collect()
}

#[async_trait]
impl EvidenceProvider for HttpSearchProvider {
    fn name(&self) -> &str {
        "http-search"
    }

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<Evidence>, ProviderError> {
        let url = format!("{}/search", self.base_url);

        let response = self
            .client
            .get(&url)
            .query(&[("q", query), ("format", "json")])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout {
                        provider: self.name().to_string(),
                        timeout: self.timeout,
                    }
                } else {
                    ProviderError::unavailable(self.name(), e)
                }
            })?;

        if !response.status().is_success() {
            return Err(ProviderError::unavailable(
                self.name(),
                format!("search returned HTTP {}", response.status()),
            ));
        }

        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::unavailable(self.name(), format!("invalid search response: {}", e)))?;

        let evidence = hits_to_evidence(body.results, max_results);
        debug!(query, count = evidence.len(), "Search completed");
        Ok(evidence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(url: &str, score: Option<f64>) -> SearchHit {
        SearchHit {
            url: url.to_string(),
            title: "Title".to_string(),
            content: "Body".to_string(),
            score,
        }
    }

    #[test]
    fn test_scores_normalized_by_best() {
        let evidence = hits_to_evidence(
            vec![hit("https://a", Some(4.0)), hit("https://b", Some(2.0)), hit("", Some(9.0))],
            10,
        );

        // Empty URL dropped, but its score still counts as the batch best
        assert_eq!(evidence.len(), 2);
        assert!((evidence[0].relevance - 4.0 / 9.0).abs() < 1e-12);
        assert_eq!(evidence[0].text, "Title: Body");
    }

    #[test]
    fn test_rank_relevance_without_scores() {
        let evidence = hits_to_evidence(vec![hit("https://a", None), hit("https://b", None)], 1);
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].relevance, 1.0);
    }

    #[test]
    fn test_base_url_trimmed() {
        let provider = HttpSearchProvider::new("http://localhost:8888/", Duration::from_secs(1));
        assert_eq!(provider.base_url(), "http://localhost:8888");
    }
}

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use super::traits::SearchProvider;
use super::types::{ProviderError, SearchResult};

const ENDPOINT: &str = "https://www.googleapis.com/customsearch/v1";
pub const MAX_SEARCH_RESULTS: usize = 3;

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchResult>,
}

/// Google Custom Search JSON API.
pub struct GoogleSearch {
    client: Client,
    api_key: String,
    engine_id: String,
}

impl GoogleSearch {
    pub fn new(api_key: impl Into<String>, engine_id: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            engine_id: engine_id.into(),
        }
    }

    fn search_url(&self, query: &str) -> Result<Url, ProviderError> {
        let num = MAX_SEARCH_RESULTS.to_string();
        Url::parse_with_params(
            ENDPOINT,
            &[
                ("q", query),
                ("key", self.api_key.as_str()),
                ("cx", self.engine_id.as_str()),
                ("num", num.as_str()),
            ],
        )
        .map_err(|e| ProviderError::RequestFailed(format!("Invalid search URL: {}", e)))
    }

    fn parse_results(body: &str) -> Result<Vec<SearchResult>, ProviderError> {
        let parsed: SearchResponse = serde_json::from_str(body)
            .map_err(|e| ProviderError::InvalidResponse(format!("Failed to parse search results: {}", e)))?;
        Ok(parsed.items.into_iter().take(MAX_SEARCH_RESULTS).collect())
    }
}

#[async_trait]
impl SearchProvider for GoogleSearch {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, ProviderError> {
        tracing::debug!(%query, "Fetching search results");
        let url = self.search_url(query)?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::RequestFailed(format!(
                "Error fetching search results: {} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("")
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;
        Self::parse_results(&body)
    }
}

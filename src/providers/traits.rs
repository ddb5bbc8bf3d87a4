use async_trait::async_trait;
use tokio::sync::mpsc;

use super::types::{ChatRequest, ChatResponse, ModelInfo, ProviderError, SearchResult, StreamEvent};

/// Hosted language-model endpoint.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Stream tokens for `request` into `tx`. Returns once the stream has been
    /// fully forwarded; transport errors after the response started are sent
    /// as `StreamEvent::Error`.
    async fn stream(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError>;

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError>;
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, ProviderError>;
}

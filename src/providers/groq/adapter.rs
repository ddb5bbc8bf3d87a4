use std::cmp::Ordering;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tokio::sync::mpsc;

use super::models::*;
use super::stream::forward_sse;
use crate::models::Message;
use crate::providers::traits::CompletionProvider;
use crate::providers::types::{ChatRequest, ChatResponse, ModelInfo, ProviderError, StreamEvent};

pub const DEFAULT_BASE_URL: &str = "https://api.groq.com/openai";

const OWNER_PRIORITY: [&str; 4] = ["Meta", "Groq", "Google", "Mistral"];
const PREFERRED_MODEL: &str = "deepseek-r1-distill-llama-70b";

/// OpenAI-compatible completion endpoint (Groq by default).
pub struct GroqProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl GroqProvider {
    pub fn new(api_key: impl Into<String>, base_url: Option<&str>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base_url, path)
    }

    fn build_messages(messages: &[Message]) -> Vec<WireMessage<'_>> {
        messages
            .iter()
            .map(|m| WireMessage {
                role: m.role.as_str(),
                content: &m.content,
            })
            .collect()
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        if self.api_key.is_empty() {
            req
        } else {
            req.header("Authorization", format!("Bearer {}", self.api_key))
        }
    }

    fn parse_error_message(status: StatusCode, body: &str) -> String {
        if let Ok(parsed) = serde_json::from_str::<ErrorResponse>(body) {
            return format!("HTTP {}: {}", status.as_u16(), parsed.error.message);
        }
        format!("HTTP {}: Request failed", status.as_u16())
    }

    fn retry_after(response: &Response) -> Option<u64> {
        response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }

    /// Map non-success statuses onto `ProviderError`, passing 2xx through.
    async fn check_status(response: Response) -> Result<Response, ProviderError> {
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ProviderError::AuthError("Invalid API key".to_string()));
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited {
                retry_after_secs: Self::retry_after(&response),
            });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::RequestFailed(Self::parse_error_message(
                status, &body,
            )));
        }

        Ok(response)
    }

    async fn post_completion(
        &self,
        request: &ChatRequest,
        stream: bool,
    ) -> Result<Response, ProviderError> {
        let body = CompletionRequest {
            model: &request.model,
            messages: Self::build_messages(&request.messages),
            stream,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            top_p: request.top_p,
        };

        let req = self
            .client
            .post(self.endpoint("chat/completions"))
            .header("content-type", "application/json")
            .json(&body);

        let response = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        Self::check_status(response).await
    }
}

#[async_trait]
impl CompletionProvider for GroqProvider {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        tracing::debug!(model = %request.model, "Sending completion request");
        let response = self.post_completion(&request, false).await?;

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        let (tokens_in, tokens_out) = parsed
            .usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or((None, None));

        Ok(ChatResponse {
            content,
            model: parsed.model.unwrap_or(request.model),
            tokens_in,
            tokens_out,
        })
    }

    async fn stream(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        tracing::debug!(model = %request.model, "Starting streaming completion");
        let response = self.post_completion(&request, true).await?;
        forward_sse(response, tx).await;
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
        let req = self.client.get(self.endpoint("models"));
        let response = self.authorize(req).send().await.map_err(|e| {
            ProviderError::NetworkError(format!("Failed to connect to {}: {}", self.base_url, e))
        })?;
        let response = Self::check_status(response).await?;

        let list: ModelList = response.json().await.map_err(|e| {
            ProviderError::InvalidResponse(format!("Failed to parse model list: {}", e))
        })?;

        let mut models: Vec<ModelInfo> = list
            .data
            .into_iter()
            .map(|m| ModelInfo {
                id: m.id,
                owned_by: m.owned_by,
            })
            .collect();
        sort_models(&mut models);
        Ok(models)
    }
}

fn owner_rank(model: &ModelInfo) -> usize {
    model
        .owned_by
        .as_deref()
        .and_then(|owner| OWNER_PRIORITY.iter().position(|p| *p == owner))
        .unwrap_or(OWNER_PRIORITY.len())
}

/// Order models by owner priority; within one owner the preferred reasoning
/// model comes first and the rest keep their listed order.
pub fn sort_models(models: &mut [ModelInfo]) {
    models.sort_by(|a, b| match owner_rank(a).cmp(&owner_rank(b)) {
        Ordering::Equal => {
            let a_pref = a.id == PREFERRED_MODEL;
            let b_pref = b.id == PREFERRED_MODEL;
            b_pref.cmp(&a_pref)
        }
        other => other,
    });
}

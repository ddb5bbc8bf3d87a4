use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::context::ContextWindow;
use super::storage::Storage;

const SETTINGS_KEY: &str = "chat_settings";

pub const DEFAULT_MODEL: &str = "deepseek-r1-distill-llama-70b";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchMode {
    Off,
    /// Search before every reply.
    Always,
    /// Ask the model whether the latest message needs a search first.
    Auto,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSettings {
    pub model: String,
    /// Models tried in order when `model` fails within one attempt.
    pub fallback_models: Vec<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub stream_responses: bool,
    pub search_mode: SearchMode,
    pub system_prompt: Option<String>,
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub context: ContextWindow,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            fallback_models: Vec::new(),
            temperature: 0.5,
            max_tokens: 1024,
            top_p: 1.0,
            stream_responses: false,
            search_mode: SearchMode::Off,
            system_prompt: None,
            max_retries: 3,
            retry_base_delay_ms: 1000,
            request_timeout_secs: 30,
            context: ContextWindow::default(),
        }
    }
}

impl ChatSettings {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// `model` followed by its fallbacks, without duplicates.
    pub fn model_chain(&self) -> Vec<&str> {
        let mut chain = vec![self.model.as_str()];
        for model in &self.fallback_models {
            if !chain.contains(&model.as_str()) {
                chain.push(model);
            }
        }
        chain
    }
}

pub struct SettingsService;

impl SettingsService {
    pub fn load(storage: &dyn Storage) -> ChatSettings {
        match storage.load(SETTINGS_KEY) {
            Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_else(|e| {
                tracing::warn!("Ignoring unreadable chat settings: {}", e);
                ChatSettings::default()
            }),
            Ok(None) => ChatSettings::default(),
            Err(e) => {
                tracing::warn!("Failed to load chat settings: {:#}", e);
                ChatSettings::default()
            }
        }
    }

    pub fn save(storage: &dyn Storage, settings: &ChatSettings) -> Result<()> {
        let json = serde_json::to_string(settings)?;
        storage.save(SETTINGS_KEY, &json)
    }
}

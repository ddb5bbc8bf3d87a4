use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use crate::services::Database;

pub const APP_NAME: &str = "Arda";

/// Process configuration read from the environment at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub api_key: String,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub search: Option<SearchConfig>,
    pub database_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchConfig {
    pub api_key: String,
    pub engine_id: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let api_key = var("ARDA_API_KEY")
            .or_else(|| var("GROQ_API_KEY"))
            .context("Set ARDA_API_KEY (or GROQ_API_KEY) to your completion API key")?;

        let search = match (var("ARDA_SEARCH_KEY"), var("ARDA_SEARCH_ENGINE_ID")) {
            (Some(api_key), Some(engine_id)) => Some(SearchConfig { api_key, engine_id }),
            (None, None) => None,
            _ => bail!("ARDA_SEARCH_KEY and ARDA_SEARCH_ENGINE_ID must be set together"),
        };

        let database_path = match var("ARDA_DATA_DIR") {
            Some(dir) => PathBuf::from(dir).join("arda.db"),
            None => Database::default_path().context("Failed to locate the data directory")?,
        };

        Ok(Self {
            api_key,
            base_url: var("ARDA_BASE_URL"),
            model: var("ARDA_MODEL"),
            search,
            database_path,
        })
    }
}

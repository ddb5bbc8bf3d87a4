pub mod google;
pub mod groq;
pub mod traits;
pub mod types;

pub use google::GoogleSearch;
pub use groq::GroqProvider;
pub use traits::{CompletionProvider, SearchProvider};
pub use types::{ChatRequest, ChatResponse, ModelInfo, ProviderError, SearchResult, StreamEvent};

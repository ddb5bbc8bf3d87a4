mod adapter;
mod models;
mod stream;

pub use adapter::{sort_models, GroqProvider, DEFAULT_BASE_URL};
pub use stream::SseDecoder;

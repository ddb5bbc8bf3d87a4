pub mod context;
pub mod conversation;
pub mod database;
pub mod dispatcher;
pub mod markdown;
pub mod settings;
pub mod storage;
pub mod store;

pub use database::Database;
pub use dispatcher::{DispatchEvent, Dispatcher, TurnPhase};
pub use settings::SettingsService;
pub use store::{lock_store, ConversationStore};

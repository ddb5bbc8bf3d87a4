use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use super::storage::Storage;
use crate::models::{Conversation, Message, Role};

const CONVERSATIONS_KEY: &str = "conversations";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Message index {index} is out of range ({len} messages)")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Only user messages can be edited or deleted (message {index} is {role})")]
    NotUserMessage { index: usize, role: &'static str },

    #[error("Conversation {0} not found")]
    ConversationNotFound(String),

    #[error("Saved conversations are corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("Storage error: {0:#}")]
    Storage(anyhow::Error),
}

/// Store shared between the front end and the dispatcher worker.
pub type SharedStore = Arc<Mutex<ConversationStore>>;

pub fn lock_store(store: &SharedStore) -> MutexGuard<'_, ConversationStore> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Saved conversations plus the one currently shown, mirrored to storage on
/// every mutation.
pub struct ConversationStore {
    storage: Arc<dyn Storage>,
    conversations: Vec<Conversation>,
    active_id: String,
}

impl ConversationStore {
    pub fn open(storage: Arc<dyn Storage>) -> Result<Self, StoreError> {
        let conversations: Vec<Conversation> = match storage
            .load(CONVERSATIONS_KEY)
            .map_err(StoreError::Storage)?
        {
            Some(json) => serde_json::from_str(&json)?,
            None => Vec::new(),
        };

        let mut store = Self {
            storage,
            active_id: String::new(),
            conversations,
        };

        match store.most_recent_id() {
            Some(id) => store.active_id = id,
            None => {
                store.new_conversation()?;
            }
        }

        tracing::info!(
            "Loaded {} saved conversation(s)",
            store.conversations.len()
        );
        Ok(store)
    }

    pub fn into_shared(self) -> SharedStore {
        Arc::new(Mutex::new(self))
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn get(&self, id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    pub fn active(&self) -> &Conversation {
        // The active id always refers to a tracked conversation.
        self.get(&self.active_id)
            .unwrap_or_else(|| &self.conversations[self.conversations.len() - 1])
    }

    pub fn active_id(&self) -> &str {
        &self.active_id
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.conversations.iter().position(|c| c.id == id)
    }

    fn most_recent_id(&self) -> Option<String> {
        self.conversations
            .iter()
            .max_by_key(|c| c.updated_at)
            .map(|c| c.id.clone())
    }

    fn persist(&self) -> Result<(), StoreError> {
        let json = serde_json::to_string(&self.conversations)?;
        self.storage
            .save(CONVERSATIONS_KEY, &json)
            .map_err(StoreError::Storage)
    }

    /// Replace the saved entry with the same id, or append it, then write
    /// the whole list.
    pub fn update(&mut self, conversation: Conversation) -> Result<(), StoreError> {
        match self.position(&conversation.id) {
            Some(pos) => self.conversations[pos] = conversation,
            None => self.conversations.push(conversation),
        }
        self.persist()
    }

    pub fn new_conversation(&mut self) -> Result<&Conversation, StoreError> {
        let conversation = Conversation::new();
        let id = conversation.id.clone();
        tracing::debug!(conversation_id = %id, "Starting new conversation");
        self.active_id = id.clone();
        self.update(conversation)?;
        self.get(&id)
            .ok_or(StoreError::ConversationNotFound(id))
    }

    pub fn select(&mut self, id: &str) -> Result<(), StoreError> {
        if self.position(id).is_none() {
            return Err(StoreError::ConversationNotFound(id.to_string()));
        }
        self.active_id = id.to_string();
        Ok(())
    }

    pub fn rename(&mut self, id: &str, name: &str) -> Result<(), StoreError> {
        let mut conversation = self
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::ConversationNotFound(id.to_string()))?;
        let name = name.trim();
        conversation.name = if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        };
        conversation.touch();
        self.update(conversation)
    }

    /// Remove a conversation. When it was active, the most recently updated
    /// remaining conversation (or a fresh one) takes its place.
    pub fn delete_conversation(&mut self, id: &str) -> Result<(), StoreError> {
        let pos = self
            .position(id)
            .ok_or_else(|| StoreError::ConversationNotFound(id.to_string()))?;
        self.conversations.remove(pos);
        tracing::debug!(conversation_id = %id, "Deleted conversation");

        if self.active_id == id {
            match self.most_recent_id() {
                Some(next) => self.active_id = next,
                None => {
                    self.new_conversation()?;
                    return Ok(());
                }
            }
        }
        self.persist()
    }

    /// Append a message to the conversation with `conversation_id`.
    /// Returns `false` when that conversation is no longer tracked.
    pub fn append_message(
        &mut self,
        conversation_id: &str,
        message: Message,
    ) -> Result<bool, StoreError> {
        let Some(mut conversation) = self.get(conversation_id).cloned() else {
            return Ok(false);
        };
        conversation.messages.push(message);
        conversation.touch();
        self.update(conversation)?;
        Ok(true)
    }

    /// Append a user message to the active conversation.
    pub fn push_user_message(&mut self, content: &str) -> Result<(), StoreError> {
        let mut conversation = self.active().clone();
        conversation.messages.push(Message::user(content));
        conversation.touch();
        self.update(conversation)
    }

    fn check_user_message(conversation: &Conversation, index: usize) -> Result<(), StoreError> {
        let len = conversation.messages.len();
        let message = conversation
            .messages
            .get(index)
            .ok_or(StoreError::IndexOutOfRange { index, len })?;
        if message.role != Role::User {
            return Err(StoreError::NotUserMessage {
                index,
                role: message.role.as_str(),
            });
        }
        Ok(())
    }

    /// Drop message `index` and everything after it from the active
    /// conversation.
    pub fn delete(&mut self, index: usize) -> Result<(), StoreError> {
        let mut conversation = self.active().clone();
        Self::check_user_message(&conversation, index)?;
        conversation.messages.truncate(index);
        conversation.touch();
        self.update(conversation)
    }

    /// Replace message `index` of the active conversation and discard the
    /// replies after it. Returns the conversation to re-send.
    pub fn edit_and_truncate(
        &mut self,
        index: usize,
        content: &str,
    ) -> Result<Conversation, StoreError> {
        let mut conversation = self.active().clone();
        Self::check_user_message(&conversation, index)?;
        conversation.messages.truncate(index + 1);
        conversation.messages[index].content = content.to_string();
        conversation.touch();
        let snapshot = conversation.clone();
        self.update(conversation)?;
        Ok(snapshot)
    }

    pub fn set_name_if_unnamed(&mut self, id: &str, name: &str) -> Result<bool, StoreError> {
        let Some(mut conversation) = self.get(id).cloned() else {
            return Ok(false);
        };
        if conversation.name.is_some() {
            return Ok(false);
        }
        conversation.name = Some(name.to_string());
        self.update(conversation)?;
        Ok(true)
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::message::{Message, Role};

const LABEL_MAX_CHARS: usize = 15;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: None,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Whether a user message has been sent in this conversation yet.
    pub fn has_user_messages(&self) -> bool {
        self.messages.iter().any(|m| m.role == Role::User)
    }

    /// Sidebar label: the name shortened to 15 characters, or "Conversation N".
    pub fn label(&self, position: usize) -> String {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => {
                if name.chars().count() > LABEL_MAX_CHARS {
                    let short: String = name.chars().take(LABEL_MAX_CHARS).collect();
                    format!("{}...", short)
                } else {
                    name.to_string()
                }
            }
            _ => format!("Conversation {}", position + 1),
        }
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

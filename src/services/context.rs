use serde::{Deserialize, Serialize};

use crate::models::Message;

/// Bounds the history sent upstream. The newest message always goes out in
/// full; older ones are dropped, or truncated from the front, first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextWindow {
    pub max_messages: usize,
    pub max_chars: usize,
}

impl Default for ContextWindow {
    fn default() -> Self {
        Self {
            max_messages: 5,
            max_chars: 16_000,
        }
    }
}

impl ContextWindow {
    pub fn apply(&self, history: &[Message]) -> Vec<Message> {
        let mut kept: Vec<Message> = Vec::new();
        let mut used = 0usize;

        for (i, message) in history.iter().rev().enumerate() {
            if kept.len() >= self.max_messages.max(1) {
                break;
            }

            let len = message.content.chars().count();
            if i == 0 || used + len <= self.max_chars {
                used += len;
                kept.push(message.clone());
                continue;
            }

            let remaining = self.max_chars.saturating_sub(used);
            if remaining > 0 {
                kept.push(Message::new(
                    message.role,
                    tail_chars(&message.content, remaining),
                ));
            }
            break;
        }

        kept.reverse();
        kept
    }
}

fn tail_chars(text: &str, count: usize) -> String {
    let skip = text.chars().count().saturating_sub(count);
    text.chars().skip(skip).collect()
}

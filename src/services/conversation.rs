use crate::models::Message;

const NAME_MAX_CHARS: usize = 30;

/// Prompt appended to the history when asking the model to name a conversation.
pub fn naming_prompt(history: &[Message], first_message: &str) -> Vec<Message> {
    let mut messages = history.to_vec();
    messages.push(Message::user(format!(
        "Make 1 short title for a conversation about:{} only the title, no extra conversations",
        first_message
    )));
    messages
}

/// Clean up a model-generated title: first line, quotes and markdown
/// emphasis stripped, capped at 30 characters. `None` when nothing is left.
pub fn clean_title(raw: &str) -> Option<String> {
    let raw = strip_reasoning(raw);
    let line = raw.lines().map(str::trim).find(|l| !l.is_empty())?;
    let line = line
        .trim_start_matches("Title:")
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '*' || c == '#')
        .trim();
    if line.is_empty() {
        return None;
    }
    Some(line.chars().take(NAME_MAX_CHARS).collect())
}

/// Truncate text to a short title for conversations.
pub fn truncate_title(text: &str) -> String {
    let first_line = text.trim().lines().next().unwrap_or_default();
    if first_line.chars().count() > 50 {
        let short: String = first_line.chars().take(47).collect();
        format!("{}...", short)
    } else {
        first_line.to_string()
    }
}

// Reasoning models prefix their answer with a <think> block.
fn strip_reasoning(raw: &str) -> &str {
    match raw.rfind("</think>") {
        Some(end) => &raw[end + "</think>".len()..],
        None => raw,
    }
}

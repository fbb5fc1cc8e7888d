use std::collections::VecDeque;

use base64::Engine as _;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    /// Raw base64 PNG payload; each provider adapter wraps it in its own wire
    /// format.
    Image { base64_png: String },
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    /// User message carrying a screenshot alongside text.
    pub fn user_with_image(text: impl Into<String>, image_bytes: &[u8]) -> Self {
        let b64 = base64::engine::general_purpose::STANDARD.encode(image_bytes);
        Self {
            role: Role::User,
            content: MessageContent::Parts(vec![
                ContentPart::Text { text: text.into() },
                ContentPart::Image { base64_png: b64 },
            ]),
        }
    }

    /// Concatenated text content, ignoring image parts.
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    fn has_image(&self) -> bool {
        matches!(&self.content, MessageContent::Parts(parts)
            if parts.iter().any(|p| matches!(p, ContentPart::Image { .. })))
    }
}

/// Drops image parts from every message, for providers without vision
/// support. Messages that were text-only pass through untouched.
pub fn degrade_to_text(messages: &[Message]) -> Vec<Message> {
    messages
        .iter()
        .map(|m| {
            if m.has_image() {
                Message {
                    role: m.role,
                    content: MessageContent::Text(m.text()),
                }
            } else {
                m.clone()
            }
        })
        .collect()
}

/// Bounded conversation history: a pinned system message plus a deque of
/// alternating user/assistant turns. When more than `max_pairs` exchange
/// pairs accumulate, the oldest pair is evicted; the system message is never
/// evicted.
#[derive(Debug, Clone)]
pub struct MessageHistory {
    system: Message,
    turns: VecDeque<Message>,
    max_pairs: usize,
}

impl MessageHistory {
    pub fn new(system_prompt: impl Into<String>, max_pairs: usize) -> Self {
        Self {
            system: Message::system(system_prompt),
            turns: VecDeque::new(),
            max_pairs,
        }
    }

    /// Replaces the system prompt without touching the turn history.
    pub fn set_system(&mut self, system_prompt: impl Into<String>) {
        self.system = Message::system(system_prompt);
    }

    pub fn push(&mut self, message: Message) {
        self.turns.push_back(message);
        self.flush();
    }

    /// Evicts whole (user, assistant) pairs oldest-first once over capacity.
    fn flush(&mut self) {
        while self.turns.len() > 2 * self.max_pairs {
            self.turns.pop_front();
            self.turns.pop_front();
        }
    }

    /// System message followed by the retained turns, for an engine call.
    pub fn as_messages(&self) -> Vec<Message> {
        let mut out = Vec::with_capacity(1 + self.turns.len());
        out.push(self.system.clone());
        out.extend(self.turns.iter().cloned());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_evicts_oldest_pair_and_keeps_system() {
        let mut history = MessageHistory::new("sys", 2);
        for i in 0..4 {
            history.push(Message::user(format!("u{i}")));
            history.push(Message::assistant(format!("a{i}")));
        }
        let messages = history.as_messages();
        // system + 2 retained pairs
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1].text(), "u2");
        assert_eq!(messages[4].text(), "a3");
    }

    #[test]
    fn degrade_strips_images_but_keeps_text() {
        let messages = vec![
            Message::user("plain"),
            Message::user_with_image("with shot", &[1, 2, 3]),
        ];
        let degraded = degrade_to_text(&messages);
        assert!(matches!(degraded[0].content, MessageContent::Text(_)));
        assert!(matches!(degraded[1].content, MessageContent::Text(_)));
        assert_eq!(degraded[1].text(), "with shot");
    }
}

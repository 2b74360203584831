use crate::models::Message;
use std::collections::HashSet;

/// Ordered, append-only message history of one thread.
#[derive(Debug, Default, Clone)]
pub struct MessageLog {
    messages: Vec<Message>,
    ids: HashSet<String>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `message` unless its id is already present. Timestamps never
    /// go backwards: an earlier stamp is raised to the previous message's.
    pub fn append(&mut self, mut message: Message) -> Option<&Message> {
        if self.ids.contains(&message.id) {
            return None;
        }
        if let Some(last) = self.messages.last() {
            if message.timestamp < last.timestamp {
                message.timestamp = last.timestamp;
            }
        }
        self.ids.insert(message.id.clone());
        self.messages.push(message);
        self.messages.last()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn all(&self) -> &[Message] {
        &self.messages
    }

    pub fn tail(&self, limit: Option<usize>) -> Vec<Message> {
        let start = match limit {
            Some(limit) => self.messages.len().saturating_sub(limit),
            None => 0,
        };
        self.messages[start..].to_vec()
    }
}

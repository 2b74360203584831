use crate::models::{Message, Role};
use serde::Serialize;
use std::collections::VecDeque;

/// One rendered line of a connection's conversation view.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TranscriptEntry {
    Message(Message),
    /// Local notices ("connected", tool calls, errors). Never stored.
    Notice { role: Role, content: String },
}

impl TranscriptEntry {
    pub fn role(&self) -> Role {
        match self {
            Self::Message(message) => message.role,
            Self::Notice { role, .. } => *role,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Self::Message(message) => &message.content,
            Self::Notice { content, .. } => content,
        }
    }
}

/// What a connection has rendered so far, oldest entries dropped past `limit`.
#[derive(Debug, Clone)]
pub struct Transcript {
    entries: VecDeque<TranscriptEntry>,
    limit: usize,
    dropped: usize,
}

impl Transcript {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            limit: limit.max(1),
            dropped: 0,
        }
    }

    pub fn push_message(&mut self, message: Message) {
        self.push(TranscriptEntry::Message(message));
    }

    pub fn push_notice(&mut self, role: Role, content: impl Into<String>) {
        self.push(TranscriptEntry::Notice {
            role,
            content: content.into(),
        });
    }

    fn push(&mut self, entry: TranscriptEntry) {
        if self.entries.len() >= self.limit {
            self.entries.pop_front();
            self.dropped = self.dropped.saturating_add(1);
        }
        self.entries.push_back(entry);
    }

    pub fn entries(&self) -> impl Iterator<Item = &TranscriptEntry> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&TranscriptEntry> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Count of rendered entries with this role and content.
    pub fn count_matching(&self, role: Role, content: &str) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.role() == role && entry.content() == content)
            .count()
    }
}

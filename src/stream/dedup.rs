use std::collections::{HashSet, VecDeque};

/// Bounded set of "already rendered" keys. Once full, the oldest key is
/// evicted to make room.
#[derive(Debug, Clone)]
pub struct SeenCache {
    keys: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            keys: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    /// Marks `key` as seen. Returns `false` if it was already present.
    pub fn insert(&mut self, key: String) -> bool {
        if self.keys.contains(&key) {
            return false;
        }
        while self.order.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.keys.remove(&evicted);
            }
        }
        self.order.push_back(key.clone());
        self.keys.insert(key);
        true
    }

    pub fn clear(&mut self) {
        self.keys.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// The two per-connection dedup sets: rendered messages and rendered
/// tool-call batches.
#[derive(Debug, Clone)]
pub struct DedupState {
    pub messages: SeenCache,
    pub tool_calls: SeenCache,
}

impl DedupState {
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: SeenCache::new(capacity),
            tool_calls: SeenCache::new(capacity),
        }
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.tool_calls.clear();
    }
}

pub fn message_key(role: &str, content: &str) -> String {
    format!("{}:{}", role, content)
}

/// Key of a tool-call batch: its JSON serialization. Object keys serialize
/// in sorted order, so equal payloads give equal keys.
pub fn tool_calls_key(tool_calls: &serde_json::Value) -> String {
    tool_calls.to_string()
}

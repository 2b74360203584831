use crate::config::ThreadsConfig;
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::messages::MessageLog;
use crate::models::{
    CreateThreadRequest, Message, Role, Thread, ThreadRecord, ThreadSummary, DEFAULT_THREAD_NAME,
    DISPLAY_NAME_MAX_CHARS,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;

#[derive(Debug)]
struct ThreadEntry {
    record: ThreadRecord,
    log: MessageLog,
}

impl ThreadEntry {
    fn summary(&self) -> ThreadSummary {
        ThreadSummary {
            id: self.record.id.clone(),
            display_name: self.record.display_name.clone(),
            created_at: self.record.created_at,
            last_message_time: self.record.last_message_time,
            message_count: self.log.len(),
        }
    }

    fn snapshot(&self) -> Thread {
        Thread {
            id: self.record.id.clone(),
            display_name: self.record.display_name.clone(),
            created_at: self.record.created_at,
            last_message_time: self.record.last_message_time,
            messages: self.log.all().to_vec(),
        }
    }
}

type SharedEntry = Arc<Mutex<ThreadEntry>>;

/// Known conversation threads and their message history.
///
/// The map itself sits behind an `RwLock`; each thread has its own mutex so
/// appends to one thread are serialized (and persisted in the same order)
/// without blocking other threads.
pub struct ThreadRegistry {
    threads: RwLock<HashMap<String, SharedEntry>>,
    store: Option<Arc<Database>>,
    settings: ThreadsConfig,
}

impl ThreadRegistry {
    pub fn new(store: Option<Arc<Database>>, settings: ThreadsConfig) -> AppResult<Self> {
        let registry = Self {
            threads: RwLock::new(HashMap::new()),
            store,
            settings,
        };
        registry.hydrate()?;
        registry.ensure_default_thread()?;
        Ok(registry)
    }

    pub fn in_memory(settings: ThreadsConfig) -> AppResult<Self> {
        Self::new(None, settings)
    }

    pub fn default_thread_id(&self) -> &str {
        &self.settings.default_thread_id
    }

    fn hydrate(&self) -> AppResult<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let records = store.load_threads()?;
        let mut threads = self.write_map()?;
        for record in records {
            let mut log = MessageLog::new();
            for message in store.load_messages(&record.id)? {
                log.append(message);
            }
            threads.insert(record.id.clone(), Arc::new(Mutex::new(ThreadEntry { record, log })));
        }
        tracing::info!(threads = threads.len(), "thread history loaded");
        Ok(())
    }

    fn ensure_default_thread(&self) -> AppResult<()> {
        let default_id = self.settings.default_thread_id.clone();
        if self.contains(&default_id)? {
            return Ok(());
        }
        let welcome = self.settings.welcome_message.clone();
        match self.insert_thread(default_id, None, welcome, None) {
            Ok(_) | Err(AppError::Conflict(_)) => Ok(()),
            Err(error) => Err(error),
        }
    }

    pub fn contains(&self, thread_id: &str) -> AppResult<bool> {
        Ok(self.read_map()?.contains_key(thread_id))
    }

    pub fn create_thread(&self, request: CreateThreadRequest) -> AppResult<Thread> {
        let id = match request.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => format!("thread-{}", Uuid::new_v4()),
        };
        let name = request
            .name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(ToString::to_string);
        let welcome = self.settings.new_thread_message.clone();
        let thread = self.insert_thread(id, name, welcome, request.system_message)?;
        tracing::info!(thread_id = %thread.id, "thread created");
        Ok(thread)
    }

    /// Returns the thread with this id, creating it when unknown.
    pub fn ensure_thread(&self, thread_id: &str) -> AppResult<Thread> {
        if let Some(entry) = self.find(thread_id)? {
            return Self::lock_entry(&entry).map(|entry| entry.snapshot());
        }
        let request = CreateThreadRequest {
            id: Some(thread_id.to_string()),
            ..CreateThreadRequest::default()
        };
        match self.create_thread(request) {
            Err(AppError::Conflict(_)) => self.switch_thread(thread_id),
            other => other,
        }
    }

    fn insert_thread(
        &self,
        id: String,
        name: Option<String>,
        welcome: Option<String>,
        system_message: Option<String>,
    ) -> AppResult<Thread> {
        let now = Utc::now();
        let record = ThreadRecord {
            id: id.clone(),
            display_name: name.clone().unwrap_or_else(|| DEFAULT_THREAD_NAME.to_string()),
            name_locked: name.is_some(),
            created_at: now,
            last_message_time: now,
        };
        let entry = Arc::new(Mutex::new(ThreadEntry {
            record,
            log: MessageLog::new(),
        }));

        // Hold the entry lock across insertion so nobody observes the thread
        // before its opening messages are in place.
        let mut guard = Self::lock_entry(&entry)?;
        {
            let mut threads = self.write_map()?;
            if threads.contains_key(&id) {
                return Err(AppError::Conflict(format!("Thread {} already exists", id)));
            }
            threads.insert(id.clone(), entry.clone());
        }

        self.persist_thread(&guard.record);
        if let Some(text) = welcome.filter(|text| !text.trim().is_empty()) {
            self.append_locked(&mut guard, new_message(&id, Role::Assistant, text));
        }
        if let Some(text) = system_message.filter(|text| !text.trim().is_empty()) {
            self.append_locked(&mut guard, new_message(&id, Role::System, text));
        }
        Ok(guard.snapshot())
    }

    /// Threads ordered by most recent activity first.
    pub fn list_threads(&self) -> AppResult<Vec<ThreadSummary>> {
        let entries: Vec<SharedEntry> = self.read_map()?.values().cloned().collect();
        let mut summaries = Vec::with_capacity(entries.len());
        for entry in entries {
            summaries.push(Self::lock_entry(&entry)?.summary());
        }
        summaries.sort_by(|a, b| {
            b.last_message_time
                .cmp(&a.last_message_time)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(summaries)
    }

    pub fn switch_thread(&self, thread_id: &str) -> AppResult<Thread> {
        let entry = self.require(thread_id)?;
        let guard = Self::lock_entry(&entry)?;
        Ok(guard.snapshot())
    }

    pub fn summary(&self, thread_id: &str) -> AppResult<ThreadSummary> {
        let entry = self.require(thread_id)?;
        let guard = Self::lock_entry(&entry)?;
        Ok(guard.summary())
    }

    pub fn messages(&self, thread_id: &str, limit: Option<usize>) -> AppResult<Vec<Message>> {
        let entry = self.require(thread_id)?;
        let guard = Self::lock_entry(&entry)?;
        Ok(guard.log.tail(limit))
    }

    pub fn append(&self, thread_id: &str, role: Role, content: impl Into<String>) -> AppResult<Message> {
        let entry = self.require(thread_id)?;
        let mut guard = Self::lock_entry(&entry)?;
        let message = new_message(thread_id, role, content.into());
        self.append_locked(&mut guard, message.clone())
            .ok_or_else(|| AppError::Internal(format!("message id collision in thread {}", thread_id)))
    }

    /// Appends a message carrying its own id. Returns `false` when a message
    /// with that id is already stored.
    pub fn append_message(&self, message: Message) -> AppResult<bool> {
        let entry = self.require(&message.thread_id)?;
        let mut guard = Self::lock_entry(&entry)?;
        Ok(self.append_locked(&mut guard, message).is_some())
    }

    pub fn rename_thread(&self, thread_id: &str, title: &str) -> AppResult<ThreadSummary> {
        let title = title.trim();
        if title.is_empty() {
            return Err(AppError::Validation("Thread title cannot be empty".to_string()));
        }
        let entry = self.require(thread_id)?;
        let mut guard = Self::lock_entry(&entry)?;
        guard.record.display_name = title.to_string();
        guard.record.name_locked = true;
        self.persist_thread(&guard.record);
        Ok(guard.summary())
    }

    fn append_locked(&self, entry: &mut ThreadEntry, message: Message) -> Option<Message> {
        let stored = entry.log.append(message)?.clone();
        entry.record.last_message_time = stored.timestamp;
        if stored.role == Role::User && !entry.record.name_locked {
            if let Some(name) = derive_display_name(&stored.content) {
                entry.record.display_name = name;
                entry.record.name_locked = true;
            }
        }
        if let Some(store) = &self.store {
            if let Err(error) = store.insert_message(&stored) {
                tracing::warn!(thread_id = %stored.thread_id, error = %error, "failed to persist message, keeping in memory only");
            }
        }
        self.persist_thread(&entry.record);
        Some(stored)
    }

    fn persist_thread(&self, record: &ThreadRecord) {
        if let Some(store) = &self.store {
            if let Err(error) = store.upsert_thread(record) {
                tracing::warn!(thread_id = %record.id, error = %error, "failed to persist thread");
            }
        }
    }

    fn find(&self, thread_id: &str) -> AppResult<Option<SharedEntry>> {
        Ok(self.read_map()?.get(thread_id).cloned())
    }

    fn require(&self, thread_id: &str) -> AppResult<SharedEntry> {
        self.find(thread_id)?
            .ok_or_else(|| AppError::NotFound(format!("Thread {} not found", thread_id)))
    }

    fn read_map(&self) -> AppResult<std::sync::RwLockReadGuard<'_, HashMap<String, SharedEntry>>> {
        self.threads
            .read()
            .map_err(|_| AppError::Internal("thread registry lock poisoned".to_string()))
    }

    fn write_map(&self) -> AppResult<std::sync::RwLockWriteGuard<'_, HashMap<String, SharedEntry>>> {
        self.threads
            .write()
            .map_err(|_| AppError::Internal("thread registry lock poisoned".to_string()))
    }

    fn lock_entry(entry: &SharedEntry) -> AppResult<std::sync::MutexGuard<'_, ThreadEntry>> {
        entry
            .lock()
            .map_err(|_| AppError::Internal("thread mutex poisoned".to_string()))
    }
}

fn new_message(thread_id: &str, role: Role, content: String) -> Message {
    Message {
        id: Uuid::new_v4().to_string(),
        role,
        content,
        thread_id: thread_id.to_string(),
        timestamp: Utc::now(),
    }
}

/// First line of the message, truncated.
pub fn derive_display_name(content: &str) -> Option<String> {
    let first_line = content.lines().next().unwrap_or_default().trim();
    if first_line.is_empty() {
        return None;
    }
    Some(first_line.chars().take(DISPLAY_NAME_MAX_CHARS).collect())
}

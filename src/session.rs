use crate::agents::AgentRequest;
use crate::config::SessionConfig;
use crate::errors::{AppError, AppResult};
use crate::metrics::{MetricsAggregator, ResponseTimeTracker};
use crate::models::{CreateThreadRequest, Message, Metrics, Role, SessionSummary};
use crate::protocol::{ChatMessagePayload, Event, SubmitPayload, ToolCallsPayload, TokenStreamPayload, TypingPayload};
use crate::stream::{message_key, tool_calls_key, DedupState, StreamOutcome, StreamingReassembler, Transcript};
use crate::threads::ThreadRegistry;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const ANONYMOUS_USER: &str = "anonymous";
pub const CONNECTED_NOTICE: &str = "Connected to SQL Matic";

/// Live socket connections, keyed by client id. A reconnect with the same
/// client id replaces the earlier registration.
#[derive(Clone, Default)]
pub struct SessionManager {
    sessions: Arc<Mutex<HashMap<String, SessionSummary>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn open_session(&self, client_id: &str, thread_id: &str, user_id: &str) -> String {
        let session_id = Uuid::new_v4().to_string();
        let summary = SessionSummary {
            session_id: session_id.clone(),
            client_id: client_id.to_string(),
            thread_id: thread_id.to_string(),
            user_id: user_id.to_string(),
            opened_at: Utc::now(),
        };

        let mut sessions = self.sessions.lock().await;
        if let Some(previous) = sessions.insert(client_id.to_string(), summary) {
            tracing::info!(client_id = %client_id, previous_session = %previous.session_id, "client reconnected, replacing session");
        }
        session_id
    }

    pub async fn session_id(&self, client_id: &str) -> Option<String> {
        let sessions = self.sessions.lock().await;
        sessions.get(client_id).map(|entry| entry.session_id.clone())
    }

    pub async fn update_thread(&self, client_id: &str, session_id: &str, thread_id: &str) -> AppResult<()> {
        let mut sessions = self.sessions.lock().await;
        let Some(entry) = sessions.get_mut(client_id).filter(|entry| entry.session_id == session_id) else {
            return Err(AppError::NotFound(format!("No active session for client {}", client_id)));
        };
        entry.thread_id = thread_id.to_string();
        Ok(())
    }

    /// Removes the registration only if it still belongs to `session_id`.
    pub async fn close_session(&self, client_id: &str, session_id: &str) {
        let mut sessions = self.sessions.lock().await;
        if sessions.get(client_id).is_some_and(|entry| entry.session_id == session_id) {
            sessions.remove(client_id);
        }
    }

    pub async fn list(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.lock().await;
        let mut list: Vec<SessionSummary> = sessions.values().cloned().collect();
        list.sort_by(|a, b| a.opened_at.cmp(&b.opened_at).then_with(|| a.client_id.cmp(&b.client_id)));
        list
    }
}

#[derive(Clone)]
pub struct SessionContext {
    pub threads: Arc<ThreadRegistry>,
    pub response_times: Arc<ResponseTimeTracker>,
    pub settings: SessionConfig,
}

#[derive(Debug, Clone, Default)]
pub struct SessionParams {
    pub client_id: String,
    pub thread_id: Option<String>,
    pub user_id: Option<String>,
}

/// Protocol state of one connection.
///
/// Owned by a single task; every transition runs synchronously in arrival
/// order. Methods return the frames to send back to the browser.
pub struct ChatSession {
    client_id: String,
    user_id: String,
    thread_id: String,
    context: SessionContext,
    reassembler: StreamingReassembler,
    dedup: DedupState,
    metrics: MetricsAggregator,
    transcript: Transcript,
    typing: Option<DateTime<Utc>>,
    turn_active: bool,
    closed: bool,
    last_finalized: Option<Message>,
}

impl ChatSession {
    pub fn open(params: SessionParams, context: SessionContext) -> AppResult<Self> {
        let thread = match params.thread_id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
            Some(thread_id) => context.threads.ensure_thread(thread_id)?,
            None => context.threads.create_thread(CreateThreadRequest::default())?,
        };
        let user_id = params
            .user_id
            .filter(|user| !user.trim().is_empty())
            .unwrap_or_else(|| ANONYMOUS_USER.to_string());

        let mut transcript = Transcript::new(context.settings.transcript_limit);
        transcript.push_notice(Role::System, CONNECTED_NOTICE);
        tracing::info!(client_id = %params.client_id, thread_id = %thread.id, user_id = %user_id, "chat session opened");

        Ok(Self {
            client_id: params.client_id,
            user_id,
            thread_id: thread.id,
            dedup: DedupState::new(context.settings.dedup_capacity),
            context,
            reassembler: StreamingReassembler::new(),
            metrics: MetricsAggregator::new(),
            transcript,
            typing: None,
            turn_active: false,
            closed: false,
            last_finalized: None,
        })
    }

    /// Accepts a user message and prepares the agent turn for it.
    pub fn submit(&mut self, payload: SubmitPayload) -> AppResult<AgentRequest> {
        if self.closed {
            return Err(AppError::Protocol("Session is closed".to_string()));
        }
        if payload.message.trim().is_empty() {
            return Err(AppError::Validation("Message cannot be empty".to_string()));
        }
        if self.turn_active {
            return Err(AppError::Validation(
                "A response is still streaming; wait for it to finish".to_string(),
            ));
        }

        if let Some(requested) = payload.thread_id.as_deref().filter(|id| !id.is_empty()) {
            if requested != self.thread_id {
                let thread = self.context.threads.switch_thread(requested)?;
                tracing::debug!(client_id = %self.client_id, from = %self.thread_id, to = %thread.id, "switched thread");
                self.thread_id = thread.id;
            }
        }
        if let Some(user_id) = payload.user_id.filter(|user| !user.trim().is_empty()) {
            self.user_id = user_id;
        }

        let message = self.context.threads.append(&self.thread_id, Role::User, payload.message)?;
        self.dedup.clear();
        self.dedup.messages.insert(message_key(Role::User.as_str(), &message.content));
        self.metrics.reset();
        self.transcript.push_message(message.clone());
        self.turn_active = true;

        Ok(AgentRequest {
            thread_id: self.thread_id.clone(),
            user_id: self.user_id.clone(),
            text: message.content,
            history: self.context.threads.messages(&self.thread_id, None)?,
        })
    }

    /// Applies one collaborator event and returns the frames to forward.
    pub fn handle_event(&mut self, event: Event) -> AppResult<Vec<Event>> {
        if self.closed {
            return Ok(Vec::new());
        }
        match event {
            Event::ChatMessage(payload) => self.on_chat_message(payload),
            Event::TokenStream(payload) => self.on_token(payload),
            Event::TypingIndicator(payload) => Ok(self.on_typing(payload)),
            Event::Error(payload) => {
                self.transcript.push_notice(Role::Error, payload.message.clone());
                Ok(vec![Event::Error(payload)])
            }
            Event::ToolCalls(payload) => Ok(self.on_tool_calls(payload)),
            Event::Metrics(payload) => self.on_metrics(payload),
        }
    }

    fn on_chat_message(&mut self, payload: ChatMessagePayload) -> AppResult<Vec<Event>> {
        let role = payload.message.role;
        let key = message_key(role.as_str(), &payload.message.content);
        if role == Role::User {
            self.dedup.messages.insert(key);
            return Ok(Vec::new());
        }
        if !self.dedup.messages.insert(key) {
            return Ok(Vec::new());
        }
        if role == Role::Error {
            self.transcript.push_notice(Role::Error, payload.message.content.clone());
            return Ok(vec![Event::ChatMessage(payload)]);
        }

        let message = Message {
            id: payload.message.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string()),
            role,
            content: payload.message.content.clone(),
            thread_id: self.thread_id.clone(),
            timestamp: Utc::now(),
        };
        if self.context.threads.append_message(message.clone())? {
            self.transcript.push_message(message);
            Ok(vec![Event::ChatMessage(payload)])
        } else {
            Ok(Vec::new())
        }
    }

    fn on_token(&mut self, payload: TokenStreamPayload) -> AppResult<Vec<Event>> {
        let state = match self.reassembler.push(&payload) {
            StreamOutcome::Started { .. } | StreamOutcome::Appended { .. } => {
                return Ok(vec![Event::TokenStream(payload)]);
            }
            StreamOutcome::Finalized(state) => state,
            StreamOutcome::FinalizedWithoutStream(state) => {
                tracing::warn!(
                    client_id = %self.client_id,
                    message_id = %state.message_id,
                    "completion arrived for a message that never streamed"
                );
                state
            }
        };

        let message = Message {
            id: state.message_id,
            role: Role::Assistant,
            content: state.accumulated_content,
            thread_id: self.thread_id.clone(),
            timestamp: Utc::now(),
        };
        self.dedup
            .messages
            .insert(message_key(Role::Assistant.as_str(), &message.content));
        if self.context.threads.append_message(message.clone())? {
            self.transcript.push_message(message.clone());
            self.last_finalized = Some(message);
        }
        Ok(vec![Event::TokenStream(payload)])
    }

    fn on_typing(&mut self, payload: TypingPayload) -> Vec<Event> {
        match (payload.is_typing, self.typing.is_some()) {
            (true, false) => {
                self.typing = Some(Utc::now());
                vec![Event::TypingIndicator(payload)]
            }
            (false, true) => {
                self.typing = None;
                vec![Event::TypingIndicator(payload)]
            }
            _ => Vec::new(),
        }
    }

    fn on_tool_calls(&mut self, payload: ToolCallsPayload) -> Vec<Event> {
        if !self.dedup.tool_calls.insert(tool_calls_key(&payload.tool_calls)) {
            return Vec::new();
        }
        self.transcript
            .push_notice(Role::System, format!("Tool calls: {}", tool_call_names(&payload.tool_calls)));
        vec![Event::ToolCalls(payload)]
    }

    fn on_metrics(&mut self, payload: serde_json::Value) -> AppResult<Vec<Event>> {
        self.metrics.replace(payload.clone());
        self.context
            .response_times
            .record(&self.thread_id, &self.metrics.current(), self.metrics.total_time())?;
        Ok(vec![Event::Metrics(payload)])
    }

    /// Ends the running turn. Streams still open are dropped unfinished.
    pub fn finish_turn(&mut self, result: AppResult<()>) -> Vec<Event> {
        self.turn_active = false;
        let abandoned = self.reassembler.abandon();
        if !abandoned.is_empty() {
            tracing::warn!(client_id = %self.client_id, streams = abandoned.len(), "turn ended with unfinished streams");
        }

        let mut frames = Vec::new();
        if let Err(error) = result {
            frames.push(self.error_frame(&error));
        }
        if self.typing.take().is_some() {
            frames.push(Event::typing(false));
        }
        frames
    }

    /// Records a failure as an error notice and builds its frame.
    pub fn error_frame(&mut self, error: &AppError) -> Event {
        let message = error.message().to_string();
        self.transcript.push_notice(Role::Error, message.clone());
        Event::error(message, Some(self.thread_id.clone()))
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.turn_active = false;
        self.typing = None;
        let abandoned = self.reassembler.abandon();
        tracing::info!(client_id = %self.client_id, thread_id = %self.thread_id, abandoned = abandoned.len(), "chat session closed");
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn is_typing(&self) -> bool {
        self.typing.is_some()
    }

    pub fn is_streaming(&self) -> bool {
        self.turn_active
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn metrics(&self) -> Metrics {
        self.metrics.current()
    }

    pub fn reassembler(&self) -> &StreamingReassembler {
        &self.reassembler
    }

    pub fn last_finalized(&self) -> Option<&Message> {
        self.last_finalized.as_ref()
    }
}

fn tool_call_names(tool_calls: &serde_json::Value) -> String {
    let names: Vec<&str> = match tool_calls {
        serde_json::Value::Array(calls) => calls
            .iter()
            .filter_map(|call| call.get("name").and_then(|name| name.as_str()))
            .collect(),
        serde_json::Value::Object(call) => call.get("name").and_then(|name| name.as_str()).into_iter().collect(),
        _ => Vec::new(),
    };
    if names.is_empty() {
        "unnamed".to_string()
    } else {
        names.join(", ")
    }
}

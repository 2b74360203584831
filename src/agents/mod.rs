//! Agent collaborators.
//!
//! An agent turns one user message into a sequence of protocol [`Event`]s,
//! pushed into a channel as they are produced. Agents own their message ids.

pub mod command;
pub mod echo;

use crate::config::{AgentConfig, AgentKind, AgentTypeConfig};
use crate::errors::{AppError, AppResult};
use crate::models::Message;
use crate::protocol::Event;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use command::CommandAgent;
pub use echo::EchoAgent;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub kind: AgentKind,
}

impl AgentInfo {
    fn from_config(id: &str, config: &AgentTypeConfig) -> Self {
        Self {
            id: id.to_string(),
            name: config.name.clone().unwrap_or_else(|| id.to_string()),
            description: config.description.clone().unwrap_or_default(),
            kind: config.kind,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentListing {
    pub active: String,
    pub agents: Vec<AgentInfo>,
}

/// One turn's input.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub thread_id: String,
    pub user_id: String,
    pub text: String,
    /// Thread history up to and including the user message.
    pub history: Vec<Message>,
}

pub type AgentFuture = Pin<Box<dyn Future<Output = AppResult<()>> + Send>>;

pub trait Agent: Send + Sync {
    fn info(&self) -> &AgentInfo;

    fn validate(&self, request: &AgentRequest) -> AppResult<()> {
        if request.text.trim().is_empty() {
            return Err(AppError::Validation("Message cannot be empty".to_string()));
        }
        Ok(())
    }

    /// Runs the turn. The future resolves once the agent is done emitting.
    fn stream(&self, request: AgentRequest, events: mpsc::Sender<Event>) -> AgentFuture;
}

/// Pushes one event to the session, failing once the session has gone away.
pub(crate) async fn emit(events: &mpsc::Sender<Event>, event: Event) -> AppResult<()> {
    events
        .send(event)
        .await
        .map_err(|_| AppError::Transport("session stopped receiving agent events".to_string()))
}

pub struct AgentRegistry {
    agents: BTreeMap<String, Arc<dyn Agent>>,
    active: RwLock<String>,
}

impl AgentRegistry {
    pub fn from_config(config: &AgentConfig) -> AppResult<Self> {
        let mut agents: BTreeMap<String, Arc<dyn Agent>> = BTreeMap::new();
        for (id, agent_config) in &config.types {
            let info = AgentInfo::from_config(id, agent_config);
            let agent: Arc<dyn Agent> = match agent_config.kind {
                AgentKind::Echo => Arc::new(EchoAgent::new(info, agent_config.token_delay_ms)),
                AgentKind::Command => Arc::new(CommandAgent::from_config(info, agent_config)?),
            };
            agents.insert(id.clone(), agent);
        }
        if agents.is_empty() {
            let fallback = AgentTypeConfig::default();
            let info = AgentInfo::from_config(&config.default_type, &fallback);
            agents.insert(config.default_type.clone(), Arc::new(EchoAgent::new(info, 0)));
        }

        let active = if agents.contains_key(&config.default_type) {
            config.default_type.clone()
        } else {
            let first = agents.keys().next().cloned().unwrap_or_default();
            tracing::warn!(
                requested = %config.default_type,
                using = %first,
                "default agent type is not configured, using the first configured agent"
            );
            first
        };

        Ok(Self {
            agents,
            active: RwLock::new(active),
        })
    }

    pub fn active_id(&self) -> AppResult<String> {
        self.active
            .read()
            .map(|active| active.clone())
            .map_err(|_| AppError::Internal("agent registry lock poisoned".to_string()))
    }

    pub fn list(&self) -> AppResult<AgentListing> {
        Ok(AgentListing {
            active: self.active_id()?,
            agents: self.agents.values().map(|agent| agent.info().clone()).collect(),
        })
    }

    /// Looks up `agent_id`, falling back to the active agent when it is
    /// absent or unknown.
    pub fn resolve(&self, agent_id: Option<&str>) -> AppResult<Arc<dyn Agent>> {
        if let Some(requested) = agent_id {
            if let Some(agent) = self.agents.get(requested) {
                return Ok(agent.clone());
            }
            tracing::warn!(agent_id = %requested, "unknown agent requested, using the active agent");
        }
        let active = self.active_id()?;
        self.agents
            .get(&active)
            .cloned()
            .ok_or_else(|| AppError::Internal(format!("active agent {} is not registered", active)))
    }

    pub fn set_active(&self, agent_id: &str) -> AppResult<AgentInfo> {
        let agent = self
            .agents
            .get(agent_id)
            .ok_or_else(|| AppError::NotFound(format!("Agent {} not found", agent_id)))?;
        let mut active = self
            .active
            .write()
            .map_err(|_| AppError::Internal("agent registry lock poisoned".to_string()))?;
        *active = agent_id.to_string();
        tracing::info!(agent_id = %agent_id, "active agent changed");
        Ok(agent.info().clone())
    }
}

#[derive(Debug)]
pub enum TurnSignal {
    Event(Event),
    /// Sent once, after the last event of the turn.
    Finished(AppResult<()>),
}

/// A running turn. Dropping it aborts the agent.
#[derive(Debug)]
pub struct TurnHandle {
    task: JoinHandle<()>,
}

impl TurnHandle {
    pub fn abort(&self) {
        self.task.abort();
    }
}

impl Drop for TurnHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Runs `agent` on its own task, forwarding its events and then a
/// [`TurnSignal::Finished`] into `signals`.
pub fn spawn_turn(
    agent: Arc<dyn Agent>,
    request: AgentRequest,
    signals: mpsc::Sender<TurnSignal>,
    buffer: usize,
) -> TurnHandle {
    let task = tokio::spawn(async move {
        if let Err(error) = agent.validate(&request) {
            let _ = signals.send(TurnSignal::Finished(Err(error))).await;
            return;
        }
        let agent_id = agent.info().id.clone();
        let thread_id = request.thread_id.clone();
        let (events_tx, mut events_rx) = mpsc::channel::<Event>(buffer.max(1));
        let run = agent.stream(request, events_tx);

        let forward = async {
            while let Some(event) = events_rx.recv().await {
                if signals.send(TurnSignal::Event(event)).await.is_err() {
                    break;
                }
            }
        };
        let (result, ()) = tokio::join!(run, forward);

        if let Err(error) = &result {
            tracing::warn!(agent_id = %agent_id, thread_id = %thread_id, error = %error, "agent turn failed");
        }
        let _ = signals.send(TurnSignal::Finished(result)).await;
    });
    TurnHandle { task }
}

#[cfg(test)]
mod tests {
    use super::{spawn_turn, AgentRegistry, AgentRequest, TurnSignal};
    use crate::config::{AgentConfig, AgentKind, AgentTypeConfig};
    use crate::errors::AppError;
    use crate::protocol::Event;
    use tokio::sync::mpsc;

    fn two_agent_config() -> AgentConfig {
        let mut config = AgentConfig::default();
        config.types.insert(
            "fast".to_string(),
            AgentTypeConfig {
                kind: AgentKind::Echo,
                name: Some("Fast echo".to_string()),
                ..AgentTypeConfig::default()
            },
        );
        config
    }

    fn request(text: &str) -> AgentRequest {
        AgentRequest {
            thread_id: "default".to_string(),
            user_id: "u1".to_string(),
            text: text.to_string(),
            history: Vec::new(),
        }
    }

    #[test]
    fn unknown_agent_falls_back_to_active() {
        let registry = AgentRegistry::from_config(&two_agent_config()).expect("registry");
        assert_eq!(registry.active_id().expect("active"), "sql");
        assert_eq!(registry.resolve(Some("missing")).expect("fallback").info().id, "sql");
        assert_eq!(registry.resolve(Some("fast")).expect("fast").info().name, "Fast echo");
        assert_eq!(registry.resolve(None).expect("default").info().id, "sql");
    }

    #[test]
    fn set_active_switches_default_and_rejects_unknown_ids() {
        let registry = AgentRegistry::from_config(&two_agent_config()).expect("registry");
        registry.set_active("fast").expect("switch");
        assert_eq!(registry.resolve(None).expect("active").info().id, "fast");
        let err = registry.set_active("nope").err().expect("unknown");
        assert!(matches!(err, AppError::NotFound(_)));
        assert_eq!(registry.list().expect("list").agents.len(), 2);
    }

    #[test]
    fn missing_default_type_uses_first_agent() {
        let mut config = two_agent_config();
        config.default_type = "absent".to_string();
        let registry = AgentRegistry::from_config(&config).expect("registry");
        assert_eq!(registry.active_id().expect("active"), "fast");
    }

    #[tokio::test]
    async fn spawn_turn_forwards_events_then_finishes() {
        let registry = AgentRegistry::from_config(&AgentConfig::default()).expect("registry");
        let agent = registry.resolve(None).expect("agent");
        let (signals_tx, mut signals_rx) = mpsc::channel(64);
        let _turn = spawn_turn(agent, request("hello"), signals_tx, 16);

        let mut events = Vec::new();
        loop {
            match signals_rx.recv().await.expect("signal") {
                TurnSignal::Event(event) => events.push(event),
                TurnSignal::Finished(result) => {
                    result.expect("turn succeeded");
                    break;
                }
            }
        }
        assert!(matches!(events.first(), Some(Event::ChatMessage(_))));
        assert!(matches!(events.last(), Some(Event::Metrics(_))));
    }

    #[tokio::test]
    async fn spawn_turn_reports_validation_failures() {
        let registry = AgentRegistry::from_config(&AgentConfig::default()).expect("registry");
        let agent = registry.resolve(None).expect("agent");
        let (signals_tx, mut signals_rx) = mpsc::channel(4);
        let _turn = spawn_turn(agent, request("   "), signals_tx, 4);
        match signals_rx.recv().await.expect("signal") {
            TurnSignal::Finished(Err(AppError::Validation(_))) => {}
            other => panic!("unexpected signal {:?}", other),
        }
    }
}

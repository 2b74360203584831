//! HTTP surface: REST endpoints plus the chat WebSocket.

pub mod ws;

use crate::agents::{spawn_turn, AgentInfo, AgentListing, AgentRegistry, TurnSignal};
use crate::config::{AppConfig, CorsConfig};
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::metrics::ResponseTimeTracker;
use crate::models::{
    ChatRequest, ChatResponse, CreateThreadRequest, DatabaseMetadata, Metrics, MessagesQuery,
    RenameThreadRequest, SchemaSnapshot, Thread, ThreadMetricsSummary, ThreadSummary,
};
use crate::protocol::SubmitPayload;
use crate::schema::SchemaFetcher;
use crate::session::{ChatSession, SessionContext, SessionManager, SessionParams};
use crate::threads::ThreadRegistry;
use axum::extract::{Path, Query, State};
use axum::http::HeaderValue;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub threads: Arc<ThreadRegistry>,
    pub agents: Arc<AgentRegistry>,
    pub sessions: SessionManager,
    pub schema: SchemaFetcher,
    pub response_times: Arc<ResponseTimeTracker>,
}

impl AppState {
    pub fn from_config(config: AppConfig) -> AppResult<Self> {
        let store = match &config.chat_db.path {
            Some(path) => {
                tracing::info!(path = %path.display(), "opening chat database");
                Some(Arc::new(Database::new(path)?))
            }
            None => None,
        };
        let threads = ThreadRegistry::new(store, config.threads.clone())?;
        let agents = AgentRegistry::from_config(&config.agent)?;
        Ok(Self {
            threads: Arc::new(threads),
            agents: Arc::new(agents),
            sessions: SessionManager::new(),
            schema: SchemaFetcher::from_config(&config.query_db),
            response_times: Arc::new(ResponseTimeTracker::new()),
            config: Arc::new(config),
        })
    }

    pub fn session_context(&self) -> SessionContext {
        SessionContext {
            threads: self.threads.clone(),
            response_times: self.response_times.clone(),
            settings: self.config.session.clone(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors);
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/api/chat", post(chat))
        .route("/api/threads", get(list_threads).post(create_thread))
        .route("/api/threads/{id}", get(get_thread))
        .route("/api/threads/{id}/messages", get(thread_messages))
        .route("/api/threads/{id}/title", put(rename_thread))
        .route("/api/threads/{id}/metrics", get(thread_metrics))
        .route("/api/metrics", get(latest_metrics))
        .route("/api/database/schema", get(database_schema))
        .route("/api/database/metadata", get(database_metadata))
        .route("/api/agents", get(list_agents))
        .route("/api/agents/active/{id}", put(set_active_agent))
        .route("/api/sessions", get(list_sessions))
        .route("/ws/{client_id}", get(ws::ws_handler))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(config: &CorsConfig) -> CorsLayer {
    let origin = if config.origins.iter().any(|origin| origin == "*") {
        AllowOrigin::mirror_request()
    } else {
        let origins: Vec<HeaderValue> = config
            .origins
            .iter()
            .filter_map(|origin| match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(origin = %origin, "ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        AllowOrigin::list(origins)
    };
    CorsLayer::new()
        .allow_origin(origin)
        .allow_credentials(config.credentials)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
}

/// Binds the configured address and serves until the process stops.
pub async fn run_server(state: AppState) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.app.host, state.config.app.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "listening");
    serve(listener, state).await
}

pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn root() -> Json<Value> {
    Json(json!({ "message": "SQL Matic API is running" }))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "activeSessions": state.sessions.list().await.len(),
    }))
}

/// Runs one turn without a socket and returns the finished reply.
async fn chat(State(state): State<AppState>, Json(request): Json<ChatRequest>) -> AppResult<Json<ChatResponse>> {
    let agent = state.agents.resolve(request.agent_id.as_deref())?;
    let thread_id = request
        .thread_id
        .clone()
        .unwrap_or_else(|| state.threads.default_thread_id().to_string());
    let mut session = ChatSession::open(
        SessionParams {
            client_id: format!("rest-{}", Uuid::new_v4()),
            thread_id: Some(thread_id),
            user_id: request.user_id.clone(),
        },
        state.session_context(),
    )?;
    let turn_request = session.submit(SubmitPayload {
        message: request.message,
        thread_id: None,
        user_id: request.user_id,
        agent_id: request.agent_id,
    })?;

    let buffer = state.config.session.outbound_buffer;
    let (signals_tx, mut signals_rx) = mpsc::channel(buffer.max(1));
    let _turn = spawn_turn(agent, turn_request, signals_tx, buffer);
    loop {
        match signals_rx.recv().await {
            Some(TurnSignal::Event(event)) => {
                session.handle_event(event)?;
            }
            Some(TurnSignal::Finished(Ok(()))) => {
                session.finish_turn(Ok(()));
                break;
            }
            Some(TurnSignal::Finished(Err(error))) => {
                session.close();
                return Err(error);
            }
            None => {
                session.close();
                return Err(AppError::Internal("agent turn ended without finishing".to_string()));
            }
        }
    }

    let reply = session.last_finalized().cloned();
    let response = ChatResponse {
        text: reply.as_ref().map(|message| message.content.clone()).unwrap_or_default(),
        message_id: reply.map(|message| message.id),
        thread_id: session.thread_id().to_string(),
        metrics: session.metrics(),
    };
    session.close();
    Ok(Json(response))
}

async fn list_threads(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let threads: Vec<ThreadSummary> = state.threads.list_threads()?;
    Ok(Json(json!({ "threads": threads })))
}

async fn create_thread(
    State(state): State<AppState>,
    payload: Option<Json<CreateThreadRequest>>,
) -> AppResult<Json<Thread>> {
    let request = payload.map(|Json(body)| body).unwrap_or_default();
    Ok(Json(state.threads.create_thread(request)?))
}

async fn get_thread(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<Thread>> {
    Ok(Json(state.threads.switch_thread(&id)?))
}

async fn thread_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> AppResult<Json<Value>> {
    let messages = state.threads.messages(&id, query.limit)?;
    Ok(Json(json!({ "messages": messages })))
}

async fn rename_thread(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<RenameThreadRequest>,
) -> AppResult<Json<ThreadSummary>> {
    Ok(Json(state.threads.rename_thread(&id, &request.title)?))
}

async fn thread_metrics(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<ThreadMetricsSummary>> {
    state.threads.summary(&id)?;
    Ok(Json(state.response_times.summary(&id)?))
}

async fn latest_metrics(State(state): State<AppState>) -> AppResult<Json<Metrics>> {
    Ok(Json(state.response_times.latest()?))
}

async fn database_schema(State(state): State<AppState>) -> AppResult<Json<SchemaSnapshot>> {
    Ok(Json(state.schema.fetch_schema().await?))
}

async fn database_metadata(State(state): State<AppState>) -> AppResult<Json<DatabaseMetadata>> {
    Ok(Json(state.schema.fetch_metadata().await?))
}

async fn list_agents(State(state): State<AppState>) -> AppResult<Json<AgentListing>> {
    Ok(Json(state.agents.list()?))
}

async fn set_active_agent(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<AgentInfo>> {
    Ok(Json(state.agents.set_active(&id)?))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "sessions": state.sessions.list().await }))
}

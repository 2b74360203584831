//! YAML configuration.
//!
//! Loaded from `CONFIG_PATH` (or `config.yaml` in the working directory).
//! A missing file yields the defaults below; `PORT` and `QUERY_DB_PATH`
//! override the file.

use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const CONFIG_PATH_ENV: &str = "CONFIG_PATH";
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: ServerConfig,
    pub cors: CorsConfig,
    pub query_db: QueryDbConfig,
    pub chat_db: ChatDbConfig,
    pub logging: LoggingConfig,
    pub session: SessionConfig,
    pub threads: ThreadsConfig,
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    /// `["*"]` mirrors any origin.
    pub origins: Vec<String>,
    pub credentials: bool,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            origins: vec!["*".to_string()],
            credentials: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryDbConfig {
    pub path: PathBuf,
    pub timeout_ms: u64,
}

impl Default for QueryDbConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/query.db"),
            timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatDbConfig {
    /// Without a path, history lives in memory only.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub dir: Option<PathBuf>,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub dedup_capacity: usize,
    pub transcript_limit: usize,
    pub outbound_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            dedup_capacity: 512,
            transcript_limit: 500,
            outbound_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadsConfig {
    pub default_thread_id: String,
    pub welcome_message: Option<String>,
    pub new_thread_message: Option<String>,
}

impl Default for ThreadsConfig {
    fn default() -> Self {
        Self {
            default_thread_id: "default".to_string(),
            welcome_message: Some(
                "# Welcome to SQL Matic!\n\nI'm your SQL assistant. You can ask me questions about SQL queries, database design, or specific SQL commands."
                    .to_string(),
            ),
            new_thread_message: Some("# New Thread Started\n\nHow can I help you with SQL today?".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentKind {
    Echo,
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentTypeConfig {
    pub kind: AgentKind,
    pub name: Option<String>,
    pub description: Option<String>,
    pub program: Option<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub timeout_ms: Option<u64>,
    /// Pause between streamed tokens of the echo agent.
    pub token_delay_ms: u64,
}

impl Default for AgentTypeConfig {
    fn default() -> Self {
        Self {
            kind: AgentKind::Echo,
            name: None,
            description: None,
            program: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            timeout_ms: None,
            token_delay_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub default_type: String,
    pub types: BTreeMap<String, AgentTypeConfig>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let mut types = BTreeMap::new();
        types.insert("sql".to_string(), AgentTypeConfig::default());
        Self {
            default_type: "sql".to_string(),
            types,
        }
    }
}

impl AppConfig {
    /// Resolves the config path from the environment and loads it.
    pub fn load() -> AppResult<Self> {
        let path = std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
        let mut config = Self::from_path(&path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_path(path: &Path) -> AppResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|error| AppError::Io(format!("failed to read {}: {}", path.display(), error)))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> AppResult<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(port) = std::env::var("PORT").ok().and_then(|raw| raw.parse::<u16>().ok()) {
            self.app.port = port;
        }
        if let Ok(path) = std::env::var("QUERY_DB_PATH") {
            if !path.trim().is_empty() {
                self.query_db.path = PathBuf::from(path);
            }
        }
    }

    fn validate(&self) -> AppResult<()> {
        if self.threads.default_thread_id.trim().is_empty() {
            return Err(AppError::Validation("threads.default_thread_id cannot be empty".to_string()));
        }
        for (id, agent) in &self.agent.types {
            if agent.kind == AgentKind::Command && agent.program.as_deref().map_or(true, |p| p.trim().is_empty()) {
                return Err(AppError::Validation(format!(
                    "agent '{}' is a command agent but has no program",
                    id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{AgentKind, AppConfig};
    use crate::errors::AppError;
    use std::path::Path;

    #[test]
    fn missing_file_yields_defaults() {
        let config = AppConfig::from_path(Path::new("/nonexistent/config.yaml")).expect("defaults");
        assert_eq!(config.app.port, 8000);
        assert_eq!(config.threads.default_thread_id, "default");
        assert!(config.agent.types.contains_key("sql"));
    }

    #[test]
    fn parses_partial_yaml_sections() {
        let config = AppConfig::from_yaml(
            r#"
app:
  port: 9100
query_db:
  path: /tmp/sample.db
agent:
  default_type: shell
  types:
    shell:
      kind: command
      program: /usr/bin/my-agent
      args: ["--stream"]
      timeout_ms: 30000
"#,
        )
        .expect("config");
        assert_eq!(config.app.port, 9100);
        assert_eq!(config.app.host, "0.0.0.0");
        assert_eq!(config.query_db.timeout_ms, 5_000);
        let shell = config.agent.types.get("shell").expect("shell agent");
        assert_eq!(shell.kind, AgentKind::Command);
        assert_eq!(shell.args, vec!["--stream".to_string()]);
        assert_eq!(config.session.dedup_capacity, 512);
    }

    #[test]
    fn command_agents_require_a_program() {
        let err = AppConfig::from_yaml("agent:\n  types:\n    broken:\n      kind: command\n").expect_err("invalid");
        assert!(matches!(err, AppError::Validation(_)));
    }
}

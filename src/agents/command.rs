use super::{emit, Agent, AgentFuture, AgentInfo, AgentRequest};
use crate::config::AgentTypeConfig;
use crate::errors::{AppError, AppResult};
use crate::protocol::{Event, RawEnvelope};
use crate::stream::LineBuffer;
use serde_json::json;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use uuid::Uuid;

const MAX_PENDING_LINE_BYTES: usize = 256 * 1024;
const STDERR_TAIL_BYTES: usize = 2048;

/// Runs an external program per turn.
///
/// The prompt goes to stdin; `THREAD_ID` and `USER_ID` are set in the
/// environment. Each stdout line that is a `{type, payload}` envelope is
/// forwarded as an event; any other line is streamed as text.
pub struct CommandAgent {
    info: AgentInfo,
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    timeout: Option<Duration>,
}

impl CommandAgent {
    pub fn from_config(info: AgentInfo, config: &AgentTypeConfig) -> AppResult<Self> {
        let program = config
            .program
            .clone()
            .filter(|program| !program.trim().is_empty())
            .ok_or_else(|| AppError::Validation(format!("agent '{}' has no program", info.id)))?;
        Ok(Self {
            info,
            program,
            args: config.args.clone(),
            env: config.env.clone(),
            timeout: config.timeout_ms.map(Duration::from_millis),
        })
    }
}

#[derive(Debug, Default)]
struct PumpState {
    text_streamed: bool,
    metrics_forwarded: bool,
    typing: bool,
}

impl Agent for CommandAgent {
    fn info(&self) -> &AgentInfo {
        &self.info
    }

    fn stream(&self, request: AgentRequest, events: mpsc::Sender<Event>) -> AgentFuture {
        let agent_id = self.info.id.clone();
        let program = self.program.clone();
        let args = self.args.clone();
        let env = self.env.clone();
        let limit = self.timeout;

        Box::pin(async move {
            let started = Instant::now();
            let mut command = Command::new(&program);
            command
                .args(&args)
                .envs(&env)
                .env("THREAD_ID", &request.thread_id)
                .env("USER_ID", &request.user_id)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            let mut child = command
                .spawn()
                .map_err(|error| AppError::Collaborator(format!("failed to start agent {}: {}", program, error)))?;
            tracing::debug!(agent_id = %agent_id, thread_id = %request.thread_id, program = %program, "agent process started");

            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(request.text.as_bytes())
                    .await
                    .map_err(|error| AppError::Io(format!("failed to write agent stdin: {}", error)))?;
                let _ = stdin.shutdown().await;
            }

            let stderr_task = child.stderr.take().map(|mut stderr| {
                tokio::spawn(async move {
                    let mut raw = Vec::new();
                    let _ = stderr.read_to_end(&mut raw).await;
                    tail(&String::from_utf8_lossy(&raw), STDERR_TAIL_BYTES)
                })
            });

            let message_id = Uuid::new_v4().to_string();
            let mut state = PumpState::default();
            let pumped = {
                let pump = pump_stdout(&mut child, &events, &message_id, &request.thread_id, &mut state);
                match limit {
                    Some(limit) => tokio::time::timeout(limit, pump).await.ok(),
                    None => Some(pump.await),
                }
            };

            let status = match pumped {
                Some(result) => result?,
                None => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Err(AppError::Collaborator(format!(
                        "agent {} timed out after {} ms",
                        agent_id,
                        limit.map(|limit| limit.as_millis()).unwrap_or_default()
                    )));
                }
            };

            let stderr_tail = match stderr_task {
                Some(task) => task.await.unwrap_or_default(),
                None => String::new(),
            };
            if !status.success() {
                let code = status.code().map(|code| code.to_string()).unwrap_or_else(|| "signal".to_string());
                let mut message = format!("agent {} exited with status {}", agent_id, code);
                if !stderr_tail.trim().is_empty() {
                    message.push_str(": ");
                    message.push_str(stderr_tail.trim());
                }
                return Err(AppError::Collaborator(message));
            }

            if state.text_streamed {
                emit(&events, Event::token(&message_id, "", true, &request.thread_id)).await?;
            }
            if state.typing {
                emit(&events, Event::typing(false)).await?;
            }
            if !state.metrics_forwarded {
                emit(
                    &events,
                    Event::Metrics(json!({
                        "performance": {"totalTime": started.elapsed().as_secs_f64() * 1000.0}
                    })),
                )
                .await?;
            }
            Ok(())
        })
    }
}

async fn pump_stdout(
    child: &mut Child,
    events: &mpsc::Sender<Event>,
    message_id: &str,
    thread_id: &str,
    state: &mut PumpState,
) -> AppResult<std::process::ExitStatus> {
    if let Some(mut stdout) = child.stdout.take() {
        let mut chunk = vec![0_u8; 4096];
        let mut lines = LineBuffer::new(Some(MAX_PENDING_LINE_BYTES));
        loop {
            let size = stdout
                .read(&mut chunk)
                .await
                .map_err(|error| AppError::Io(format!("failed to read agent output: {}", error)))?;
            if size == 0 {
                break;
            }
            for line in lines.push(&chunk[..size]) {
                handle_line(&line, events, message_id, thread_id, state).await?;
            }
            let discarded = lines.take_discarded_bytes();
            if discarded > 0 {
                tracing::warn!(bytes = discarded, "agent output line too long, dropped its start");
            }
        }
        if let Some(rest) = lines.finish() {
            handle_line(&rest, events, message_id, thread_id, state).await?;
        }
    }
    child
        .wait()
        .await
        .map_err(|error| AppError::Io(format!("failed to wait for agent: {}", error)))
}

async fn handle_line(
    line: &str,
    events: &mpsc::Sender<Event>,
    message_id: &str,
    thread_id: &str,
    state: &mut PumpState,
) -> AppResult<()> {
    if line.trim_start().starts_with('{') {
        if let Ok(envelope) = serde_json::from_str::<RawEnvelope>(line) {
            return match Event::from_envelope(envelope) {
                Ok(event) => {
                    match &event {
                        Event::Metrics(_) => state.metrics_forwarded = true,
                        Event::TypingIndicator(typing) => state.typing = typing.is_typing,
                        _ => {}
                    }
                    emit(events, event).await
                }
                Err(error) => {
                    tracing::warn!(error = %error, "agent emitted an unusable event, skipping");
                    Ok(())
                }
            };
        }
    }

    if !state.text_streamed && !state.typing {
        emit(events, Event::typing(true)).await?;
        state.typing = true;
    }
    state.text_streamed = true;
    emit(events, Event::token(message_id, format!("{}\n", line), false, thread_id)).await
}

fn tail(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use super::{tail, CommandAgent};
    use crate::agents::{Agent, AgentInfo, AgentRequest};
    use crate::config::{AgentKind, AgentTypeConfig};
    use crate::errors::AppError;
    use crate::protocol::Event;
    use tokio::sync::mpsc;

    fn shell_agent(script: &str, timeout_ms: Option<u64>) -> CommandAgent {
        let config = AgentTypeConfig {
            kind: AgentKind::Command,
            program: Some("/bin/sh".to_string()),
            args: vec!["-c".to_string(), script.to_string()],
            timeout_ms,
            ..AgentTypeConfig::default()
        };
        let info = AgentInfo {
            id: "shell".to_string(),
            name: "Shell".to_string(),
            description: String::new(),
            kind: AgentKind::Command,
        };
        CommandAgent::from_config(info, &config).expect("agent")
    }

    fn request(text: &str) -> AgentRequest {
        AgentRequest {
            thread_id: "t1".to_string(),
            user_id: "u1".to_string(),
            text: text.to_string(),
            history: Vec::new(),
        }
    }

    async fn run(agent: &CommandAgent, text: &str) -> (Result<(), AppError>, Vec<Event>) {
        let (tx, mut rx) = mpsc::channel(256);
        let result = agent.stream(request(text), tx).await;
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (result, events)
    }

    #[tokio::test]
    async fn plain_output_is_streamed_and_completed() {
        let agent = shell_agent("read line; echo \"$THREAD_ID says $line\"", None);
        let (result, events) = run(&agent, "hello\n").await;
        result.expect("success");

        let tokens: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                Event::TokenStream(token) => Some(token.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(tokens.first().map(|token| token.token.as_str()), Some("t1 says hello\n"));
        assert!(tokens.last().expect("completion").is_complete);
        assert!(matches!(events.last(), Some(Event::Metrics(_))));
    }

    #[tokio::test]
    async fn envelope_lines_are_forwarded_as_events() {
        let agent = shell_agent(
            r#"echo '{"type":"tool_calls","payload":{"tool_calls":[{"name":"sqlite_get_schema","args":{}}]}}'
echo '{"type":"metrics","payload":{"tokenUsage":{"total":3}}}'"#,
            None,
        );
        let (result, events) = run(&agent, "schema?").await;
        result.expect("success");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type(), "tool_calls");
        assert_eq!(events[1].event_type(), "metrics");
    }

    #[tokio::test]
    async fn multi_byte_output_on_a_read_boundary_is_intact() {
        let agent = shell_agent(
            r#"s=$(head -c 4095 /dev/zero | tr '\0' a); printf '%s\303\251\n' "$s""#,
            None,
        );
        let (result, events) = run(&agent, "go").await;
        result.expect("success");

        let text: String = events
            .iter()
            .filter_map(|event| match event {
                Event::TokenStream(token) => Some(token.token.as_str()),
                _ => None,
            })
            .collect();
        assert!(!text.contains('\u{fffd}'));
        assert!(text.ends_with("a\u{e9}\n"));
        assert_eq!(text.chars().filter(|c| *c == 'a').count(), 4095);
    }

    #[tokio::test]
    async fn non_zero_exit_reports_stderr_tail() {
        let agent = shell_agent("echo 'no such table: users' >&2; exit 3", None);
        let (result, _) = run(&agent, "select").await;
        match result {
            Err(AppError::Collaborator(message)) => {
                assert!(message.contains("status 3"));
                assert!(message.contains("no such table: users"));
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn slow_agents_time_out() {
        let agent = shell_agent("sleep 5", Some(100));
        let (result, _) = run(&agent, "wait").await;
        assert!(matches!(result, Err(AppError::Collaborator(message)) if message.contains("timed out")));
    }

    #[test]
    fn tail_respects_char_boundaries() {
        assert_eq!(tail("abc", 10), "abc");
        assert_eq!(tail("héllo", 4), "llo");
    }
}

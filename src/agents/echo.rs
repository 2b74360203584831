use super::{emit, Agent, AgentFuture, AgentInfo, AgentRequest};
use crate::models::Role;
use crate::protocol::{ChatMessageBody, ChatMessagePayload, Event};
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Replies `Echo: <text>`, streamed word by word with the full event
/// sequence a real model backend produces.
pub struct EchoAgent {
    info: AgentInfo,
    token_delay: Duration,
}

impl EchoAgent {
    pub fn new(info: AgentInfo, token_delay_ms: u64) -> Self {
        Self {
            info,
            token_delay: Duration::from_millis(token_delay_ms),
        }
    }
}

pub fn echo_reply(text: &str) -> String {
    format!("Echo: {}", text)
}

impl Agent for EchoAgent {
    fn info(&self) -> &AgentInfo {
        &self.info
    }

    fn stream(&self, request: AgentRequest, events: mpsc::Sender<Event>) -> AgentFuture {
        let token_delay = self.token_delay;
        Box::pin(async move {
            let started = Instant::now();
            let thread_id = request.thread_id;

            emit(
                &events,
                Event::ChatMessage(ChatMessagePayload {
                    message: ChatMessageBody {
                        id: None,
                        role: Role::User,
                        content: request.text.clone(),
                    },
                    thread_id: Some(thread_id.clone()),
                }),
            )
            .await?;
            emit(&events, Event::typing(true)).await?;

            let message_id = Uuid::new_v4().to_string();
            let reply = echo_reply(&request.text);
            let llm_started = Instant::now();
            for word in reply.split_inclusive(' ') {
                emit(&events, Event::token(&message_id, word, false, &thread_id)).await?;
                if !token_delay.is_zero() {
                    tokio::time::sleep(token_delay).await;
                }
            }
            let llm_time = llm_started.elapsed().as_secs_f64() * 1000.0;
            emit(&events, Event::token(&message_id, "", true, &thread_id)).await?;
            emit(&events, Event::typing(false)).await?;

            let prompt = request.text.split_whitespace().count() as u64;
            let completion = reply.split_whitespace().count() as u64;
            emit(
                &events,
                Event::Metrics(json!({
                    "tokenUsage": {"prompt": prompt, "completion": completion, "total": prompt + completion},
                    "performance": {
                        "totalTime": started.elapsed().as_secs_f64() * 1000.0,
                        "llmTime": llm_time
                    },
                    "toolUsage": {"totalCalls": 0, "lastUsed": null}
                })),
            )
            .await
        })
    }
}

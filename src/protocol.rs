//! Wire format of the chat socket.
//!
//! Every frame is a JSON object `{"type": ..., "payload": {...}}`. Inbound
//! frames from the browser only ever carry `chat_message` submits; every
//! other type flows from the agent collaborator through the session to the
//! browser.

use crate::errors::{AppError, AppResult};
use crate::models::Role;
use serde::{Deserialize, Serialize};

pub const CHAT_MESSAGE: &str = "chat_message";
pub const TOKEN_STREAM: &str = "token_stream";
pub const TYPING_INDICATOR: &str = "typing_indicator";
pub const ERROR: &str = "error";
pub const TOOL_CALLS: &str = "tool_calls";
pub const METRICS: &str = "metrics";

/// A frame before its `type` has been checked.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitPayload {
    pub message: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Submit(SubmitPayload),
}

impl ClientEvent {
    pub fn parse(text: &str) -> AppResult<Self> {
        let envelope: RawEnvelope = serde_json::from_str(text)
            .map_err(|error| AppError::Protocol(format!("Invalid message format: {}", error)))?;
        match envelope.event_type.as_str() {
            CHAT_MESSAGE => {
                let payload: SubmitPayload = serde_json::from_value(envelope.payload)
                    .map_err(|error| AppError::Protocol(format!("Invalid chat_message payload: {}", error)))?;
                Ok(Self::Submit(payload))
            }
            other => Err(AppError::Protocol(format!("Unsupported message type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessageBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessagePayload {
    pub message: ChatMessageBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenStreamPayload {
    #[serde(default)]
    pub token: String,
    pub message_id: String,
    #[serde(default)]
    pub is_complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingPayload {
    #[serde(rename = "isTyping")]
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallsPayload {
    pub tool_calls: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

/// Events emitted by an agent collaborator and forwarded to the browser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Event {
    ChatMessage(ChatMessagePayload),
    TokenStream(TokenStreamPayload),
    TypingIndicator(TypingPayload),
    Error(ErrorPayload),
    ToolCalls(ToolCallsPayload),
    Metrics(serde_json::Value),
}

impl Event {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ChatMessage(_) => CHAT_MESSAGE,
            Self::TokenStream(_) => TOKEN_STREAM,
            Self::TypingIndicator(_) => TYPING_INDICATOR,
            Self::Error(_) => ERROR,
            Self::ToolCalls(_) => TOOL_CALLS,
            Self::Metrics(_) => METRICS,
        }
    }

    pub fn error(message: impl Into<String>, thread_id: Option<String>) -> Self {
        Self::Error(ErrorPayload {
            message: message.into(),
            thread_id,
        })
    }

    pub fn typing(is_typing: bool) -> Self {
        Self::TypingIndicator(TypingPayload { is_typing })
    }

    pub fn token(message_id: &str, token: impl Into<String>, is_complete: bool, thread_id: &str) -> Self {
        Self::TokenStream(TokenStreamPayload {
            token: token.into(),
            message_id: message_id.to_string(),
            is_complete,
            thread_id: Some(thread_id.to_string()),
        })
    }

    /// Parses a frame produced by an external collaborator.
    pub fn parse(text: &str) -> AppResult<Self> {
        let envelope: RawEnvelope = serde_json::from_str(text)
            .map_err(|error| AppError::Protocol(format!("Invalid event format: {}", error)))?;
        Self::from_envelope(envelope)
    }

    pub fn from_envelope(envelope: RawEnvelope) -> AppResult<Self> {
        let RawEnvelope { event_type, payload } = envelope;
        let parsed = match event_type.as_str() {
            CHAT_MESSAGE => serde_json::from_value(payload).map(Self::ChatMessage),
            TOKEN_STREAM => serde_json::from_value(payload).map(Self::TokenStream),
            TYPING_INDICATOR => serde_json::from_value(payload).map(Self::TypingIndicator),
            ERROR => serde_json::from_value(payload).map(Self::Error),
            TOOL_CALLS => serde_json::from_value(payload).map(Self::ToolCalls),
            METRICS => Ok(Self::Metrics(payload)),
            other => {
                return Err(AppError::Protocol(format!("Unrecognized event type '{}'", other)));
            }
        };
        parsed.map_err(|error| AppError::Protocol(format!("Invalid {} payload: {}", event_type, error)))
    }

    pub fn to_json(&self) -> AppResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::{ClientEvent, Event, SubmitPayload};
    use crate::errors::AppError;
    use serde_json::json;

    #[test]
    fn parses_submit_frame() {
        let frame = json!({
            "type": "chat_message",
            "payload": {"message": "How do I create a table?", "thread_id": "default", "user_id": "u1"}
        })
        .to_string();
        let event = ClientEvent::parse(&frame).expect("submit");
        assert_eq!(
            event,
            ClientEvent::Submit(SubmitPayload {
                message: "How do I create a table?".to_string(),
                thread_id: Some("default".to_string()),
                user_id: Some("u1".to_string()),
                agent_id: None,
            })
        );
    }

    #[test]
    fn unknown_inbound_type_is_a_protocol_violation() {
        let err = ClientEvent::parse(r#"{"type":"agent_message","payload":{}}"#).expect_err("unknown type");
        assert!(matches!(err, AppError::Protocol(_)));
        let err = ClientEvent::parse("not json").expect_err("bad json");
        assert!(matches!(err, AppError::Protocol(_)));
    }

    #[test]
    fn events_serialize_as_type_and_payload() {
        let value = serde_json::to_value(Event::typing(true)).expect("serialize");
        assert_eq!(value, json!({"type": "typing_indicator", "payload": {"isTyping": true}}));

        let value = serde_json::to_value(Event::token("m1", "To ", false, "default")).expect("serialize");
        assert_eq!(
            value,
            json!({
                "type": "token_stream",
                "payload": {"token": "To ", "message_id": "m1", "is_complete": false, "thread_id": "default"}
            })
        );
    }

    #[test]
    fn collaborator_frames_parse_into_events() {
        let event = Event::parse(r#"{"type":"token_stream","payload":{"message_id":"m1","is_complete":true}}"#)
            .expect("token");
        match event {
            Event::TokenStream(payload) => {
                assert!(payload.is_complete);
                assert_eq!(payload.token, "");
            }
            other => panic!("unexpected event {:?}", other),
        }

        let event = Event::parse(r#"{"type":"metrics","payload":{"tokenUsage":{"total":3}}}"#).expect("metrics");
        assert_eq!(event.event_type(), "metrics");

        let err = Event::parse(r#"{"type":"thread_info","payload":{}}"#).expect_err("unknown");
        assert!(matches!(err, AppError::Protocol(_)));
    }
}

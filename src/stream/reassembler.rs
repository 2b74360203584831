use crate::protocol::TokenStreamPayload;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingState {
    pub message_id: String,
    pub accumulated_content: String,
    pub is_complete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Started { message_id: String },
    Appended { message_id: String },
    /// The stream is done; the state is handed back for storage.
    Finalized(StreamingState),
    /// A completion arrived for an id that never streamed.
    FinalizedWithoutStream(StreamingState),
}

/// Folds ordered `token_stream` events into whole messages, one state per
/// `message_id`. Tokens are taken in arrival order.
#[derive(Debug, Default)]
pub struct StreamingReassembler {
    streams: HashMap<String, StreamingState>,
    current: Option<String>,
}

impl StreamingReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: &TokenStreamPayload) -> StreamOutcome {
        let message_id = event.message_id.clone();
        self.current = Some(message_id.clone());

        if event.is_complete {
            return match self.streams.remove(&message_id) {
                Some(mut state) => {
                    state.accumulated_content.push_str(&event.token);
                    state.is_complete = true;
                    StreamOutcome::Finalized(state)
                }
                None => StreamOutcome::FinalizedWithoutStream(StreamingState {
                    message_id,
                    accumulated_content: event.token.clone(),
                    is_complete: true,
                }),
            };
        }

        match self.streams.get_mut(&message_id) {
            Some(state) => {
                state.accumulated_content.push_str(&event.token);
                StreamOutcome::Appended { message_id }
            }
            None => {
                self.streams.insert(
                    message_id.clone(),
                    StreamingState {
                        message_id: message_id.clone(),
                        accumulated_content: event.token.clone(),
                        is_complete: false,
                    },
                );
                StreamOutcome::Started { message_id }
            }
        }
    }

    /// The most recently touched stream, if it is still open.
    pub fn current(&self) -> Option<&StreamingState> {
        self.current.as_ref().and_then(|id| self.streams.get(id))
    }

    pub fn get(&self, message_id: &str) -> Option<&StreamingState> {
        self.streams.get(message_id)
    }

    pub fn active_count(&self) -> usize {
        self.streams.len()
    }

    pub fn is_idle(&self) -> bool {
        self.streams.is_empty()
    }

    /// Drops every open stream without finalizing it.
    pub fn abandon(&mut self) -> Vec<StreamingState> {
        self.current = None;
        self.streams.drain().map(|(_, state)| state).collect()
    }
}

//! Per-connection stream handling: token reassembly, rendered-event
//! deduplication, the rendered transcript, and line splitting for
//! subprocess agents.

pub mod dedup;
pub mod line_buffer;
pub mod reassembler;
pub mod transcript;

pub use dedup::{message_key, tool_calls_key, DedupState, SeenCache};
pub use line_buffer::LineBuffer;
pub use reassembler::{StreamOutcome, StreamingReassembler, StreamingState};
pub use transcript::{Transcript, TranscriptEntry};

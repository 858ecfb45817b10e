/// Streaming chat core
///
/// - `transcript` - ordered message log with change observers
/// - `decoder` - SSE frame parsing into typed stream events
/// - `sync` - applies stream events to the transcript, one session at a time
/// - `coordinator` - turns document viewer snippet actions into chat turns
mod coordinator;
mod decoder;
mod sync;
mod transcript;

pub use coordinator::{ActionCoordinator, IgnoreReason, Outcome, VIEWER_EVENT_TYPE, ViewerEvent};
pub use decoder::{
    EventDecoder, EventStream, FrameParser, MalformedFrame, SseFrame, StreamEvent, decode_frame,
    decode_stream,
};
pub use sync::{
    Applied, Conversation, SessionId, SharedConversation, StreamBackend, StreamRequest,
    StreamSynchronizer, StreamTicket,
};
pub use transcript::{ConversationKey, Transcript, TranscriptChange};

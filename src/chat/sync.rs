//! Binds decoded stream events to transcript mutations.
//!
//! A [`Conversation`] owns the transcript plus at most one active stream
//! session. Every event is tagged with the session it came from, and is only
//! applied while that session is still the active one, the transcript has not
//! been reloaded, and the session's placeholder is still the last message.
//! Anything else is a stale delivery and is dropped.

use super::decoder::{EventStream, StreamEvent};
use super::transcript::{ConversationKey, Transcript};
use crate::error::{ChatError, ChatResult};
use crate::types::{Action, AssistantMessage, ChatTurn, Message, MessageId, ReplyStatus, UserMessage};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};

/// Body of `POST /prepare_stream`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StreamRequest {
    pub messages: Vec<ChatTurn>,
    pub file_id: String,
    pub action: Action,
    pub snippet: Option<String>,
}

/// Anything that can open a chat completion event stream.
#[async_trait]
pub trait StreamBackend: Send + Sync {
    async fn open_stream(&self, request: &StreamRequest) -> ChatResult<EventStream>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Result of feeding one event into a [`Conversation`].
#[derive(Clone, Debug, PartialEq)]
pub enum Applied {
    Updated,
    Stale,
    Finished(ChatResult<()>),
}

#[derive(Debug)]
struct ActiveSession {
    id: SessionId,
    generation: u64,
    placeholder: MessageId,
    task: Option<AbortHandle>,
}

#[derive(Debug, Default)]
pub struct Conversation {
    transcript: Transcript,
    active: Option<ActiveSession>,
    next_session: u64,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn transcript_mut(&mut self) -> &mut Transcript {
        &mut self.transcript
    }

    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_session(&self) -> Option<SessionId> {
        self.active.as_ref().map(|session| session.id)
    }

    /// Replaces the transcript without touching the active session, which is
    /// left orphaned: its remaining events are discarded as stale.
    pub fn load(&mut self, key: impl Into<ConversationKey>, messages: Vec<Message>) {
        self.transcript.load(key, messages);
    }

    /// Appends the user turn and an empty assistant placeholder, registers a
    /// new session and returns the request to send.
    pub fn begin(&mut self, trigger: UserMessage) -> ChatResult<(SessionId, StreamRequest)> {
        if self.active.is_some() {
            return Err(ChatError::AlreadyStreaming);
        }
        let file_id = self
            .transcript
            .key()
            .ok_or(ChatError::NoConversation)?
            .to_string();

        let mut messages: Vec<ChatTurn> =
            self.transcript.messages().iter().map(Message::to_turn).collect();
        let trigger = Message::User(trigger);
        messages.push(trigger.to_turn());
        let (action, snippet) = match &trigger {
            Message::User(msg) => (msg.action, msg.snippet.clone()),
            Message::Assistant(_) => (Action::Default, None),
        };

        self.transcript.append(trigger);
        let placeholder = self.transcript.append(AssistantMessage::placeholder());

        self.next_session += 1;
        let id = SessionId(self.next_session);
        self.active = Some(ActiveSession {
            id,
            generation: self.transcript.generation(),
            placeholder,
            task: None,
        });
        tracing::debug!(session = %id, %placeholder, "stream session registered");

        Ok((
            id,
            StreamRequest {
                messages,
                file_id,
                action,
                snippet,
            },
        ))
    }

    fn attach_task(&mut self, session: SessionId, task: AbortHandle) {
        if let Some(active) = &mut self.active
            && active.id == session
        {
            active.task = Some(task);
        }
    }

    fn is_live(&self, session: &ActiveSession) -> bool {
        session.generation == self.transcript.generation()
            && self.transcript.last().is_some_and(|last| {
                last.id() == session.placeholder
                    && last.as_assistant().is_some_and(AssistantMessage::is_streaming)
            })
    }

    fn is_current(&self, session: SessionId) -> bool {
        self.active_session() == Some(session)
    }

    pub fn apply(&mut self, session: SessionId, event: StreamEvent) -> Applied {
        let live = match &self.active {
            Some(active) if active.id == session => self.is_live(active),
            _ => {
                tracing::debug!(%session, ?event, "discarding event from inactive session");
                return Applied::Stale;
            }
        };

        match event {
            StreamEvent::Delta { text } => {
                if !live {
                    tracing::debug!(%session, "discarding delta for replaced transcript");
                    return Applied::Stale;
                }
                self.edit_reply(|reply| reply.content.push_str(&text));
                Applied::Updated
            }
            StreamEvent::Context { chunks } => {
                if !live {
                    tracing::debug!(%session, "discarding context for replaced transcript");
                    return Applied::Stale;
                }
                self.edit_reply(|reply| reply.context_chunks = chunks);
                Applied::Updated
            }
            StreamEvent::Done => {
                if live {
                    self.edit_reply(|reply| reply.status = ReplyStatus::Complete);
                }
                self.active = None;
                tracing::info!(%session, "stream finished");
                Applied::Finished(Ok(()))
            }
            StreamEvent::Error { cause } => {
                if live {
                    self.edit_reply(|reply| reply.status = ReplyStatus::Failed);
                }
                self.active = None;
                tracing::error!(%session, "stream failed: {cause}");
                Applied::Finished(Err(cause))
            }
        }
    }

    /// Detaches the active session. Its placeholder is marked cancelled when
    /// it is still the tail of this transcript, and the decoding task is
    /// aborted on a best-effort basis.
    pub fn cancel(&mut self) -> Option<SessionId> {
        let session = self.active.take()?;
        if self.is_live(&session) {
            self.edit_reply(|reply| reply.status = ReplyStatus::Cancelled);
        }
        if let Some(task) = &session.task {
            task.abort();
        }
        tracing::info!(session = %session.id, "stream cancelled");
        Some(session.id)
    }

    fn edit_reply<F>(&mut self, edit: F)
    where
        F: FnOnce(&mut AssistantMessage),
    {
        self.transcript.mutate_last(|msg| {
            if let Some(reply) = msg.as_assistant_mut() {
                edit(reply);
            }
        });
    }
}

pub type SharedConversation = Arc<Mutex<Conversation>>;

fn lock(conversation: &Mutex<Conversation>) -> MutexGuard<'_, Conversation> {
    conversation.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle on a running stream session.
#[derive(Debug)]
pub struct StreamTicket {
    session: SessionId,
    handle: JoinHandle<ChatResult<()>>,
}

impl StreamTicket {
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Waits for the session to end and returns its terminal cause.
    pub async fn outcome(self) -> ChatResult<()> {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(err) if err.is_cancelled() => Err(ChatError::Cancelled),
            Err(err) => Err(ChatError::Transport(format!("stream task failed: {err}"))),
        }
    }
}

/// Drives stream sessions for one conversation on the tokio runtime.
///
/// Transcript observers run while the conversation lock is held and must not
/// call back into the synchronizer.
#[derive(Clone)]
pub struct StreamSynchronizer {
    conversation: SharedConversation,
    backend: Arc<dyn StreamBackend>,
    idle_timeout: Duration,
}

impl StreamSynchronizer {
    pub fn new(backend: Arc<dyn StreamBackend>, idle_timeout: Duration) -> Self {
        Self {
            conversation: Arc::new(Mutex::new(Conversation::new())),
            backend,
            idle_timeout,
        }
    }

    pub fn conversation(&self) -> SharedConversation {
        Arc::clone(&self.conversation)
    }

    pub fn with_conversation<R>(&self, f: impl FnOnce(&mut Conversation) -> R) -> R {
        f(&mut lock(&self.conversation))
    }

    pub fn is_busy(&self) -> bool {
        lock(&self.conversation).is_busy()
    }

    /// Must be called from within a tokio runtime.
    pub fn start_stream(&self, trigger: UserMessage) -> ChatResult<StreamTicket> {
        let (session, request) = lock(&self.conversation).begin(trigger)?;

        let conversation = Arc::clone(&self.conversation);
        let backend = Arc::clone(&self.backend);
        let idle_timeout = self.idle_timeout;
        let handle = tokio::spawn(async move {
            run_session(conversation, backend, session, request, idle_timeout).await
        });
        lock(&self.conversation).attach_task(session, handle.abort_handle());

        Ok(StreamTicket { session, handle })
    }

    pub fn cancel(&self) -> Option<SessionId> {
        lock(&self.conversation).cancel()
    }

    /// Cancels any active session, then loads `messages` as the new transcript.
    pub fn switch_conversation(&self, key: impl Into<ConversationKey>, messages: Vec<Message>) {
        let mut conversation = lock(&self.conversation);
        conversation.cancel();
        conversation.load(key, messages);
    }
}

async fn run_session(
    conversation: SharedConversation,
    backend: Arc<dyn StreamBackend>,
    session: SessionId,
    request: StreamRequest,
    idle_timeout: Duration,
) -> ChatResult<()> {
    tracing::info!(%session, file_id = %request.file_id, action = %request.action, "opening stream");

    let mut events = match tokio::time::timeout(idle_timeout, backend.open_stream(&request)).await {
        Ok(Ok(events)) => events,
        Ok(Err(cause)) => return finish(&conversation, session, StreamEvent::Error { cause }),
        Err(_) => {
            let cause = ChatError::Timeout(idle_timeout);
            return finish(&conversation, session, StreamEvent::Error { cause });
        }
    };

    loop {
        let event = match tokio::time::timeout(idle_timeout, events.next()).await {
            Ok(Some(event)) => event,
            Ok(None) => StreamEvent::Error {
                cause: ChatError::Incomplete,
            },
            Err(_) => {
                tracing::warn!(%session, "no stream activity for {idle_timeout:?}");
                StreamEvent::Error {
                    cause: ChatError::Timeout(idle_timeout),
                }
            }
        };

        let mut guard = lock(&conversation);
        match guard.apply(session, event) {
            Applied::Finished(outcome) => return outcome,
            Applied::Updated => {}
            Applied::Stale if guard.is_current(session) => {}
            Applied::Stale => return Err(ChatError::Cancelled),
        }
    }
}

fn finish(conversation: &Mutex<Conversation>, session: SessionId, event: StreamEvent) -> ChatResult<()> {
    match lock(conversation).apply(session, event) {
        Applied::Finished(outcome) => outcome,
        Applied::Updated | Applied::Stale => Err(ChatError::Cancelled),
    }
}

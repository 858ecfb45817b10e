use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use time::OffsetDateTime;

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-local message identifier, stable for the message's lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(u64);

impl MessageId {
    pub fn next() -> Self {
        Self(NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// What the user asked the assistant to do with a message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    #[default]
    Default,
    Translate,
    Explain,
    Ask,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Default => "default",
            Action::Translate => "translate",
            Action::Explain => "explain",
            Action::Ask => "ask",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown action: {0}")]
pub struct UnknownAction(pub String);

impl FromStr for Action {
    type Err = UnknownAction;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "default" => Ok(Action::Default),
            "translate" => Ok(Action::Translate),
            "explain" => Ok(Action::Explain),
            "ask" => Ok(Action::Ask),
            _ => Err(UnknownAction(raw.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyStatus {
    Streaming,
    Complete,
    Failed,
    Cancelled,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UserMessage {
    pub id: MessageId,
    pub content: String,
    pub action: Action,
    pub snippet: Option<String>,
    pub created_at: Option<OffsetDateTime>,
}

impl UserMessage {
    /// Free-text turn typed by the user.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            id: MessageId::next(),
            content: content.into(),
            action: Action::Default,
            snippet: None,
            created_at: Some(OffsetDateTime::now_utc()),
        }
    }

    /// Turn synthesized from a snippet selected in the document viewer.
    pub fn shortcut(action: Action, snippet: impl Into<String>) -> Self {
        Self {
            id: MessageId::next(),
            content: String::new(),
            action,
            snippet: Some(snippet.into()),
            created_at: Some(OffsetDateTime::now_utc()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AssistantMessage {
    pub id: MessageId,
    pub content: String,
    pub context_chunks: Vec<String>,
    pub status: ReplyStatus,
    pub created_at: Option<OffsetDateTime>,
}

impl AssistantMessage {
    /// Empty reply slot shown while the response streams in.
    pub fn placeholder() -> Self {
        Self {
            id: MessageId::next(),
            content: String::new(),
            context_chunks: Vec::new(),
            status: ReplyStatus::Streaming,
            created_at: Some(OffsetDateTime::now_utc()),
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.status == ReplyStatus::Streaming
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    User(UserMessage),
    Assistant(AssistantMessage),
}

impl Message {
    pub fn id(&self) -> MessageId {
        match self {
            Message::User(msg) => msg.id,
            Message::Assistant(msg) => msg.id,
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Message::User(_) => Role::User,
            Message::Assistant(_) => Role::Assistant,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Message::User(msg) => &msg.content,
            Message::Assistant(msg) => &msg.content,
        }
    }

    pub fn is_user(&self) -> bool {
        matches!(self, Message::User(_))
    }

    pub fn created_at(&self) -> Option<OffsetDateTime> {
        match self {
            Message::User(msg) => msg.created_at,
            Message::Assistant(msg) => msg.created_at,
        }
    }

    pub fn as_assistant(&self) -> Option<&AssistantMessage> {
        match self {
            Message::Assistant(msg) => Some(msg),
            Message::User(_) => None,
        }
    }

    pub fn as_assistant_mut(&mut self) -> Option<&mut AssistantMessage> {
        match self {
            Message::Assistant(msg) => Some(msg),
            Message::User(_) => None,
        }
    }

    /// Wire representation sent to `/prepare_stream`.
    pub fn to_turn(&self) -> ChatTurn {
        ChatTurn {
            role: self.role(),
            content: self.content().to_string(),
        }
    }
}

impl From<UserMessage> for Message {
    fn from(msg: UserMessage) -> Self {
        Message::User(msg)
    }
}

impl From<AssistantMessage> for Message {
    fn from(msg: AssistantMessage) -> Self {
        Message::Assistant(msg)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub file_id: String,
    pub filename: String,
    #[serde(default)]
    pub is_indexed: bool,
}

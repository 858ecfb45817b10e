use std::time::Duration;

/// Errors surfaced by the API client and the chat synchronizer.
///
/// Values are cloneable so a single terminal cause can be both stored on the
/// stream session and handed back to the caller.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChatError {
    #[error("session expired, please log in again")]
    AuthExpired,

    #[error("not signed in")]
    NotSignedIn,

    #[error("invalid email or password")]
    InvalidCredentials,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("server reported an error: {0}")]
    Server(String),

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("a response is already streaming for this conversation")]
    AlreadyStreaming,

    #[error("no conversation is open")]
    NoConversation,

    #[error("stream idle for more than {0:?}")]
    Timeout(Duration),

    #[error("stream closed before completion")]
    Incomplete,

    #[error("stream cancelled")]
    Cancelled,
}

impl ChatError {
    /// Maps a non-success HTTP status to the matching error.
    pub fn from_status(status: reqwest::StatusCode, body: String) -> Self {
        if status == reqwest::StatusCode::UNAUTHORIZED {
            ChatError::AuthExpired
        } else {
            ChatError::Status {
                status: status.as_u16(),
                body,
            }
        }
    }

    pub fn is_auth_expired(&self) -> bool {
        matches!(self, ChatError::AuthExpired)
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        if err.status() == Some(reqwest::StatusCode::UNAUTHORIZED) {
            return ChatError::AuthExpired;
        }
        if err.is_decode() {
            return ChatError::Decode(err.to_string());
        }
        ChatError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::Decode(err.to_string())
    }
}

impl From<std::io::Error> for ChatError {
    fn from(err: std::io::Error) -> Self {
        ChatError::Io(err.to_string())
    }
}

pub type ChatResult<T> = Result<T, ChatError>;

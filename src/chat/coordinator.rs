//! Turns snippet+action events from the document viewer into chat turns.
//!
//! Events arrive over an explicit channel together with the origin they were
//! posted from. Only events from the trusted origin whose `type` is
//! `pdf-user-action` and whose action is on the allow-list are acted upon, and
//! each distinct `(action, text)` pair starts at most one stream per loaded
//! transcript.

use super::sync::{StreamSynchronizer, StreamTicket};
use super::transcript::ConversationKey;
use crate::error::ChatError;
use crate::types::{Action, UserMessage};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub const VIEWER_EVENT_TYPE: &str = "pdf-user-action";

/// A message posted by the document viewer.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewerEvent {
    pub origin: String,
    pub data: serde_json::Value,
}

impl ViewerEvent {
    pub fn user_action(origin: impl Into<String>, action: Action, text: impl Into<String>) -> Self {
        let payload = ViewerPayload {
            kind: VIEWER_EVENT_TYPE.to_string(),
            action: action.as_str().to_string(),
            text: text.into(),
        };
        Self {
            origin: origin.into(),
            data: serde_json::to_value(payload).unwrap_or_default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct ViewerPayload {
    #[serde(rename = "type")]
    kind: String,
    action: String,
    #[serde(default)]
    text: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IgnoreReason {
    ForeignOrigin,
    NotViewerAction,
    ActionNotAllowed,
    EmptySnippet,
    Unchanged,
}

#[derive(Debug)]
pub enum Outcome {
    Started(StreamTicket),
    Ignored(IgnoreReason),
    Rejected(ChatError),
}

/// The last shortcut that started a stream, pinned to the transcript it ran in.
#[derive(Debug, PartialEq, Eq)]
struct HandledAction {
    conversation: Option<ConversationKey>,
    generation: u64,
    action: Action,
    text: String,
}

pub struct ActionCoordinator {
    sync: StreamSynchronizer,
    trusted_origin: String,
    allowed: Vec<Action>,
    last_handled: Option<HandledAction>,
}

impl ActionCoordinator {
    pub fn new(sync: StreamSynchronizer, trusted_origin: impl Into<String>) -> Self {
        Self {
            sync,
            trusted_origin: trusted_origin.into(),
            allowed: vec![Action::Translate, Action::Explain],
            last_handled: None,
        }
    }

    pub fn with_allowed_actions(mut self, actions: impl IntoIterator<Item = Action>) -> Self {
        self.allowed = actions
            .into_iter()
            .filter(|action| *action != Action::Default)
            .collect();
        self
    }

    pub fn allowed_actions(&self) -> &[Action] {
        &self.allowed
    }

    /// Must be called from within a tokio runtime.
    pub fn handle(&mut self, event: ViewerEvent) -> Outcome {
        if event.origin != self.trusted_origin {
            tracing::debug!(origin = %event.origin, "ignoring viewer event from foreign origin");
            return Outcome::Ignored(IgnoreReason::ForeignOrigin);
        }

        let payload = match serde_json::from_value::<ViewerPayload>(event.data) {
            Ok(payload) if payload.kind == VIEWER_EVENT_TYPE => payload,
            _ => return Outcome::Ignored(IgnoreReason::NotViewerAction),
        };

        let action = match payload.action.parse::<Action>() {
            Ok(action) if self.allowed.contains(&action) => action,
            _ => {
                tracing::debug!(action = %payload.action, "ignoring viewer action outside allow-list");
                return Outcome::Ignored(IgnoreReason::ActionNotAllowed);
            }
        };

        let snippet = payload.text.trim();
        if snippet.is_empty() {
            return Outcome::Ignored(IgnoreReason::EmptySnippet);
        }

        let handled = self.pin(action, snippet);
        if self.last_handled.as_ref() == Some(&handled) {
            return Outcome::Ignored(IgnoreReason::Unchanged);
        }
        self.start(handled)
    }

    /// Starts a shortcut the user asked for directly, bypassing the origin
    /// check, the allow-list and the repeat filter. Any action except
    /// `Default` is accepted.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&mut self, action: Action, text: &str) -> Outcome {
        if action == Action::Default {
            return Outcome::Ignored(IgnoreReason::ActionNotAllowed);
        }
        let snippet = text.trim();
        if snippet.is_empty() {
            return Outcome::Ignored(IgnoreReason::EmptySnippet);
        }
        let handled = self.pin(action, snippet);
        self.start(handled)
    }

    fn pin(&self, action: Action, snippet: &str) -> HandledAction {
        let (conversation, generation) = self.sync.with_conversation(|conversation| {
            let transcript = conversation.transcript();
            (transcript.key().map(str::to_owned), transcript.generation())
        });
        HandledAction {
            conversation,
            generation,
            action,
            text: snippet.to_string(),
        }
    }

    fn start(&mut self, handled: HandledAction) -> Outcome {
        let action = handled.action;
        match self
            .sync
            .start_stream(UserMessage::shortcut(action, handled.text.clone()))
        {
            Ok(ticket) => {
                tracing::info!(%action, session = %ticket.session(), "started shortcut stream");
                self.last_handled = Some(handled);
                Outcome::Started(ticket)
            }
            Err(err) => {
                tracing::warn!(%action, "shortcut rejected: {err}");
                Outcome::Rejected(err)
            }
        }
    }

    /// Consumes viewer events until the sender side closes, reporting each
    /// outcome on `outcomes`.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<ViewerEvent>,
        outcomes: mpsc::UnboundedSender<Outcome>,
    ) {
        while let Some(event) = events.recv().await {
            let outcome = self.handle(event);
            if outcomes.send(outcome).is_err() {
                break;
            }
        }
        tracing::debug!("viewer event channel closed");
    }
}

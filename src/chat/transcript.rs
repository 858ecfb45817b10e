use crate::types::{Message, MessageId};
use std::fmt;

/// Conversations are keyed by the document's file id.
pub type ConversationKey = String;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TranscriptChange {
    Loaded,
    Appended(MessageId),
    Updated(MessageId),
}

type Observer = Box<dyn Fn(&Transcript, TranscriptChange) + Send + Sync>;

/// Ordered message log for one conversation.
///
/// Every `load` bumps the generation, which lets stream sessions started
/// against an older generation detect that the log was replaced under them.
#[derive(Default)]
pub struct Transcript {
    key: Option<ConversationKey>,
    messages: Vec<Message>,
    generation: u64,
    observers: Vec<Observer>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|msg| msg.id() == id)
    }

    /// Replaces the whole log. In-flight sessions are not merged; callers
    /// cancel them first or let them be discarded as stale.
    pub fn load(&mut self, key: impl Into<ConversationKey>, messages: Vec<Message>) {
        self.key = Some(key.into());
        self.messages = messages;
        self.generation += 1;
        self.notify(TranscriptChange::Loaded);
    }

    pub fn append(&mut self, message: impl Into<Message>) -> MessageId {
        let message = message.into();
        let id = message.id();
        self.messages.push(message);
        self.notify(TranscriptChange::Appended(id));
        id
    }

    /// Edits the last message in place. Returns `false` on an empty log.
    pub fn mutate_last<F>(&mut self, edit: F) -> bool
    where
        F: FnOnce(&mut Message),
    {
        let Some(last) = self.messages.last_mut() else {
            return false;
        };
        edit(last);
        let id = last.id();
        self.notify(TranscriptChange::Updated(id));
        true
    }

    pub fn subscribe<F>(&mut self, observer: F)
    where
        F: Fn(&Transcript, TranscriptChange) + Send + Sync + 'static,
    {
        self.observers.push(Box::new(observer));
    }

    fn notify(&self, change: TranscriptChange) {
        for observer in &self.observers {
            observer(self, change);
        }
    }
}

impl fmt::Debug for Transcript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transcript")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .field("messages", &self.messages)
            .field("observers", &self.observers.len())
            .finish()
    }
}

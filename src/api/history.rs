use crate::types::{Action, AssistantMessage, Message, MessageId, ReplyStatus, UserMessage};
use serde::Deserialize;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, format_description::well_known::Rfc3339};

/// One entry of `GET /history/{file_id}`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct HistoryRecord {
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    pub is_user: bool,
    #[serde(default)]
    pub context: Vec<String>,
    #[serde(default)]
    pub action: Action,
    #[serde(default)]
    pub snippet: Option<String>,
}

impl From<HistoryRecord> for Message {
    fn from(record: HistoryRecord) -> Self {
        let created_at = record.timestamp.as_deref().and_then(parse_timestamp);
        if record.is_user {
            Message::User(UserMessage {
                id: MessageId::next(),
                content: record.content,
                action: record.action,
                snippet: record.snippet,
                created_at,
            })
        } else {
            Message::Assistant(AssistantMessage {
                id: MessageId::next(),
                content: record.content,
                context_chunks: record.context,
                status: ReplyStatus::Complete,
                created_at,
            })
        }
    }
}

/// Accepts RFC 3339 and the offset-less ISO form the server emits for naive
/// timestamps, which are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<OffsetDateTime> {
    if let Ok(parsed) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Some(parsed);
    }
    let naive = format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second][optional [.[subsecond]]]"
    );
    PrimitiveDateTime::parse(raw, naive)
        .ok()
        .map(PrimitiveDateTime::assume_utc)
}

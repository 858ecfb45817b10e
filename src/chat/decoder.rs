//! Server-sent event decoding for chat completion streams.
//!
//! The server frames every event as
//!
//! ```text
//! event: chunk
//! data: {"choices":[{"delta":{"content":"Hel"}}]}
//!
//! event: context
//! data: ["first retrieved chunk", "second"]
//!
//! event: done
//! data: [DONE]
//! ```
//!
//! [`FrameParser`] cuts the byte stream into [`SseFrame`]s, [`decode_frame`]
//! turns one frame into a [`StreamEvent`], and [`decode_stream`] glues both to
//! an async byte stream. A single bad frame is dropped and logged; it never
//! ends the stream.

use crate::error::ChatError;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::collections::VecDeque;
use std::fmt;

const DONE_SENTINEL: &str = "[DONE]";

#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    Delta { text: String },
    Context { chunks: Vec<String> },
    Done,
    Error { cause: ChatError },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done | StreamEvent::Error { .. })
    }
}

pub type EventStream = BoxStream<'static, StreamEvent>;

/// One `event:`/`data:` unit as it appeared on the wire.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental line splitter for SSE framing.
///
/// Bytes are buffered until a full line is available, so multi-byte UTF-8
/// sequences split across network chunks decode correctly.
#[derive(Debug, Default)]
pub struct FrameParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Option<String>,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();
        let mut consumed = 0;
        while let Some(offset) = self.buffer[consumed..].iter().position(|b| *b == b'\n') {
            let end = consumed + offset + 1;
            let line = trim_line_ending(&self.buffer[consumed..end]);
            let line = String::from_utf8_lossy(line).into_owned();
            consumed = end;
            self.feed_line(&line, &mut frames);
        }
        self.buffer.drain(..consumed);
        frames
    }

    /// Flushes whatever is left once the byte stream has closed.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(trim_line_ending(&rest)).into_owned();
            self.feed_line(&line, &mut frames);
        }
        frames.extend(self.take_frame());
        frames
    }

    fn feed_line(&mut self, line: &str, frames: &mut Vec<SseFrame>) {
        if line.is_empty() {
            frames.extend(self.take_frame());
            return;
        }
        if line.starts_with(':') {
            // keep-alive comment
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => {
                if self.data.is_some() {
                    frames.extend(self.take_frame());
                }
                self.event = Some(value.to_string());
            }
            "data" => match &mut self.data {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(value);
                }
                None => self.data = Some(value.to_string()),
            },
            _ => {}
        }
    }

    fn take_frame(&mut self) -> Option<SseFrame> {
        if self.event.is_none() && self.data.is_none() {
            return None;
        }
        Some(SseFrame {
            event: self.event.take(),
            data: self.data.take().unwrap_or_default(),
        })
    }
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedFrame {
    pub event: String,
    pub reason: String,
}

impl fmt::Display for MalformedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed `{}` frame: {}", self.event, self.reason)
    }
}

#[derive(Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

/// Decodes a single frame.
///
/// `Ok(None)` means the frame carries nothing to apply (empty delta, unknown
/// event name). `Err` marks a frame that should have carried data but could
/// not be read.
pub fn decode_frame(frame: &SseFrame) -> Result<Option<StreamEvent>, MalformedFrame> {
    let name = frame.event.as_deref().unwrap_or("message");
    let payload = frame.data.trim();

    if matches!(name, "chunk" | "message" | "done") && payload == DONE_SENTINEL {
        return Ok(Some(StreamEvent::Done));
    }

    match name {
        "chunk" | "message" => {
            if payload.is_empty() {
                return Ok(None);
            }
            let parsed: CompletionChunk =
                serde_json::from_str(payload).map_err(|err| MalformedFrame {
                    event: name.to_string(),
                    reason: err.to_string(),
                })?;
            let content = parsed
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.delta)
                .and_then(|delta| delta.content)
                .ok_or_else(|| MalformedFrame {
                    event: name.to_string(),
                    reason: "missing choices[0].delta.content".to_string(),
                })?;
            if content.is_empty() {
                return Ok(None);
            }
            Ok(Some(StreamEvent::Delta { text: content }))
        }
        "context" => {
            if payload.is_empty() {
                return Ok(Some(StreamEvent::Context { chunks: Vec::new() }));
            }
            let chunks: Vec<String> =
                serde_json::from_str(payload).map_err(|err| MalformedFrame {
                    event: name.to_string(),
                    reason: err.to_string(),
                })?;
            Ok(Some(StreamEvent::Context { chunks }))
        }
        "done" => Ok(Some(StreamEvent::Done)),
        "error" => {
            let message = if payload.is_empty() {
                "unknown server error".to_string()
            } else {
                payload.to_string()
            };
            Ok(Some(StreamEvent::Error {
                cause: ChatError::Server(message),
            }))
        }
        other => {
            tracing::debug!(event = other, "ignoring unknown stream event");
            Ok(None)
        }
    }
}

/// Bytes in, events out. Stops producing after the first terminal event.
#[derive(Debug, Default)]
pub struct EventDecoder {
    parser: FrameParser,
    malformed: usize,
    finished: bool,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        let frames = self.parser.push(bytes);
        self.apply(frames)
    }

    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        let frames = self.parser.finish();
        let events = self.apply(frames);
        self.finished = true;
        events
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of frames dropped because they could not be decoded.
    pub fn malformed_frames(&self) -> usize {
        self.malformed
    }

    fn terminate(&mut self) {
        self.finished = true;
    }

    fn apply(&mut self, frames: Vec<SseFrame>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        for frame in frames {
            match decode_frame(&frame) {
                Ok(Some(event)) => {
                    let terminal = event.is_terminal();
                    events.push(event);
                    if terminal {
                        self.finished = true;
                        break;
                    }
                }
                Ok(None) => {}
                Err(malformed) => {
                    self.malformed += 1;
                    tracing::warn!(data = %frame.data, "dropping {malformed}");
                }
            }
        }
        events
    }
}

struct DecodeState<B, E> {
    bytes: BoxStream<'static, Result<B, E>>,
    decoder: EventDecoder,
    pending: VecDeque<StreamEvent>,
}

/// Wraps a byte stream (for example `reqwest::Response::bytes_stream`) into a
/// lazy event stream.
///
/// The returned stream ends after `Done`, after `Error`, or when the byte
/// stream closes. Once a terminal event has been produced the byte stream is
/// not polled again.
pub fn decode_stream<S, B, E>(bytes: S) -> EventStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let state = DecodeState {
        bytes: bytes.boxed(),
        decoder: EventDecoder::new(),
        pending: VecDeque::new(),
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((event, state));
            }
            if state.decoder.is_finished() {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    let events = state.decoder.feed(chunk.as_ref());
                    state.pending.extend(events);
                }
                Some(Err(err)) => {
                    state.decoder.terminate();
                    state.pending.push_back(StreamEvent::Error {
                        cause: ChatError::Transport(err.to_string()),
                    });
                }
                None => {
                    let events = state.decoder.finish();
                    state.pending.extend(events);
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn frame(event: &str, data: &str) -> SseFrame {
        SseFrame {
            event: Some(event.to_string()),
            data: data.to_string(),
        }
    }

    async fn collect(chunks: Vec<Result<&'static str, &'static str>>) -> Vec<StreamEvent> {
        decode_stream(stream::iter(chunks)).collect().await
    }

    #[test]
    fn parser_reassembles_split_chunks() {
        let mut parser = FrameParser::new();
        assert!(parser.push(b"event: ch").is_empty());
        assert!(parser.push(b"unk\r\ndata: {\"a\"").is_empty());
        let frames = parser.push(b":1}\r\n\r\n");
        assert_eq!(frames, vec![frame("chunk", "{\"a\":1}")]);
    }

    #[test]
    fn parser_skips_comments_and_joins_data_lines() {
        let mut parser = FrameParser::new();
        let frames = parser.push(b": ping\n\nevent: chunk\ndata: one\ndata: two\n\n");
        assert_eq!(frames, vec![frame("chunk", "one\ntwo")]);
    }

    #[test]
    fn event_header_closes_pending_frame() {
        let mut parser = FrameParser::new();
        let frames = parser.push(b"event: chunk\ndata: a\nevent: done\ndata: [DONE]\n\n");
        assert_eq!(frames, vec![frame("chunk", "a"), frame("done", "[DONE]")]);
    }

    #[test]
    fn parser_handles_many_lines_in_one_push() {
        let mut input = String::new();
        for i in 0..200 {
            input.push_str(&format!("event: chunk\ndata: {i}\n\n"));
        }
        input.push_str("event: chunk\ndata: tail");

        let mut parser = FrameParser::new();
        let frames = parser.push(input.as_bytes());
        assert_eq!(frames.len(), 200);
        assert_eq!(frames[0], frame("chunk", "0"));
        assert_eq!(frames[199], frame("chunk", "199"));

        // The unterminated line stays buffered for the next push
        assert_eq!(parser.push(b"-end\n\n"), vec![frame("chunk", "tail-end")]);
    }

    #[test]
    fn finish_flushes_unterminated_frame() {
        let mut parser = FrameParser::new();
        assert!(parser.push(b"event: done\ndata: [DONE]").is_empty());
        assert_eq!(parser.finish(), vec![frame("done", "[DONE]")]);
    }

    #[test]
    fn multibyte_text_split_across_chunks() {
        let text = "data: {\"choices\":[{\"delta\":{\"content\":\"привет\"}}]}\n\n";
        let bytes = text.as_bytes();
        let split = text.find('и').unwrap() + 1;
        let mut decoder = EventDecoder::new();
        assert!(decoder.feed(&bytes[..split]).is_empty());
        assert_eq!(
            decoder.feed(&bytes[split..]),
            vec![StreamEvent::Delta {
                text: "привет".into()
            }]
        );
    }

    #[test]
    fn decodes_chunk_delta() {
        let event = decode_frame(&frame(
            "chunk",
            r#"{"model":"null","choices":[{"index":0,"delta":{"content":"hi"}}]}"#,
        ));
        assert_eq!(event, Ok(Some(StreamEvent::Delta { text: "hi".into() })));
    }

    #[test]
    fn chunk_without_content_is_malformed() {
        let err = decode_frame(&frame("chunk", r#"{"choices":[]}"#)).unwrap_err();
        assert_eq!(err.event, "chunk");
        assert!(decode_frame(&frame("chunk", "{bad json}")).is_err());
    }

    #[test]
    fn empty_delta_is_skipped() {
        let event = decode_frame(&frame("chunk", r#"{"choices":[{"delta":{"content":""}}]}"#));
        assert_eq!(event, Ok(None));
    }

    #[test]
    fn decodes_context_payloads() {
        assert_eq!(
            decode_frame(&frame("context", r#"["a","b"]"#)),
            Ok(Some(StreamEvent::Context {
                chunks: vec!["a".into(), "b".into()]
            }))
        );
        assert_eq!(
            decode_frame(&frame("context", "")),
            Ok(Some(StreamEvent::Context { chunks: Vec::new() }))
        );
        assert!(decode_frame(&frame("context", "[1, 2]")).is_err());
    }

    #[test]
    fn decodes_terminators() {
        assert_eq!(decode_frame(&frame("done", "")), Ok(Some(StreamEvent::Done)));
        assert_eq!(
            decode_frame(&frame("chunk", "[DONE]")),
            Ok(Some(StreamEvent::Done))
        );
        assert_eq!(
            decode_frame(&frame("error", "model offline")),
            Ok(Some(StreamEvent::Error {
                cause: ChatError::Server("model offline".into())
            }))
        );
        assert_eq!(decode_frame(&frame("usage", "{}")), Ok(None));
    }

    #[test]
    fn sentinel_only_ends_completion_frames() {
        assert_eq!(
            decode_frame(&SseFrame {
                event: None,
                data: "[DONE]".into()
            }),
            Ok(Some(StreamEvent::Done))
        );
        assert_eq!(decode_frame(&frame("usage", "[DONE]")), Ok(None));
        assert!(decode_frame(&frame("context", "[DONE]")).is_err());
    }

    #[tokio::test]
    async fn sentinel_in_unknown_event_keeps_stream_open() {
        let events = collect(vec![
            Ok("event: usage\ndata: [DONE]\n\n"),
            Ok("event: chunk\ndata: {\"choices\":[{\"delta\":{\"content\":\"still here\"}}]}\n\n"),
            Ok("event: done\ndata: [DONE]\n\n"),
        ])
        .await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Delta {
                    text: "still here".into()
                },
                StreamEvent::Done
            ]
        );
    }

    #[tokio::test]
    async fn malformed_frame_does_not_end_stream() {
        let events = collect(vec![
            Ok("event: chunk\ndata: {bad json}\n\n"),
            Ok("event: chunk\ndata: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n"),
            Ok("event: done\ndata: [DONE]\n\n"),
        ])
        .await;
        assert_eq!(
            events,
            vec![StreamEvent::Delta { text: "hi".into() }, StreamEvent::Done]
        );
    }

    #[tokio::test]
    async fn sentinel_stops_reading() {
        let polled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&polled);
        let chunks = stream::iter(vec![
            Ok::<_, &str>("event: chunk\ndata: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n"),
            Ok("data: [DONE]\n\n"),
            Ok("event: chunk\ndata: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n\n"),
        ])
        .inspect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let events: Vec<_> = decode_stream(chunks).collect().await;
        assert_eq!(
            events,
            vec![StreamEvent::Delta { text: "a".into() }, StreamEvent::Done]
        );
        assert_eq!(polled.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn frames_after_done_in_same_chunk_are_dropped() {
        let events = collect(vec![Ok(
            "event: done\ndata: [DONE]\n\nevent: chunk\ndata: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n",
        )])
        .await;
        assert_eq!(events, vec![StreamEvent::Done]);
    }

    #[tokio::test]
    async fn transport_error_terminates() {
        let events = collect(vec![
            Ok("event: chunk\ndata: {\"choices\":[{\"delta\":{\"content\":\"part\"}}]}\n\n"),
            Err("connection reset"),
            Ok("event: done\ndata: [DONE]\n\n"),
        ])
        .await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Delta {
                    text: "part".into()
                },
                StreamEvent::Error {
                    cause: ChatError::Transport("connection reset".into())
                },
            ]
        );
    }

    #[tokio::test]
    async fn closed_stream_ends_without_terminal() {
        let events = collect(vec![Ok(
            "event: context\ndata: [\"ctx\"]\n\n",
        )])
        .await;
        assert_eq!(
            events,
            vec![StreamEvent::Context {
                chunks: vec!["ctx".into()]
            }]
        );
    }

    #[test]
    fn counts_malformed_frames() {
        let mut decoder = EventDecoder::new();
        decoder.feed(b"event: chunk\ndata: nope\n\nevent: context\ndata: {}\n\n");
        assert_eq!(decoder.malformed_frames(), 2);
        assert!(!decoder.is_finished());
    }
}

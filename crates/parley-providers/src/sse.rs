//! Server-Sent Events line parser.
//!
//! Turns a chunked byte stream (usually a `reqwest::Response` body) into a
//! `Stream<Item = SseEvent>`. Lines may be split across chunks.

use futures::Stream;
use tokio_stream::StreamExt;

/// A parsed SSE event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

/// Parse a reqwest response body as an SSE stream.
pub fn parse_sse_stream(
    response: reqwest::Response,
) -> impl Stream<Item = anyhow::Result<SseEvent>> + Send {
    parse_sse_bytes(response.bytes_stream())
}

/// Parse any stream of byte chunks as SSE.
pub fn parse_sse_bytes<S, B, E>(bytes: S) -> impl Stream<Item = anyhow::Result<SseEvent>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    futures::stream::unfold(
        SseState {
            bytes: Box::pin(bytes),
            buffer: String::new(),
            pending: PendingEvent::default(),
        },
        |mut state| async move {
            loop {
                if let Some(newline_pos) = state.buffer.find('\n') {
                    let line = state.buffer[..newline_pos].trim_end_matches('\r').to_string();
                    state.buffer.drain(..=newline_pos);

                    // Blank line dispatches.
                    if line.is_empty() {
                        if let Some(event) = state.pending.take() {
                            return Some((Ok(event), state));
                        }
                        continue;
                    }
                    state.pending.field(&line);
                    continue;
                }

                match state.bytes.next().await {
                    Some(Ok(chunk)) => {
                        state
                            .buffer
                            .push_str(&String::from_utf8_lossy(chunk.as_ref()));
                    }
                    Some(Err(e)) => {
                        return Some((Err(anyhow::anyhow!("SSE stream error: {e}")), state));
                    }
                    None => {
                        // Trailing line without newline, then any undispatched event.
                        if !state.buffer.is_empty() {
                            let line = std::mem::take(&mut state.buffer);
                            state.pending.field(line.trim_end_matches('\r'));
                        }
                        return state.pending.take().map(|event| (Ok(event), state));
                    }
                }
            }
        },
    )
}

#[derive(Default)]
struct PendingEvent {
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl PendingEvent {
    fn field(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }
        if let Some(value) = line.strip_prefix("event:") {
            self.event = Some(value.trim_start().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            self.data.push(value.trim_start().to_string());
        } else if let Some(value) = line.strip_prefix("id:") {
            self.id = Some(value.trim_start().to_string());
        }
    }

    fn take(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        let event = SseEvent {
            event: self.event.take(),
            data: self.data.join("\n"),
            id: self.id.take(),
        };
        self.data.clear();
        Some(event)
    }
}

struct SseState<S> {
    bytes: std::pin::Pin<Box<S>>,
    buffer: String,
    pending: PendingEvent,
}

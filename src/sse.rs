//! Server-Sent Events (SSE) reassembly for streamed chat answers.
//!
//! The backend streams answers as:
//! ```text
//! data: {"content": "Hello"}
//!
//! data: {"content": " world", "sources": [{"page": 3}]}
//!
//! ```
//!
//! Network reads do not line up with events: one read may hold half an
//! event (or half a UTF-8 character), another several events. [`Reassembler`]
//! turns reads into ordered [`ChatEvent`]s and [`ChatStream`] drives it from
//! an async byte stream.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use futures::stream::{BoxStream, FusedStream, Stream, StreamExt};
use itertools::Itertools;
use tracing::{debug, warn};

use crate::client::{ClientError, TransportError};
use crate::model::{ChatEvent, ChatFrame, ChatTranscript, Source};

/// Blank line separating two events.
const EVENT_DELIMITER: &str = "\n\n";

/// Field name of SSE data lines.
const DATA_FIELD: &str = "data:";

/// Extension trait for `reqwest::Response` to read a chat answer.
pub trait ChatResponseExt {
    /// Convert the response body into a stream of chat events.
    fn chat_stream(self) -> ChatStream;
}

impl ChatResponseExt for reqwest::Response {
    fn chat_stream(self) -> ChatStream {
        reassemble(self.bytes_stream())
    }
}

/// Reassemble an SSE byte stream into chat events.
///
/// The returned stream yields tokens and citations in arrival order. It ends
/// after the byte stream ends, on a `[DONE]` marker, on an `error` frame
/// (yielded as [`ClientError::Upstream`]) or on a read error (yielded as
/// [`ClientError::Transport`]).
///
/// # Example
/// ```
/// use futures::{stream, StreamExt};
/// use litstream::model::ChatEvent;
/// use litstream::sse::reassemble;
///
/// # tokio_test_block(async {
/// let body = stream::iter(vec![
///     Ok::<_, std::io::Error>("data: {\"content\":\"Hel"),
///     Ok("lo\"}\n\n"),
/// ]);
/// let events: Vec<_> = reassemble(body).collect().await;
/// assert_eq!(events[0].as_ref().unwrap(), &ChatEvent::Token("Hello".to_string()));
/// # });
/// # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Runtime::new().unwrap().block_on(f)
/// # }
/// ```
pub fn reassemble<S, B, E>(stream: S) -> ChatStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: Into<Bytes> + 'static,
    E: Into<TransportError> + 'static,
{
    ChatStream {
        source: Some(stream.map(|chunk| chunk.map(Into::into).map_err(Into::into)).boxed()),
        reassembler: Reassembler::new(),
        pending: VecDeque::new(),
    }
}

/// A streamed chat answer.
///
/// Dropping the stream, or calling [`ChatStream::cancel`], releases the
/// underlying connection. Once a terminal item has been yielded the
/// connection is released as well and every further poll returns `None`.
pub struct ChatStream {
    source: Option<BoxStream<'static, Result<Bytes, TransportError>>>,
    reassembler: Reassembler,
    pending: VecDeque<Result<ChatEvent, ClientError>>,
}

impl ChatStream {
    /// All citations received so far, in arrival order.
    pub fn citations(&self) -> &[Source] {
        self.reassembler.citations()
    }

    /// Stop reading and release the byte source. Undelivered events are dropped.
    pub fn cancel(&mut self) {
        if self.source.take().is_some() {
            debug!("chat stream cancelled by consumer");
        }
        self.pending.clear();
        self.reassembler.abort();
    }

    /// Whether the byte source is still held.
    pub fn is_open(&self) -> bool {
        self.source.is_some()
    }

    /// Drain the stream into a transcript.
    pub async fn into_transcript(mut self) -> Result<ChatTranscript, ClientError> {
        let mut transcript = ChatTranscript::default();
        while let Some(event) = self.next().await {
            transcript.record(event?);
        }
        Ok(transcript)
    }

    fn enqueue(&mut self, batch: Batch) {
        self.pending.extend(batch.events.into_iter().map(Ok));
        match batch.end {
            Some(End::Upstream(message)) => {
                self.pending.push_back(Err(ClientError::Upstream(message)));
                self.source = None;
            }
            Some(End::Done) => self.source = None,
            None => {}
        }
    }
}

impl Stream for ChatStream {
    type Item = Result<ChatEvent, ClientError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(item) = this.pending.pop_front() {
                return Poll::Ready(Some(item));
            }

            let Some(source) = this.source.as_mut() else {
                return Poll::Ready(None);
            };

            match ready!(source.poll_next_unpin(cx)) {
                Some(Ok(chunk)) => {
                    let batch = this.reassembler.push(&chunk);
                    this.enqueue(batch);
                }
                Some(Err(e)) => {
                    warn!(error = %e, "chat stream read failed");
                    this.reassembler.abort();
                    this.source = None;
                    return Poll::Ready(Some(Err(ClientError::Transport(e))));
                }
                None => {
                    let batch = this.reassembler.finish();
                    this.enqueue(batch);
                    this.source = None;
                }
            }
        }
    }
}

impl FusedStream for ChatStream {
    fn is_terminated(&self) -> bool {
        self.source.is_none() && self.pending.is_empty()
    }
}

impl std::fmt::Debug for ChatStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatStream")
            .field("open", &self.is_open())
            .field("pending", &self.pending.len())
            .field("citations", &self.citations().len())
            .finish()
    }
}

/// How a stream ended.
#[derive(Debug, Clone, PartialEq)]
pub enum End {
    /// Input exhausted or `[DONE]` received
    Done,

    /// The backend sent an `error` frame
    Upstream(String),
}

/// Events produced by one call to [`Reassembler::push`] or [`Reassembler::finish`].
#[derive(Debug, Default, PartialEq)]
pub struct Batch {
    pub events: Vec<ChatEvent>,

    /// Set when this batch terminates the stream
    pub end: Option<End>,
}

/// Synchronous SSE reassembly state for one response.
#[derive(Debug, Default)]
pub struct Reassembler {
    decoder: Utf8Decoder,
    buffer: String,
    citations: Vec<Source>,
    finished: bool,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network read. Only complete events are processed; the tail
    /// stays buffered until its delimiter arrives.
    pub fn push(&mut self, chunk: &[u8]) -> Batch {
        let mut batch = Batch::default();
        if self.finished {
            return batch;
        }

        let text = self.decoder.decode(chunk);
        self.append(&text);
        self.drain_complete(&mut batch);
        self.close_if_ended(&batch);
        batch
    }

    /// Signal end of input: the buffered tail is processed as a last event.
    pub fn finish(&mut self) -> Batch {
        let mut batch = Batch::default();
        if self.finished {
            return batch;
        }

        let text = self.decoder.finish();
        self.append(&text);
        self.drain_complete(&mut batch);

        if batch.end.is_none() {
            let tail = std::mem::take(&mut self.buffer);
            self.process_segment(&tail, &mut batch);
        }

        batch.end.get_or_insert(End::Done);
        self.close_if_ended(&batch);
        batch
    }

    /// Drop buffered input after a transport failure.
    pub fn abort(&mut self) {
        self.buffer.clear();
        self.decoder = Utf8Decoder::default();
        self.finished = true;
    }

    pub fn citations(&self) -> &[Source] {
        &self.citations
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn append(&mut self, text: &str) {
        self.buffer.push_str(text);
        // A `\r` at the end of a read waits here for its `\n`.
        if self.buffer.contains("\r\n") {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }
    }

    fn drain_complete(&mut self, batch: &mut Batch) {
        while batch.end.is_none() {
            let Some(pos) = self.buffer.find(EVENT_DELIMITER) else {
                break;
            };
            let segment = self.buffer[..pos].to_string();
            self.buffer.drain(..pos + EVENT_DELIMITER.len());
            self.process_segment(&segment, batch);
        }
    }

    fn close_if_ended(&mut self, batch: &Batch) {
        if batch.end.is_some() {
            self.buffer.clear();
            self.finished = true;
        }
    }

    fn process_segment(&mut self, segment: &str, batch: &mut Batch) {
        let Some(payload) = event_data(segment) else {
            return;
        };

        let decoded = decode_payload(&payload);
        if decoded.done {
            batch.end = Some(End::Done);
            return;
        }

        if let Some(token) = decoded.token {
            batch.events.push(ChatEvent::Token(token));
        }

        if !decoded.sources.is_empty() {
            self.citations.extend(decoded.sources.iter().cloned());
            batch.events.push(ChatEvent::Citations(decoded.sources));
        }

        if let Some(error) = decoded.error {
            warn!(error = %error, "backend reported a chat error");
            batch.end = Some(End::Upstream(error));
        }
    }
}

/// Stateful UTF-8 decoder that carries incomplete multi-byte sequences
/// over to the next read. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);

        let mut out = String::with_capacity(bytes.len());
        let mut rest = bytes.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush bytes held back at end of input.
    pub fn finish(&mut self) -> String {
        let pending = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&pending).into_owned()
    }
}

/// Data carried by one event: its `data:` lines joined with `\n`.
///
/// Returns `None` for events without data (comments, `event:`-only blocks).
pub fn event_data(segment: &str) -> Option<String> {
    let mut lines = segment.lines().filter_map(parse_sse_line).peekable();
    lines.peek()?;
    Some(lines.join("\n"))
}

/// Parse an SSE line to extract the data portion.
///
/// # Example
/// ```
/// use litstream::sse::parse_sse_line;
///
/// assert_eq!(parse_sse_line("data: {\"content\":\"x\"}"), Some("{\"content\":\"x\"}"));
/// assert_eq!(parse_sse_line("data:x"), Some("x"));
/// assert_eq!(parse_sse_line(": keep-alive"), None);
/// ```
pub fn parse_sse_line(line: &str) -> Option<&str> {
    line.strip_prefix(DATA_FIELD)
        .map(|data| data.strip_prefix(' ').unwrap_or(data))
}

/// Check if an SSE data line indicates the stream is done.
pub fn is_done_marker(data: &str) -> bool {
    data.trim() == "[DONE]"
}

#[derive(Debug, Default, PartialEq)]
struct Decoded {
    token: Option<String>,
    sources: Vec<Source>,
    error: Option<String>,
    done: bool,
}

fn decode_payload(payload: &str) -> Decoded {
    if is_done_marker(payload) {
        return Decoded {
            done: true,
            ..Decoded::default()
        };
    }

    match serde_json::from_str::<ChatFrame>(payload) {
        Ok(frame) => {
            let mut sources = frame.sources.unwrap_or_default();
            let token = frame.content.and_then(|content| {
                let (token, inner_sources) = unwrap_content(content);
                sources.extend(inner_sources);
                token
            });
            Decoded {
                token,
                sources,
                error: frame.error,
                done: false,
            }
        }
        Err(e) => {
            let token = if looks_like_envelope(payload) {
                debug!(error = %e, "dropping malformed chat frame");
                None
            } else {
                Some(payload.to_string()).filter(|text| !text.trim().is_empty())
            };
            Decoded {
                token,
                ..Decoded::default()
            }
        }
    }
}

/// Resolve a `content` field that may itself hold serialized frames.
///
/// Several frames batched into one `content` are unwrapped one by one and
/// their texts concatenated.
fn unwrap_content(content: String) -> (Option<String>, Vec<Source>) {
    if !is_nested_envelope(&content) {
        return (Some(content).filter(|c| !c.is_empty()), Vec::new());
    }

    let mut text = String::new();
    let mut sources = Vec::new();
    for piece in content.split(EVENT_DELIMITER).filter(|p| !p.trim().is_empty()) {
        if !is_nested_envelope(piece) {
            text.push_str(piece);
            continue;
        }
        let (token, inner_sources) = unwrap_envelope(piece);
        text.extend(token);
        sources.extend(inner_sources);
    }
    (Some(text).filter(|t| !t.is_empty()), sources)
}

/// Decode a single nested frame, falling back to stripping its syntax.
fn unwrap_envelope(piece: &str) -> (Option<String>, Vec<Source>) {
    let inner = strip_data_prefix(piece.trim());
    match serde_json::from_str::<ChatFrame>(inner) {
        Ok(frame) => {
            if let Some(error) = &frame.error {
                debug!(error = %error, "ignoring error inside nested frame");
            }
            (
                frame.content.filter(|c| !c.is_empty()),
                frame.sources.unwrap_or_default(),
            )
        }
        Err(e) => {
            debug!(error = %e, "cleaning unparsable nested frame");
            let cleaned = strip_envelope(piece);
            (Some(cleaned).filter(|c| !c.is_empty()), Vec::new())
        }
    }
}

fn is_nested_envelope(text: &str) -> bool {
    let text = text.trim_start();
    text.starts_with(DATA_FIELD) || (text.starts_with('{') && text.contains("\"content\""))
}

fn looks_like_envelope(payload: &str) -> bool {
    let payload = payload.trim_start();
    payload.starts_with('{') || payload.starts_with('[') || payload.contains("\"content\"")
}

fn strip_data_prefix(text: &str) -> &str {
    text.strip_prefix(DATA_FIELD).map_or(text, str::trim_start)
}

/// Best-effort removal of frame syntax around a `content` value.
///
/// `data: {"content": "Hello wor` becomes `Hello wor`.
pub fn strip_envelope(text: &str) -> String {
    let mut rest = strip_data_prefix(text.trim());
    rest = rest.strip_prefix('{').unwrap_or(rest).trim_start();

    if let Some(after_key) = rest.strip_prefix("\"content\"") {
        rest = after_key.trim_start();
        rest = rest.strip_prefix(':').unwrap_or(rest).trim_start();
        rest = rest.strip_prefix('"').unwrap_or(rest);
    }

    let end = [find_unescaped(rest, "\","), find_unescaped(rest, "\"}")]
        .into_iter()
        .flatten()
        .min();
    let body = match end {
        Some(end) => &rest[..end],
        None => rest.trim_end_matches('}').trim_end_matches('"'),
    };

    unescape_json(body).trim().to_string()
}

/// First position of `pattern` whose leading quote is not escaped.
fn find_unescaped(text: &str, pattern: &str) -> Option<usize> {
    text.match_indices(pattern)
        .map(|(pos, _)| pos)
        .find(|&pos| !text[..pos].ends_with('\\'))
}

/// Undo the common JSON string escapes; unknown escapes are kept verbatim.
fn unescape_json(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some('/') => out.push('/'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::io;

    const SCENARIO: &str =
        "data: {\"content\":\"Hello\"}\n\ndata: {\"content\":\" world\",\"sources\":[{\"page\":3}]}\n\n";

    fn tokens(events: &[ChatEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|event| match event {
                ChatEvent::Token(token) => Some(token.clone()),
                ChatEvent::Citations(_) => None,
            })
            .collect()
    }

    /// Run `input` through a reassembler split into the given chunks.
    fn run_chunks(chunks: &[&[u8]]) -> (Vec<ChatEvent>, Vec<Source>, Option<End>) {
        let mut reassembler = Reassembler::new();
        let mut events = Vec::new();
        let mut end = None;
        for chunk in chunks {
            let batch = reassembler.push(chunk);
            events.extend(batch.events);
            end = end.or(batch.end);
        }
        let batch = reassembler.finish();
        events.extend(batch.events);
        (events, reassembler.citations().to_vec(), end.or(batch.end))
    }

    fn run_text(chunks: &[&str]) -> (Vec<ChatEvent>, Vec<Source>, Option<End>) {
        let bytes: Vec<&[u8]> = chunks.iter().map(|chunk| chunk.as_bytes()).collect();
        run_chunks(&bytes)
    }

    #[test]
    fn test_parse_sse_line() {
        assert_eq!(parse_sse_line("data: hello"), Some("hello"));
        assert_eq!(parse_sse_line("data:  two"), Some(" two"));
        assert_eq!(parse_sse_line("event: message"), None);
        assert_eq!(parse_sse_line(""), None);
    }

    #[test]
    fn test_is_done_marker() {
        assert!(is_done_marker("[DONE]"));
        assert!(is_done_marker(" [DONE] "));
        assert!(!is_done_marker(""));
        assert!(!is_done_marker("{\"content\": \"[DONE]\"}"));
    }

    #[test]
    fn test_event_data() {
        assert_eq!(event_data("data: a\ndata: b"), Some("a\nb".to_string()));
        assert_eq!(
            event_data("event: chunk\nid: 4\ndata: {}"),
            Some("{}".to_string())
        );
        assert_eq!(event_data(": ping"), None);
        assert_eq!(event_data(""), None);
    }

    #[test]
    fn test_scenario() {
        let (events, citations, end) = run_chunks(&[SCENARIO.as_bytes()]);
        assert_eq!(tokens(&events), vec!["Hello", " world"]);
        assert_eq!(citations, vec![Source::page(3)]);
        assert_eq!(end, Some(End::Done));
        assert_eq!(
            events,
            vec![
                ChatEvent::Token("Hello".to_string()),
                ChatEvent::Token(" world".to_string()),
                ChatEvent::Citations(vec![Source::page(3)]),
            ]
        );
    }

    #[test]
    fn test_every_split_point_gives_same_tokens() {
        let input = "data: {\"content\":\"Größe \"}\n\ndata: {\"content\":\"des 文献\"}\n\n: ping\n\ndata: {\"content\":\" ✓\",\"sources\":[{\"page\":1}]}\n\n";
        let bytes = input.as_bytes();

        for first in 0..=bytes.len() {
            let (events, citations, _) = run_chunks(&[&bytes[..first], &bytes[first..]]);
            assert_eq!(tokens(&events).concat(), "Größe des 文献 ✓", "split at {}", first);
            assert_eq!(citations, vec![Source::page(1)]);
        }
    }

    #[test]
    fn test_byte_by_byte() {
        let chunks: Vec<&[u8]> = SCENARIO.as_bytes().chunks(1).collect();
        let (events, citations, _) = run_chunks(&chunks);
        assert_eq!(tokens(&events), vec!["Hello", " world"]);
        assert_eq!(citations, vec![Source::page(3)]);
    }

    #[test]
    fn test_incomplete_event_is_held_back() {
        let mut reassembler = Reassembler::new();
        let batch = reassembler.push(b"data: {\"content\":\"Hel");
        assert!(batch.events.is_empty());
        let batch = reassembler.push(b"lo\"}\n");
        assert!(batch.events.is_empty());
        let batch = reassembler.push(b"\n");
        assert_eq!(batch.events, vec![ChatEvent::Token("Hello".to_string())]);
    }

    #[test]
    fn test_trailing_event_without_delimiter() {
        let (events, _, end) = run_text(&["data: {\"content\":\"a\"}\n\ndata: {\"content\":\"b\"}"]);
        assert_eq!(tokens(&events), vec!["a", "b"]);
        assert_eq!(end, Some(End::Done));
    }

    #[test]
    fn test_crlf_delimiters() {
        let (events, _, _) = run_text(&[
            "data: {\"content\":\"a\"}\r",
            "\n\r\ndata: {\"content\":\"b\"}\r\n\r\n",
        ]);
        assert_eq!(tokens(&events), vec!["a", "b"]);
    }

    #[test]
    fn test_nested_envelope() {
        let frame = serde_json::json!({ "content": "{\"content\": \"inner text\"}" }).to_string();
        let input = format!("data: {}\n\n", frame);
        let (events, _, _) = run_chunks(&[input.as_bytes()]);
        assert_eq!(tokens(&events), vec!["inner text"]);
    }

    #[test]
    fn test_nested_envelope_with_data_prefix_and_sources() {
        let frame = serde_json::json!({
            "content": "data: {\"content\": \"inner\", \"sources\": [{\"page\": 9}]}"
        })
        .to_string();
        let input = format!("data: {}\n\n", frame);
        let (events, citations, _) = run_chunks(&[input.as_bytes()]);
        assert_eq!(tokens(&events), vec!["inner"]);
        assert_eq!(citations, vec![Source::page(9)]);
    }

    #[test]
    fn test_broken_nested_envelope_is_cleaned() {
        let frame = serde_json::json!({ "content": "data: {\"content\": \"Hello wor" }).to_string();
        let input = format!("data: {}\n\n", frame);
        let (events, _, _) = run_chunks(&[input.as_bytes()]);
        assert_eq!(tokens(&events), vec!["Hello wor"]);
    }

    #[test]
    fn test_malformed_frame_then_valid_frame() {
        let (events, _, end) = run_text(&[
            "data: {\"content\": \"broken\n\ndata: {\"content\":\"ok\"}\n\n",
        ]);
        assert_eq!(tokens(&events), vec!["ok"]);
        assert_eq!(end, Some(End::Done));
    }

    #[test]
    fn test_plain_text_payload_is_salvaged() {
        let (events, _, _) = run_text(&["data: just text\n\ndata: {\"content\":\"!\"}\n\n"]);
        assert_eq!(tokens(&events), vec!["just text", "!"]);
    }

    #[test]
    fn test_sources_accumulate() {
        let (events, citations, _) = run_text(&[
            "data: {\"content\":\"a\",\"sources\":[{\"page\":1}]}\n\n",
            "data: {\"content\":\"b\",\"sources\":[{\"page\":2}]}\n\n",
            "data: {\"content\":\"c\",\"sources\":[]}\n\n",
        ]);
        assert_eq!(citations, vec![Source::page(1), Source::page(2)]);
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, ChatEvent::Citations(_)))
                .count(),
            2
        );
    }

    #[test]
    fn test_error_frame_terminates() {
        let mut reassembler = Reassembler::new();
        let batch = reassembler.push(
            b"data: {\"content\":\"partial\"}\n\ndata: {\"error\":\"boom\"}\n\ndata: {\"content\":\"late\"}\n\n",
        );
        assert_eq!(batch.events, vec![ChatEvent::Token("partial".to_string())]);
        assert_eq!(batch.end, Some(End::Upstream("boom".to_string())));
        assert!(reassembler.is_finished());
        assert_eq!(reassembler.push(b"data: {\"content\":\"x\"}\n\n"), Batch::default());
        assert_eq!(reassembler.finish(), Batch::default());
    }

    #[test]
    fn test_done_marker_ends_stream() {
        let (events, _, end) = run_text(&[
            "data: {\"content\":\"a\"}\n\ndata: [DONE]\n\ndata: {\"content\":\"b\"}\n\n",
        ]);
        assert_eq!(tokens(&events), vec!["a"]);
        assert_eq!(end, Some(End::Done));
    }

    #[test]
    fn test_utf8_decoder_split_character() {
        let mut decoder = Utf8Decoder::new();
        let bytes = "é".as_bytes();
        assert_eq!(decoder.decode(&bytes[..1]), "");
        assert_eq!(decoder.decode(&bytes[1..]), "é");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn test_utf8_decoder_invalid_bytes() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{FFFD}b");
        assert_eq!(decoder.decode(b"\xe2\x82"), "");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }

    #[test]
    fn test_strip_envelope() {
        assert_eq!(strip_envelope("data: {\"content\": \"Hello wor"), "Hello wor");
        assert_eq!(
            strip_envelope("{\"content\":\"line\\none\",\"sources\":["),
            "line\none"
        );
        assert_eq!(strip_envelope("{\"content\":\"quoted \\\"x\\\"\"}"), "quoted \"x\"");
        assert_eq!(strip_envelope("{\"content\":\""), "");
        assert_eq!(
            strip_envelope("{\"content\": \"a\"}\n\ndata: {\"content\": \"b"),
            "a"
        );
    }

    #[test]
    fn test_content_survives_odd_sources() {
        let (events, citations, _) = run_text(&[
            "data: {\"content\":\"Hello\",\"sources\":[{\"page\":3.0}]}\n\n",
            "data: {\"content\":\" there\",\"sources\":[{\"page\":null}]}\n\n",
        ]);
        assert_eq!(tokens(&events), vec!["Hello", " there"]);
        assert_eq!(citations.len(), 1);
        assert_eq!(citations[0].page_number(), Some(3));
    }

    #[test]
    fn test_batched_nested_envelopes() {
        let frame = serde_json::json!({
            "content": "data: {\"content\": \"a\"}\n\ndata: {\"content\": \"b\", \"sources\": [{\"page\": 1}]}\n\n"
        })
        .to_string();
        let input = format!("data: {}\n\n", frame);
        let (events, citations, _) = run_chunks(&[input.as_bytes()]);
        assert_eq!(tokens(&events), vec!["ab"]);
        assert_eq!(citations, vec![Source::page(1)]);
    }

    #[test]
    fn test_batched_broken_nested_envelopes_leak_no_syntax() {
        let frame = serde_json::json!({
            "content": "data: {\"content\": \"a\"}\n\ndata: {\"content\": \"b"
        })
        .to_string();
        let input = format!("data: {}\n\n", frame);
        let (events, _, _) = run_chunks(&[input.as_bytes()]);
        assert_eq!(tokens(&events), vec!["ab"]);
    }

    #[test]
    fn test_nested_error_is_not_terminal() {
        let frame = serde_json::json!({
            "content": "{\"content\": \"inner\", \"error\": \"ignored\"}"
        })
        .to_string();
        let input = format!("data: {}\n\ndata: {{\"content\":\" next\"}}\n\n", frame);
        let (events, _, end) = run_chunks(&[input.as_bytes()]);
        assert_eq!(tokens(&events), vec!["inner", " next"]);
        assert_eq!(end, Some(End::Done));
    }

    #[test]
    fn test_chat_stream_is_send_and_unpin() {
        fn assert_send_unpin<T: Send + Unpin>() {}
        assert_send_unpin::<ChatStream>();
        assert_send_unpin::<Reassembler>();
    }

    #[tokio::test]
    async fn test_chat_stream_scenario() {
        let chunks: Vec<Result<&'static str, io::Error>> = vec![
            Ok("data: {\"content\":\"Hel"),
            Ok("lo\"}\n\ndata: {\"content\":\" world\",\"sources\":[{\"page\":3}]}\n"),
            Ok("\n"),
        ];
        let transcript = reassemble(stream::iter(chunks))
            .into_transcript()
            .await
            .unwrap();
        assert_eq!(transcript.tokens, vec!["Hello", " world"]);
        assert_eq!(transcript.text(), "Hello world");
        assert_eq!(transcript.citations, vec![Source::page(3)]);
    }

    #[tokio::test]
    async fn test_transport_error_is_terminal() {
        let chunks: Vec<Result<&'static str, io::Error>> = vec![
            Ok("data: {\"content\":\"one\"}\n\ndata: {\"content\":\"two"),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
            Ok("\"}\n\ndata: {\"content\":\"three\"}\n\n"),
        ];
        let mut chat = reassemble(stream::iter(chunks));

        assert_eq!(
            chat.next().await.unwrap().unwrap(),
            ChatEvent::Token("one".to_string())
        );
        let err = chat.next().await.unwrap().unwrap_err();
        assert!(err.is_transport());
        assert!(!chat.is_open());
        assert!(chat.is_terminated());
        assert!(chat.next().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_releases_source() {
        let body = stream::iter(vec![Ok::<_, io::Error>(SCENARIO)]).chain(stream::pending());
        let mut chat = reassemble(body);

        assert_eq!(
            chat.next().await.unwrap().unwrap(),
            ChatEvent::Token("Hello".to_string())
        );
        chat.cancel();
        assert!(!chat.is_open());
        assert!(chat.next().await.is_none());
    }

    #[tokio::test]
    async fn test_done_marker_releases_source() {
        let body = stream::iter(vec![Ok::<_, io::Error>("data: {\"content\":\"a\"}\n\ndata: [DONE]\n\n")])
            .chain(stream::pending());
        let transcript = reassemble(body).into_transcript().await.unwrap();
        assert_eq!(transcript.text(), "a");
    }
}

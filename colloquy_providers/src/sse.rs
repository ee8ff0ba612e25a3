//! Incremental parsing of `text/event-stream` completion responses.
//!
//! The network body is drained by a dedicated reader task that turns raw
//! bytes into [`ReaderEvent`]s and pushes them through a bounded channel. The
//! calling task consumes the channel and races it against a rolling stall
//! deadline; when the deadline wins the reader is aborted and the call fails
//! with [`TransportError::StallTimeout`].

use colloquy_core::{GenerationProgress, StreamChunk, TransportError};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::fmt::Display;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, warn};
use uuid::Uuid;

/// Payload of the line that terminates a successful stream.
pub const DONE_SENTINEL: &str = "[DONE]";

const CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Deserialize)]
struct WireChunk {
    #[serde(default)]
    id: String,
    #[serde(default)]
    choices: Vec<WireChoice>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    #[serde(default)]
    delta: WireDelta,
    #[serde(default, rename = "finishReason", alias = "finish_reason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Classification of a single line of the response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    Blank,
    Done,
    Chunk(StreamChunk),
    /// Comments and SSE fields other than `data`.
    Ignored,
}

pub fn parse_line(line: &str) -> Result<SseLine, TransportError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(SseLine::Blank);
    }
    if line.starts_with(':') {
        return Ok(SseLine::Ignored);
    }

    let Some(payload) = line.strip_prefix("data:") else {
        if ["event:", "id:", "retry:"]
            .iter()
            .any(|field| line.starts_with(field))
        {
            return Ok(SseLine::Ignored);
        }
        return Err(TransportError::StreamParse(format!(
            "unexpected line: {line}"
        )));
    };

    let payload = payload.trim();
    if payload == DONE_SENTINEL {
        return Ok(SseLine::Done);
    }

    let wire: WireChunk = serde_json::from_str(payload)
        .map_err(|e| TransportError::StreamParse(format!("{e}: {payload}")))?;
    let (delta_text, finish_reason) = wire
        .choices
        .into_iter()
        .next()
        .map(|choice| (choice.delta.content.unwrap_or_default(), choice.finish_reason))
        .unwrap_or_default();

    Ok(SseLine::Chunk(StreamChunk {
        id: wire.id,
        delta_text,
        finish_reason,
    }))
}

/// Splits a byte stream into lines, holding back a trailing partial line
/// until the rest of it arrives.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(
                String::from_utf8_lossy(&raw)
                    .trim_end_matches(['\r', '\n'])
                    .to_string(),
            );
        }
        lines
    }

    /// Returns whatever is left once the body has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

#[derive(Debug)]
enum ReaderEvent {
    Chunk(StreamChunk),
    /// Bytes arrived but carried no content (keep-alives, partial lines).
    Activity,
    Malformed(TransportError),
    Failed(TransportError),
    Done,
}

impl ReaderEvent {
    fn from_line(line: &str) -> Self {
        match parse_line(line) {
            Ok(SseLine::Chunk(chunk)) => Self::Chunk(chunk),
            Ok(SseLine::Done) => Self::Done,
            Ok(SseLine::Blank | SseLine::Ignored) => Self::Activity,
            Err(e) => Self::Malformed(e),
        }
    }
}

/// Aborts the reader when the consumer goes away, whatever the reason.
struct ReaderTask(JoinHandle<()>);

impl Drop for ReaderTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn read_events<S, B, E>(mut body: S, tx: mpsc::Sender<ReaderEvent>)
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    let mut buffer = LineBuffer::default();
    while let Some(item) = body.next().await {
        let lines = match item {
            Ok(bytes) => buffer.push(bytes.as_ref()),
            Err(e) => {
                let failure = TransportError::Network(format!("stream interrupted: {e}"));
                let _ = tx.send(ReaderEvent::Failed(failure)).await;
                return;
            }
        };

        if lines.is_empty() {
            if tx.send(ReaderEvent::Activity).await.is_err() {
                return;
            }
            continue;
        }

        for line in lines {
            let event = ReaderEvent::from_line(&line);
            let done = matches!(event, ReaderEvent::Done);
            if tx.send(event).await.is_err() || done {
                return;
            }
        }
    }

    if let Some(rest) = buffer.finish() {
        let _ = tx.send(ReaderEvent::from_line(&rest)).await;
    }
}

/// Final state of a fully consumed stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOutcome {
    pub message_id: String,
    pub text: String,
    pub dropped_chunks: u64,
}

/// Drives `body` to completion, reporting accumulated text after every chunk
/// and once more with `is_complete = true` when the stream ends.
///
/// The stream ends successfully on the `[DONE]` sentinel or when the body
/// closes. If nothing arrives for `stall_timeout` since the previous read the
/// reader is aborted and `StallTimeout` is returned.
pub async fn consume_stream<S, B, E>(
    body: S,
    stall_timeout: Duration,
    on_progress: &mut (dyn FnMut(GenerationProgress) + Send),
) -> Result<StreamOutcome, TransportError>
where
    S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
    let reader = ReaderTask(tokio::spawn(read_events(body, tx)));

    let mut message_id = String::new();
    let mut text = String::new();
    let mut dropped_chunks = 0;
    let mut deadline = Instant::now() + stall_timeout;

    loop {
        let event = tokio::select! {
            event = rx.recv() => event,
            () = sleep_until(deadline) => {
                warn!(
                    "No stream data for {}s, aborting (received {} chars)",
                    stall_timeout.as_secs(),
                    text.len()
                );
                drop(reader);
                return Err(TransportError::StallTimeout(stall_timeout));
            }
        };
        deadline = Instant::now() + stall_timeout;

        match event {
            Some(ReaderEvent::Chunk(chunk)) => {
                if message_id.is_empty() {
                    message_id = chunk.id;
                }
                if let Some(reason) = &chunk.finish_reason {
                    debug!("Stream finish reason: {reason}");
                }
                text.push_str(&chunk.delta_text);
                on_progress(GenerationProgress::partial(&message_id, &text));
            }
            Some(ReaderEvent::Activity) => {}
            Some(ReaderEvent::Malformed(e)) => {
                dropped_chunks += 1;
                warn!("Dropping stream chunk: {e}");
            }
            Some(ReaderEvent::Failed(e)) => return Err(e),
            Some(ReaderEvent::Done) | None => break,
        }
    }

    if message_id.is_empty() {
        message_id = Uuid::now_v7().to_string();
    }
    on_progress(GenerationProgress::complete(&message_id, &text));

    Ok(StreamOutcome {
        message_id,
        text,
        dropped_chunks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::io;

    type Body = Result<&'static str, io::Error>;

    fn data(content: &str) -> String {
        format!(
            "data: {{\"id\":\"chatcmpl-1\",\"choices\":[{{\"delta\":{{\"content\":\"{content}\"}},\"finishReason\":null}}]}}\n\n"
        )
    }

    fn leak(s: String) -> &'static str {
        Box::leak(s.into_boxed_str())
    }

    async fn collect(
        body: impl Stream<Item = Body> + Send + Unpin + 'static,
    ) -> (Result<StreamOutcome, TransportError>, Vec<GenerationProgress>) {
        let mut events = Vec::new();
        let result = consume_stream(body, Duration::from_secs(30), &mut |p| events.push(p)).await;
        (result, events)
    }

    #[test]
    fn parses_data_line() {
        let line = r#"data: {"id":"x","choices":[{"delta":{"content":"Hi"},"finish_reason":"stop"}]}"#;
        assert_eq!(
            parse_line(line),
            Ok(SseLine::Chunk(StreamChunk {
                id: "x".into(),
                delta_text: "Hi".into(),
                finish_reason: Some("stop".into()),
            }))
        );
    }

    #[test]
    fn classifies_control_lines() {
        assert_eq!(parse_line(""), Ok(SseLine::Blank));
        assert_eq!(parse_line("   "), Ok(SseLine::Blank));
        assert_eq!(parse_line("data: [DONE]"), Ok(SseLine::Done));
        assert_eq!(parse_line(": keep-alive"), Ok(SseLine::Ignored));
        assert_eq!(parse_line("event: message"), Ok(SseLine::Ignored));
    }

    #[test]
    fn role_only_delta_has_empty_text() {
        let line = r#"data: {"id":"x","choices":[{"delta":{"role":"assistant"}}]}"#;
        match parse_line(line) {
            Ok(SseLine::Chunk(chunk)) => assert_eq!(chunk.delta_text, ""),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            parse_line("data: {not json"),
            Err(TransportError::StreamParse(_))
        ));
        assert!(matches!(
            parse_line("hello"),
            Err(TransportError::StreamParse(_))
        ));
    }

    #[test]
    fn line_buffer_joins_split_reads() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(b"data: {\"id\":").is_empty());
        let lines = buffer.push(b"\"a\"}\r\ndata: [DO");
        assert_eq!(lines, vec!["data: {\"id\":\"a\"}".to_string()]);
        assert_eq!(buffer.push(b"NE]\n"), vec!["data: [DONE]".to_string()]);
        assert_eq!(buffer.finish(), None);
    }

    #[tokio::test]
    async fn accumulates_chunks_in_order() {
        let body = stream::iter(vec![
            Ok(leak(data("A"))),
            Ok(leak(data("B"))),
            Ok(leak(data("C"))),
            Ok("data: [DONE]\n\n"),
        ]);
        let (result, events) = collect(body).await;

        let outcome = result.unwrap_or_else(|e| panic!("stream failed: {e}"));
        assert_eq!(outcome.text, "ABC");
        assert_eq!(outcome.message_id, "chatcmpl-1");

        let texts: Vec<_> = events.iter().map(|p| p.accumulated_text.as_str()).collect();
        assert_eq!(texts, vec!["A", "AB", "ABC", "ABC"]);
        let completions: Vec<_> = events.iter().filter(|p| p.is_complete).collect();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].accumulated_text, "ABC");
        assert!(events.last().is_some_and(|p| p.is_complete));
    }

    #[tokio::test]
    async fn socket_close_without_sentinel_completes() {
        let body = stream::iter(vec![Ok(leak(data("Hel"))), Ok(leak(data("lo")))]);
        let (result, events) = collect(body).await;
        assert_eq!(result.map(|o| o.text), Ok("Hello".to_string()));
        assert_eq!(events.iter().filter(|p| p.is_complete).count(), 1);
    }

    #[tokio::test]
    async fn malformed_chunk_is_dropped_and_stream_continues() {
        let body = stream::iter(vec![
            Ok(leak(data("A"))),
            Ok("data: {broken\n\n"),
            Ok(leak(data("B"))),
            Ok("data: [DONE]\n"),
        ]);
        let (result, _) = collect(body).await;
        let outcome = result.unwrap_or_else(|e| panic!("stream failed: {e}"));
        assert_eq!(outcome.text, "AB");
        assert_eq!(outcome.dropped_chunks, 1);
    }

    #[tokio::test]
    async fn body_error_fails_without_completion_event() {
        let body = stream::iter(vec![
            Ok(leak(data("A"))),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ]);
        let (result, events) = collect(body).await;
        assert!(matches!(result, Err(TransportError::Network(_))));
        assert!(events.iter().all(|p| !p.is_complete));
    }

    #[tokio::test(start_paused = true)]
    async fn silence_after_last_chunk_stalls() {
        let body = stream::iter(vec![Ok(leak(data("A"))), Ok(leak(data("B")))])
            .chain(stream::pending());
        let started = Instant::now();
        let (result, events) = collect(body).await;

        assert_eq!(
            result,
            Err(TransportError::StallTimeout(Duration::from_secs(30)))
        );
        assert!(started.elapsed() >= Duration::from_secs(30));
        let texts: Vec<_> = events.iter().map(|p| p.accumulated_text.as_str()).collect();
        assert_eq!(texts, vec!["A", "AB"]);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_but_steady_stream_is_not_a_stall() {
        // Five chunks 20s apart: 100s in total, never 30s of silence.
        let body = stream::unfold(0_u32, |n| async move {
            match n {
                0..5 => {
                    tokio::time::sleep(Duration::from_secs(20)).await;
                    Some((Ok::<_, io::Error>(leak(data("x"))), n + 1))
                }
                5 => Some((Ok("data: [DONE]\n"), n + 1)),
                _ => None,
            }
        });
        let started = Instant::now();
        let (result, _) = collect(Box::pin(body)).await;
        assert_eq!(result.map(|o| o.text), Ok("xxxxx".to_string()));
        assert!(started.elapsed() >= Duration::from_secs(100));
    }
}

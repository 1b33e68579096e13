//! Incremental decoding of the bot response stream.
//!
//! The backend answers `POST /botAsk` with a newline-delimited stream:
//! meaningful lines look like `data: {"content":"..."}`, blank lines are
//! keep-alives, and `data: [DONE]` marks the end of the reply. Chunk
//! boundaries fall anywhere, including mid-line, so [`LineFramer`] reassembles
//! complete lines before [`decode_line`] classifies them.

use futures_util::StreamExt;
use memchr::memchr;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::api::{ApiErrorBody, BotAskRequest, StreamEvent};
use crate::utils::url::construct_api_url;

/// Sentinel payload that terminates a reply stream.
const DONE_MARKER: &str = "[DONE]";

/// Reassembles newline-delimited lines from raw transport chunks.
///
/// Carries the incomplete tail of each chunk over to the next one, so a line
/// split across any number of chunks is yielded intact exactly once. This
/// stage never fails: invalid UTF-8 is replaced lossily and the decoder deals
/// with whatever comes out. A tail left over when the stream closes is
/// dropped, since well-formed streams end in a terminator line.
#[derive(Default)]
pub struct LineFramer {
    buffer: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk, returning every line it completes, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(newline_pos) = memchr(b'\n', &self.buffer) {
            // CRLF-framed streams leave a trailing CR; drop it so the
            // decoder sees the same line either way.
            let mut end = newline_pos;
            if end > 0 && self.buffer[end - 1] == b'\r' {
                end -= 1;
            }
            let line = String::from_utf8_lossy(&self.buffer[..end]).into_owned();
            self.buffer.drain(..=newline_pos);
            lines.push(line);
        }
        lines
    }

    /// The carried-over fragment, if any. Only inspected by tests and by the
    /// read loop's end-of-stream logging.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }
}

/// Classification of one stream line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    /// Blank line, keep-alive, or anything else without a payload.
    Noop,
    /// The terminator line; no further content follows.
    Done,
    /// One fragment of reply text.
    Content(String),
    /// A `data:` line whose payload could not be understood. Carried so the
    /// caller can log it; never aborts the stream.
    Malformed(String),
}

fn extract_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}

/// Classify one line. Pure; logging and state changes are the caller's job.
pub fn decode_line(line: &str) -> LineEvent {
    if line.trim().is_empty() {
        return LineEvent::Noop;
    }

    let Some(payload) = extract_data_payload(line) else {
        return LineEvent::Noop;
    };

    if payload == DONE_MARKER {
        return LineEvent::Done;
    }

    match serde_json::from_str::<StreamEvent>(payload) {
        Ok(event) => match event.content {
            Some(text) if !text.is_empty() => LineEvent::Content(text),
            Some(_) => LineEvent::Noop,
            None => LineEvent::Malformed(line.to_string()),
        },
        Err(_) => LineEvent::Malformed(line.to_string()),
    }
}

/// Events delivered to the session, tagged with the stream id they belong to
/// so replies from a superseded stream can be discarded.
#[derive(Clone, Debug)]
pub enum StreamMessage {
    /// The request was accepted; the bot placeholder may now be posted.
    Started,
    /// One fragment of reply text, to be appended to the placeholder.
    Chunk(String),
    /// The exchange failed; carries user-presentable detail.
    Error(String),
    /// No more events will arrive for this stream.
    End,
}

pub struct StreamParams {
    pub client: reqwest::Client,
    pub base_url: String,
    pub token: Option<String>,
    pub system_prompt: String,
    pub user_query: String,
    pub cancel_token: tokio_util::sync::CancellationToken,
    pub stream_id: u64,
}

fn format_transport_error(status: reqwest::StatusCode, body: &str) -> String {
    let detail = serde_json::from_str::<ApiErrorBody>(body)
        .ok()
        .and_then(|err| err.message)
        .unwrap_or_else(|| body.trim().to_string());

    if detail.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {detail}")
    }
}

/// Owns the sending half of the stream channel and spawns one read task per
/// exchange. The receiving half is drained by the chat loop, which applies
/// each event to the session; this task never touches session state itself.
#[derive(Clone)]
pub struct ChatStreamService {
    tx: mpsc::UnboundedSender<(StreamMessage, u64)>,
}

impl ChatStreamService {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(StreamMessage, u64)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn spawn_stream(&self, params: StreamParams) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let StreamParams {
                client,
                base_url,
                token,
                system_prompt,
                user_query,
                cancel_token,
                stream_id,
            } = params;

            let request = BotAskRequest {
                system_prompt,
                user_query,
            };

            tokio::select! {
                _ = run_stream(client, base_url, token, request, &cancel_token, &tx, stream_id) => {}
                _ = cancel_token.cancelled() => {
                    debug!(stream_id, "stream cancelled");
                }
            }
        });
    }
}

async fn run_stream(
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    request: BotAskRequest,
    cancel_token: &tokio_util::sync::CancellationToken,
    tx: &mpsc::UnboundedSender<(StreamMessage, u64)>,
    stream_id: u64,
) {
    let url = construct_api_url(&base_url, "botAsk");
    let mut http_request = client.post(url).header("Content-Type", "application/json");
    if let Some(token) = &token {
        http_request = http_request.bearer_auth(token);
    }

    let response = match http_request.json(&request).send().await {
        Ok(response) => response,
        Err(e) => {
            let _ = tx.send((StreamMessage::Error(e.to_string()), stream_id));
            let _ = tx.send((StreamMessage::End, stream_id));
            return;
        }
    };

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let _ = tx.send((
            StreamMessage::Error(format_transport_error(status, &body)),
            stream_id,
        ));
        let _ = tx.send((StreamMessage::End, stream_id));
        return;
    }

    let _ = tx.send((StreamMessage::Started, stream_id));
    debug!(stream_id, "stream opened");

    let mut stream = response.bytes_stream();
    let mut framer = LineFramer::new();

    while let Some(chunk) = stream.next().await {
        if cancel_token.is_cancelled() {
            return;
        }

        let chunk_bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = tx.send((StreamMessage::Error(e.to_string()), stream_id));
                let _ = tx.send((StreamMessage::End, stream_id));
                return;
            }
        };

        for line in framer.push(&chunk_bytes) {
            match decode_line(&line) {
                LineEvent::Noop => {}
                LineEvent::Content(text) => {
                    let _ = tx.send((StreamMessage::Chunk(text), stream_id));
                }
                LineEvent::Malformed(raw) => {
                    warn!(stream_id, line = %raw, "skipping malformed stream line");
                }
                LineEvent::Done => {
                    let _ = tx.send((StreamMessage::End, stream_id));
                    return;
                }
            }
        }
    }

    // Natural close without a terminator still ends the exchange cleanly.
    // Any dangling partial line is dropped with the framer.
    if !framer.pending().is_empty() {
        debug!(stream_id, "discarding incomplete trailing fragment");
    }
    let _ = tx.send((StreamMessage::End, stream_id));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_str(framer: &mut LineFramer, chunk: &str) -> Vec<String> {
        framer.push(chunk.as_bytes())
    }

    #[test]
    fn framer_yields_complete_lines_in_order() {
        let mut framer = LineFramer::new();
        let lines = push_str(&mut framer, "one\ntwo\nthr");
        assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);
        let lines = push_str(&mut framer, "ee\n");
        assert_eq!(lines, vec!["three".to_string()]);
        assert!(framer.pending().is_empty());
    }

    #[test]
    fn framer_reassembles_lines_across_arbitrary_chunk_splits() {
        let line = r#"data: {"content":"Hello, world"}"#;
        let full = format!("{line}\n");

        // Every possible split point of the line into two chunks must yield
        // the line intact exactly once.
        for split in 0..full.len() {
            let mut framer = LineFramer::new();
            let mut lines = push_str(&mut framer, &full[..split]);
            lines.extend(push_str(&mut framer, &full[split..]));
            assert_eq!(lines, vec![line.to_string()], "split at {split}");
        }

        // Byte-at-a-time delivery.
        let mut framer = LineFramer::new();
        let mut lines = Vec::new();
        for byte in full.as_bytes() {
            lines.extend(framer.push(std::slice::from_ref(byte)));
        }
        assert_eq!(lines, vec![line.to_string()]);
    }

    #[test]
    fn framer_strips_crlf_line_endings() {
        let mut framer = LineFramer::new();
        let lines = push_str(&mut framer, "data: {\"content\":\"Hi\"}\r\ndata: [DONE]\r\n");
        assert_eq!(
            lines,
            vec![
                r#"data: {"content":"Hi"}"#.to_string(),
                "data: [DONE]".to_string(),
            ]
        );
        // The terminator must still classify as such after CR stripping,
        // even when the CR arrives in its own chunk.
        assert_eq!(decode_line(&lines[1]), LineEvent::Done);

        let mut framer = LineFramer::new();
        let mut lines = push_str(&mut framer, "data: [DONE]\r");
        lines.extend(push_str(&mut framer, "\n"));
        assert_eq!(lines, vec!["data: [DONE]".to_string()]);
    }

    #[test]
    fn framer_drops_dangling_tail() {
        let mut framer = LineFramer::new();
        let lines = push_str(&mut framer, "data: {\"content\":\"Hi\"}\ndata: {\"cont");
        assert_eq!(lines.len(), 1);
        assert_eq!(framer.pending(), b"data: {\"cont");
        // Stream end: the tail is never surfaced as a line.
    }

    #[test]
    fn decode_classifies_control_lines() {
        assert_eq!(decode_line(""), LineEvent::Noop);
        assert_eq!(decode_line("   "), LineEvent::Noop);
        assert_eq!(decode_line("data: [DONE]"), LineEvent::Done);
        assert_eq!(decode_line("data:[DONE]"), LineEvent::Done);
        assert_eq!(decode_line(": keep-alive comment"), LineEvent::Noop);
    }

    #[test]
    fn decode_extracts_content() {
        assert_eq!(
            decode_line(r#"data: {"content":"Hello"}"#),
            LineEvent::Content("Hello".to_string())
        );
        assert_eq!(
            decode_line(r#"data:{"content":"spacing optional"}"#),
            LineEvent::Content("spacing optional".to_string())
        );
        // Extra fields ride along without disturbing the payload.
        assert_eq!(
            decode_line(r#"data: {"content":"Hi","tokens":2}"#),
            LineEvent::Content("Hi".to_string())
        );
    }

    #[test]
    fn decode_flags_malformed_payloads() {
        assert!(matches!(
            decode_line("data: {not json"),
            LineEvent::Malformed(_)
        ));
        assert!(matches!(
            decode_line(r#"data: {"other":"field"}"#),
            LineEvent::Malformed(_)
        ));
    }

    #[test]
    fn decode_treats_empty_content_as_noop() {
        assert_eq!(decode_line(r#"data: {"content":""}"#), LineEvent::Noop);
    }

    #[test]
    fn done_is_never_content() {
        assert_eq!(decode_line("data: [DONE]"), LineEvent::Done);
        assert!(!matches!(decode_line("data: [DONE]"), LineEvent::Content(_)));
    }

    #[test]
    fn transport_errors_prefer_the_message_envelope() {
        let formatted = format_transport_error(
            reqwest::StatusCode::UNAUTHORIZED,
            r#"{"message":"Token expired"}"#,
        );
        assert_eq!(formatted, "401 Unauthorized: Token expired");

        let formatted =
            format_transport_error(reqwest::StatusCode::BAD_GATEWAY, "upstream sad");
        assert_eq!(formatted, "502 Bad Gateway: upstream sad");

        let formatted = format_transport_error(reqwest::StatusCode::BAD_GATEWAY, "");
        assert_eq!(formatted, "502 Bad Gateway");
    }
}

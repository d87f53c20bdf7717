//! NDJSON stream relay for Ollama streaming responses.
//!
//! Reads the upstream body as bytes, splits it into newline-terminated JSON
//! objects, and turns each one into [`ChatFragment`]s as soon as its newline
//! arrives. The upstream connection is owned by the returned stream: it is
//! released on the terminal fragment, and dropping the stream early closes it.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};

use super::errors::{GatewayError, TransportError};
use super::normalize::normalize;
use super::registry::{ActiveSelection, ServerRegistry};
use super::transport::ByteStream;
use super::types::{ChatFragment, PullLine, PullProgress};

/// Lazy, finite sequence of fragments ending in `Done` or `Error`.
pub type FragmentStream = BoxStream<'static, ChatFragment>;

/// Progress events from a model pull.
pub type PullStream = BoxStream<'static, Result<PullProgress, GatewayError>>;

// ─── Line splitting ──────────────────────────────────────────────────────────

/// Splits a byte stream into lines.
///
/// Holds at most the unterminated tail of the current line; every complete
/// line is handed out on the read that completes it.
#[derive(Debug, Default)]
pub struct LineBuffer {
    partial: Vec<u8>,
}

impl LineBuffer {
    /// Append a chunk and return the lines it completed, trimmed, skipping blanks.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = self.partial.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line_bytes);
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                lines.push(trimmed.to_string());
            }
        }
        lines
    }

    /// The trailing unterminated line, if any, once the body has ended.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.partial);
        let line = String::from_utf8_lossy(&rest);
        let trimmed = line.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}

/// Fragments produced by one upstream line.
///
/// Unparsable lines produce nothing. A line may carry both the last piece of
/// content and the end-of-stream flag.
pub fn parse_line(line: &str) -> Vec<ChatFragment> {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
        tracing::trace!(line, "skipping unparsable stream line");
        return Vec::new();
    };

    let body = normalize(&value);
    if let Some(message) = body.error {
        return vec![ChatFragment::Error { message }];
    }

    let mut fragments = Vec::with_capacity(2);
    if !body.content.is_empty() {
        fragments.push(ChatFragment::Content(body.content));
    }
    if body.done {
        fragments.push(ChatFragment::Done);
    }
    fragments
}

// ─── Chat / generate relay ───────────────────────────────────────────────────

/// Mutable state threaded through the relay's `unfold`.
struct RelayState {
    /// `None` once the upstream connection has been released.
    upstream: Option<ByteStream>,
    lines: LineBuffer,
    queued: VecDeque<ChatFragment>,
    finished: bool,
    registry: Arc<ServerRegistry>,
    selection: Arc<ActiveSelection>,
    yielded: usize,
}

impl RelayState {
    /// Queue fragments up to and including the first terminal one.
    fn enqueue(&mut self, fragments: Vec<ChatFragment>) {
        for fragment in fragments {
            if self.finished {
                return;
            }
            let terminal = fragment.is_terminal();
            if let ChatFragment::Error { ref message } = fragment {
                tracing::warn!(
                    endpoint = %self.selection.endpoint.label,
                    error = %message,
                    "upstream reported an error mid-stream"
                );
            }
            self.queued.push_back(fragment);
            if terminal {
                self.release();
            }
        }
    }

    fn absorb(&mut self, chunk: &[u8]) {
        for line in self.lines.push(chunk) {
            let fragments = parse_line(&line);
            self.enqueue(fragments);
            if self.finished {
                return;
            }
        }
    }

    fn fail(&mut self, err: TransportError) {
        let err = GatewayError::from_transport(&self.selection.endpoint, err);
        tracing::warn!(
            endpoint = %self.selection.endpoint.label,
            error = %err,
            fragments = self.yielded,
            "stream interrupted"
        );
        self.registry.invalidate(&self.selection);
        self.queued.push_back(ChatFragment::Error {
            message: err.to_string(),
        });
        self.release();
    }

    fn end_of_body(&mut self) {
        if let Some(line) = self.lines.finish() {
            let fragments = parse_line(&line);
            self.enqueue(fragments);
        }
        if !self.finished {
            self.queued.push_back(ChatFragment::Done);
            self.release();
        }
    }

    /// Drop the upstream body now rather than when the consumer drops us.
    fn release(&mut self) {
        self.finished = true;
        if self.upstream.take().is_some() {
            tracing::debug!(
                endpoint = %self.selection.endpoint.label,
                fragments = self.yielded,
                "upstream stream released"
            );
        }
    }
}

/// Relay an upstream NDJSON body as fragments.
///
/// Transport failures mid-stream invalidate `selection` and end the sequence
/// with an `Error` fragment after whatever was already yielded.
pub fn relay_fragments(
    upstream: ByteStream,
    registry: Arc<ServerRegistry>,
    selection: Arc<ActiveSelection>,
) -> FragmentStream {
    let state = RelayState {
        upstream: Some(upstream),
        lines: LineBuffer::default(),
        queued: VecDeque::new(),
        finished: false,
        registry,
        selection,
        yielded: 0,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(fragment) = state.queued.pop_front() {
                state.yielded += 1;
                return Some((fragment, state));
            }
            if state.finished {
                return None;
            }

            let next = match state.upstream.as_mut() {
                Some(upstream) => upstream.next().await,
                None => None,
            };
            match next {
                Some(Ok(bytes)) => state.absorb(&bytes),
                Some(Err(e)) => state.fail(e),
                None => state.end_of_body(),
            }
        }
    })
    .boxed()
}

// ─── Pull progress ───────────────────────────────────────────────────────────

struct PullState {
    upstream: Option<ByteStream>,
    lines: LineBuffer,
    queued: VecDeque<Result<PullProgress, GatewayError>>,
    registry: Arc<ServerRegistry>,
    selection: Arc<ActiveSelection>,
}

impl PullState {
    fn enqueue_line(&mut self, line: &str) {
        let Ok(parsed) = serde_json::from_str::<PullLine>(line) else {
            return;
        };
        if let Some(message) = parsed.error.clone() {
            self.queued.push_back(Err(GatewayError::UpstreamReported {
                endpoint: self.selection.endpoint.label.clone(),
                message,
            }));
            self.upstream = None;
            return;
        }
        let progress = PullProgress::from_line(parsed);
        let done = progress.is_success();
        self.queued.push_back(Ok(progress));
        if done {
            self.upstream = None;
        }
    }
}

/// Relay `/api/pull` progress lines.
///
/// Ends after the `success` line. An error line, a transport failure, or a
/// body that closes before `success` ends it with an `Err`.
pub fn relay_pull_progress(
    upstream: ByteStream,
    registry: Arc<ServerRegistry>,
    selection: Arc<ActiveSelection>,
) -> PullStream {
    let state = PullState {
        upstream: Some(upstream),
        lines: LineBuffer::default(),
        queued: VecDeque::new(),
        registry,
        selection,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.queued.pop_front() {
                return Some((item, state));
            }
            let Some(upstream) = state.upstream.as_mut() else {
                return None;
            };
            let next = upstream.next().await;
            match next {
                Some(Ok(bytes)) => {
                    for line in state.lines.push(&bytes) {
                        if state.upstream.is_none() {
                            break;
                        }
                        state.enqueue_line(&line);
                    }
                }
                Some(Err(e)) => {
                    state.registry.invalidate(&state.selection);
                    let err = GatewayError::from_transport(&state.selection.endpoint, e);
                    state.queued.push_back(Err(err));
                    state.upstream = None;
                }
                None => {
                    if let Some(line) = state.lines.finish() {
                        state.enqueue_line(&line);
                    }
                    if state.upstream.take().is_some() {
                        state.registry.invalidate(&state.selection);
                        state.queued.push_back(Err(GatewayError::UpstreamProtocolError {
                            endpoint: state.selection.endpoint.label.clone(),
                            reason: "pull ended before success".into(),
                        }));
                    }
                }
            }
        }
    })
    .boxed()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

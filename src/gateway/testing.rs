//! Scripted in-memory transport for gateway tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde_json::Value;

use super::errors::TransportError;
use super::transport::{ByteStream, UpstreamTransport};

/// A scripted streaming reply.
pub struct FakeStream {
    pub chunks: Vec<Result<Bytes, TransportError>>,
    /// Keep the connection open after the last chunk instead of closing it.
    pub hang: bool,
}

impl FakeStream {
    pub fn lines(lines: &[&str]) -> Self {
        let body: String = lines.iter().map(|l| format!("{l}\n")).collect();
        Self {
            chunks: vec![Ok(Bytes::from(body))],
            hang: false,
        }
    }

    pub fn chunks(chunks: &[&str]) -> Self {
        Self {
            chunks: chunks
                .iter()
                .map(|c| Ok(Bytes::from(c.to_string())))
                .collect(),
            hang: false,
        }
    }

    pub fn then_fail(mut self, err: TransportError) -> Self {
        self.chunks.push(Err(err));
        self
    }

    pub fn then_hang(mut self) -> Self {
        self.hang = true;
        self
    }
}

/// Increments a counter when the owning stream is dropped.
struct CloseGuard(Arc<AtomicUsize>);

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// In-memory [`UpstreamTransport`] keyed by full URL.
///
/// Probes succeed only for URLs marked up. JSON and stream replies are
/// consumed in order; an exhausted script answers with a connect error.
#[derive(Default)]
pub struct FakeTransport {
    up: Mutex<HashMap<String, bool>>,
    json: Mutex<HashMap<String, VecDeque<Result<Value, TransportError>>>>,
    streams: Mutex<HashMap<String, VecDeque<FakeStream>>>,
    calls: Mutex<Vec<String>>,
    closed: Arc<AtomicUsize>,
    opened: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_up(&self, base_url: &str, up: bool) {
        self.up
            .lock()
            .unwrap()
            .insert(format!("{base_url}/api/tags"), up);
    }

    pub fn push_json(&self, url: &str, reply: Result<Value, TransportError>) {
        self.json
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn push_stream(&self, url: &str, reply: FakeStream) {
        self.streams
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Every call so far, as `"METHOD url"`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn probe_count(&self) -> usize {
        self.count("PROBE ")
    }

    pub fn streams_opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn streams_closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    fn log(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn next_json(&self, url: &str) -> Result<Value, TransportError> {
        self.json
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| {
                Err(TransportError::Connect {
                    reason: format!("no scripted reply for {url}"),
                })
            })
    }
}

#[async_trait]
impl UpstreamTransport for FakeTransport {
    async fn probe(&self, url: &str, _timeout: Duration) -> Result<(), TransportError> {
        self.log(format!("PROBE {url}"));
        match self.up.lock().unwrap().get(url) {
            Some(true) => Ok(()),
            _ => Err(TransportError::Connect {
                reason: "connection refused".into(),
            }),
        }
    }

    async fn get_json(&self, url: &str, _timeout: Duration) -> Result<Value, TransportError> {
        self.log(format!("GET {url}"));
        self.next_json(url)
    }

    async fn post_json(
        &self,
        url: &str,
        _body: &Value,
        _timeout: Duration,
    ) -> Result<Value, TransportError> {
        self.log(format!("POST {url}"));
        self.next_json(url)
    }

    async fn post_stream(
        &self,
        url: &str,
        _body: &Value,
        _timeout: Duration,
        _idle_timeout: Option<Duration>,
    ) -> Result<ByteStream, TransportError> {
        self.log(format!("STREAM {url}"));
        let script = self
            .streams
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| TransportError::Connect {
                reason: format!("no scripted stream for {url}"),
            })?;

        self.opened.fetch_add(1, Ordering::SeqCst);
        let guard = CloseGuard(Arc::clone(&self.closed));
        let body = stream::iter(script.chunks);
        let body: ByteStream = if script.hang {
            body.chain(stream::pending()).boxed()
        } else {
            body.boxed()
        };

        Ok(body
            .map(move |chunk| {
                let _held = &guard;
                chunk
            })
            .boxed())
    }
}

//! Test doubles for driving the engine without a network.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};

use sharefetch_core::{
    OriginBody, OriginError, OriginFetcher, OriginResponse, ResponseHead, ResponseSink, ShareEvent,
    ShareEventKind, ShareEventListener,
};

/// How long a test waits for a client response to end.
pub const WAIT: Duration = Duration::from_secs(10);

/// Deterministic payload of `len` bytes.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

// ---------------------------------------------------------------------------
// Origin
// ---------------------------------------------------------------------------

/// Body served from fixed chunks, optionally failing after the last one.
pub struct ChunkedBody {
    chunks: VecDeque<Bytes>,
    fail_at_end: bool,
}

impl ChunkedBody {
    pub fn new(data: &[u8], chunk: usize) -> Self {
        Self {
            chunks: data.chunks(chunk.max(1)).map(Bytes::copy_from_slice).collect(),
            fail_at_end: false,
        }
    }

    pub fn failing(data: &[u8], chunk: usize) -> Self {
        Self {
            fail_at_end: true,
            ..Self::new(data, chunk)
        }
    }
}

#[async_trait]
impl OriginBody for ChunkedBody {
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        match self.chunks.pop_front() {
            Some(chunk) => Ok(Some(chunk)),
            None if self.fail_at_end => Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset by origin",
            )),
            None => Ok(None),
        }
    }
}

/// Body the test feeds by hand. Dropping the sender ends it.
pub struct ChannelBody {
    rx: mpsc::UnboundedReceiver<io::Result<Bytes>>,
}

pub type BodyFeed = mpsc::UnboundedSender<io::Result<Bytes>>;

pub fn channel_body() -> (BodyFeed, ChannelBody) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, ChannelBody { rx })
}

#[async_trait]
impl OriginBody for ChannelBody {
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        match self.rx.recv().await {
            Some(result) => result.map(Some),
            None => Ok(None),
        }
    }
}

/// One scripted origin answer.
pub enum Reply {
    Response(OriginResponse),
    Fail(OriginError),
}

impl Reply {
    /// `200` with a `Content-Length` and optional `ETag`.
    pub fn full(total: usize, etag: Option<&str>, body: impl OriginBody + 'static) -> Self {
        let mut headers = vec![
            ("Content-Length".to_string(), total.to_string()),
            ("Content-Type".to_string(), "application/octet-stream".to_string()),
            ("Connection".to_string(), "keep-alive".to_string()),
        ];
        if let Some(etag) = etag {
            headers.push(("ETag".to_string(), format!("\"{etag}\"")));
        }
        Self::Response(OriginResponse {
            status: 200,
            headers,
            body: Box::new(body),
        })
    }

    /// `206` for `bytes start-(total-1)/total`.
    pub fn partial(start: usize, total: usize, body: impl OriginBody + 'static) -> Self {
        Self::Response(OriginResponse {
            status: 206,
            headers: vec![
                ("Content-Length".to_string(), (total - start).to_string()),
                (
                    "Content-Range".to_string(),
                    format!("bytes {start}-{}/{total}", total - 1),
                ),
            ],
            body: Box::new(body),
        })
    }

    /// Non-streamable status with a text body.
    pub fn status(status: u16, text: &str) -> Self {
        Self::Response(OriginResponse {
            status,
            headers: vec![("Content-Type".to_string(), "text/plain".to_string())],
            body: Box::new(ChunkedBody::new(text.as_bytes(), 64)),
        })
    }

    pub fn refused(url: &str) -> Self {
        Self::Fail(OriginError::Connect {
            url: url.to_string(),
            message: "connection refused".to_string(),
        })
    }
}

/// Origin that answers from a queue of replies and records every call.
#[derive(Default)]
pub struct ScriptedOrigin {
    replies: Mutex<VecDeque<Reply>>,
    calls: Mutex<Vec<(String, u64)>>,
}

impl ScriptedOrigin {
    pub fn new(replies: impl IntoIterator<Item = Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, reply: Reply) {
        self.replies.lock().push_back(reply);
    }

    pub fn calls(&self) -> Vec<(String, u64)> {
        self.calls.lock().clone()
    }

    pub fn offsets(&self) -> Vec<u64> {
        self.calls.lock().iter().map(|(_, offset)| *offset).collect()
    }
}

#[async_trait]
impl OriginFetcher for ScriptedOrigin {
    async fn fetch(&self, url: &str, resume_from: u64) -> Result<OriginResponse, OriginError> {
        self.calls.lock().push((url.to_string(), resume_from));
        match self.replies.lock().pop_front() {
            Some(Reply::Response(response)) => Ok(response),
            Some(Reply::Fail(e)) => Err(e),
            None => Err(OriginError::Transport {
                url: url.to_string(),
                message: "no scripted reply".to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// How a client response ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Redirected(String),
    Error(u16, String),
    Disconnected,
}

#[derive(Debug, Clone, Default)]
pub struct Recorded {
    pub head: Option<ResponseHead>,
    pub body: Vec<u8>,
    pub outcome: Option<Outcome>,
}

struct Shared {
    record: Mutex<Recorded>,
    connected: AtomicBool,
    stalled: AtomicBool,
    ended: Notify,
}

/// Sink that records everything written to it.
pub struct RecordingSink {
    shared: Arc<Shared>,
}

/// Test-side view of a [`RecordingSink`].
#[derive(Clone)]
pub struct ClientHandle {
    shared: Arc<Shared>,
}

fn shared() -> Arc<Shared> {
    Arc::new(Shared {
        record: Mutex::new(Recorded::default()),
        connected: AtomicBool::new(true),
        stalled: AtomicBool::new(false),
        ended: Notify::new(),
    })
}

pub fn client() -> (Box<dyn ResponseSink>, ClientHandle) {
    let shared = shared();
    (
        Box::new(RecordingSink {
            shared: Arc::clone(&shared),
        }),
        ClientHandle { shared },
    )
}

/// A client that accepts the head and then never reads the body.
pub fn stalled_client() -> (Box<dyn ResponseSink>, ClientHandle) {
    let shared = shared();
    (
        Box::new(StalledSink(RecordingSink {
            shared: Arc::clone(&shared),
        })),
        ClientHandle { shared },
    )
}

impl ClientHandle {
    /// Wait for the response to end.
    pub async fn finished(&self) -> Recorded {
        tokio::time::timeout(WAIT, async {
            loop {
                {
                    let record = self.shared.record.lock();
                    if record.outcome.is_some() {
                        return record.clone();
                    }
                }
                self.shared.ended.notified().await;
            }
        })
        .await
        .expect("client response did not end in time")
    }

    pub fn snapshot(&self) -> Recorded {
        self.shared.record.lock().clone()
    }

    /// Whether a body write is stuck on this client.
    pub fn is_stalled(&self) -> bool {
        self.shared.stalled.load(Ordering::SeqCst)
    }

    /// Simulate the client going away.
    pub fn hang_up(&self) {
        self.shared.connected.store(false, Ordering::SeqCst);
    }
}

impl RecordingSink {
    fn end(&self, outcome: Outcome) {
        let mut record = self.shared.record.lock();
        if record.outcome.is_none() {
            record.outcome = Some(outcome);
        }
        drop(record);
        self.shared.ended.notify_one();
    }

    fn check_connected(&self) -> io::Result<()> {
        if self.shared.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "client gone"))
        }
    }
}

#[async_trait]
impl ResponseSink for RecordingSink {
    async fn start(&mut self, head: ResponseHead) -> io::Result<()> {
        self.check_connected()?;
        self.shared.record.lock().head = Some(head);
        Ok(())
    }

    async fn write(&mut self, chunk: Bytes) -> io::Result<()> {
        self.check_connected()?;
        self.shared.record.lock().body.extend_from_slice(&chunk);
        Ok(())
    }

    async fn complete(&mut self) {
        self.end(Outcome::Completed);
    }

    async fn redirect(&mut self, location: &str) {
        self.end(Outcome::Redirected(location.to_string()));
    }

    async fn send_error(&mut self, status: u16, message: &str) {
        self.end(Outcome::Error(status, message.to_string()));
    }

    fn disconnect(&mut self) {
        self.end(Outcome::Disconnected);
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn set_timeout(&mut self, _timeout: Duration) {}

    fn reset_timeout(&mut self) {}
}

/// Sink whose body writes never complete.
pub struct StalledSink(RecordingSink);

#[async_trait]
impl ResponseSink for StalledSink {
    async fn start(&mut self, head: ResponseHead) -> io::Result<()> {
        self.0.start(head).await
    }

    async fn write(&mut self, _chunk: Bytes) -> io::Result<()> {
        self.0.shared.stalled.store(true, Ordering::SeqCst);
        std::future::pending().await
    }

    async fn complete(&mut self) {
        self.0.complete().await;
    }

    async fn redirect(&mut self, location: &str) {
        self.0.redirect(location).await;
    }

    async fn send_error(&mut self, status: u16, message: &str) {
        self.0.send_error(status, message).await;
    }

    fn disconnect(&mut self) {
        self.0.disconnect();
    }

    fn is_connected(&self) -> bool {
        self.0.is_connected()
    }

    fn set_timeout(&mut self, _timeout: Duration) {}

    fn reset_timeout(&mut self) {}
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Listener that keeps every event.
#[derive(Default)]
pub struct CollectingListener {
    events: Mutex<Vec<ShareEvent>>,
}

impl CollectingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ShareEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, kind: ShareEventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind() == kind).count()
    }

    pub fn first(&self, kind: ShareEventKind) -> Option<ShareEvent> {
        self.events.lock().iter().find(|e| e.kind() == kind).cloned()
    }
}

impl ShareEventListener for CollectingListener {
    fn on_event(&self, event: &ShareEvent) {
        self.events.lock().push(event.clone());
    }
}

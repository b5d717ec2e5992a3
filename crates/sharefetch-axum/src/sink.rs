//! Channel-backed [`ResponseSink`] for axum responses.
//!
//! An axum handler cannot hand its connection to another task, so the sink
//! and the handler meet over two channels:
//!
//! ```text
//! engine task ──► ChannelSink ──oneshot──► SinkReply (handler awaits the head)
//!                             ──mpsc────► Body::from_stream (hyper pulls chunks)
//! ```
//!
//! When the client goes away hyper drops the body stream, the sender sees
//! the channel closed, and the engine treats the client as disconnected.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::header::{HeaderName, HeaderValue, LOCATION};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use sharefetch_core::{ResponseHead, ResponseSink};

use crate::error::HttpError;

/// Chunks buffered between the engine and hyper per response.
pub const DEFAULT_BODY_BUFFER: usize = 16;

/// How long a queued abort waits for room in a full body buffer.
const ABORT_GRACE: Duration = Duration::from_secs(30);

/// How the engine answered before any body byte.
#[derive(Debug)]
enum HeadOutcome {
    Stream(ResponseHead),
    Redirect(String),
    Error(u16, String),
}

/// Engine side of one client response.
pub struct ChannelSink {
    head_tx: Option<oneshot::Sender<HeadOutcome>>,
    body_tx: Option<mpsc::Sender<io::Result<Bytes>>>,
    timeout: Duration,
    deadline: Instant,
}

/// Handler side of one client response.
pub struct SinkReply {
    head_rx: oneshot::Receiver<HeadOutcome>,
    body_rx: mpsc::Receiver<io::Result<Bytes>>,
}

/// Create a connected sink and reply pair.
pub fn channel_sink(buffer: usize) -> (ChannelSink, SinkReply) {
    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, body_rx) = mpsc::channel(buffer.max(1));
    let timeout = Duration::from_secs(300);
    (
        ChannelSink {
            head_tx: Some(head_tx),
            body_tx: Some(body_tx),
            timeout,
            deadline: Instant::now() + timeout,
        },
        SinkReply { head_rx, body_rx },
    )
}

impl ChannelSink {
    fn answer(&mut self, outcome: HeadOutcome) {
        if let Some(tx) = self.head_tx.take() {
            if tx.send(outcome).is_err() {
                debug!("Client left before the response head");
            }
        }
        self.body_tx = None;
    }
}

/// Deliver the abort item once the client drains the body buffer.
///
/// Until it arrives the sender stays alive, so the body cannot end cleanly.
fn queue_abort(tx: mpsc::Sender<io::Result<Bytes>>, aborted: io::Result<Bytes>) {
    let Ok(runtime) = Handle::try_current() else {
        warn!("No runtime to deliver a transfer abort, response may end cleanly");
        return;
    };
    runtime.spawn(async move {
        match tokio::time::timeout(ABORT_GRACE, tx.send(aborted)).await {
            Ok(Ok(())) => debug!("Transfer abort delivered after the buffer drained"),
            Ok(Err(_)) => {}
            Err(_) => debug!("Client never drained the body, dropping it"),
        }
    });
}

fn gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "client disconnected")
}

#[async_trait]
impl ResponseSink for ChannelSink {
    async fn start(&mut self, head: ResponseHead) -> io::Result<()> {
        let tx = self.head_tx.take().ok_or_else(gone)?;
        tx.send(HeadOutcome::Stream(head)).map_err(|_| gone())
    }

    async fn write(&mut self, chunk: Bytes) -> io::Result<()> {
        let tx = self.body_tx.as_ref().ok_or_else(gone)?;
        match tokio::time::timeout(self.timeout, tx.send(Ok(chunk))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(gone()),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "client stopped reading",
            )),
        }
    }

    async fn complete(&mut self) {
        self.body_tx = None;
    }

    async fn redirect(&mut self, location: &str) {
        self.answer(HeadOutcome::Redirect(location.to_string()));
    }

    async fn send_error(&mut self, status: u16, message: &str) {
        self.answer(HeadOutcome::Error(status, message.to_string()));
    }

    fn disconnect(&mut self) {
        // An error item makes hyper abort the connection instead of ending the body cleanly
        if let Some(tx) = self.body_tx.take() {
            let aborted = Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "transfer aborted",
            ));
            match tx.try_send(aborted) {
                Ok(()) | Err(TrySendError::Closed(_)) => {}
                Err(TrySendError::Full(aborted)) => queue_abort(tx, aborted),
            }
        }
        self.head_tx = None;
    }

    fn is_connected(&self) -> bool {
        if Instant::now() >= self.deadline {
            return false;
        }
        match (&self.head_tx, &self.body_tx) {
            (Some(head), _) => !head.is_closed(),
            (None, Some(body)) => !body.is_closed(),
            (None, None) => false,
        }
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
        self.deadline = Instant::now() + timeout;
    }

    fn reset_timeout(&mut self) {
        self.deadline = Instant::now() + self.timeout;
    }
}

impl SinkReply {
    /// Wait for the engine's answer and turn it into a response.
    pub async fn into_response(self) -> Response {
        match self.head_rx.await {
            Ok(HeadOutcome::Stream(head)) => stream_response(head, self.body_rx),
            Ok(HeadOutcome::Redirect(location)) => redirect_response(&location),
            Ok(HeadOutcome::Error(status, message)) => {
                HttpError::from_status(status, message).into_response()
            }
            Err(_) => HttpError::GatewayTimeout("no response from download".into()).into_response(),
        }
    }
}

fn stream_response(head: ResponseHead, body_rx: mpsc::Receiver<io::Result<Bytes>>) -> Response {
    let status = StatusCode::from_u16(head.status).unwrap_or(StatusCode::OK);
    let mut builder = Response::builder().status(status);
    for (name, value) in &head.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            builder = builder.header(name, value);
        }
    }
    builder
        .body(Body::from_stream(ReceiverStream::new(body_rx)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn redirect_response(location: &str) -> Response {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(LOCATION, location)
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

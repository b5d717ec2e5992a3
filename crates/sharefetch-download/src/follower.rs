//! Follower transfer protocol.
//!
//! Each follower runs on its own task, so its writes to the client are
//! serialised. The task sleeps on its [`FollowerLink`] and, when woken, runs
//! a copy pass from its read position up to the leader's published position
//! (or the end of the requested range).
//!
//! A follower finishes only on the leader's `Finish` directive after
//! copying everything published, or once its requested range is delivered.
//! A short read from the staging file never counts as the end.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use sharefetch_core::{ByteRange, FileMetadata, ResourceRef, ResponseSink, ShareError, ShareEvent};

use crate::context::EngineContext;
use crate::leader::{Directive, FollowerLink, Leader};
use crate::staging;

/// How a transfer ended.
enum Ending {
    Finished,
    Terminated(ShareError),
    Aborted(ShareError),
}

/// One client waiting on a leader.
pub(crate) struct Follower {
    link: Arc<FollowerLink>,
    leader: Arc<Leader>,
    ctx: Arc<EngineContext>,
    sink: Box<dyn ResponseSink>,
    range_header: Option<String>,
    retry_location: String,
    started_at: DateTime<Utc>,
    started: Instant,
    reader: Option<File>,
    range: Option<ByteRange>,
    /// Absolute read position in the staging file.
    position: u64,
    /// Exclusive end of the requested range.
    limit: Option<u64>,
    delivered: u64,
    head_sent: bool,
}

impl Follower {
    pub(crate) fn new(
        link: Arc<FollowerLink>,
        leader: Arc<Leader>,
        ctx: Arc<EngineContext>,
        sink: Box<dyn ResponseSink>,
        range_header: Option<String>,
        retry_location: String,
    ) -> Self {
        Self {
            link,
            leader,
            ctx,
            sink,
            range_header,
            retry_location,
            started_at: Utc::now(),
            started: Instant::now(),
            reader: None,
            range: None,
            position: 0,
            limit: None,
            delivered: 0,
            head_sent: false,
        }
    }

    /// Serve the client until the transfer ends, then release the staging reference.
    pub(crate) async fn run(mut self) {
        self.sink
            .set_timeout(self.ctx.settings.follower_idle_timeout());

        let ending = self.transfer().await;
        self.reader = None;
        self.conclude(ending).await;
        self.leader.release_staging().await;
    }

    async fn transfer(&mut self) -> Ending {
        let idle_timeout = self.ctx.settings.follower_idle_timeout();
        loop {
            // Directive before position: a Finish seen here means the
            // published position read next is final.
            let directive = self.link.directive();
            if let Some(Directive::Terminate(e)) = directive {
                return Ending::Terminated(e);
            }
            if !self.sink.is_connected() {
                return Ending::Aborted(ShareError::ClientDisconnected);
            }

            let published = self.leader.published();
            let finishing = matches!(directive, Some(Directive::Finish));
            if let Some(metadata) = self.leader.metadata() {
                match self.copy_pass(&metadata, published, finishing).await {
                    Ok(true) => return Ending::Finished,
                    Ok(false) => {}
                    Err(e) => return Ending::Aborted(e),
                }
            }
            if finishing {
                return Ending::Finished;
            }

            if tokio::time::timeout(idle_timeout, self.link.woken())
                .await
                .is_err()
                && !self.sink.is_connected()
            {
                return Ending::Aborted(ShareError::ClientDisconnected);
            }
        }
    }

    /// Copy everything available. Returns true once the requested range is
    /// fully delivered.
    async fn copy_pass(
        &mut self,
        metadata: &FileMetadata,
        published: u64,
        finishing: bool,
    ) -> Result<bool, ShareError> {
        if !self.head_sent {
            self.range = self.range_header.as_deref().and_then(|header| {
                metadata
                    .content_length()
                    .and_then(|length| ByteRange::parse_request(header, length))
            });
            self.position = self.range.map_or(0, |r| r.start);
            self.limit = self.range.map(|r| r.end + 1);

            if published <= self.position && !finishing {
                return Ok(false);
            }
            self.sink
                .start(metadata.response_head(self.range))
                .await
                .map_err(|_| ShareError::ClientDisconnected)?;
            self.head_sent = true;
        }

        let limit = self.limit.map_or(published, |end| end.min(published));
        while self.position < limit {
            let want = usize::try_from(limit - self.position)
                .map_or(self.ctx.settings.copy_chunk_size, |left| {
                    left.min(self.ctx.settings.copy_chunk_size)
                });
            let Some(chunk) = self.read_chunk(want).await? else {
                // Not on disk yet as far as this handle can see; wait for the next wake
                break;
            };
            let n = chunk.len() as u64;

            self.deliver(chunk).await?;
            self.sink.reset_timeout();
            self.position += n;
            self.delivered += n;
        }

        Ok(self.limit.is_some_and(|end| self.position >= end))
    }

    /// Read up to `want` bytes from the staging file at the read position.
    ///
    /// The copy permit covers the disk read only, so a client that stops
    /// reading never holds one.
    async fn read_chunk(&mut self, want: usize) -> Result<Option<Bytes>, ShareError> {
        let _permit = self
            .ctx
            .copy_permits
            .acquire()
            .await
            .map_err(|_| ShareError::Cancelled)?;

        if self.reader.is_none() {
            let reader = staging::open_reader(&self.leader.paths().staging, self.position)
                .await
                .map_err(|e| ShareError::from_io_error(&e))?;
            self.reader = Some(reader);
        }
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };

        let mut buf = vec![0u8; want];
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| ShareError::from_io_error(&e))?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(Bytes::from(buf)))
    }

    /// Write one chunk to the client, giving up when the service shuts down.
    async fn deliver(&mut self, chunk: Bytes) -> Result<(), ShareError> {
        tokio::select! {
            written = self.sink.write(chunk) => {
                written.map_err(|_| ShareError::ClientDisconnected)
            }
            () = self.ctx.cancel.cancelled() => Err(ShareError::Cancelled),
        }
    }

    async fn conclude(&mut self, ending: Ending) {
        let resource = ResourceRef::new(self.leader.key(), &self.leader.paths().file);
        let metadata = self.leader.metadata();
        let duration = self.started.elapsed();

        match ending {
            Ending::Finished => {
                self.sink.complete().await;
                let expected = self
                    .range
                    .map(|r| r.len())
                    .or_else(|| metadata.as_ref().and_then(|m| m.content_length()))
                    .unwrap_or(self.delivered);
                if self.delivered == expected {
                    debug!(
                        session = %self.leader.id(),
                        follower = %self.link.id(),
                        bytes = self.delivered,
                        "Shared download complete"
                    );
                    self.ctx.events.emit(ShareEvent::SharedDownloadSuccess {
                        resource,
                        metadata,
                        started_at: self.started_at,
                        duration,
                        bytes: self.delivered,
                    });
                } else {
                    warn!(
                        session = %self.leader.id(),
                        follower = %self.link.id(),
                        delivered = self.delivered,
                        expected,
                        "Shared download incomplete"
                    );
                    self.ctx.events.emit(ShareEvent::SharedDownloadError {
                        message: resource.describe(&format!(
                            "delivered {} of {expected} bytes",
                            self.delivered
                        )),
                        resource,
                        metadata,
                        started_at: self.started_at,
                        duration,
                        bytes: self.delivered,
                        error_kind: "IncompleteTransfer".to_string(),
                    });
                }
            }
            Ending::Terminated(e) => {
                if self.head_sent {
                    self.sink.disconnect();
                } else if let Some(status) = e.reply_status() {
                    self.sink.send_error(status, &e.detail()).await;
                } else {
                    self.sink.redirect(&self.retry_location).await;
                }
                info!(
                    session = %self.leader.id(),
                    follower = %self.link.id(),
                    bytes = self.delivered,
                    redirected = !self.head_sent,
                    "Leader failed, follower terminated"
                );
                self.emit_error(resource, metadata, duration, &e);
            }
            Ending::Aborted(e) => {
                self.leader.detach(self.link.id());
                if self.head_sent {
                    self.sink.disconnect();
                } else if !matches!(e, ShareError::ClientDisconnected) {
                    self.sink.send_error(500, &e.detail()).await;
                }
                debug!(
                    session = %self.leader.id(),
                    follower = %self.link.id(),
                    bytes = self.delivered,
                    error = %e,
                    "Follower aborted"
                );
                self.emit_error(resource, metadata, duration, &e);
            }
        }
    }

    fn emit_error(
        &self,
        resource: ResourceRef,
        metadata: Option<Arc<FileMetadata>>,
        duration: std::time::Duration,
        error: &ShareError,
    ) {
        self.ctx.events.emit(ShareEvent::SharedDownloadError {
            message: resource.describe(&error.detail()),
            resource,
            metadata,
            started_at: self.started_at,
            duration,
            bytes: self.delivered,
            error_kind: error.kind_name().to_string(),
        });
    }
}

//! Leader session pipeline.
//!
//! One session runs per leader, on its own task:
//!
//! 1. Fetch from the origin (resuming at the current offset)
//! 2. Stream the body into the staging file, publishing each flushed chunk
//! 3. On an I/O failure, resume if the attempt made progress, otherwise give up
//! 4. Validate the staging file against a trusted ETag digest
//! 5. Write the sidecar and copy the staging file into place
//!
//! Whatever the outcome, the session ends with exactly one wind-down.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

use sharefetch_core::hash::md5_file;
use sharefetch_core::{
    ByteRange, FileMetadata, OriginBody, ResourceRef, ShareError, ShareEvent,
};

use super::{Leader, LeaderPhase};
use crate::context::EngineContext;
use crate::staging;

/// Largest origin error body read into a message.
const MAX_ERROR_BODY: usize = 2047;

/// Status reported for a partial response that cannot be appended.
const UNUSABLE_PARTIAL_STATUS: u16 = 502;

/// How an attempt ended when it did not complete.
enum AttemptError {
    /// Read or write failure; retried if the attempt made progress.
    Io(io::Error),
    /// Never retried.
    Terminal(ShareError),
}

/// Per-session mutable state, owned by the session task.
struct Session<'a> {
    leader: &'a Arc<Leader>,
    ctx: &'a EngineContext,
    /// Bytes confirmed in the staging file.
    position: u64,
    network_time: Duration,
    disk_write_time: Duration,
    /// Remove the staging file on failure instead of keeping it for resume.
    discard_staging: bool,
}

/// Drive `leader` through its state machine and wind it down.
pub(crate) async fn run_session(leader: Arc<Leader>, ctx: Arc<EngineContext>) {
    let started = Instant::now();
    let resource = ResourceRef::new(leader.key(), &leader.paths().file);
    info!(session = %leader.id(), uri = %leader.key(), "Download started");

    let mut session = Session {
        leader: &leader,
        ctx: &ctx,
        position: 0,
        network_time: Duration::ZERO,
        disk_write_time: Duration::ZERO,
        discard_staging: false,
    };
    let outcome = session.drive().await;
    let elapsed = started.elapsed();

    match &outcome {
        Ok(metadata) => {
            let duration = elapsed.saturating_sub(session.disk_write_time);
            info!(
                session = %leader.id(),
                uri = %leader.key(),
                bytes = session.position,
                duration_ms = duration.as_millis(),
                network_ms = session.network_time.as_millis(),
                disk_ms = session.disk_write_time.as_millis(),
                "Download committed"
            );
            ctx.events.emit(ShareEvent::DownloadSuccess {
                resource,
                metadata: Arc::clone(metadata),
                started_at: leader.started_at(),
                duration,
            });
        }
        Err(e) => {
            error!(
                session = %leader.id(),
                uri = %leader.key(),
                bytes = session.position,
                error = %e,
                "Download failed"
            );
            ctx.events.emit(ShareEvent::DownloadError {
                message: resource.describe(&e.detail()),
                resource,
                metadata: leader.metadata(),
                started_at: leader.started_at(),
                duration: elapsed,
                error_kind: e.kind_name().to_string(),
                status: e.reply_status(),
            });
            // Still registered in the pool, so no other session owns the path yet
            if session.discard_staging || staging::existing_len(&leader.paths().staging).await == 0
            {
                staging::remove_quietly(&leader.paths().staging).await;
            }
        }
    }

    leader.wind_down(&ctx.pool, outcome.as_ref().err());
    leader.release_staging().await;
}

impl Session<'_> {
    async fn drive(&mut self) -> Result<Arc<FileMetadata>, ShareError> {
        let paths = self.leader.paths();
        paths
            .ensure_dir()
            .await
            .map_err(|e| ShareError::from_io_error(&e))?;

        // A staging file left by a failed session is resumed
        self.position = staging::existing_len(&paths.staging).await;
        if self.position > 0 {
            info!(
                session = %self.leader.id(),
                offset = self.position,
                "Resuming from existing staging file"
            );
        }

        loop {
            let attempt_start = self.position;
            match self.attempt(attempt_start).await {
                Ok(()) => break,
                Err(AttemptError::Terminal(e)) => return Err(e),
                Err(AttemptError::Io(e)) => {
                    // Only an attempt that moved the published position may be resumed
                    let failure = if self.position > attempt_start {
                        ShareError::transient(self.position, &e)
                    } else {
                        ShareError::exhausted(&e)
                    };
                    if !failure.is_recoverable() {
                        return Err(failure);
                    }
                    warn!(
                        session = %self.leader.id(),
                        error_kind = failure.kind_name(),
                        error = %failure,
                        "Transfer interrupted after progress, resuming"
                    );
                    self.leader.record_retry(failure);
                }
            }
        }

        self.validate().await?;
        self.commit().await
    }

    /// One fetch-and-stream attempt starting at `offset`.
    async fn attempt(&mut self, offset: u64) -> Result<(), AttemptError> {
        self.leader.set_phase(LeaderPhase::Fetching);
        let url = self.leader.key().as_str();

        let response = tokio::select! {
            response = self.ctx.fetcher.fetch(url, offset) => {
                response.map_err(|e| AttemptError::Io(e.into_io()))?
            }
            () = self.ctx.cancel.cancelled() => {
                return Err(AttemptError::Terminal(ShareError::Cancelled));
            }
        };
        let status = response.status;

        if !response.is_streamable() {
            if status == 416 && offset > 0 {
                // The staging file no longer lines up with the origin
                self.discard_staging = true;
            }
            let body = read_error_body(response.body).await;
            return Err(AttemptError::Terminal(ShareError::origin_rejected(
                status,
                format!("http status code {status} error: {body}"),
            )));
        }

        let body_start = if status == 206 {
            response
                .header("Content-Range")
                .and_then(ByteRange::parse_content_range)
                .map(|range| range.start)
                .ok_or_else(|| {
                    AttemptError::Terminal(ShareError::origin_rejected(
                        UNUSABLE_PARTIAL_STATUS,
                        "partial response without a valid Content-Range",
                    ))
                })?
        } else {
            0
        };
        if body_start > offset {
            return Err(AttemptError::Terminal(ShareError::origin_rejected(
                UNUSABLE_PARTIAL_STATUS,
                format!("Content-Range starts at {body_start}, expected {offset}"),
            )));
        }
        // Bytes already on disk that the origin sent again
        let mut skip = offset - body_start;

        let paths = self.leader.paths();
        let (metadata, installed) = self.leader.install_metadata(FileMetadata::from_origin(
            &paths.sidecar,
            status,
            &response.headers,
            self.leader.key().relative_path(),
        ));
        if installed {
            self.ctx.events.emit(ShareEvent::DownloadBefore {
                resource: ResourceRef::new(self.leader.key(), &paths.file),
                metadata: Arc::clone(&metadata),
            });
        }
        self.leader.publish(offset);

        let mut file = staging::open_at(&paths.staging, offset)
            .await
            .map_err(AttemptError::Io)?;
        self.leader.set_phase(LeaderPhase::Streaming);
        let mut body = response.body;

        loop {
            let read_started = Instant::now();
            let chunk = tokio::select! {
                chunk = body.next_chunk() => chunk.map_err(AttemptError::Io)?,
                () = self.ctx.cancel.cancelled() => {
                    return Err(AttemptError::Terminal(ShareError::Cancelled));
                }
            };
            self.network_time += read_started.elapsed();

            let Some(mut chunk) = chunk else { break };
            if skip > 0 {
                let n = usize::try_from(skip).map_or(chunk.len(), |s| s.min(chunk.len()));
                let _ = chunk.split_to(n);
                skip -= n as u64;
                if chunk.is_empty() {
                    continue;
                }
            }

            self.append(&mut file, &chunk).await.map_err(AttemptError::Io)?;
        }

        if let Some(expected) = metadata.content_length() {
            if self.position < expected {
                return Err(AttemptError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("origin closed the body at {} of {expected} bytes", self.position),
                )));
            }
        }
        Ok(())
    }

    /// Write and flush one chunk, then publish it.
    async fn append(&mut self, file: &mut File, chunk: &[u8]) -> io::Result<()> {
        let write_started = Instant::now();
        file.write_all(chunk).await?;
        file.flush().await?;
        self.disk_write_time += write_started.elapsed();

        self.position += chunk.len() as u64;
        self.leader.publish(self.position);
        Ok(())
    }

    async fn validate(&mut self) -> Result<(), ShareError> {
        self.leader.set_phase(LeaderPhase::Validating);
        if self.leader.key().is_parameterized() {
            return Ok(());
        }
        let Some(expected) = self.leader.metadata().and_then(|m| m.trusted_md5()) else {
            return Ok(());
        };

        let actual = md5_file(self.leader.paths().staging.clone())
            .await
            .map_err(|e| ShareError::from_io_error(&e))?;
        if actual.eq_ignore_ascii_case(&expected) {
            Ok(())
        } else {
            self.discard_staging = true;
            Err(ShareError::integrity_mismatch(expected, actual))
        }
    }

    async fn commit(&mut self) -> Result<Arc<FileMetadata>, ShareError> {
        let paths = self.leader.paths();
        let metadata = self
            .leader
            .metadata()
            .map(|m| (*m).clone())
            .unwrap_or_else(|| FileMetadata::new(&paths.sidecar))
            .with_timings(self.network_time, self.disk_write_time);
        let metadata = Arc::new(metadata);

        metadata.write().await?;
        staging::commit(&paths.staging, &paths.file)
            .await
            .map_err(|e| ShareError::from_io_error(&e))?;
        self.ctx.metadata.put(Arc::clone(&metadata));
        Ok(metadata)
    }
}

/// Read at most [`MAX_ERROR_BODY`] bytes of an error response.
async fn read_error_body(mut body: Box<dyn OriginBody>) -> String {
    let mut collected = Vec::new();
    while collected.len() < MAX_ERROR_BODY {
        match body.next_chunk().await {
            Ok(Some(chunk)) => collected.extend_from_slice(&chunk),
            Ok(None) | Err(_) => break,
        }
    }
    collected.truncate(MAX_ERROR_BODY);
    String::from_utf8_lossy(&collected).into_owned()
}

//! Serving committed files from disk.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::Utc;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use sharefetch_core::{
    ByteRange, FileMetadata, ResourceKey, ResourceRef, ResponseSink, ShareError, ShareEvent,
    StorePaths,
};

use crate::context::EngineContext;
use crate::staging;

/// A request for a file that is already in the store.
pub(crate) struct LocalRequest {
    pub key: ResourceKey,
    pub paths: StorePaths,
    pub range_header: Option<String>,
}

/// Serve a committed file, or redirect to the configured static base.
pub(crate) async fn serve(
    ctx: Arc<EngineContext>,
    request: LocalRequest,
    mut sink: Box<dyn ResponseSink>,
) {
    let started_at = Utc::now();
    let started = Instant::now();
    let resource = ResourceRef::new(&request.key, &request.paths.file);
    let metadata = ctx.metadata.get(&request.paths.sidecar).await;

    if let Some(base) = &ctx.settings.local_redirect_base {
        let location = format!(
            "{}{}",
            base.trim_end_matches('/'),
            request.key.relative_path()
        );
        sink.redirect(&location).await;
        ctx.events.emit(ShareEvent::LocalDownload {
            resource,
            metadata,
            started_at,
            duration: started.elapsed(),
            bytes: 0,
        });
        return;
    }

    let mut head_sent = false;
    let outcome = stream_file(
        &ctx,
        &request,
        metadata.as_deref(),
        sink.as_mut(),
        &mut head_sent,
    )
    .await;

    match outcome {
        Ok(bytes) => {
            sink.complete().await;
            debug!(uri = %request.key, bytes, "Served from local store");
            ctx.events.emit(ShareEvent::LocalDownload {
                resource,
                metadata,
                started_at,
                duration: started.elapsed(),
                bytes,
            });
        }
        Err(e) => {
            if head_sent {
                sink.disconnect();
            } else if !matches!(e, ShareError::ClientDisconnected) {
                sink.send_error(500, &e.detail()).await;
            }
            warn!(uri = %request.key, error = %e, "Local download failed");
            ctx.events.emit(ShareEvent::LocalDownloadError {
                message: resource.describe(&e.detail()),
                resource,
                started_at,
                error_kind: e.kind_name().to_string(),
            });
        }
    }
}

async fn stream_file(
    ctx: &EngineContext,
    request: &LocalRequest,
    metadata: Option<&FileMetadata>,
    sink: &mut dyn ResponseSink,
    head_sent: &mut bool,
) -> Result<u64, ShareError> {
    let io_err = |e: std::io::Error| ShareError::from_io_error(&e);
    let length = tokio::fs::metadata(&request.paths.file)
        .await
        .map_err(io_err)?
        .len();

    // The file on disk is authoritative for the length
    let mut headers = metadata.cloned().unwrap_or_else(|| {
        let mut fallback = FileMetadata::new(&request.paths.sidecar);
        fallback.set_header(
            "Content-Disposition",
            &format!("inline;filename={}", request.key.relative_path()),
        );
        fallback
    });
    headers.set_header("Content-Length", &length.to_string());

    let range = request
        .range_header
        .as_deref()
        .and_then(|header| ByteRange::parse_request(header, length));
    let (start, end) = range.map_or((0, length), |r| (r.start, r.end + 1));

    let mut reader = staging::open_reader(&request.paths.file, start)
        .await
        .map_err(io_err)?;
    sink.start(headers.response_head(range))
        .await
        .map_err(|_| ShareError::ClientDisconnected)?;
    *head_sent = true;
    sink.set_timeout(ctx.settings.follower_idle_timeout());

    let mut position = start;
    while position < end {
        let want = usize::try_from(end - position).map_or(ctx.settings.copy_chunk_size, |left| {
            left.min(ctx.settings.copy_chunk_size)
        });
        let mut buf = vec![0u8; want];
        // The permit covers the disk read only, never the client write
        let n = {
            let _permit = ctx
                .copy_permits
                .acquire()
                .await
                .map_err(|_| ShareError::Cancelled)?;
            reader.read(&mut buf).await.map_err(io_err)?
        };
        if n == 0 {
            return Err(ShareError::Io {
                kind: "UnexpectedEof".into(),
                message: format!("file ended at {position} of {end} bytes"),
            });
        }
        buf.truncate(n);

        tokio::select! {
            written = sink.write(Bytes::from(buf)) => {
                written.map_err(|_| ShareError::ClientDisconnected)?;
            }
            () = ctx.cancel.cancelled() => return Err(ShareError::Cancelled),
        }
        sink.reset_timeout();
        position += n as u64;
    }

    Ok(position - start)
}

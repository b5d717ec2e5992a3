//! End-to-end tests for the download engine.
//!
//! Each test runs a real [`ShareDownloader`] against a temp store, a
//! scripted origin and recording clients.

mod common;

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tokio_test::{assert_err, assert_ok};

use common::{
    ChunkedBody, CollectingListener, Outcome, Reply, ScriptedOrigin, channel_body, client, payload,
    stalled_client,
};
use sharefetch_core::hash::md5_hex;
use sharefetch_core::{ResourceKey, ShareError, ShareEvent, ShareEventKind, ShareSettings};
use sharefetch_download::{Dispatch, LeaderPhase, ShareDownloader, ShareRequest};

const URL: &str = "http://origin.test/files/data.bin";

fn settings(root: &Path) -> ShareSettings {
    ShareSettings {
        copy_chunk_size: 128,
        ..ShareSettings::for_store(root)
    }
}

fn downloader(
    root: &Path,
    origin: &Arc<ScriptedOrigin>,
    listener: &Arc<CollectingListener>,
) -> ShareDownloader {
    ShareDownloader::new(settings(root), origin.clone(), listener.clone()).unwrap()
}

fn store_paths(root: &Path, url: &str) -> sharefetch_core::StorePaths {
    ResourceKey::parse(url).unwrap().paths(root)
}

/// Leave `bytes` in the staging file as a failed session would.
async fn seed_staging(root: &Path, url: &str, bytes: &[u8]) -> sharefetch_core::StorePaths {
    let paths = store_paths(root, url);
    paths.ensure_dir().await.unwrap();
    std::fs::write(&paths.staging, bytes).unwrap();
    paths
}

async fn wait_for_body(handle: &common::ClientHandle, len: usize) {
    tokio::time::timeout(common::WAIT, async {
        while handle.snapshot().body.len() < len {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_concurrent_requests_share_one_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(1000);
    let (feed, body) = channel_body();
    let origin = ScriptedOrigin::new([Reply::full(1000, Some(&md5_hex(&data)), body)]);
    let listener = CollectingListener::new();
    let service = downloader(dir.path(), &origin, &listener);

    let (sink_a, a) = client();
    let (sink_b, b) = client();
    let (sink_c, c) = client();
    let first = service.download(ShareRequest::new(URL), sink_a).await.unwrap();
    let second = service.download(ShareRequest::new(URL), sink_b).await.unwrap();
    let third = service.download(ShareRequest::new(URL), sink_c).await.unwrap();

    let Dispatch::Leader { session } = first else {
        panic!("Expected leader, got {first:?}");
    };
    assert_eq!(second, Dispatch::Follower { session });
    assert_eq!(third, Dispatch::Follower { session });

    assert!(service.is_downloading(URL));
    let snapshot = service.snapshot();
    assert_eq!(snapshot.sessions.len(), 1);
    assert_eq!(snapshot.sessions[0].followers, 3);

    feed.send(Ok(Bytes::copy_from_slice(&data[..400]))).unwrap();
    feed.send(Ok(Bytes::copy_from_slice(&data[400..]))).unwrap();
    drop(feed);

    for handle in [&a, &b, &c] {
        let record = handle.finished().await;
        assert_eq!(record.outcome, Some(Outcome::Completed));
        assert_eq!(record.head.as_ref().map(|h| h.status), Some(200));
        assert_eq!(record.body, data);
    }

    service.shutdown().await;

    assert_eq!(origin.calls(), vec![(URL.to_string(), 0)]);
    assert!(!service.is_downloading(URL));
    let paths = store_paths(dir.path(), URL);
    assert_eq!(std::fs::read(&paths.file).unwrap(), data);
    assert!(paths.sidecar.exists());
    assert!(!paths.staging.exists());

    assert_eq!(listener.count(ShareEventKind::DownloadBefore), 1);
    assert_eq!(listener.count(ShareEventKind::DownloadSuccess), 1);
    assert_eq!(listener.count(ShareEventKind::SharedDownloadSuccess), 3);
}

#[tokio::test]
async fn test_interrupted_transfer_resumes_from_last_byte() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(1000);
    let origin = ScriptedOrigin::new([
        Reply::full(1000, None, ChunkedBody::failing(&data[..300], 100)),
        Reply::partial(300, 1000, ChunkedBody::new(&data[300..], 100)),
    ]);
    let listener = CollectingListener::new();
    let service = downloader(dir.path(), &origin, &listener);

    let (sink, handle) = client();
    assert_ok!(service.download(ShareRequest::new(URL), sink).await);

    let record = handle.finished().await;
    assert_eq!(record.outcome, Some(Outcome::Completed));
    assert_eq!(record.body, data);

    service.shutdown().await;
    assert_eq!(origin.offsets(), vec![0, 300]);
    assert_eq!(
        std::fs::read(store_paths(dir.path(), URL).file).unwrap(),
        data
    );
    assert_eq!(listener.count(ShareEventKind::DownloadError), 0);
}

#[tokio::test]
async fn test_failure_without_progress_redirects_client() {
    let dir = tempfile::tempdir().unwrap();
    let origin = ScriptedOrigin::new([Reply::full(1000, None, ChunkedBody::failing(&[], 1))]);
    let listener = CollectingListener::new();
    let service = downloader(dir.path(), &origin, &listener);

    let (sink, handle) = client();
    let request = ShareRequest::new(URL).with_retry_location("http://proxy.test/files/data.bin");
    service.download(request, sink).await.unwrap();

    let record = handle.finished().await;
    assert_eq!(
        record.outcome,
        Some(Outcome::Redirected("http://proxy.test/files/data.bin".into()))
    );
    assert!(record.head.is_none());

    service.shutdown().await;
    assert_eq!(origin.offsets(), vec![0]);
    let paths = store_paths(dir.path(), URL);
    assert!(!paths.file.exists());
    assert!(!paths.staging.exists());

    let event = listener.first(ShareEventKind::DownloadError).unwrap();
    assert_eq!(event.error_kind(), Some("TransientIoExhausted"));
    assert!(event.message().unwrap().ends_with(URL));
}

#[tokio::test]
async fn test_origin_error_status_is_relayed() {
    let dir = tempfile::tempdir().unwrap();
    let origin = ScriptedOrigin::new([Reply::status(404, "no such file")]);
    let listener = CollectingListener::new();
    let service = downloader(dir.path(), &origin, &listener);

    let (sink, handle) = client();
    service.download(ShareRequest::new(URL), sink).await.unwrap();

    let record = handle.finished().await;
    match record.outcome {
        Some(Outcome::Error(status, message)) => {
            assert_eq!(status, 404);
            assert!(message.contains("no such file"));
        }
        other => panic!("Expected error reply, got {other:?}"),
    }

    service.shutdown().await;
    match listener.first(ShareEventKind::DownloadError) {
        Some(ShareEvent::DownloadError { status, .. }) => assert_eq!(status, Some(404)),
        other => panic!("Expected download error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_md5_mismatch_discards_download() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(1000);
    // One character off the real digest
    let mut wrong = md5_hex(&data);
    let last = if wrong.ends_with('0') { "1" } else { "0" };
    wrong.replace_range(31.., last);
    let (feed, body) = channel_body();
    let origin = ScriptedOrigin::new([Reply::full(1000, Some(&wrong), body)]);
    let listener = CollectingListener::new();
    let service = downloader(dir.path(), &origin, &listener);

    let (sink, handle) = client();
    service.download(ShareRequest::new(URL), sink).await.unwrap();

    feed.send(Ok(Bytes::copy_from_slice(&data))).unwrap();
    wait_for_body(&handle, 1000).await;
    drop(feed);

    // Every byte arrived, but the file failed validation, so the body is cut off
    let record = handle.finished().await;
    assert_eq!(record.outcome, Some(Outcome::Disconnected));
    assert_eq!(record.body, data);

    service.shutdown().await;
    let paths = store_paths(dir.path(), URL);
    assert!(!paths.file.exists());
    assert!(!paths.sidecar.exists());
    assert!(!paths.staging.exists());

    match listener.first(ShareEventKind::DownloadError) {
        Some(ShareEvent::DownloadError {
            error_kind, status, ..
        }) => {
            assert_eq!(error_kind, "IntegrityMismatch");
            assert_eq!(status, Some(409));
        }
        other => panic!("Expected download error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_parameterized_url_skips_md5_check() {
    let dir = tempfile::tempdir().unwrap();
    let url = "http://origin.test/files/data.bin?v=2";
    let data = payload(600);
    let wrong = md5_hex(b"not the payload");
    let origin = ScriptedOrigin::new([Reply::full(600, Some(&wrong), ChunkedBody::new(&data, 200))]);
    let listener = CollectingListener::new();
    let service = downloader(dir.path(), &origin, &listener);

    let (sink, handle) = client();
    service.download(ShareRequest::new(url), sink).await.unwrap();

    let record = handle.finished().await;
    assert_eq!(record.outcome, Some(Outcome::Completed));

    service.shutdown().await;
    assert_eq!(std::fs::read(store_paths(dir.path(), url).file).unwrap(), data);
    assert_eq!(listener.count(ShareEventKind::DownloadSuccess), 1);
}

#[tokio::test]
async fn test_leader_failure_redirects_waiting_followers_and_keeps_staging() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(1000);
    let (feed, body) = channel_body();
    let origin = ScriptedOrigin::new([
        Reply::full(1000, Some(&md5_hex(&data)), body),
        Reply::refused(URL),
    ]);
    let listener = CollectingListener::new();
    let service = downloader(dir.path(), &origin, &listener);
    let retry = "http://proxy.test/files/data.bin";

    let (sink_a, a) = client();
    let (sink_b, b) = client();
    let (sink_c, c) = client();
    service
        .download(ShareRequest::new(URL).with_retry_location(retry), sink_a)
        .await
        .unwrap();
    for sink in [sink_b, sink_c] {
        let request = ShareRequest::new(URL)
            .with_range("bytes=500-")
            .with_retry_location(retry);
        service.download(request, sink).await.unwrap();
    }

    feed.send(Ok(Bytes::copy_from_slice(&data[..400]))).unwrap();
    wait_for_body(&a, 400).await;
    // The resumed attempt is refused without progress, which ends the session
    feed.send(Err(std::io::Error::new(
        std::io::ErrorKind::ConnectionReset,
        "reset",
    )))
    .unwrap();

    for handle in [&b, &c] {
        let record = handle.finished().await;
        assert_eq!(record.outcome, Some(Outcome::Redirected(retry.into())));
        assert!(record.head.is_none());
        assert!(record.body.is_empty());
    }
    let record = a.finished().await;
    assert_eq!(record.outcome, Some(Outcome::Disconnected));
    assert_eq!(record.head.map(|h| h.status), Some(200));
    assert_eq!(record.body, &data[..400]);

    // The retried request resumes from what the failed session left behind
    origin.push(Reply::partial(400, 1000, ChunkedBody::new(&data[400..], 200)));
    let (sink_d, d) = client();
    let request = ShareRequest::new(URL).with_range("bytes=500-");
    let dispatch = service.download(request, sink_d).await.unwrap();
    assert!(matches!(dispatch, Dispatch::Leader { .. }));

    let record = d.finished().await;
    assert_eq!(record.outcome, Some(Outcome::Completed));
    let head = record.head.unwrap();
    assert_eq!(head.status, 206);
    assert_eq!(head.header("Content-Range"), Some("bytes 500-999/1000"));
    assert_eq!(record.body, &data[500..]);

    service.shutdown().await;
    assert_eq!(origin.offsets(), vec![0, 400, 400]);
    let paths = store_paths(dir.path(), URL);
    assert_eq!(std::fs::read(&paths.file).unwrap(), data);
    assert!(!paths.staging.exists());
    assert_eq!(listener.count(ShareEventKind::DownloadError), 1);
    assert_eq!(listener.count(ShareEventKind::DownloadSuccess), 1);
}

#[tokio::test]
async fn test_committed_file_is_served_locally_with_range() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(1000);
    let origin = ScriptedOrigin::new([Reply::full(1000, None, ChunkedBody::new(&data, 300))]);
    let listener = CollectingListener::new();
    let service = downloader(dir.path(), &origin, &listener);

    let (sink, handle) = client();
    service.download(ShareRequest::new(URL), sink).await.unwrap();
    handle.finished().await;

    // The session may still be winding down; wait for the committed file
    let paths = store_paths(dir.path(), URL);
    tokio::time::timeout(common::WAIT, async {
        while service.is_downloading(URL) || !paths.file.exists() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    let (sink, handle) = client();
    let request = ShareRequest::new(URL).with_range("bytes=10-19");
    let dispatch = service.download(request, sink).await.unwrap();
    assert_eq!(dispatch, Dispatch::Local);

    let record = handle.finished().await;
    assert_eq!(record.outcome, Some(Outcome::Completed));
    let head = record.head.unwrap();
    assert_eq!(head.status, 206);
    assert_eq!(head.header("Content-Range"), Some("bytes 10-19/1000"));
    assert_eq!(head.header("Content-Length"), Some("10"));
    assert_eq!(head.header("Access-Control-Allow-Origin"), Some("*"));
    assert_eq!(record.body, &data[10..20]);

    service.shutdown().await;
    assert_eq!(origin.calls().len(), 1);
    assert_eq!(listener.count(ShareEventKind::LocalDownload), 1);

    let metadata = service.metadata(URL).await.unwrap().unwrap();
    assert_eq!(metadata.content_length(), Some(1000));
}

#[tokio::test]
async fn test_local_redirect_base() {
    let dir = tempfile::tempdir().unwrap();
    let paths = store_paths(dir.path(), URL);
    paths.ensure_dir().await.unwrap();
    std::fs::write(&paths.file, b"cached").unwrap();

    let origin = ScriptedOrigin::new([]);
    let listener = CollectingListener::new();
    let settings = ShareSettings {
        local_redirect_base: Some("http://static.test/".into()),
        ..settings(dir.path())
    };
    let service = ShareDownloader::new(settings, origin.clone(), listener.clone()).unwrap();

    let (sink, handle) = client();
    service.download(ShareRequest::new(URL), sink).await.unwrap();

    let record = handle.finished().await;
    assert_eq!(
        record.outcome,
        Some(Outcome::Redirected(
            "http://static.test/origin.test/files/data.bin".into()
        ))
    );
    service.shutdown().await;
    assert!(origin.calls().is_empty());
}

#[tokio::test]
async fn test_media_request_redirects_and_downloads_in_background() {
    let dir = tempfile::tempdir().unwrap();
    let url = "http://origin.test/video/clip.MP4";
    let data = payload(512);
    let origin = ScriptedOrigin::new([Reply::full(512, None, ChunkedBody::new(&data, 128))]);
    let listener = CollectingListener::new();
    let service = downloader(dir.path(), &origin, &listener);

    let (sink, handle) = client();
    let dispatch = service.download(ShareRequest::new(url), sink).await.unwrap();
    assert_eq!(
        dispatch,
        Dispatch::Redirected {
            location: url.to_string()
        }
    );
    assert_eq!(
        handle.finished().await.outcome,
        Some(Outcome::Redirected(url.to_string()))
    );

    // A second request while the first is running does not start another fetch
    let (sink, _second) = client();
    service.download(ShareRequest::new(url), sink).await.unwrap();

    service.shutdown().await;
    assert_eq!(std::fs::read(store_paths(dir.path(), url).file).unwrap(), data);
    assert_eq!(origin.calls().len(), 1);
    assert_eq!(listener.count(ShareEventKind::DownloadSuccess), 1);
}

#[tokio::test]
async fn test_disconnected_follower_does_not_affect_others() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(800);
    let (feed, body) = channel_body();
    let origin = ScriptedOrigin::new([Reply::full(800, None, body)]);
    let listener = CollectingListener::new();
    let service = downloader(dir.path(), &origin, &listener);

    let (sink_a, a) = client();
    let (sink_b, b) = client();
    service.download(ShareRequest::new(URL), sink_a).await.unwrap();
    service.download(ShareRequest::new(URL), sink_b).await.unwrap();

    b.hang_up();
    feed.send(Ok(Bytes::copy_from_slice(&data))).unwrap();
    drop(feed);

    let record = a.finished().await;
    assert_eq!(record.outcome, Some(Outcome::Completed));
    assert_eq!(record.body, data);

    service.shutdown().await;
    assert!(b.snapshot().body.is_empty());
    assert_eq!(listener.count(ShareEventKind::SharedDownloadSuccess), 1);
    match listener.first(ShareEventKind::SharedDownloadError) {
        Some(event) => assert_eq!(event.error_kind(), Some("ClientDisconnected")),
        None => panic!("Expected a shared download error for the dropped client"),
    }
    assert!(!store_paths(dir.path(), URL).staging.exists());
}

#[tokio::test]
async fn test_session_snapshot_reports_progress() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(600);
    let (feed, body) = channel_body();
    let origin = ScriptedOrigin::new([Reply::full(600, None, body)]);
    let listener = CollectingListener::new();
    let service = downloader(dir.path(), &origin, &listener);

    let (sink, handle) = client();
    service.download(ShareRequest::new(URL), sink).await.unwrap();
    feed.send(Ok(Bytes::copy_from_slice(&data[..200]))).unwrap();
    wait_for_body(&handle, 200).await;

    let snapshot = service.snapshot();
    let session = &snapshot.sessions[0];
    assert_eq!(session.uri, URL);
    assert_eq!(session.relative_path, "/origin.test/files/data.bin");
    assert_eq!(session.published, 200);
    assert_eq!(session.content_length, Some(600));
    assert_eq!(session.phase, LeaderPhase::Streaming);

    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["sessions"][0]["phase"], "streaming");

    feed.send(Ok(Bytes::copy_from_slice(&data[200..]))).unwrap();
    drop(feed);
    handle.finished().await;
    service.shutdown().await;
}

#[tokio::test]
async fn test_rejected_requests() {
    let dir = tempfile::tempdir().unwrap();
    let origin = ScriptedOrigin::new([]);
    let listener = CollectingListener::new();
    let service = downloader(dir.path(), &origin, &listener);

    let (sink, handle) = client();
    let err = assert_err!(
        service
            .download(ShareRequest::new("ftp://origin.test/x"), sink)
            .await
    );
    assert_eq!(err.kind_name(), "InvalidKey");
    assert!(matches!(handle.snapshot().outcome, Some(Outcome::Error(400, _))));

    service.shutdown().await;

    let (sink, handle) = client();
    let err = service
        .download(ShareRequest::new(URL), sink)
        .await
        .unwrap_err();
    assert_eq!(err, ShareError::Cancelled);
    assert!(matches!(handle.snapshot().outcome, Some(Outcome::Error(503, _))));
    assert!(origin.calls().is_empty());
}

#[tokio::test]
async fn test_full_response_on_resume_skips_bytes_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(1000);
    let paths = seed_staging(dir.path(), URL, &data[..300]).await;
    let origin = ScriptedOrigin::new([Reply::full(
        1000,
        Some(&md5_hex(&data)),
        ChunkedBody::new(&data, 250),
    )]);
    let listener = CollectingListener::new();
    let service = downloader(dir.path(), &origin, &listener);

    let (sink, handle) = client();
    service.download(ShareRequest::new(URL), sink).await.unwrap();

    let record = handle.finished().await;
    assert_eq!(record.outcome, Some(Outcome::Completed));
    assert_eq!(record.body, data);

    service.shutdown().await;
    assert_eq!(origin.offsets(), vec![300]);
    assert_eq!(std::fs::read(&paths.file).unwrap(), data);
    assert!(!paths.staging.exists());
    assert_eq!(listener.count(ShareEventKind::DownloadSuccess), 1);
}

#[tokio::test]
async fn test_earlier_partial_response_on_resume_is_trimmed() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(1000);
    let paths = seed_staging(dir.path(), URL, &data[..300]).await;
    let origin = ScriptedOrigin::new([Reply::partial(
        200,
        1000,
        ChunkedBody::new(&data[200..], 250),
    )]);
    let listener = CollectingListener::new();
    let service = downloader(dir.path(), &origin, &listener);

    let (sink, handle) = client();
    service.download(ShareRequest::new(URL), sink).await.unwrap();

    let record = handle.finished().await;
    assert_eq!(record.outcome, Some(Outcome::Completed));
    assert_eq!(record.body, data);

    service.shutdown().await;
    assert_eq!(origin.offsets(), vec![300]);
    assert_eq!(std::fs::read(&paths.file).unwrap(), data);
    assert!(!paths.staging.exists());
}

#[tokio::test]
async fn test_later_partial_response_on_resume_is_terminal() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(1000);
    let paths = seed_staging(dir.path(), URL, &data[..300]).await;
    let origin = ScriptedOrigin::new([Reply::partial(
        500,
        1000,
        ChunkedBody::new(&data[500..], 250),
    )]);
    let listener = CollectingListener::new();
    let service = downloader(dir.path(), &origin, &listener);

    let (sink, handle) = client();
    service.download(ShareRequest::new(URL), sink).await.unwrap();

    let record = handle.finished().await;
    match record.outcome {
        Some(Outcome::Error(status, message)) => {
            assert_eq!(status, 502);
            assert!(message.contains("starts at 500"));
        }
        other => panic!("Expected error reply, got {other:?}"),
    }
    assert!(record.head.is_none());

    service.shutdown().await;
    assert_eq!(origin.offsets(), vec![300]);
    assert!(!paths.file.exists());
    // Nothing was appended, so the bytes on disk remain for the next session
    assert_eq!(std::fs::read(&paths.staging).unwrap(), &data[..300]);
    match listener.first(ShareEventKind::DownloadError) {
        Some(ShareEvent::DownloadError {
            error_kind, status, ..
        }) => {
            assert_eq!(error_kind, "OriginRejected");
            assert_eq!(status, Some(502));
        }
        other => panic!("Expected download error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unsatisfiable_resume_discards_staging() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(1000);
    let paths = seed_staging(dir.path(), URL, &data[..300]).await;
    let origin = ScriptedOrigin::new([Reply::status(416, "range not satisfiable")]);
    let listener = CollectingListener::new();
    let service = downloader(dir.path(), &origin, &listener);

    let (sink, handle) = client();
    service.download(ShareRequest::new(URL), sink).await.unwrap();

    let record = handle.finished().await;
    match record.outcome {
        Some(Outcome::Error(status, message)) => {
            assert_eq!(status, 416);
            assert!(message.contains("range not satisfiable"));
        }
        other => panic!("Expected error reply, got {other:?}"),
    }

    service.shutdown().await;
    assert_eq!(origin.offsets(), vec![300]);
    assert!(!paths.file.exists());
    assert!(!paths.staging.exists());
}

#[tokio::test]
async fn test_snapshot_reports_resumed_transfer() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(1000);
    let (feed, body) = channel_body();
    let origin = ScriptedOrigin::new([
        Reply::full(1000, None, ChunkedBody::failing(&data[..300], 100)),
        Reply::partial(300, 1000, body),
    ]);
    let listener = CollectingListener::new();
    let service = downloader(dir.path(), &origin, &listener);

    let (sink, handle) = client();
    service.download(ShareRequest::new(URL), sink).await.unwrap();

    let session = tokio::time::timeout(common::WAIT, async {
        loop {
            if let Some(session) = service.snapshot().sessions.into_iter().next() {
                if session.retries == 1 && session.phase == LeaderPhase::Streaming {
                    return session;
                }
            }
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    assert_eq!(session.published, 300);
    match &session.last_error {
        Some(ShareError::TransientIo { offset, kind, .. }) => {
            assert_eq!(*offset, 300);
            assert_eq!(kind, "ConnectionReset");
        }
        other => panic!("Expected a transient error, got {other:?}"),
    }
    let json = serde_json::to_value(&session).unwrap();
    assert_eq!(json["retries"], 1);
    assert_eq!(json["last_error"]["TransientIo"]["offset"], 300);

    feed.send(Ok(Bytes::copy_from_slice(&data[300..]))).unwrap();
    drop(feed);
    let record = handle.finished().await;
    assert_eq!(record.outcome, Some(Outcome::Completed));
    assert_eq!(record.body, data);
    service.shutdown().await;
    assert_eq!(origin.offsets(), vec![0, 300]);
}

#[tokio::test]
async fn test_scheme_variants_share_one_download() {
    let dir = tempfile::tempdir().unwrap();
    let secure = "https://origin.test/files/data.bin";
    let data = payload(500);
    let (feed, body) = channel_body();
    let origin = ScriptedOrigin::new([Reply::full(500, None, body)]);
    let listener = CollectingListener::new();
    let service = downloader(dir.path(), &origin, &listener);

    let (sink_a, a) = client();
    let (sink_b, b) = client();
    let first = service.download(ShareRequest::new(URL), sink_a).await.unwrap();
    let second = service.download(ShareRequest::new(secure), sink_b).await.unwrap();

    let Dispatch::Leader { session } = first else {
        panic!("Expected leader, got {first:?}");
    };
    assert_eq!(second, Dispatch::Follower { session });
    assert!(service.is_downloading(secure));

    feed.send(Ok(Bytes::copy_from_slice(&data))).unwrap();
    drop(feed);
    for handle in [&a, &b] {
        let record = handle.finished().await;
        assert_eq!(record.outcome, Some(Outcome::Completed));
        assert_eq!(record.body, data);
    }

    service.shutdown().await;
    assert_eq!(origin.calls(), vec![(URL.to_string(), 0)]);
    assert_eq!(std::fs::read(store_paths(dir.path(), secure).file).unwrap(), data);
}

#[tokio::test]
async fn test_stalled_client_does_not_block_other_downloads() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(600);
    // Both resources get the same bytes, whichever is fetched first
    let origin = ScriptedOrigin::new([
        Reply::full(600, None, ChunkedBody::new(&data, 200)),
        Reply::full(600, None, ChunkedBody::new(&data, 200)),
    ]);
    let listener = CollectingListener::new();
    let settings = ShareSettings {
        max_concurrent_copies: 1,
        ..settings(dir.path())
    };
    let service = ShareDownloader::new(settings, origin.clone(), listener.clone()).unwrap();

    let (sink, slow) = stalled_client();
    service
        .download(ShareRequest::new("http://origin.test/slow.bin"), sink)
        .await
        .unwrap();
    tokio::time::timeout(common::WAIT, async {
        while !slow.is_stalled() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    let (sink, other) = client();
    service
        .download(ShareRequest::new("http://origin.test/other.bin"), sink)
        .await
        .unwrap();
    let record = other.finished().await;
    assert_eq!(record.outcome, Some(Outcome::Completed));
    assert_eq!(record.body, data);

    // Shutdown ends the stuck write instead of waiting on it
    tokio::time::timeout(common::WAIT, service.shutdown())
        .await
        .unwrap();
    assert_eq!(slow.finished().await.outcome, Some(Outcome::Disconnected));
}

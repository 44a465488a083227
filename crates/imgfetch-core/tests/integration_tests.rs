//! Integration tests for imgfetch-core against a local HTTP server

mod common;

use common::{payload, ServerOptions, TestServer};
use imgfetch_core::transfer::{split_segments, TransferState};
use imgfetch_core::{
    checksum_bytes, AcquireConfig, Acquirer, ChecksumAlgorithm, Downloader, Error, ImageDescriptor,
    Phase, ProgressEvent, ProgressReport, ProgressTracker,
};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

fn test_config() -> AcquireConfig {
    AcquireConfig::new()
        .connections(4)
        .timeout(Duration::from_secs(5))
        .retry_attempts(1)
        .retry_delay(Duration::from_millis(10))
        .write_buffer_size(16 * 1024)
}

fn recording_tracker() -> (ProgressTracker, Arc<Mutex<Vec<ProgressReport>>>) {
    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reports);
    let tracker = ProgressTracker::new(move |r| sink.lock().unwrap().push(r));
    (tracker, reports)
}

fn event_recorder() -> (
    Arc<Mutex<Vec<ProgressEvent>>>,
    impl Fn(ProgressEvent) + Send + Sync + 'static,
) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    (events, move |e| sink.lock().unwrap().push(e))
}

// ============================================================================
// Downloader
// ============================================================================

#[tokio::test]
async fn test_download_multi_segment() {
    let body = payload(1024 * 1024);
    let server = TestServer::start(body.clone());
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("image.img");

    let downloader = Downloader::with_config(test_config()).unwrap();
    let (mut progress, reports) = recording_tracker();
    downloader.download(&server.url(), &dest, &mut progress).await.unwrap();

    assert_eq!(std::fs::read(&dest).unwrap(), body);
    assert!(!TransferState::sidecar_path(&dest).exists());

    let ranges = server.served_ranges();
    assert_eq!(ranges.len(), 4);
    assert!(ranges.iter().any(|r| r == "bytes=0-262143"));
    assert!(ranges.iter().any(|r| r == "bytes=786432-1048575"));

    let reports = reports.lock().unwrap();
    assert_eq!(reports.first().unwrap().eta_seconds, -1);
    assert_eq!(*reports.last().unwrap(), ProgressReport::completed());
    assert_eq!(progress.state().updated_size, body.len() as u64);
}

#[tokio::test]
async fn test_download_without_range_support() {
    let body = payload(300 * 1024);
    let server = TestServer::with_options(
        body.clone(),
        ServerOptions {
            accept_ranges: false,
            etag: None,
            ..Default::default()
        },
    );
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("image.img");

    let downloader = Downloader::with_config(test_config()).unwrap();
    let mut progress = ProgressTracker::silent();
    downloader.download(&server.url(), &dest, &mut progress).await.unwrap();

    assert_eq!(std::fs::read(&dest).unwrap(), body);
    assert_eq!(server.get_count(), 1);
    assert!(server.served_ranges().is_empty());
    assert!(!TransferState::sidecar_path(&dest).exists());
}

#[tokio::test]
async fn test_download_empty_resource() {
    let server = TestServer::start(Vec::new());
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("empty.img");

    let downloader = Downloader::with_config(test_config()).unwrap();
    let (mut progress, reports) = recording_tracker();
    downloader.download(&server.url(), &dest, &mut progress).await.unwrap();

    assert_eq!(std::fs::metadata(&dest).unwrap().len(), 0);
    assert!(!TransferState::sidecar_path(&dest).exists());
    assert_eq!(*reports.lock().unwrap().last().unwrap(), ProgressReport::completed());
}

#[tokio::test]
async fn test_resume_from_sidecar() {
    let body = payload(512 * 1024);
    let total = body.len() as u64;
    let server = TestServer::start(body.clone());
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("image.img");
    let sidecar = TransferState::sidecar_path(&dest);

    // an earlier run wrote part of each segment before being interrupted
    let mut state = TransferState::new(server.url(), &dest, Some(total), Some("\"v1\"".into()), true, 2);
    assert_eq!(state.segments, split_segments(total, 2));
    state.segments[0].offset = 100_000;
    state.segments[1].offset = state.segments[1].start + 50_000;

    let mut partial = vec![0u8; body.len()];
    for segment in &state.segments {
        let (start, offset) = (segment.start as usize, segment.offset as usize);
        partial[start..offset].copy_from_slice(&body[start..offset]);
    }
    std::fs::write(&dest, &partial).unwrap();
    state.save(&sidecar).await.unwrap();
    let already_received = state.received_bytes();

    let downloader = Downloader::with_config(test_config().connections(2)).unwrap();
    let (mut progress, reports) = recording_tracker();
    downloader.download(&server.url(), &dest, &mut progress).await.unwrap();

    assert_eq!(std::fs::read(&dest).unwrap(), body);
    assert!(!sidecar.exists());

    // only the missing bytes were requested
    let seg1_resume = state.segments[1].offset;
    assert_eq!(
        server.served_ranges(),
        vec![
            format!("bytes=100000-{}", state.segments[0].end.unwrap() - 1),
            format!("bytes={}-{}", seg1_resume, total - 1),
        ]
    );

    // the tracker was seeded with the bytes already on disk
    let first = reports.lock().unwrap()[0];
    let expected_pct = already_received as f64 / total as f64 * 100.0;
    assert!((first.percentage - expected_pct).abs() < 1e-9);
    assert_eq!(progress.state().updated_size, total);
}

#[tokio::test]
async fn test_resume_discarded_when_remote_changed() {
    let body = payload(256 * 1024);
    let total = body.len() as u64;
    let server = TestServer::start(body.clone());
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("image.img");
    let sidecar = TransferState::sidecar_path(&dest);

    // sidecar from an older revision of the image with a different size
    let mut state = TransferState::new(server.url(), &dest, Some(total + 10), Some("\"v0\"".into()), true, 1);
    state.segments[0].offset = 1000;
    state.save(&sidecar).await.unwrap();
    std::fs::write(&dest, vec![0xAA; (total + 10) as usize]).unwrap();

    let downloader = Downloader::with_config(test_config().connections(1)).unwrap();
    let mut progress = ProgressTracker::silent();
    downloader.download(&server.url(), &dest, &mut progress).await.unwrap();

    assert_eq!(std::fs::read(&dest).unwrap(), body);
    assert_eq!(server.served_ranges(), vec![format!("bytes=0-{}", total - 1)]);
}

#[tokio::test]
async fn test_resume_discarded_when_etag_changed() {
    let body = payload(128 * 1024);
    let total = body.len() as u64;
    let server = TestServer::start(body.clone());
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("image.img");
    let sidecar = TransferState::sidecar_path(&dest);

    let mut state = TransferState::new(server.url(), &dest, Some(total), Some("\"v0\"".into()), true, 1);
    state.segments[0].offset = 4096;
    state.save(&sidecar).await.unwrap();
    std::fs::write(&dest, vec![0xAA; total as usize]).unwrap();

    let downloader = Downloader::with_config(test_config().connections(1)).unwrap();
    let mut progress = ProgressTracker::silent();
    downloader.download(&server.url(), &dest, &mut progress).await.unwrap();

    assert_eq!(std::fs::read(&dest).unwrap(), body);
    assert_eq!(server.served_ranges(), vec![format!("bytes=0-{}", total - 1)]);
}

#[tokio::test]
async fn test_download_not_found() {
    let server = TestServer::start(payload(1024));
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("missing.img");

    let downloader = Downloader::with_config(test_config()).unwrap();
    let mut progress = ProgressTracker::silent();
    let result = downloader
        .download(&server.url_for("/missing.img"), &dest, &mut progress)
        .await;

    assert!(matches!(result, Err(Error::HttpStatus { status: 404, .. })));
    assert!(!dest.exists());
    assert!(!TransferState::sidecar_path(&dest).exists());
}

#[tokio::test]
async fn test_connection_refused_preserves_sidecar() {
    let body = payload(128 * 1024);
    let server = TestServer::start(body);
    let url = server.url();
    drop(server);

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("image.img");
    let sidecar = TransferState::sidecar_path(&dest);
    let mut state = TransferState::new(url.clone(), &dest, Some(128 * 1024), None, true, 1);
    state.segments[0].offset = 2048;
    state.save(&sidecar).await.unwrap();
    std::fs::write(&dest, vec![0u8; 128 * 1024]).unwrap();

    let downloader = Downloader::with_config(test_config()).unwrap();
    let mut progress = ProgressTracker::silent();
    let result = downloader.download(&url, &dest, &mut progress).await;

    let err = result.unwrap_err();
    assert!(err.is_retryable(), "unexpected error: {err}");
    assert_eq!(err.code(), Some(imgfetch_core::ErrorCode::ConnectionInterrupted));
    let preserved = TransferState::load(&sidecar).await.unwrap().unwrap();
    assert_eq!(preserved.received_bytes(), 2048);
}

#[tokio::test]
async fn test_cancel_preserves_sidecar() {
    let body = payload(512 * 1024);
    let server = TestServer::start(body);
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("image.img");

    let downloader = Downloader::with_config(test_config()).unwrap();
    downloader.cancel_handle().store(true, Ordering::SeqCst);
    let mut progress = ProgressTracker::silent();
    let result = downloader.download(&server.url(), &dest, &mut progress).await;

    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(TransferState::sidecar_path(&dest).exists());
    assert!(dest.exists());
    assert!(progress.is_completed());

    Downloader::discard(&dest).await.unwrap();
    assert!(!dest.exists());
    assert!(!TransferState::sidecar_path(&dest).exists());
}

#[tokio::test]
async fn test_connection_drop_keeps_partial_download() {
    let body = payload(256 * 1024);
    let total = body.len() as u64;
    let server = TestServer::with_options(
        body.clone(),
        ServerOptions {
            truncate_after: Some(40_000),
            truncate_times: 1,
            ..Default::default()
        },
    );
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("image.img");
    let sidecar = TransferState::sidecar_path(&dest);

    // first run: the only connection closes mid-body and is not retried
    let config = test_config().connections(1).retry_attempts(0);
    let downloader = Downloader::with_config(config.clone()).unwrap();
    let mut progress = ProgressTracker::silent();
    let err = downloader
        .download(&server.url(), &dest, &mut progress)
        .await
        .unwrap_err();

    assert_eq!(err.code(), Some(imgfetch_core::ErrorCode::ConnectionInterrupted));
    assert!(progress.is_completed());
    let saved = TransferState::load(&sidecar).await.unwrap().unwrap();
    let received = saved.received_bytes();
    assert!(received > 0 && received <= 40_000, "received {received}");
    let partial = std::fs::read(&dest).unwrap();
    assert_eq!(partial.len() as u64, total);
    assert_eq!(&partial[..received as usize], &body[..received as usize]);

    // second run resumes from the saved offset
    let downloader = Downloader::with_config(config).unwrap();
    let (mut progress, reports) = recording_tracker();
    downloader.download(&server.url(), &dest, &mut progress).await.unwrap();

    assert_eq!(std::fs::read(&dest).unwrap(), body);
    assert!(!sidecar.exists());
    let last_get = server
        .requests()
        .into_iter()
        .filter(|r| r.method == "GET")
        .last()
        .unwrap();
    assert_eq!(last_get.range, Some(format!("bytes={}-{}", received, total - 1)));

    let first = reports.lock().unwrap()[0];
    let expected_pct = received as f64 / total as f64 * 100.0;
    assert!((first.percentage - expected_pct).abs() < 1e-9);
}

#[tokio::test]
async fn test_connection_drop_reconnects_segment() {
    let body = payload(256 * 1024);
    let server = TestServer::with_options(
        body.clone(),
        ServerOptions {
            truncate_after: Some(50_000),
            truncate_times: 2,
            ..Default::default()
        },
    );
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("image.img");

    let config = test_config().connections(1).retry_attempts(3);
    let downloader = Downloader::with_config(config).unwrap();
    let mut progress = ProgressTracker::silent();
    downloader.download(&server.url(), &dest, &mut progress).await.unwrap();

    assert_eq!(std::fs::read(&dest).unwrap(), body);
    assert!(!TransferState::sidecar_path(&dest).exists());
    assert_eq!(server.head_count(), 1);
    assert_eq!(server.get_count(), 3);

    // each reconnect asks for the bytes after the last written one
    let ranges: Vec<String> = server
        .requests()
        .into_iter()
        .filter(|r| r.method == "GET")
        .filter_map(|r| r.range)
        .collect();
    assert_eq!(ranges[0], format!("bytes=0-{}", body.len() - 1));
    assert_ne!(ranges[1], ranges[0]);
    assert_ne!(ranges[2], ranges[1]);
}

#[tokio::test]
async fn test_remote_change_restarts_once() {
    let body = payload(128 * 1024);
    let total = body.len() as u64;
    let server = TestServer::with_options(
        body.clone(),
        ServerOptions {
            stale_heads: 1,
            ..Default::default()
        },
    );
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("image.img");

    let downloader = Downloader::with_config(test_config()).unwrap();
    let (mut progress, reports) = recording_tracker();
    downloader.download(&server.url(), &dest, &mut progress).await.unwrap();

    assert_eq!(std::fs::read(&dest).unwrap(), body);
    assert!(!TransferState::sidecar_path(&dest).exists());
    assert_eq!(server.head_count(), 2);

    // the tracker follows the new size after the restart
    let state = progress.state();
    assert_eq!(state.total_size, total);
    assert_eq!(state.updated_size, total);
    assert_eq!(*reports.lock().unwrap().last().unwrap(), ProgressReport::completed());
}

#[tokio::test]
async fn test_remote_change_twice_is_surfaced() {
    let body = payload(128 * 1024);
    let server = TestServer::with_options(
        body,
        ServerOptions {
            stale_heads: usize::MAX,
            ..Default::default()
        },
    );
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("image.img");

    let downloader = Downloader::with_config(test_config()).unwrap();
    let mut progress = ProgressTracker::silent();
    let result = downloader.download(&server.url(), &dest, &mut progress).await;

    assert!(matches!(result, Err(Error::RemoteChanged(_))), "got {result:?}");
    assert_eq!(server.head_count(), 2);
    assert!(progress.is_completed());
    assert!(!dest.exists());
    assert!(!TransferState::sidecar_path(&dest).exists());
}

// ============================================================================
// Acquisition
// ============================================================================

#[tokio::test]
async fn test_acquire_network_image() {
    let body = payload(400 * 1024);
    let md5 = checksum_bytes(&body, ChecksumAlgorithm::Md5).to_hex();
    let server = TestServer::start(body.clone());
    let dir = TempDir::new().unwrap();

    let descriptor = ImageDescriptor::new(server.url())
        .checksum(md5)
        .download_location(dir.path());
    let (events, callback) = event_recorder();
    let path = Acquirer::with_config(test_config())
        .ensure_local_image(&descriptor, callback)
        .await
        .unwrap();

    assert_eq!(path, dir.path().join(server.image_name()));
    assert_eq!(std::fs::read(&path).unwrap(), body);
    assert!(!TransferState::sidecar_path(&path).exists());

    let events = events.lock().unwrap();
    let download_done = events
        .iter()
        .position(|e| e.phase == Phase::Download && e.percentage == 100.0)
        .expect("download completed");
    let checksum_done = events
        .iter()
        .position(|e| e.phase == Phase::Checksum && e.percentage == 100.0)
        .expect("checksum completed");
    assert!(download_done < checksum_done);
}

#[tokio::test]
async fn test_acquire_reuses_verified_download() {
    let body = payload(64 * 1024);
    let sha = checksum_bytes(&body, ChecksumAlgorithm::Sha256).to_hex();
    let server = TestServer::start(body);
    let dir = TempDir::new().unwrap();

    let descriptor = ImageDescriptor::new(server.url())
        .checksum(sha)
        .checksum_algorithm("sha256")
        .download_location(dir.path());
    let acquirer = Acquirer::with_config(test_config());

    let first = acquirer.ensure_local_image(&descriptor, |_| {}).await.unwrap();
    let requests_after_first = server.requests().len();
    let second = acquirer.ensure_local_image(&descriptor, |_| {}).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(server.requests().len(), requests_after_first);
}

#[tokio::test]
async fn test_acquire_bad_checksum_cleans_up() {
    let body = payload(64 * 1024);
    let server = TestServer::start(body);
    let dir = TempDir::new().unwrap();

    let descriptor = ImageDescriptor::new(server.url())
        .checksum("d41d8cd98f00b204e9800998ecf8427e")
        .download_location(dir.path());
    let result = Acquirer::with_config(test_config())
        .ensure_local_image(&descriptor, |_| {})
        .await;

    assert!(matches!(result, Err(Error::ChecksumError)));
    let dest = dir.path().join(server.image_name());
    assert!(!dest.exists());
    assert!(!TransferState::sidecar_path(&dest).exists());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_acquire_redownloads_corrupt_copy() {
    let body = payload(64 * 1024);
    let md5 = checksum_bytes(&body, ChecksumAlgorithm::Md5).to_hex();
    let server = TestServer::start(body.clone());
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join(server.image_name());
    std::fs::write(&dest, b"stale copy").unwrap();

    let descriptor = ImageDescriptor::new(server.url())
        .checksum(md5)
        .download_location(dir.path());
    let path = Acquirer::with_config(test_config())
        .ensure_local_image(&descriptor, |_| {})
        .await
        .unwrap();

    assert_eq!(std::fs::read(path).unwrap(), body);
    assert!(server.get_count() >= 1);
}

#[tokio::test]
async fn test_acquire_local_mismatch_makes_no_request() {
    let server = TestServer::start(payload(1024));
    let dir = TempDir::new().unwrap();
    let local = dir.path().join("a.img");
    std::fs::write(&local, vec![3u8; 1000]).unwrap();

    let descriptor = ImageDescriptor::new(local.to_str().unwrap())
        .checksum("d41d8cd98f00b204e9800998ecf8427e")
        .download_location(dir.path());
    let result = Acquirer::with_config(test_config())
        .ensure_local_image(&descriptor, |_| {})
        .await;

    assert!(matches!(result, Err(Error::ChecksumError)));
    assert!(server.requests().is_empty());
    assert!(local.exists());
}

#[tokio::test]
async fn test_acquire_missing_download_location() {
    let server = TestServer::start(payload(1024));
    let descriptor = ImageDescriptor::new(server.url());
    let result = Acquirer::new().ensure_local_image(&descriptor, |_| {}).await;

    assert!(matches!(result, Err(Error::MissingDownloadLocation)));
    assert!(server.requests().is_empty());
}

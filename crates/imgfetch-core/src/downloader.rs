//! Resumable multi-connection HTTP downloader
//!
//! This module provides:
//! - A `HEAD` request recording size, range support and entity tag
//! - Concurrent byte-range fetches written at absolute file offsets
//! - A persisted [`TransferState`] sidecar for resuming after interruption
//! - Classification of transport failures into retryable and fatal classes
//!
//! Only the coordinating task mutates the transfer state; segment tasks report
//! their written offsets over a channel.
//!
//! ## Example
//!
//! ```no_run
//! use imgfetch_core::downloader::Downloader;
//! use imgfetch_core::progress::ProgressTracker;
//!
//! # async fn run() -> imgfetch_core::Result<()> {
//! let downloader = Downloader::new()?;
//! let mut progress = ProgressTracker::new(|r| println!("{:.1}%", r.percentage));
//! downloader
//!     .download(
//!         "https://example.com/image.img",
//!         "/tmp/example.com-image.img".as_ref(),
//!         &mut progress,
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::config::AcquireConfig;
use crate::error::{Error, Result};
use crate::progress::ProgressTracker;
use crate::transfer::{Segment, TransferState};
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, ETAG, RANGE};
use reqwest::{Client, StatusCode};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// How often the coordinator checks the cancel flag while segments stall
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// Remote info
// ============================================================================

/// What a `HEAD` request revealed about the remote resource
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteInfo {
    /// Declared `Content-Length`
    pub total_bytes: Option<u64>,
    /// Whether `Accept-Ranges: bytes` was advertised
    pub accepts_ranges: bool,
    /// Entity tag, if any
    pub etag: Option<String>,
}

impl RemoteInfo {
    fn from_headers(headers: &HeaderMap) -> Self {
        let text = |name: HeaderName| headers.get(name).and_then(|v| v.to_str().ok());

        Self {
            total_bytes: text(CONTENT_LENGTH).and_then(|v| v.trim().parse().ok()),
            accepts_ranges: text(ACCEPT_RANGES)
                .is_some_and(|v| v.split(',').any(|unit| unit.trim().eq_ignore_ascii_case("bytes"))),
            etag: text(ETAG).map(str::to_string),
        }
    }

    /// Whether a multi-segment, resumable transfer is possible
    pub fn is_resumable(&self) -> bool {
        self.accepts_ranges && self.total_bytes.is_some()
    }

    fn matches(&self, state: &TransferState) -> bool {
        let etag_matches = match (&state.etag, &self.etag) {
            (Some(saved), Some(current)) => saved == current,
            _ => true,
        };
        state.resumable && self.is_resumable() && state.total_bytes == self.total_bytes && etag_matches
    }
}

// ============================================================================
// Downloader
// ============================================================================

/// Resumable downloader for a single remote resource at a time
pub struct Downloader {
    client: Client,
    config: AcquireConfig,
    cancel_flag: Arc<AtomicBool>,
}

impl Downloader {
    /// Create a downloader with default configuration
    pub fn new() -> Result<Self> {
        Self::with_config(AcquireConfig::default())
    }

    /// Create a downloader with custom configuration
    pub fn with_config(config: AcquireConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.timeout)
            .read_timeout(config.timeout)
            .build()
            .map_err(|e| Error::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            cancel_flag: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Share an existing cancel flag
    pub fn with_cancel_handle(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel_flag = flag;
        self
    }

    /// Get a handle to cancel the download
    ///
    /// Cancelling stops every segment and keeps the sidecar for a later resume.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel_flag)
    }

    /// Get the configuration
    pub fn config(&self) -> &AcquireConfig {
        &self.config
    }

    /// Download `url` to `destination`, resuming from a sidecar if one exists
    ///
    /// Re-invoking after a failure is safe: a preserved sidecar makes the
    /// next call continue where this one stopped.
    pub async fn download(
        &self,
        url: &str,
        destination: &Path,
        progress: &mut ProgressTracker,
    ) -> Result<()> {
        let sidecar = TransferState::sidecar_path(destination);
        let mut restarted = false;

        loop {
            let mut state = self.prepare(url, destination, &sidecar).await?;
            if restarted {
                progress.rebase(state.total_bytes.unwrap_or(0), state.received_bytes());
            }

            match self.transfer(url, &mut state, &sidecar, progress).await {
                Err(Error::RemoteChanged(reason)) if !restarted => {
                    tracing::warn!("{}; restarting download of {}", reason, url);
                    Self::discard(destination).await?;
                    restarted = true;
                }
                Err(Error::RemoteChanged(reason)) => {
                    Self::discard(destination).await?;
                    progress.abort();
                    return Err(Error::RemoteChanged(reason));
                }
                result => return result,
            }
        }
    }

    /// Delete the partial file and its sidecar
    pub async fn discard(destination: &Path) -> Result<()> {
        TransferState::remove(&TransferState::sidecar_path(destination)).await?;
        match tokio::fs::remove_file(destination).await {
            Ok(()) => {
                tracing::debug!("Removed partial download {:?}", destination);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Query size, range support and entity tag of `url`
    pub async fn remote_info(&self, url: &str) -> Result<RemoteInfo> {
        let response = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e, url))?;

        let status = response.status();
        if status == StatusCode::METHOD_NOT_ALLOWED || status == StatusCode::NOT_IMPLEMENTED {
            tracing::debug!("Server rejected HEAD for {}, using a single connection", url);
            return Ok(RemoteInfo::default());
        }
        if !status.is_success() {
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let info = RemoteInfo::from_headers(response.headers());
        tracing::debug!(
            "Remote {}: size={:?} ranges={} etag={:?}",
            url,
            info.total_bytes,
            info.accepts_ranges,
            info.etag
        );
        Ok(info)
    }

    // ------------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------------

    /// Load a usable sidecar or create a fresh transfer
    async fn prepare(&self, url: &str, destination: &Path, sidecar: &Path) -> Result<TransferState> {
        let existing = match TransferState::load(sidecar).await {
            Ok(state) => state,
            Err(Error::TransferState(reason)) => {
                tracing::warn!("Discarding unusable transfer state {:?}: {}", sidecar, reason);
                Self::discard(destination).await?;
                None
            }
            Err(e) => return Err(e),
        };

        let remote = self.remote_info(url).await?;

        if let Some(state) = existing {
            let file_len = tokio::fs::metadata(destination).await.map(|m| m.len()).ok();
            let file_intact = file_len.is_some() && file_len == state.total_bytes;

            if state.source_url == url && remote.matches(&state) && file_intact {
                tracing::info!(
                    "Resuming download of {} ({} of {:?} bytes received)",
                    url,
                    state.received_bytes(),
                    state.total_bytes
                );
                return Ok(state);
            }

            tracing::warn!("Transfer state for {:?} no longer matches {}, restarting", destination, url);
            Self::discard(destination).await?;
        }

        self.create(url, destination, sidecar, remote).await
    }

    /// Preallocate the destination and persist a fresh sidecar
    async fn create(
        &self,
        url: &str,
        destination: &Path,
        sidecar: &Path,
        remote: RemoteInfo,
    ) -> Result<TransferState> {
        let resumable = remote.is_resumable();
        let state = TransferState::new(
            url,
            destination,
            remote.total_bytes,
            remote.etag,
            resumable,
            self.config.connections,
        );

        let created = async {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(destination)
                .await
                .map_err(Error::from_download_io)?;
            if let Some(total) = state.total_bytes {
                file.set_len(total).await.map_err(Error::from_download_io)?;
            }
            state.save(sidecar).await
        }
        .await;

        if let Err(e) = created {
            tracing::debug!("Failed to create transfer for {}: {}", url, e);
            // best effort: the original error is what matters
            let _ = Self::discard(destination).await;
            return Err(e);
        }

        tracing::info!(
            "Starting download of {} ({} segment(s), {:?} bytes)",
            url,
            state.segments.len(),
            state.total_bytes
        );
        Ok(state)
    }

    /// Drive the segments, then finalize or apply the failure policy
    async fn transfer(
        &self,
        url: &str,
        state: &mut TransferState,
        sidecar: &Path,
        progress: &mut ProgressTracker,
    ) -> Result<()> {
        if !progress.is_started() {
            progress.set_total_size(state.total_bytes.unwrap_or(0))?;
            progress.set_start_size(state.received_bytes())?;
            progress.start();
        }

        let result = if state.is_complete() {
            Ok(())
        } else {
            self.fetch_segments(url, state, sidecar, progress).await
        };

        match result {
            Ok(()) => self.finalize(url, state, sidecar, progress).await,
            Err(Error::RemoteChanged(reason)) => Err(Error::RemoteChanged(reason)),
            Err(Error::DownloadNoSpace) => {
                progress.abort();
                let _ = Self::discard(&state.destination_path).await;
                Err(Error::DownloadNoSpace)
            }
            Err(e) => {
                progress.abort();
                if state.resumable {
                    if let Err(save_err) = state.save(sidecar).await {
                        tracing::warn!("Failed to persist transfer state: {}", save_err);
                    }
                }
                tracing::debug!(
                    "Download of {} stopped at {} bytes: {}",
                    url,
                    state.received_bytes(),
                    e
                );
                Err(e)
            }
        }
    }

    /// Run every incomplete segment concurrently and fold their reports into `state`
    async fn fetch_segments(
        &self,
        url: &str,
        state: &mut TransferState,
        sidecar: &Path,
        progress: &mut ProgressTracker,
    ) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<SegmentUpdate>();
        let mut tasks = JoinSet::new();
        let url: Arc<str> = Arc::from(url);

        for (index, segment) in state.segments.iter().enumerate() {
            if segment.is_complete() {
                continue;
            }
            tracing::debug!(
                "Segment {} fetching {}..{:?} from offset {}",
                index,
                segment.start,
                segment.end,
                segment.offset
            );
            tasks.spawn(fetch_segment(SegmentJob {
                client: self.client.clone(),
                url: Arc::clone(&url),
                path: state.destination_path.clone(),
                index,
                offset: segment.offset,
                end: segment.end,
                ranged: state.resumable,
                expected_total: state.total_bytes,
                write_buffer_size: self.config.write_buffer_size,
                retry_attempts: self.config.retry_attempts,
                retry_delay: self.config.retry_delay,
                cancel: Arc::clone(&self.cancel_flag),
                updates: tx.clone(),
            }));
        }
        drop(tx);

        let mut pending_delta = 0u64;
        let mut last_progress = Instant::now();
        let mut last_save = Instant::now();
        let mut failure: Option<Error> = None;
        let mut cancel_poll = tokio::time::interval(CANCEL_POLL_INTERVAL);

        loop {
            tokio::select! {
                Some(update) = rx.recv() => {
                    pending_delta += update.apply(state);

                    if last_progress.elapsed() >= self.config.progress_update_interval {
                        progress.update(pending_delta);
                        pending_delta = 0;
                        last_progress = Instant::now();
                    }
                    if state.resumable && failure.is_none()
                        && last_save.elapsed() >= self.config.state_save_interval
                    {
                        if let Err(e) = state.save(sidecar).await {
                            failure = Some(e);
                            tasks.abort_all();
                        }
                        last_save = Instant::now();
                    }
                }
                joined = tasks.join_next() => {
                    match joined {
                        None => break,
                        Some(Ok(Ok(()))) => {}
                        Some(Ok(Err(e))) => {
                            if failure.is_none() {
                                tracing::debug!("Segment failed, stopping all segments: {}", e);
                                failure = Some(e);
                                tasks.abort_all();
                            }
                        }
                        Some(Err(join_err)) if join_err.is_cancelled() => {}
                        Some(Err(join_err)) => {
                            if failure.is_none() {
                                failure = Some(Error::Network(format!("segment task failed: {}", join_err)));
                                tasks.abort_all();
                            }
                        }
                    }
                }
                _ = cancel_poll.tick() => {
                    if failure.is_none() && self.cancel_flag.load(Ordering::SeqCst) {
                        tracing::info!("Download of {} cancelled", url);
                        failure = Some(Error::Cancelled);
                        tasks.abort_all();
                    }
                }
            }
        }

        // every sender is gone; collect what the segments wrote before stopping
        while let Ok(update) = rx.try_recv() {
            pending_delta += update.apply(state);
        }
        progress.update(pending_delta);

        match failure {
            Some(e) => Err(e),
            None if state.is_complete() => Ok(()),
            None => Err(Error::ConnectionInterrupted(format!(
                "transfer ended with {} of {:?} bytes",
                state.received_bytes(),
                state.total_bytes
            ))),
        }
    }

    /// Sync the file, drop the sidecar and report completion
    async fn finalize(
        &self,
        url: &str,
        state: &TransferState,
        sidecar: &Path,
        progress: &mut ProgressTracker,
    ) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .open(&state.destination_path)
            .await
            .map_err(Error::from_download_io)?;
        file.sync_all().await.map_err(Error::from_download_io)?;

        TransferState::remove(sidecar).await?;
        progress.complete();

        tracing::info!(
            "Downloaded {} to {:?} ({} bytes)",
            url,
            state.destination_path,
            state.received_bytes()
        );
        Ok(())
    }
}

// ============================================================================
// Segment tasks
// ============================================================================

/// Written-offset report from a segment task
#[derive(Debug, Clone, Copy)]
struct SegmentUpdate {
    index: usize,
    offset: u64,
    delta: u64,
    eof: bool,
}

impl SegmentUpdate {
    /// Record the new offset; returns the byte delta for progress
    fn apply(&self, state: &mut TransferState) -> u64 {
        let Some(segment) = state.segments.get_mut(self.index) else {
            return 0;
        };
        segment.offset = segment.offset.max(self.offset);
        if self.eof && segment.end.is_none() {
            segment.end = Some(segment.offset);
            state.total_bytes = Some(segment.offset);
        }
        self.delta
    }
}

struct SegmentJob {
    client: Client,
    url: Arc<str>,
    path: PathBuf,
    index: usize,
    offset: u64,
    end: Option<u64>,
    ranged: bool,
    expected_total: Option<u64>,
    write_buffer_size: usize,
    retry_attempts: u32,
    retry_delay: Duration,
    cancel: Arc<AtomicBool>,
    updates: mpsc::UnboundedSender<SegmentUpdate>,
}

/// Fetch one segment, reconnecting from its current offset on connection errors
async fn fetch_segment(job: SegmentJob) -> Result<()> {
    let mut offset = job.offset;
    let mut attempts = 0u32;

    loop {
        let before = offset;
        match fetch_range(&job, &mut offset).await {
            Ok(()) => {
                tracing::debug!("Segment {} finished at byte {}", job.index, offset);
                return Ok(());
            }
            Err(e) if e.is_retryable() && job.ranged && !job.cancel.load(Ordering::SeqCst) => {
                if offset > before {
                    attempts = 0;
                }
                if attempts >= job.retry_attempts {
                    return Err(e);
                }
                attempts += 1;
                tracing::warn!(
                    "Segment {} interrupted ({}), reconnecting from byte {} (attempt {}/{})",
                    job.index,
                    e,
                    offset,
                    attempts,
                    job.retry_attempts
                );
                tokio::time::sleep(job.retry_delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// One request for the bytes from `offset` to the segment end
async fn fetch_range(job: &SegmentJob, offset: &mut u64) -> Result<()> {
    let url = &*job.url;
    let mut request = job.client.get(url);
    if job.ranged {
        request = request.header(RANGE, Segment::new(*offset, job.end).range_header());
    }

    let response = request
        .send()
        .await
        .map_err(|e| classify_reqwest_error(&e, url))?;
    let status = response.status();

    if job.ranged {
        if status == StatusCode::OK {
            return Err(Error::RemoteChanged(format!("{} no longer honours range requests", url)));
        }
        if status != StatusCode::PARTIAL_CONTENT {
            return Err(status_error(status, url));
        }
        let total = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total);
        if let (Some(total), Some(expected)) = (total, job.expected_total) {
            if total != expected {
                return Err(Error::RemoteChanged(format!(
                    "{} now reports {} bytes instead of {}",
                    url, total, expected
                )));
            }
        }
    } else if !status.is_success() {
        return Err(status_error(status, url));
    }

    let mut file = OpenOptions::new()
        .write(true)
        .open(&job.path)
        .await
        .map_err(Error::from_download_io)?;
    file.seek(SeekFrom::Start(*offset))
        .await
        .map_err(Error::from_download_io)?;

    let mut buffer = Vec::with_capacity(job.write_buffer_size);
    let mut stream = response.bytes_stream();

    loop {
        if job.cancel.load(Ordering::SeqCst) {
            flush_segment(job, &mut file, &mut buffer, offset, false).await?;
            return Err(Error::Cancelled);
        }

        let chunk = match stream.next().await {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                flush_segment(job, &mut file, &mut buffer, offset, false).await?;
                return Err(classify_reqwest_error(&e, url));
            }
            None => break,
        };

        let mut data = &chunk[..];
        if let Some(end) = job.end {
            let room = end.saturating_sub(*offset + buffer.len() as u64);
            data = &data[..data.len().min(usize::try_from(room).unwrap_or(usize::MAX))];
        }
        buffer.extend_from_slice(data);

        if buffer.len() >= job.write_buffer_size {
            flush_segment(job, &mut file, &mut buffer, offset, false).await?;
        }
        if job.end.is_some_and(|end| *offset + buffer.len() as u64 >= end) {
            break;
        }
    }

    match job.end {
        Some(end) => {
            flush_segment(job, &mut file, &mut buffer, offset, false).await?;
            if *offset < end {
                return Err(Error::ConnectionInterrupted(format!(
                    "connection closed at byte {} of segment ending at {}",
                    offset, end
                )));
            }
        }
        None => flush_segment(job, &mut file, &mut buffer, offset, true).await?,
    }
    Ok(())
}

/// Write the buffered bytes at `offset` and report the new offset
async fn flush_segment(
    job: &SegmentJob,
    file: &mut tokio::fs::File,
    buffer: &mut Vec<u8>,
    offset: &mut u64,
    eof: bool,
) -> Result<()> {
    if !buffer.is_empty() {
        file.write_all(buffer).await.map_err(Error::from_download_io)?;
        file.flush().await.map_err(Error::from_download_io)?;
    }

    let delta = buffer.len() as u64;
    *offset += delta;
    buffer.clear();

    if delta > 0 || eof {
        // the coordinator may already be gone after a sibling failure
        let _ = job.updates.send(SegmentUpdate {
            index: job.index,
            offset: *offset,
            delta,
            eof,
        });
    }
    Ok(())
}

// ============================================================================
// Error classification
// ============================================================================

fn status_error(status: StatusCode, url: &str) -> Error {
    Error::HttpStatus {
        status: status.as_u16(),
        url: url.to_string(),
    }
}

/// Map a transport error to the retryable or fatal class
///
/// Timeouts, connect/DNS failures and connections dropped mid-body are all
/// [`Error::ConnectionInterrupted`].
pub(crate) fn classify_reqwest_error(err: &reqwest::Error, url: &str) -> Error {
    if let Some(status) = err.status() {
        return status_error(status, url);
    }
    if err.is_timeout() || err.is_connect() || err.is_body() || is_connection_error(err) {
        return Error::ConnectionInterrupted(format!("{}: {}", url, describe(err)));
    }
    Error::Network(format!("{}: {}", url, describe(err)))
}

/// Whether any I/O error in the source chain is a connection-class failure
fn is_connection_error(err: &(dyn std::error::Error + 'static)) -> bool {
    use std::io::ErrorKind;

    let mut source = Some(err);
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::ConnectionRefused
                    | ErrorKind::NotConnected
                    | ErrorKind::BrokenPipe
                    | ErrorKind::TimedOut
                    | ErrorKind::UnexpectedEof
            ) {
                return true;
            }
        }
        source = e.source();
    }
    false
}

/// Error message including the innermost cause
fn describe(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(e) = source {
        if e.source().is_none() {
            message = format!("{} ({})", message, e);
        }
        source = e.source();
    }
    message
}

/// Total length from a `Content-Range: bytes a-b/total` header
fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse().ok()
}

//! Image acquisition: verify a local image or download and verify a remote one
//!
//! [`Acquirer::ensure_local_image`] is the entry point. It resolves the
//! descriptor to a candidate path, verifies it, downloads the image when the
//! source is a URL and the candidate is missing, partial or invalid, then
//! verifies again. Files are only deleted if this module created them.
//!
//! ## Example
//!
//! ```no_run
//! use imgfetch_core::{Acquirer, AcquireConfig, ImageDescriptor};
//!
//! # async fn run() -> imgfetch_core::Result<()> {
//! let descriptor = ImageDescriptor::new("https://example.com/image.img")
//!     .checksum("d41d8cd98f00b204e9800998ecf8427e")
//!     .download_location("/tmp/images");
//!
//! let acquirer = Acquirer::with_config(AcquireConfig::new().connections(8));
//! let path = acquirer
//!     .ensure_local_image(&descriptor, |event| {
//!         println!("{} {:.1}%", event.phase, event.percentage);
//!     })
//!     .await?;
//! println!("Image ready at {}", path.display());
//! # Ok(())
//! # }
//! ```

use crate::config::AcquireConfig;
use crate::downloader::Downloader;
use crate::error::{Error, Result};
use crate::image::{ImageDescriptor, ImageSource};
use crate::progress::{Phase, ProgressEvent, ProgressTracker};
use crate::transfer::TransferState;
use crate::verifier::{ChecksumAlgorithm, Verifier};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type EventCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// Outcome of checking a candidate path
#[derive(Debug, Clone, PartialEq, Eq)]
enum Candidate {
    Valid,
    Missing,
    Partial,
    Mismatch { expected: String, actual: String },
}

/// Acquisition orchestrator
pub struct Acquirer {
    config: AcquireConfig,
    cancel_flag: Arc<AtomicBool>,
}

impl Acquirer {
    /// Create an acquirer with default configuration
    pub fn new() -> Self {
        Self::with_config(AcquireConfig::default())
    }

    /// Create an acquirer with custom configuration
    pub fn with_config(config: AcquireConfig) -> Self {
        Self {
            config,
            cancel_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share an existing cancel flag
    pub fn with_cancel_handle(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel_flag = flag;
        self
    }

    /// Get a handle to cancel the acquisition (download and checksum phases)
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel_flag)
    }

    /// Get the configuration
    pub fn config(&self) -> &AcquireConfig {
        &self.config
    }

    /// Return a verified local path for `descriptor`
    ///
    /// Local sources are only verified. Network sources are verified at
    /// `<download_location>/<host>-<basename>`, downloaded (or resumed) if that
    /// fails, then verified once more. Progress is reported per phase.
    pub async fn ensure_local_image<F>(
        &self,
        descriptor: &ImageDescriptor,
        on_progress: F,
    ) -> Result<PathBuf>
    where
        F: Fn(ProgressEvent) + Send + Sync + 'static,
    {
        let on_progress: EventCallback = Arc::new(on_progress);

        // reject unknown algorithms and malformed checksums before touching the filesystem
        let algorithm = descriptor.algorithm()?;
        let expected = descriptor.expected_checksum();
        if let Some(expected) = expected {
            algorithm.validate_hex(expected)?;
        }
        let source = descriptor.source()?;
        let path = source.candidate_path(descriptor.download_location.as_deref())?;

        let url = match source {
            ImageSource::Local(_) => {
                return match self.check_candidate(&path, expected, algorithm, &on_progress).await? {
                    Candidate::Valid => Ok(path),
                    Candidate::Missing => {
                        tracing::warn!("Local image {:?} does not exist", path);
                        Err(Error::ChecksumError)
                    }
                    Candidate::Partial | Candidate::Mismatch { .. } => {
                        tracing::warn!("Local image {:?} failed verification", path);
                        Err(Error::ChecksumError)
                    }
                };
            }
            ImageSource::Remote(url) => url,
        };

        match self.check_candidate(&path, expected, algorithm, &on_progress).await? {
            Candidate::Valid => {
                tracing::info!("Using existing download {:?}", path);
                return Ok(path);
            }
            Candidate::Missing => tracing::debug!("No local copy of {} yet", url),
            Candidate::Partial => tracing::debug!("Found partial download {:?}", path),
            Candidate::Mismatch { expected, actual } => tracing::info!(
                "Existing {:?} does not match checksum (expected {}, got {}), downloading again",
                path,
                expected,
                actual
            ),
        }

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let downloader = Downloader::with_config(self.config.clone())?
            .with_cancel_handle(self.cancel_handle());
        let mut progress = self.tracker(Phase::Download, &on_progress);
        downloader.download(url.as_str(), &path, &mut progress).await?;

        match self.check_candidate(&path, expected, algorithm, &on_progress).await {
            Ok(Candidate::Valid) => Ok(path),
            Ok(outcome) => {
                tracing::warn!("Downloaded image {:?} failed verification: {:?}", path, outcome);
                Downloader::discard(&path).await?;
                Err(Error::ChecksumError)
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                Downloader::discard(&path).await?;
                Err(e)
            }
        }
    }

    /// Existence, partial-transfer and checksum check of `path`
    async fn check_candidate(
        &self,
        path: &Path,
        expected: Option<&str>,
        algorithm: ChecksumAlgorithm,
        on_progress: &EventCallback,
    ) -> Result<Candidate> {
        if self.cancel_flag.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }

        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Err(Error::SourceNotFound(format!("{} is not a file", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Candidate::Missing),
            Err(e) => return Err(Error::Io(e)),
        }

        if tokio::fs::try_exists(TransferState::sidecar_path(path)).await? {
            return Ok(Candidate::Partial);
        }

        let Some(expected) = expected else {
            return Ok(Candidate::Valid);
        };

        let verifier = Verifier::new()
            .block_size(self.config.read_block_size)
            .with_cancel_handle(self.cancel_handle());
        let mut progress = self.tracker(Phase::Checksum, on_progress);

        match verifier.verify(path, expected, algorithm, &mut progress).await {
            Ok(()) => Ok(Candidate::Valid),
            Err(Error::ChecksumMismatch { expected, actual }) => {
                Ok(Candidate::Mismatch { expected, actual })
            }
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(Candidate::Missing),
            Err(e) => Err(e),
        }
    }

    /// A fresh tracker for one phase, forwarding to the caller's callback
    fn tracker(&self, phase: Phase, on_progress: &EventCallback) -> ProgressTracker {
        let callback = Arc::clone(on_progress);
        ProgressTracker::with_config(&self.config.progress, move |report| {
            callback(ProgressEvent::new(phase, report));
        })
    }
}

impl Default for Acquirer {
    fn default() -> Self {
        Self::new()
    }
}

/// Acquire `descriptor` with `config`
pub async fn ensure_local_image<F>(
    descriptor: &ImageDescriptor,
    config: AcquireConfig,
    on_progress: F,
) -> Result<PathBuf>
where
    F: Fn(ProgressEvent) + Send + Sync + 'static,
{
    Acquirer::with_config(config)
        .ensure_local_image(descriptor, on_progress)
        .await
}

//! # Imgfetch Core
//!
//! Core library for acquiring disk images ahead of flashing: a verified local
//! file, or a resumable multi-connection download checked against a known
//! checksum.
//!
//! ## Modules
//!
//! - `acquire`: Top-level orchestration (`ensure_local_image`)
//! - `downloader`: Resumable multi-connection HTTP downloads
//! - `transfer`: Persisted transfer state for resuming downloads
//! - `verifier`: Streaming checksum calculation and verification
//! - `progress`: Progress tracking with smoothed speed and ETA
//! - `image`: Image descriptors and local file naming
//! - `error`: Error types, error codes and result aliases
//! - `config`: Runtime configuration
//! - `settings`: Persistent user settings from configuration file
//!
//! ## Example
//!
//! ```no_run
//! use imgfetch_core::{Acquirer, AcquireConfig, ImageDescriptor};
//!
//! # async fn run() -> imgfetch_core::Result<()> {
//! let descriptor = ImageDescriptor::new("https://example.com/releases/os.img")
//!     .checksum("9e107d9d372bb6826bd81d3542a419d6")
//!     .download_location("/tmp/images");
//!
//! let acquirer = Acquirer::with_config(AcquireConfig::new().connections(4));
//! let path = acquirer
//!     .ensure_local_image(&descriptor, |event| {
//!         println!("{}: {:.1}% eta={}s", event.phase, event.percentage, event.eta);
//!     })
//!     .await?;
//! println!("Ready: {}", path.display());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod acquire;
pub mod config;
pub mod downloader;
pub mod error;
pub mod image;
pub mod progress;
pub mod settings;
pub mod transfer;
pub mod verifier;

pub use acquire::{ensure_local_image, Acquirer};
pub use config::{
    AcquireConfig, ProgressConfig, DEFAULT_CONNECTIONS, DEFAULT_READ_BLOCK_SIZE,
    DEFAULT_SMOOTHING_FACTOR, DEFAULT_TIMEOUT, DEFAULT_WRITE_BUFFER_SIZE, MAX_CONNECTIONS,
};
pub use downloader::{Downloader, RemoteInfo};
pub use error::{Error, ErrorCode, Result};
pub use image::{
    image_name_from_url, is_network_resource, sanitize_filename, ImageDescriptor, ImageSource,
};
pub use progress::{
    Phase, ProgressCallback, ProgressEvent, ProgressReport, ProgressState, ProgressTracker,
};
pub use settings::{
    parse_size, ChecksumSettings, DownloadSettings, ProgressSettings, Settings, SettingsError,
};
pub use transfer::{Segment, TransferState, TRANSFER_STATE_EXTENSION, TRANSFER_STATE_VERSION};
pub use verifier::{calculate, checksum_bytes, verify, Checksum, ChecksumAlgorithm, Hasher, Verifier};

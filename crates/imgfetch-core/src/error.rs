//! Error types for the imgfetch core library

use thiserror::Error;

/// Main error type for image acquisition
#[derive(Error, Debug)]
pub enum Error {
    /// A network source was given without a directory to download into
    #[error("Download location is not specified for network image")]
    MissingDownloadLocation,

    /// URL scheme other than http/https
    #[error("Unsupported network protocol: {0}")]
    UnsupportedProtocol(String),

    /// The URL could not be parsed
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl {
        /// The offending URL
        url: String,
        /// Why parsing failed
        reason: String,
    },

    /// No usable file name could be derived from the URL
    #[error("No valid file name in URL: {0}")]
    InvalidFileName(String),

    /// Local image not found
    #[error("Source not found: {0}")]
    SourceNotFound(String),

    /// Timeout, DNS failure or connection reset; resumable later
    #[error("Connection interrupted: {0}")]
    ConnectionInterrupted(String),

    /// Remote server answered with a non-success status
    #[error("HTTP error {status} for {url}")]
    HttpStatus {
        /// Status code returned by the server
        status: u16,
        /// Requested URL
        url: String,
    },

    /// Non-retryable transport failure
    #[error("Network error: {0}")]
    Network(String),

    /// Remote resource no longer matches the persisted transfer state
    #[error("Remote resource changed: {0}")]
    RemoteChanged(String),

    /// Destination disk full
    #[error("No space left on destination device")]
    NoSpace,

    /// Disk full while storing a download
    #[error("No space left on device while downloading")]
    DownloadNoSpace,

    /// Computed digest differs from the expected one
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Expected checksum
        expected: String,
        /// Actual checksum
        actual: String,
    },

    /// Image failed verification and could not be repaired by downloading
    #[error("Image checksum verification failed")]
    ChecksumError,

    /// Transfer-state sidecar is unreadable or inconsistent
    #[error("Invalid transfer state: {0}")]
    TransferState(String),

    /// Operation invoked in the wrong order (programming error)
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// IO error during read/write operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type alias using the imgfetch error type
pub type Result<T> = std::result::Result<T, Error>;

/// Error codes surfaced to the writer/CLI layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Post-write validation failed
    Validation,
    /// Destination disk full during write
    NoSpace,
    /// Disk full during download
    DownloadNoSpace,
    /// Connection lost; the transfer can be resumed
    ConnectionInterrupted,
    /// Image checksum verification failed
    Checksum,
    /// Unmounting the target failed
    Unmount,
}

impl ErrorCode {
    /// The literal code string (`ECHECKSUM`, ...)
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Validation => "EVALIDATION",
            ErrorCode::NoSpace => "ENOSPC",
            ErrorCode::DownloadNoSpace => "EDOWNLOADNOSPC",
            ErrorCode::ConnectionInterrupted => "ECONNINTERRUPT",
            ErrorCode::Checksum => "ECHECKSUM",
            ErrorCode::Unmount => "EUNMOUNT",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Classified code for collaborators, if this error has one
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Error::NoSpace => Some(ErrorCode::NoSpace),
            Error::DownloadNoSpace => Some(ErrorCode::DownloadNoSpace),
            Error::ConnectionInterrupted(_) => Some(ErrorCode::ConnectionInterrupted),
            Error::ChecksumMismatch { .. } | Error::ChecksumError => Some(ErrorCode::Checksum),
            _ => None,
        }
    }

    /// Whether re-invoking the acquisition later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ConnectionInterrupted(_))
    }

    /// Classify an I/O error raised while storing downloaded bytes
    pub(crate) fn from_download_io(err: std::io::Error) -> Self {
        if is_no_space(&err) {
            Error::DownloadNoSpace
        } else {
            Error::Io(err)
        }
    }
}

/// Whether an I/O error means the device is full
pub(crate) fn is_no_space(err: &std::io::Error) -> bool {
    if err.kind() == std::io::ErrorKind::StorageFull {
        return true;
    }
    // ENOSPC on unix, ERROR_HANDLE_DISK_FULL / ERROR_DISK_FULL on windows
    match err.raw_os_error() {
        #[cfg(unix)]
        Some(28) => true,
        #[cfg(windows)]
        Some(39) | Some(112) => true,
        _ => false,
    }
}

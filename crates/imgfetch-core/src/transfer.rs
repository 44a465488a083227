//! Persisted transfer state for resumable downloads
//!
//! A [`TransferState`] records which byte ranges of a download have been
//! received. It is stored as JSON in a sidecar file next to the destination
//! (`<destination>.transfer`) so an interrupted download can resume after a
//! process restart.
//!
//! # Example
//!
//! ```ignore
//! use imgfetch_core::transfer::TransferState;
//!
//! let state = TransferState::new(url, &dest, Some(total), None, true, 4);
//! let sidecar = TransferState::sidecar_path(&dest);
//! state.save(&sidecar).await?;
//!
//! // After a restart:
//! if let Some(state) = TransferState::load(&sidecar).await? {
//!     println!("{} bytes already received", state.received_bytes());
//! }
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Current version of the sidecar format
pub const TRANSFER_STATE_VERSION: u32 = 1;

/// Sidecar file extension, appended to the destination file name
pub const TRANSFER_STATE_EXTENSION: &str = "transfer";

/// Segments are never split below this size (64 KB)
pub const MIN_SEGMENT_SIZE: u64 = 64 * 1024;

// ============================================================================
// Segment
// ============================================================================

/// One byte range of a download, fetched over its own connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// First byte of the range
    pub start: u64,
    /// Next byte to fetch; `start..offset` is on disk
    pub offset: u64,
    /// Exclusive end, `None` for an open-ended stream of unknown length
    pub end: Option<u64>,
}

impl Segment {
    /// Create an empty segment covering `start..end`
    pub fn new(start: u64, end: Option<u64>) -> Self {
        Self {
            start,
            offset: start,
            end,
        }
    }

    /// Bytes already written for this segment
    pub fn received(&self) -> u64 {
        self.offset.saturating_sub(self.start)
    }

    /// Bytes still missing, if the end is known
    pub fn remaining(&self) -> Option<u64> {
        self.end.map(|end| end.saturating_sub(self.offset))
    }

    /// Whether every byte of the range is on disk
    pub fn is_complete(&self) -> bool {
        self.end.is_some_and(|end| self.offset >= end)
    }

    /// `Range` header value requesting the missing bytes
    pub fn range_header(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.offset, end.saturating_sub(1)),
            None => format!("bytes={}-", self.offset),
        }
    }
}

// ============================================================================
// Transfer State
// ============================================================================

/// Persisted record of an in-progress download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferState {
    /// Sidecar format version
    pub version: u32,

    /// Remote resource being fetched
    pub source_url: String,

    /// Final file path (not the sidecar)
    pub destination_path: PathBuf,

    /// Declared size, if the server reported one
    pub total_bytes: Option<u64>,

    /// Entity tag reported by the server, used to detect upstream changes
    #[serde(default)]
    pub etag: Option<String>,

    /// Whether the server honours byte-range requests
    pub resumable: bool,

    /// Per-connection ranges, ordered by start offset
    pub segments: Vec<Segment>,
}

impl TransferState {
    /// Create a fresh state, splitting a known size into up to `connections` segments
    ///
    /// Non-resumable or unknown-size transfers get a single segment.
    pub fn new(
        source_url: impl Into<String>,
        destination_path: &Path,
        total_bytes: Option<u64>,
        etag: Option<String>,
        resumable: bool,
        connections: usize,
    ) -> Self {
        let segments = match total_bytes {
            Some(total) if resumable => split_segments(total, connections),
            Some(total) => vec![Segment::new(0, Some(total))],
            None => vec![Segment::new(0, None)],
        };

        Self {
            version: TRANSFER_STATE_VERSION,
            source_url: source_url.into(),
            destination_path: destination_path.to_path_buf(),
            total_bytes,
            etag,
            resumable,
            segments,
        }
    }

    /// Sidecar location for a destination file
    pub fn sidecar_path(destination: &Path) -> PathBuf {
        let mut name = destination.as_os_str().to_os_string();
        name.push(".");
        name.push(TRANSFER_STATE_EXTENSION);
        PathBuf::from(name)
    }

    /// Bytes already on disk, summed over all segments
    pub fn received_bytes(&self) -> u64 {
        self.segments.iter().map(Segment::received).sum()
    }

    /// Whether every segment has reached its end
    pub fn is_complete(&self) -> bool {
        self.segments.iter().all(Segment::is_complete)
    }

    /// Percentage of the declared size received
    pub fn percentage(&self) -> Option<f64> {
        match self.total_bytes {
            Some(0) => Some(100.0),
            Some(total) => Some(self.received_bytes() as f64 / total as f64 * 100.0),
            None => None,
        }
    }

    /// Check the structural invariants of a loaded state
    ///
    /// Segments must be ordered, non-overlapping, and cover `[0, total)`
    /// without gaps; every offset must lie within its segment.
    pub fn validate(&self) -> Result<()> {
        if self.version > TRANSFER_STATE_VERSION {
            return Err(Error::TransferState(format!(
                "version {} is newer than supported version {}",
                self.version, TRANSFER_STATE_VERSION
            )));
        }
        if self.segments.is_empty() {
            return Err(Error::TransferState("no segments".to_string()));
        }

        let mut expected_start = 0u64;
        for (index, segment) in self.segments.iter().enumerate() {
            if segment.start != expected_start {
                return Err(Error::TransferState(format!(
                    "segment {} starts at {}, expected {}",
                    index, segment.start, expected_start
                )));
            }
            if segment.offset < segment.start {
                return Err(Error::TransferState(format!(
                    "segment {} offset precedes its start",
                    index
                )));
            }
            match segment.end {
                Some(end) => {
                    if end < segment.start || segment.offset > end {
                        return Err(Error::TransferState(format!(
                            "segment {} has invalid range {}..{} at offset {}",
                            index, segment.start, end, segment.offset
                        )));
                    }
                    expected_start = end;
                }
                None if index + 1 == self.segments.len() && self.total_bytes.is_none() => {}
                None => {
                    return Err(Error::TransferState(format!(
                        "segment {} is open-ended",
                        index
                    )));
                }
            }
        }

        if let Some(total) = self.total_bytes {
            if expected_start != total {
                return Err(Error::TransferState(format!(
                    "segments cover {} bytes, expected {}",
                    expected_start, total
                )));
            }
        }
        Ok(())
    }

    /// Persist to `path` via a temp file and rename
    pub async fn save(&self, path: &Path) -> Result<()> {
        let temp_path = path.with_extension(format!("{}.tmp", TRANSFER_STATE_EXTENSION));
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::TransferState(format!("failed to serialize: {}", e)))?;

        tokio::fs::write(&temp_path, json)
            .await
            .map_err(Error::from_download_io)?;
        tokio::fs::rename(&temp_path, path)
            .await
            .map_err(Error::from_download_io)?;

        tracing::trace!("Saved transfer state to {:?}", path);
        Ok(())
    }

    /// Load and validate a sidecar; `Ok(None)` if it does not exist
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        };

        let state: TransferState = serde_json::from_slice(&bytes)
            .map_err(|e| Error::TransferState(format!("failed to parse {:?}: {}", path, e)))?;
        state.validate()?;

        tracing::debug!(
            "Loaded transfer state from {:?} ({} bytes received)",
            path,
            state.received_bytes()
        );
        Ok(Some(state))
    }

    /// Delete a sidecar; a missing file is not an error
    pub async fn remove(path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                tracing::debug!("Removed transfer state {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

/// Split `total` bytes into contiguous segments, at most `connections` of them
pub fn split_segments(total: u64, connections: usize) -> Vec<Segment> {
    if total == 0 {
        return vec![Segment::new(0, Some(0))];
    }

    let by_size = (total / MIN_SEGMENT_SIZE).max(1);
    let count = (connections.max(1) as u64).min(by_size);
    let chunk = total / count;

    (0..count)
        .map(|i| {
            let start = i * chunk;
            let end = if i + 1 == count { total } else { start + chunk };
            Segment::new(start, Some(end))
        })
        .collect()
}

//! Streaming checksum verification
//!
//! This module provides:
//! - Checksum algorithms (MD5, SHA-256, SHA-512, CRC32)
//! - Async streaming of a file through a hasher with progress reporting
//! - Case-insensitive comparison against an expected hex digest
//!
//! ## Example
//!
//! ```no_run
//! use imgfetch_core::progress::ProgressTracker;
//! use imgfetch_core::verifier::{verify, ChecksumAlgorithm};
//!
//! # async fn run() -> imgfetch_core::Result<()> {
//! let mut progress = ProgressTracker::new(|r| println!("{:.1}%", r.percentage));
//! verify(
//!     "image.img".as_ref(),
//!     "d41d8cd98f00b204e9800998ecf8427e",
//!     ChecksumAlgorithm::Md5,
//!     &mut progress,
//! )
//! .await?;
//! # Ok(())
//! # }
//! ```

use crate::config::DEFAULT_READ_BLOCK_SIZE;
use crate::error::{Error, Result};
use crate::progress::ProgressTracker;
use sha2::Digest;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;

// ============================================================================
// Checksum Algorithm
// ============================================================================

/// Supported checksum algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChecksumAlgorithm {
    /// MD5 (default for image descriptors)
    #[default]
    Md5,
    /// SHA-256
    Sha256,
    /// SHA-512
    Sha512,
    /// CRC32 (fast, not cryptographic)
    Crc32,
}

impl ChecksumAlgorithm {
    /// Digest length in bytes
    pub fn byte_length(&self) -> usize {
        match self {
            ChecksumAlgorithm::Md5 => 16,
            ChecksumAlgorithm::Sha256 => 32,
            ChecksumAlgorithm::Sha512 => 64,
            ChecksumAlgorithm::Crc32 => 4,
        }
    }

    /// Digest length in hex characters
    pub fn hex_length(&self) -> usize {
        self.byte_length() * 2
    }

    /// Display name
    pub fn name(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Md5 => "MD5",
            ChecksumAlgorithm::Sha256 => "SHA-256",
            ChecksumAlgorithm::Sha512 => "SHA-512",
            ChecksumAlgorithm::Crc32 => "CRC32",
        }
    }

    /// Check that `hex` could be a digest of this algorithm
    ///
    /// Rejects wrong lengths and non-hex characters with
    /// [`Error::InvalidConfig`], so a checksum that can never match fails
    /// before any file is read or downloaded.
    pub fn validate_hex(&self, hex: &str) -> Result<()> {
        let hex = hex.trim();
        if hex.len() != self.hex_length() {
            return Err(Error::InvalidConfig(format!(
                "{} checksum must be {} hex characters, got {}",
                self.name(),
                self.hex_length(),
                hex.len()
            )));
        }
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidConfig(format!(
                "{} checksum contains non-hex characters: {}",
                self.name(),
                hex
            )));
        }
        Ok(())
    }

    /// All supported algorithms
    pub fn all() -> &'static [ChecksumAlgorithm] {
        &[
            ChecksumAlgorithm::Md5,
            ChecksumAlgorithm::Sha256,
            ChecksumAlgorithm::Sha512,
            ChecksumAlgorithm::Crc32,
        ]
    }
}

impl std::fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ChecksumAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_lowercase();
        match s.as_str() {
            "md5" => Ok(ChecksumAlgorithm::Md5),
            "sha256" | "sha-256" => Ok(ChecksumAlgorithm::Sha256),
            "sha512" | "sha-512" => Ok(ChecksumAlgorithm::Sha512),
            "crc32" | "crc-32" => Ok(ChecksumAlgorithm::Crc32),
            _ => Err(Error::InvalidConfig(format!(
                "Unknown checksum algorithm: {}",
                s
            ))),
        }
    }
}

// ============================================================================
// Checksum Result
// ============================================================================

/// A computed digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    /// The algorithm used
    pub algorithm: ChecksumAlgorithm,
    /// The digest bytes
    pub bytes: Vec<u8>,
}

impl Checksum {
    /// Create a checksum from raw digest bytes
    pub fn new(algorithm: ChecksumAlgorithm, bytes: Vec<u8>) -> Self {
        Self { algorithm, bytes }
    }

    /// Lowercase hex form
    pub fn to_hex(&self) -> String {
        self.bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Compare against a hex string, ignoring case and surrounding whitespace
    pub fn matches_hex(&self, hex: &str) -> bool {
        self.to_hex() == hex.trim().to_lowercase()
    }
}

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

// ============================================================================
// Hasher
// ============================================================================

/// Incremental hasher over any supported algorithm
pub enum Hasher {
    /// MD5 state
    Md5(md5::Md5),
    /// SHA-256 state
    Sha256(sha2::Sha256),
    /// SHA-512 state
    Sha512(sha2::Sha512),
    /// CRC32 state
    Crc32(crc32fast::Hasher),
}

impl Hasher {
    /// Fresh hasher for `algorithm`
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Md5 => Hasher::Md5(md5::Md5::new()),
            ChecksumAlgorithm::Sha256 => Hasher::Sha256(sha2::Sha256::new()),
            ChecksumAlgorithm::Sha512 => Hasher::Sha512(sha2::Sha512::new()),
            ChecksumAlgorithm::Crc32 => Hasher::Crc32(crc32fast::Hasher::new()),
        }
    }

    /// Feed a chunk
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
            Hasher::Crc32(h) => h.update(data),
        }
    }

    /// Consume the hasher and produce the digest
    pub fn finalize(self) -> Checksum {
        match self {
            Hasher::Md5(h) => Checksum::new(ChecksumAlgorithm::Md5, h.finalize().to_vec()),
            Hasher::Sha256(h) => Checksum::new(ChecksumAlgorithm::Sha256, h.finalize().to_vec()),
            Hasher::Sha512(h) => Checksum::new(ChecksumAlgorithm::Sha512, h.finalize().to_vec()),
            Hasher::Crc32(h) => {
                Checksum::new(ChecksumAlgorithm::Crc32, h.finalize().to_be_bytes().to_vec())
            }
        }
    }
}

/// Digest an in-memory buffer
pub fn checksum_bytes(data: &[u8], algorithm: ChecksumAlgorithm) -> Checksum {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    hasher.finalize()
}

// ============================================================================
// Verifier
// ============================================================================

/// Streams files through a hasher, reporting to a [`ProgressTracker`]
#[derive(Debug, Clone)]
pub struct Verifier {
    block_size: usize,
    cancel_flag: Arc<AtomicBool>,
}

impl Verifier {
    /// Verifier with the default block size
    pub fn new() -> Self {
        Self {
            block_size: DEFAULT_READ_BLOCK_SIZE,
            cancel_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set the read block size
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size.max(1);
        self
    }

    /// Share an existing cancel flag
    pub fn with_cancel_handle(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel_flag = flag;
        self
    }

    /// Get a handle to cancel the operation
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel_flag)
    }

    /// Compute the digest of `path`, completing `progress` on success
    pub async fn calculate(
        &self,
        path: &Path,
        algorithm: ChecksumAlgorithm,
        progress: &mut ProgressTracker,
    ) -> Result<Checksum> {
        let checksum = self.digest(path, algorithm, progress).await?;
        progress.complete();
        Ok(checksum)
    }

    /// Compute the digest of `path` and compare it to `expected`
    ///
    /// A mismatch yields [`Error::ChecksumMismatch`] and aborts `progress`;
    /// a match completes it.
    pub async fn verify(
        &self,
        path: &Path,
        expected: &str,
        algorithm: ChecksumAlgorithm,
        progress: &mut ProgressTracker,
    ) -> Result<()> {
        let actual = self.digest(path, algorithm, progress).await?;

        if actual.matches_hex(expected) {
            tracing::info!("{} checksum verified for {}", algorithm, path.display());
            progress.complete();
            Ok(())
        } else {
            progress.abort();
            tracing::info!(
                "{} checksum mismatch for {}: expected {}, got {}",
                algorithm,
                path.display(),
                expected,
                actual
            );
            Err(Error::ChecksumMismatch {
                expected: expected.trim().to_lowercase(),
                actual: actual.to_hex(),
            })
        }
    }

    /// Stream the file; aborts `progress` on every error path
    async fn digest(
        &self,
        path: &Path,
        algorithm: ChecksumAlgorithm,
        progress: &mut ProgressTracker,
    ) -> Result<Checksum> {
        let result = self.stream(path, algorithm, progress).await;
        if result.is_err() {
            progress.abort();
        }
        result
    }

    async fn stream(
        &self,
        path: &Path,
        algorithm: ChecksumAlgorithm,
        progress: &mut ProgressTracker,
    ) -> Result<Checksum> {
        let mut file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();

        if !progress.is_started() {
            progress.set_total_size(size)?;
        }
        progress.start();

        let mut hasher = Hasher::new(algorithm);
        let mut buffer = vec![0u8; self.block_size];

        loop {
            if self.cancel_flag.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }

            let n = match file.read(&mut buffer).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            };

            hasher.update(&buffer[..n]);
            progress.update(n as u64);
        }

        Ok(hasher.finalize())
    }
}

impl Default for Verifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Verify `path` against `expected` with a default [`Verifier`]
pub async fn verify(
    path: &Path,
    expected: &str,
    algorithm: ChecksumAlgorithm,
    progress: &mut ProgressTracker,
) -> Result<()> {
    Verifier::new()
        .verify(path, expected, algorithm, progress)
        .await
}

/// Compute the digest of `path` with a default [`Verifier`]
pub async fn calculate(
    path: &Path,
    algorithm: ChecksumAlgorithm,
    progress: &mut ProgressTracker,
) -> Result<Checksum> {
    Verifier::new().calculate(path, algorithm, progress).await
}

// ============================================================================
// Unit Tests
// ============================================================================

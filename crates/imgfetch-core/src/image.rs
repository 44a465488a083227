//! Image descriptors and deterministic local naming

use crate::error::{Error, Result};
use crate::verifier::ChecksumAlgorithm;
use std::path::{Path, PathBuf};
use url::Url;

/// Characters that cannot appear in a file name on common filesystems
const INVALID_FILENAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// What the caller wants acquired
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDescriptor {
    /// Local path or http(s) URL
    pub path_or_url: String,

    /// Expected hex digest; `None` or empty means existence suffices
    pub checksum: Option<String>,

    /// Algorithm name for `checksum`
    pub checksum_algorithm: String,

    /// Directory receiving downloads of network images
    pub download_location: Option<PathBuf>,
}

impl ImageDescriptor {
    /// Describe an image by path or URL, with MD5 as the checksum algorithm
    pub fn new(path_or_url: impl Into<String>) -> Self {
        Self {
            path_or_url: path_or_url.into(),
            checksum: None,
            checksum_algorithm: "md5".to_string(),
            download_location: None,
        }
    }

    /// Set the expected checksum
    pub fn checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    /// Set the checksum algorithm name
    pub fn checksum_algorithm(mut self, algorithm: impl Into<String>) -> Self {
        self.checksum_algorithm = algorithm.into();
        self
    }

    /// Set the download directory
    pub fn download_location(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_location = Some(dir.into());
        self
    }

    /// Expected checksum, if a non-blank one was given
    pub fn expected_checksum(&self) -> Option<&str> {
        self.checksum
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }

    /// Parsed checksum algorithm
    pub fn algorithm(&self) -> Result<ChecksumAlgorithm> {
        self.checksum_algorithm.parse()
    }

    /// Whether the image has to come from the network
    pub fn is_network_resource(&self) -> bool {
        is_network_resource(&self.path_or_url)
    }

    /// Resolve the descriptor into a local path or a validated http(s) URL
    pub fn source(&self) -> Result<ImageSource> {
        if !self.is_network_resource() {
            return Ok(ImageSource::Local(PathBuf::from(&self.path_or_url)));
        }

        let url = Url::parse(self.path_or_url.trim()).map_err(|e| Error::InvalidUrl {
            url: self.path_or_url.clone(),
            reason: e.to_string(),
        })?;
        match url.scheme() {
            "http" | "https" => Ok(ImageSource::Remote(url)),
            other => Err(Error::UnsupportedProtocol(other.to_string())),
        }
    }
}

/// Where an image lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// Already on the local filesystem
    Local(PathBuf),
    /// Must be downloaded
    Remote(Url),
}

impl ImageSource {
    /// Path an image will be verified at, given a download directory
    pub fn candidate_path(&self, download_location: Option<&Path>) -> Result<PathBuf> {
        match self {
            ImageSource::Local(path) => Ok(path.clone()),
            ImageSource::Remote(url) => {
                let dir = download_location.ok_or(Error::MissingDownloadLocation)?;
                Ok(dir.join(image_name_from_url(url)?))
            }
        }
    }
}

/// Whether a source string names a network resource (has a URL scheme)
pub fn is_network_resource(source: &str) -> bool {
    source
        .trim()
        .split_once("://")
        .is_some_and(|(scheme, _)| {
            !scheme.is_empty()
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        })
}

/// `<host>-<basename>` for a URL, sanitized for the filesystem
///
/// The host prefix keeps same-named images from different mirrors apart;
/// an explicit port is part of the host.
pub fn image_name_from_url(url: &Url) -> Result<String> {
    let basename = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .map(|name| name.trim_start_matches('.'))
        .filter(|name| !name.is_empty())
        .ok_or_else(|| Error::InvalidFileName(url.to_string()))?;

    let host = match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_string(),
        (None, _) => return Err(Error::InvalidFileName(url.to_string())),
    };

    Ok(format!("{}-{}", sanitize_filename(&host), sanitize_filename(basename)))
}

/// Percent-escape characters that are invalid in file names
pub fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if INVALID_FILENAME_CHARS.contains(&c) || c.is_control() {
            out.push_str(&format!("%{:02X}", c as u32));
        } else {
            out.push(c);
        }
    }
    out
}

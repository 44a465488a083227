//! Discard command - removes a partial download and its transfer state

use anyhow::{Context, Result};
use console::style;
use imgfetch_core::{Downloader, ImageDescriptor, ImageSource, TransferState};
use std::path::{Path, PathBuf};

use super::println_if;

/// Execute the discard command
pub fn execute(url: &str, download_location: Option<&Path>, quiet: bool) -> Result<()> {
    let path = candidate_path(url, download_location)?;
    let sidecar = TransferState::sidecar_path(&path);

    if !sidecar.exists() {
        // a file without a sidecar is a finished download
        println_if!(
            quiet,
            "{} No partial download for {}",
            style("Note:").yellow(),
            url
        );
        return Ok(());
    }

    let runtime = super::runtime()?;
    runtime
        .block_on(Downloader::discard(&path))
        .with_context(|| format!("Failed to discard {}", path.display()))?;

    println_if!(
        quiet,
        "{} Removed partial download at {}",
        style("✓").green().bold(),
        style(path.display()).cyan()
    );
    Ok(())
}

/// Where a download of `url` is stored under `download_location`
fn candidate_path(url: &str, download_location: Option<&Path>) -> Result<PathBuf> {
    let source = ImageDescriptor::new(url)
        .source()
        .with_context(|| format!("Invalid image URL: {}", url))?;

    if let ImageSource::Local(path) = &source {
        anyhow::bail!("Not a network image: {}", path.display());
    }

    Ok(source.candidate_path(download_location)?)
}

//! Checksum command - calculates the checksum of a local image

use anyhow::{Context, Result};
use console::style;
use imgfetch_core::{ChecksumAlgorithm, Phase, ProgressEvent, ProgressTracker, Settings, Verifier};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use super::println_if;
use crate::progress::{ProgressMode, ProgressReporter};

/// Execute the checksum command
pub fn execute(
    file: &Path,
    algorithm: Option<&str>,
    settings: &Settings,
    cancel_flag: Arc<AtomicBool>,
    quiet: bool,
) -> Result<()> {
    let algorithm = algorithm.unwrap_or(settings.checksum.algorithm.as_str());
    let algo: ChecksumAlgorithm = algorithm
        .parse()
        .with_context(|| format!("Invalid algorithm: {}", algorithm))?;

    let metadata = std::fs::metadata(file)
        .with_context(|| format!("Failed to read file: {}", file.display()))?;
    if !metadata.is_file() {
        anyhow::bail!("Not a regular file: {}", file.display());
    }

    println_if!(
        quiet,
        "{} {}",
        style("File:").bold(),
        style(file.display()).cyan()
    );
    println_if!(
        quiet,
        "\n{} {} checksum...",
        style("Calculating").bold(),
        algo.name()
    );

    let config = settings.to_config();
    let reporter = Arc::new(ProgressReporter::new(ProgressMode::from_flags(false, quiet)));
    let mut progress = {
        let reporter = Arc::clone(&reporter);
        ProgressTracker::with_config(&config.progress, move |report| {
            reporter.handle(ProgressEvent::new(Phase::Checksum, report))
        })
    };

    let verifier = Verifier::new()
        .block_size(config.read_block_size)
        .with_cancel_handle(cancel_flag);

    let runtime = super::runtime()?;
    let result = runtime.block_on(verifier.calculate(file, algo, &mut progress));
    reporter.finish();

    let checksum =
        result.with_context(|| format!("Failed to calculate checksum of {}", file.display()))?;

    if quiet {
        println!("{}", checksum.to_hex());
    } else {
        println!();
        println!("{} ({}):", style(algo.name()).bold(), file.display());
        println!("{}", style(checksum.to_hex()).green());

        // Checksum-file format for convenience
        let filename = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.display().to_string());
        println!();
        println!(
            "{}",
            style("Checksum file format (for verification):").dim()
        );
        println!("{}  {}", checksum.to_hex(), filename);
    }

    Ok(())
}

//! Fetch command - ensures a verified local copy of an image

use anyhow::{Context, Result};
use console::style;
use imgfetch_core::{Acquirer, ImageDescriptor, Settings};
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use super::println_if;
use crate::progress::{ProgressMode, ProgressReporter};

/// Arguments for the fetch command
pub struct FetchArgs {
    /// Local path or URL of the image
    pub image: String,
    /// Directory for downloaded images
    pub download_location: Option<PathBuf>,
    /// Expected checksum (hex)
    pub checksum: Option<String>,
    /// Checksum algorithm name
    pub checksum_type: Option<String>,
    /// Parallel connections for the download
    pub connections: Option<usize>,
    /// Emit progress and result as JSON lines
    pub json: bool,
    /// Suppress everything except the result
    pub quiet: bool,
    /// Set by the Ctrl+C handler
    pub cancel_flag: Arc<AtomicBool>,
    /// Loaded user settings
    pub settings: Settings,
}

/// Build the descriptor from flags, falling back to settings
fn descriptor(args: &FetchArgs) -> ImageDescriptor {
    let algorithm = args
        .checksum_type
        .clone()
        .unwrap_or_else(|| args.settings.checksum.algorithm.clone());

    let mut descriptor = ImageDescriptor::new(args.image.as_str()).checksum_algorithm(algorithm);
    if let Some(checksum) = &args.checksum {
        descriptor = descriptor.checksum(checksum.as_str());
    }
    if let Some(dir) = args
        .download_location
        .clone()
        .or_else(|| args.settings.download.location.clone())
    {
        descriptor = descriptor.download_location(dir);
    }
    descriptor
}

/// Execute the fetch command
pub fn execute(args: FetchArgs) -> Result<()> {
    let json = args.json || args.settings.progress.json;
    let quiet = args.quiet || json;
    let descriptor = descriptor(&args);

    let mut config = args.settings.to_config();
    if let Some(connections) = args.connections {
        config = config.connections(connections);
    }

    println_if!(
        quiet,
        "{} {}",
        style("Image:").bold(),
        style(&args.image).cyan()
    );
    if let Some(checksum) = descriptor.expected_checksum() {
        println_if!(
            quiet,
            "  {} {} {}",
            style("Checksum:").dim(),
            descriptor.checksum_algorithm,
            checksum
        );
    }

    let acquirer = Acquirer::with_config(config).with_cancel_handle(args.cancel_flag);
    let reporter = Arc::new(ProgressReporter::new(ProgressMode::from_flags(
        json, args.quiet,
    )));

    let runtime = super::runtime()?;
    let result = {
        let reporter = Arc::clone(&reporter);
        runtime.block_on(
            acquirer.ensure_local_image(&descriptor, move |event| reporter.handle(event)),
        )
    };
    reporter.finish();

    let path = result.with_context(|| format!("Failed to acquire {}", args.image))?;

    if json {
        println!("{}", json!({ "path": path }));
    } else if args.quiet {
        println!("{}", path.display());
    } else {
        println!(
            "\n{} Image ready at {}",
            style("✓").green().bold(),
            style(path.display()).cyan()
        );
    }

    Ok(())
}

//! Configuration file management command

use anyhow::{Context, Result};
use console::style;
use imgfetch_core::Settings;
use std::path::PathBuf;

/// Arguments for the config command
pub struct ConfigArgs {
    /// Initialize a new configuration file with defaults
    pub init: bool,
    /// Show the path to the configuration file
    pub path: bool,
    /// Show configuration in JSON format
    pub json: bool,
    /// Suppress output (for scripting)
    pub quiet: bool,
    /// Custom configuration file path (overrides default)
    pub config_file: Option<PathBuf>,
}

/// Execute the config command
pub fn execute(args: ConfigArgs) -> Result<()> {
    let config_path = args.config_file.clone().or_else(Settings::config_path);

    if args.path {
        if let Some(path) = &config_path {
            if !args.quiet {
                println!("{}", path.display());
            }
        } else if !args.quiet {
            eprintln!("{}", style("Could not determine config path").yellow());
        }
        return Ok(());
    }

    if args.init {
        return init_config(config_path, args.quiet);
    }

    show_config(config_path, args.json, args.quiet)
}

/// Initialize a new configuration file with default values
fn init_config(config_path: Option<PathBuf>, quiet: bool) -> Result<()> {
    let path = config_path.context("Could not determine configuration directory")?;

    if path.exists() {
        if !quiet {
            eprintln!(
                "{} Configuration file already exists at: {}",
                style("Warning:").yellow(),
                path.display()
            );
            eprintln!("Use a text editor to modify it, or delete it to re-initialize.");
        }
        return Ok(());
    }

    let saved_path = Settings::default()
        .save_to_path(Some(path))
        .context("Failed to save configuration file")?;

    if !quiet {
        println!(
            "{} Created configuration file at: {}",
            style("Success:").green(),
            saved_path.display()
        );
        println!();
        println!("Example settings:");
        println!();
        println!("  [download]");
        println!("  connections = 8                 # Parallel ranged requests");
        println!("  location = \"/var/lib/images\"    # Default download directory");
        println!();
        println!("  [checksum]");
        println!("  algorithm = \"sha256\"");
    }

    Ok(())
}

/// Show the current configuration
fn show_config(config_path: Option<PathBuf>, json: bool, quiet: bool) -> Result<()> {
    if quiet {
        return Ok(());
    }

    let config_exists = config_path.as_ref().is_some_and(|p| p.exists());
    let settings = Settings::load_from_path(config_path.clone());

    if json {
        let json_output = serde_json::to_string_pretty(&settings)
            .context("Failed to serialize settings to JSON")?;
        println!("{}", json_output);
        return Ok(());
    }

    println!("{}", style("Imgfetch Configuration").bold());
    println!();

    if let Some(path) = &config_path {
        if config_exists {
            println!("  {} {}", style("Config file:").dim(), path.display());
        } else {
            println!(
                "  {} {} {}",
                style("Config file:").dim(),
                path.display(),
                style("(not found, using defaults)").yellow()
            );
        }
    }
    println!();

    println!("{}", style("[download]").cyan());
    println!("  connections = {}", settings.download.connections);
    println!("  timeout_secs = {}", settings.download.timeout_secs);
    println!("  retry_attempts = {}", settings.download.retry_attempts);
    println!("  retry_delay_ms = {}", settings.download.retry_delay_ms);
    println!(
        "  write_buffer_size = \"{}\"",
        settings.download.write_buffer_size
    );
    match &settings.download.location {
        Some(location) => println!("  location = \"{}\"", location.display()),
        None => println!("  location = {}", style("(unset)").dim()),
    }
    println!();

    println!("{}", style("[checksum]").cyan());
    println!("  algorithm = \"{}\"", settings.checksum.algorithm);
    println!("  block_size = \"{}\"", settings.checksum.block_size);
    println!();

    println!("{}", style("[progress]").cyan());
    println!("  initial_delay_ms = {}", settings.progress.initial_delay_ms);
    println!("  tick_interval_ms = {}", settings.progress.tick_interval_ms);
    println!("  smoothing_factor = {}", settings.progress.smoothing_factor);
    println!("  json = {}", settings.progress.json);

    if !config_exists {
        println!();
        println!(
            "{}",
            style("Run 'imgfetch config --init' to create a configuration file.").dim()
        );
    }

    Ok(())
}

//! Imgfetch - fetch and verify disk images before flashing
//!
//! # Usage
//!
//! ```bash
//! # Verify a local image
//! imgfetch fetch ubuntu.iso --checksum 9e107d9d372bb6826bd81d3542a419d6
//!
//! # Download (or resume) an image into a directory and verify it
//! imgfetch fetch https://releases.ubuntu.com/24.04/ubuntu.iso \
//!     --download-location ~/images --checksum-type sha256 --checksum <hex>
//!
//! # Drop a partial download
//! imgfetch discard https://releases.ubuntu.com/24.04/ubuntu.iso -d ~/images
//! ```

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use console::style;
use imgfetch_core::{Error, ErrorCode, Settings};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod commands;
mod progress;

/// Exit status for a cancelled run
const EXIT_CANCELLED: i32 = 130;

/// Imgfetch - fetch and verify disk images before flashing
#[derive(Parser)]
#[command(name = "imgfetch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress all output except errors and results
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true, env = "IMGFETCH_CONFIG", value_name = "PATH")]
    config_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ensure a verified local copy of an image (local file or URL)
    Fetch {
        /// Image path or URL
        image: String,

        /// Directory downloaded images are stored in
        #[arg(short, long, value_name = "DIR")]
        download_location: Option<PathBuf>,

        /// Expected checksum (hex)
        #[arg(long, value_name = "CHECKSUM")]
        checksum: Option<String>,

        /// Checksum algorithm (md5, sha256, sha512, crc32)
        #[arg(short = 't', long, value_name = "ALGORITHM")]
        checksum_type: Option<String>,

        /// Parallel connections for ranged downloads
        #[arg(short, long)]
        connections: Option<usize>,

        /// Output progress and result as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Calculate the checksum of a local image
    Checksum {
        /// Image file
        file: PathBuf,

        /// Checksum algorithm (md5, sha256, sha512, crc32)
        #[arg(short, long)]
        algorithm: Option<String>,
    },

    /// Remove a partial download and its transfer state
    Discard {
        /// Image URL
        url: String,

        /// Directory downloaded images are stored in
        #[arg(short, long, value_name = "DIR")]
        download_location: Option<PathBuf>,
    },

    /// Show or initialize the configuration file
    Config {
        /// Create a configuration file with default values
        #[arg(long)]
        init: bool,

        /// Print the configuration file path
        #[arg(long)]
        path: bool,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    // Set up panic handler for nicer error messages
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("{} {}", style("Error:").red().bold(), panic_info);
    }));

    if let Err(e) = run() {
        let code = core_error(&e).and_then(Error::code);
        match code {
            Some(code) => eprintln!(
                "{} [{}] {:#}",
                style("Error:").red().bold(),
                code,
                e
            ),
            None => eprintln!("{} {:#}", style("Error:").red().bold(), e),
        }

        if std::env::var("RUST_BACKTRACE").is_ok() {
            let mut source = e.source();
            while let Some(cause) = source {
                eprintln!("  {} {}", style("Caused by:").yellow(), cause);
                source = cause.source();
            }
        }

        std::process::exit(exit_code(&e));
    }
}

/// The core error behind an anyhow chain, if any
fn core_error(err: &anyhow::Error) -> Option<&Error> {
    err.chain().find_map(|cause| cause.downcast_ref::<Error>())
}

/// Process exit status for a failed run
fn exit_code(err: &anyhow::Error) -> i32 {
    match core_error(err) {
        Some(Error::Cancelled) => EXIT_CANCELLED,
        Some(e) => match e.code() {
            Some(ErrorCode::Checksum) | Some(ErrorCode::Validation) => 2,
            Some(ErrorCode::ConnectionInterrupted) => 3,
            _ => 1,
        },
        None => 1,
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else if cli.quiet {
        EnvFilter::new("off")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let quiet = cli.quiet;

    // First Ctrl+C cancels the running operation, second one exits
    let cancel_flag = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel_flag);
    ctrlc::set_handler(move || {
        if flag.load(Ordering::SeqCst) {
            if !quiet {
                eprintln!("\n{}", style("Forced exit").red().bold());
            }
            std::process::exit(EXIT_CANCELLED);
        }
        flag.store(true, Ordering::SeqCst);
        if !quiet {
            eprintln!(
                "\n{}",
                style("Cancelling... Press Ctrl+C again to force exit").yellow()
            );
        }
    })?;

    let config_path = cli.config_file.clone().or_else(Settings::config_path);

    match cli.command {
        Commands::Fetch {
            image,
            download_location,
            checksum,
            checksum_type,
            connections,
            json,
        } => commands::fetch::execute(commands::fetch::FetchArgs {
            image,
            download_location,
            checksum,
            checksum_type,
            connections,
            json,
            quiet,
            cancel_flag,
            settings: Settings::load_from_path(config_path),
        }),
        Commands::Checksum { file, algorithm } => {
            let settings = Settings::load_from_path(config_path);
            commands::checksum::execute(&file, algorithm.as_deref(), &settings, cancel_flag, quiet)
        }
        Commands::Discard {
            url,
            download_location,
        } => {
            let location = download_location
                .or_else(|| Settings::load_from_path(config_path).download.location);
            commands::discard::execute(&url, location.as_deref(), quiet)
        }
        Commands::Config { init, path, json } => {
            commands::config::execute(commands::config::ConfigArgs {
                init,
                path,
                json,
                quiet,
                config_file: cli.config_file,
            })
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(shell, &mut cmd, name, &mut std::io::stdout());
            Ok(())
        }
    }
}

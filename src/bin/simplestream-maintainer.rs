//! CLI entry point for the simple-streams repository maintainer.
//!
//! A thin shell around the library: parses arguments, configures logging,
//! wires the interrupt handler and optional timeout into the shared
//! cancellation token, and dispatches to the build or prune orchestrator.

use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use simplestream_maintainer::build::{build_index, BuildOptions};
use simplestream_maintainer::cancel::Cancellation;
use simplestream_maintainer::prune::{prune, PruneOptions};
use simplestream_maintainer::workers::default_worker_count;

/// Simplestream repository maintainer.
#[derive(Parser, Debug)]
#[command(name = "simplestream-maintainer", version, about)]
struct Cli {
    /// Timeout in seconds (0 disables the limit).
    #[arg(long, global = true, default_value_t = 0)]
    timeout: u64,

    /// Log level.
    #[arg(long, global = true, default_value = "info")]
    loglevel: String,

    /// Log format.
    #[arg(long, global = true, default_value = "text")]
    logformat: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build the simplestream index on the given path.
    Build {
        /// Repository root directory.
        path: PathBuf,

        /// Stream version.
        #[arg(long, default_value = "v1")]
        stream_version: String,

        /// Image directory (relative to the path argument).
        #[arg(short = 'd', long = "image-dir", default_value = "images")]
        image_dirs: Vec<String>,

        /// Maximum number of concurrent operations.
        #[arg(long, default_value_t = default_worker_count())]
        workers: usize,
    },

    /// Prune product versions, retaining only a number of latest ones.
    Prune {
        /// Repository root directory.
        path: PathBuf,

        /// Stream version.
        #[arg(long, default_value = "v1")]
        stream_version: String,

        /// Image directory (relative to the path argument).
        #[arg(short = 'd', long = "image-dir", default_value = "images")]
        image_dirs: Vec<String>,

        /// Number of product versions to retain.
        #[arg(long, default_value_t = 10)]
        retain: usize,

        /// Remove dangling product versions (not referenced from any
        /// product catalog).
        #[arg(long)]
        dangling: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = init_logging(&cli.loglevel, &cli.logformat) {
        // Error out rather than run with a misconfigured logger.
        eprintln!("Error: {err}");
        return ExitCode::FAILURE;
    }

    let cancel = Cancellation::new();

    {
        let cancel = cancel.clone();
        if let Err(err) = ctrlc::set_handler(move || cancel.cancel()) {
            tracing::error!("Failed to set interrupt handler: {err}");
            return ExitCode::FAILURE;
        }
    }

    if cli.timeout > 0 {
        let cancel = cancel.clone();
        let timeout = Duration::from_secs(cli.timeout);
        thread::spawn(move || {
            thread::sleep(timeout);
            tracing::warn!("Timeout reached, cancelling");
            cancel.cancel();
        });
    }

    let result = match cli.command {
        Commands::Build {
            path,
            stream_version,
            image_dirs,
            workers,
        } => run_build(&cancel, &path, stream_version, image_dirs, workers),
        Commands::Prune {
            path,
            stream_version,
            image_dirs,
            retain,
            dangling,
        } => run_prune(&path, stream_version, image_dirs, retain, dangling),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run_build(
    cancel: &Cancellation,
    path: &PathBuf,
    stream_version: String,
    image_dirs: Vec<String>,
    workers: usize,
) -> Result<()> {
    ensure_root(path)?;

    let opts = BuildOptions {
        stream_version,
        image_dirs,
        workers,
    };
    build_index(cancel, path, &opts)
}

fn run_prune(
    path: &PathBuf,
    stream_version: String,
    image_dirs: Vec<String>,
    retain: usize,
    dangling: bool,
) -> Result<()> {
    ensure_root(path)?;

    let opts = PruneOptions {
        stream_version,
        image_dirs,
        retain,
        dangling,
    };
    prune(path, &opts)
}

fn ensure_root(path: &PathBuf) -> Result<()> {
    if path.as_os_str().is_empty() {
        bail!("Argument \"path\" is required and cannot be empty");
    }

    let metadata = std::fs::metadata(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    if !metadata.is_dir() {
        bail!("{} is not a directory", path.display());
    }

    Ok(())
}

fn init_logging(level: &str, format: &str) -> Result<()> {
    let filter = match level {
        "debug" | "info" | "warn" | "error" => EnvFilter::new(level),
        other => bail!(
            "Invalid log level {other:?}. Valid log levels are: [debug, info, warn, error]"
        ),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    match format {
        "text" => builder.init(),
        "json" => builder.json().init(),
        other => bail!("Invalid log format {other:?}. Valid log formats are: [text, json]"),
    }

    Ok(())
}

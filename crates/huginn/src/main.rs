//! huginn: Replay and inspect live call-graph telemetry
//!
//! Huginn reads a JSONL capture of exported spans, logs and metrics, folds it
//! into a span database, and prints the resulting call tree. Snapshot batches
//! can be written alongside for a remote mirror to apply.

mod config;
mod follow;
mod render;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use huginn_trace::{
    Db, FrontendOpts, SnapshotWriter, SpanId, ingest_records, read_capture, read_snapshot_batches,
};
use tokio::sync::Mutex;
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use config::Config;
use follow::{FollowOptions, follow_capture};

/// Replay and inspect live call-graph telemetry
#[derive(Parser)]
#[command(name = "huginn")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to .huginn directory (default: search for .huginn/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Row verbosity from 0 to 4 (overrides config)
    #[arg(long, global = true)]
    verbosity: Option<i32>,

    /// Show passthrough and hidden spans
    #[arg(long, global = true)]
    debug: bool,

    /// Only print paths leading to failed spans
    #[arg(long, global = true)]
    errors: bool,

    /// Print the children of this span instead of the primary span
    #[arg(long, global = true)]
    zoom: Option<SpanId>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a telemetry capture and print the call tree
    Replay {
        /// JSONL capture file
        path: PathBuf,

        /// Write snapshot batches to this file
        #[arg(long)]
        snapshots: Option<PathBuf>,

        /// Keep reading as the capture grows until its root span completes
        #[arg(long)]
        follow: bool,
    },

    /// Apply snapshot batches to an empty mirror and print its call tree
    Rows {
        /// JSONL snapshot batch file
        path: PathBuf,
    },

    /// Initialize a new .huginn directory with config file
    Init {
        /// Force overwrite existing config
        #[arg(long)]
        force: bool,
    },
}

const DEFAULT_CONFIG: &str = r#"# Huginn configuration
# All paths are relative to this .huginn/ directory unless absolute

[view]
verbosity = 0  # 0 hides completed spans, 3 shows internal spans, 4 shows everything
debug = false
reveal_noisy_spans = false

[sync]
flush_interval_ms = 100  # How often follow mode flushes snapshots
batch_size = 64

[logging]
file = false  # Log to daily rotating files instead of stderr
directory = "logs"
"#;

fn env_filter(verbose: bool) -> EnvFilter {
    if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Initialize logging to stderr for interactive use.
fn init_logging(verbose: bool) {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter(verbose))
        .init();
}

/// Initialize logging to daily rotating files in the configured log directory.
fn init_file_logging(logs_dir: &Path, verbose: bool) {
    if let Err(e) = std::fs::create_dir_all(logs_dir) {
        eprintln!("Warning: Failed to create logs directory: {}", e);
        init_logging(verbose);
        return;
    }

    let file_appender = RollingFileAppender::new(Rotation::DAILY, logs_dir, "huginn.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Dropping the guard stops the background writer
    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
        std::sync::OnceLock::new();
    let _ = GUARD.set(guard);

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .with(env_filter(verbose))
        .init();
}

/// Load config from file or auto-discover from `.huginn/config.toml`.
///
/// Returns the config and the path to the `.huginn` directory (for resolving relative paths).
fn load_config(override_path: Option<&PathBuf>) -> Result<(Config, Option<PathBuf>)> {
    let (config, huginn_dir) = if let Some(path) = override_path {
        // Explicit path override - treat as path to .huginn directory
        let config_file = if path.is_dir() {
            path.join(config::CONFIG_FILE)
        } else {
            path.clone()
        };
        let huginn_dir = config_file.parent().unwrap_or(path).to_path_buf();
        (Config::from_file(&config_file)?, Some(huginn_dir))
    } else {
        match Config::find_and_load()? {
            Some((config, huginn_dir)) => (config, Some(huginn_dir)),
            None => (Config::default(), None),
        }
    };

    let errors = config.validate();
    if !errors.is_empty() {
        let joined: Vec<String> = errors.iter().map(ToString::to_string).collect();
        anyhow::bail!("Invalid configuration: {}", joined.join("; "));
    }
    Ok((config, huginn_dir))
}

fn frontend_opts(cli: &Cli, config: &Config) -> FrontendOpts {
    FrontendOpts {
        debug: cli.debug || config.view.debug,
        verbosity: cli.verbosity.unwrap_or(config.view.verbosity),
        zoomed_span: cli.zoom,
        reveal_noisy_spans: config.view.reveal_noisy_spans,
        ..FrontendOpts::default()
    }
}

fn print_rows(db: &Db, opts: &FrontendOpts, errors_only: bool) {
    let now = db.end.unwrap_or_else(Utc::now);
    print!("{}", render::render_rows(db, opts, errors_only, now));
}

async fn replay(
    path: &Path,
    snapshots: Option<&Path>,
    follow: bool,
    config: &Config,
    opts: &FrontendOpts,
    errors_only: bool,
) -> Result<()> {
    let writer = snapshots
        .map(|out| {
            SnapshotWriter::create(out)
                .with_context(|| format!("Failed to create snapshot file: {}", out.display()))
        })
        .transpose()?;

    if follow {
        let shared = Arc::new(Mutex::new(Db::new()));
        let follow_opts = FollowOptions {
            flush_interval: Duration::from_millis(config.sync.flush_interval_ms),
            batch_size: config.sync.batch_size,
        };
        let batches = follow_capture(path, Arc::clone(&shared), writer, follow_opts).await?;
        let db = shared.lock().await;
        info!(batches, spans = db.len(), "Follow finished");
        print_rows(&db, opts, errors_only);
        return Ok(());
    }

    let records = read_capture(path)
        .with_context(|| format!("Failed to read capture: {}", path.display()))?;
    info!(records = records.len(), "Replaying capture");

    let mut db = Db::new();
    ingest_records(&mut db, records);
    if let Some(mut writer) = writer {
        writer.write_batch(&db.updated_snapshots(None))?;
        writer.into_inner()?;
    }

    info!(spans = db.len(), "Capture loaded");
    print_rows(&db, opts, errors_only);
    Ok(())
}

fn rows(path: &Path, opts: &FrontendOpts, errors_only: bool) -> Result<()> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open snapshot file: {}", path.display()))?;
    let batches = read_snapshot_batches(std::io::BufReader::new(file))
        .with_context(|| format!("Failed to read snapshot file: {}", path.display()))?;

    let mut mirror = Db::new();
    for batch in batches {
        mirror.import_snapshots(batch);
    }
    info!(spans = mirror.len(), "Snapshots applied");
    print_rows(&mirror, opts, errors_only);
    Ok(())
}

fn init(force: bool) -> Result<()> {
    use config::{CONFIG_FILE, HUGINN_DIR};

    let huginn_dir = PathBuf::from(HUGINN_DIR);
    let config_path = huginn_dir.join(CONFIG_FILE);

    if config_path.exists() && !force {
        anyhow::bail!(".huginn/config.toml already exists. Use --force to overwrite.");
    }

    if !huginn_dir.exists() {
        std::fs::create_dir_all(&huginn_dir)?;
        info!("Created {}/", huginn_dir.display());
    }

    std::fs::write(&config_path, DEFAULT_CONFIG)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;
    println!("Created {}", config_path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, huginn_dir) = load_config(cli.config.as_ref())?;

    if config.logging.file {
        init_file_logging(&config.resolve_log_dir(huginn_dir.as_deref()), cli.verbose);
    } else {
        init_logging(cli.verbose);
    }
    if let Some(dir) = &huginn_dir {
        info!("Found config at {}", dir.display());
    }

    let opts = frontend_opts(&cli, &config);
    match &cli.command {
        Commands::Replay {
            path,
            snapshots,
            follow,
        } => {
            replay(
                path,
                snapshots.as_deref(),
                *follow,
                &config,
                &opts,
                cli.errors,
            )
            .await
        }
        Commands::Rows { path } => rows(path, &opts, cli.errors),
        Commands::Init { force } => init(*force),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_default_config_parses() {
        let config: Config = toml::from_str(DEFAULT_CONFIG).unwrap();
        assert!(config.validate().is_empty());
        assert_eq!(config.sync.batch_size, 64);
    }

    #[test]
    fn test_cli_overrides_config() {
        let cli = Cli::parse_from([
            "huginn",
            "--verbosity",
            "3",
            "--zoom",
            "00000000000000aa",
            "rows",
            "snapshots.jsonl",
        ]);
        let mut config = Config::default();
        config.view.verbosity = 1;
        config.view.debug = true;

        let opts = frontend_opts(&cli, &config);
        assert_eq!(opts.verbosity, 3);
        assert!(opts.debug);
        assert_eq!(opts.zoomed_span, Some(SpanId([0, 0, 0, 0, 0, 0, 0, 0xaa])));
    }

    #[test]
    fn test_load_config_rejects_invalid() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(config::CONFIG_FILE), "[sync]\nbatch_size = 0\n").unwrap();
        let err = load_config(Some(&dir.path().to_path_buf())).unwrap_err();
        assert!(err.to_string().contains("sync.batch_size"));
    }
}

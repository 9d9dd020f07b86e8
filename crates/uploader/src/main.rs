//! Uploader command line
//!
//! Manages a cache document (ignore/freeze/status/snapshot) and pushes files
//! through the upload pipeline into a local mirror directory.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info, warn};
use uploader::{
    decide, CacheHandle, EpochMillis, FileStatus, MirrorRouter, MirrorStrategy, Observation,
    UploaderCache, UploaderConfig, UploaderService,
};
use uploader_logging::LogConfig;
use walkdir::WalkDir;

#[derive(Parser, Debug)]
#[command(name = "uploader", about = "Track and gate uploads of local files")]
struct Cli {
    /// Enable verbose logging (info/debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Config file (default: $UPLOADER_HOME/config.toml)
    #[arg(long, global = true, env = "UPLOADER_CONFIG")]
    config: Option<PathBuf>,

    /// Cache document to use instead of the configured one
    #[arg(long, global = true)]
    cache: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Never upload files whose full path matches a regex
    Ignore {
        /// Regular expression matched against the whole normalized path
        pattern: String,
    },

    /// Freeze files matching a regex, snapshotting their current mtimes
    Freeze {
        /// Directory to walk for the snapshot
        root: PathBuf,

        /// Regular expression matched against the whole normalized path
        pattern: String,

        /// Freeze deadline in epoch milliseconds (default: now)
        #[arg(long)]
        deadline: Option<EpochMillis>,
    },

    /// Show cached state and the current upload decision for files
    Status {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Print the whole cache document
    Snapshot,

    /// Push files (or directories, recursively) into a mirror directory
    Push {
        /// Root the mirrored paths are taken relative to
        #[arg(long)]
        source_root: PathBuf,

        /// Destination root (default: mirror_root from the config file)
        #[arg(long)]
        mirror_root: Option<PathBuf>,

        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{:#}", err);
            eprintln!("Error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = match cli.config.clone().or_else(UploaderConfig::default_path) {
        Some(path) => UploaderConfig::load_or_default(&path)?,
        None => UploaderConfig::default(),
    };

    if let Err(err) = uploader_logging::init_logging(LogConfig {
        app_name: "uploader",
        verbose: cli.verbose || config.verbose,
        log_dir: None,
    }) {
        eprintln!("Warning: file logging disabled: {:#}", err);
    }

    let cache_file = cli.cache.clone().unwrap_or_else(|| config.cache_file.clone());
    if let Some(parent) = cache_file.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create cache directory {}", parent.display()))?;
    }
    let cache = UploaderCache::open(&cache_file)
        .with_context(|| format!("Failed to open cache {}", cache_file.display()))?;

    let result = match cli.command {
        Commands::Ignore { pattern } => cache
            .ignore(&pattern)
            .with_context(|| format!("Failed to ignore '{}'", pattern)),
        Commands::Freeze {
            root,
            pattern,
            deadline,
        } => {
            let deadline = deadline.unwrap_or_else(|| Utc::now().timestamp_millis());
            cache
                .freeze(&root, &pattern, deadline)
                .with_context(|| format!("Failed to freeze '{}' under {}", pattern, root.display()))
        }
        Commands::Status { paths, json } => print_status(&cache, &paths, json),
        Commands::Snapshot => print_snapshot(&cache),
        Commands::Push {
            source_root,
            mirror_root,
            files,
        } => {
            let mirror_root = mirror_root
                .or(config.mirror_root)
                .context("No mirror root given. Pass --mirror-root or set mirror_root in the config file.")?;
            push(&cache, &source_root, &mirror_root, &files)
        }
    };

    cache.close();
    result
}

fn print_status(cache: &CacheHandle, paths: &[PathBuf], as_json: bool) -> Result<()> {
    for path in paths {
        let status = cache.file_status(path)?;
        let observation = Observation::of_path(path)
            .with_context(|| format!("Failed to stat {}", path.display()))?;
        let decision = decide(&status, observation);

        if as_json {
            let line = json!({
                "path": path,
                "status": status,
                "decision": decision.to_string(),
            });
            println!("{}", line);
        } else {
            println!("{}", path.display());
            print_status_fields(&status);
            println!("  decision:        {}", decision);
        }
    }
    Ok(())
}

fn print_status_fields(status: &FileStatus) {
    println!("  ignored:         {}", status.ignored);
    println!("  freeze deadline: {}", format_millis(status.freeze_deadline));
    println!("  mtime frozen:    {}", format_millis(status.frozen_at));
    println!("  last uploaded:   {}", format_millis(status.last_uploaded));
}

fn format_millis(millis: Option<EpochMillis>) -> String {
    match millis {
        None => "-".to_string(),
        Some(millis) => match DateTime::<Utc>::from_timestamp_millis(millis) {
            Some(at) => format!("{} ({})", at.to_rfc3339(), millis),
            None => millis.to_string(),
        },
    }
}

fn print_snapshot(cache: &CacheHandle) -> Result<()> {
    let snapshot = cache.snapshot()?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

fn push(cache: &CacheHandle, source_root: &Path, mirror_root: &Path, files: &[PathBuf]) -> Result<()> {
    let router = MirrorRouter::new(source_root, mirror_root);
    let mut service = UploaderService::start(cache.clone(), router, MirrorStrategy)?;

    let mut queued = 0usize;
    for file in files {
        if file.is_dir() {
            for entry in WalkDir::new(file).follow_links(false) {
                match entry {
                    Ok(entry) if entry.file_type().is_file() => {
                        queued += service.queue_upload(entry.path())?;
                    }
                    Ok(_) => {}
                    Err(err) => warn!("Skipping unreadable entry: {}", err),
                }
            }
        } else {
            queued += service.queue_upload(file)?;
        }
    }
    info!("Queued {} uploads", queued);

    service.terminate()?;
    let stats = service.await_termination();
    println!(
        "queued {}, uploaded {}, skipped {}, failed {}",
        queued, stats.uploaded, stats.skipped, stats.failed
    );
    Ok(())
}

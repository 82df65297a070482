//! blocksync: Block-level differential file sync
//!
//! - Content-defined blocks, BLAKE3 hashed; only missing blocks move
//! - Per-path version history with restore
//! - Selective sync scope
//! - Conflict handling that never silently drops an edit
//! - File watching with debouncing

mod debug_log;
mod progress;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use blocksync_core::config::CONFIG_FILE;
use blocksync_core::manifest::now_ms;
use blocksync_core::scan::{STATE_DIR, TEMP_PREFIX};
use blocksync_core::scope::normalize_path;
use blocksync_core::{
    ChannelSink, ConflictPolicy, EngineConfig, ManifestId, MemoryTransport, ScopeRule, SyncEngine,
    SyncEvent,
};
use blocksync_transport::LocalTransport;
use clap::builder::styling::{AnsiColor, Effects};
use clap::{Args, Parser, Subcommand, builder::Styles};
use color_eyre::Result;
use color_eyre::eyre::{bail, eyre};
use notify::RecursiveMode;
use notify_debouncer_full::{DebounceEventResult, new_debouncer};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::progress::SyncProgress;

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default())
    .valid(AnsiColor::Green.on_default())
    .invalid(AnsiColor::Red.on_default());

#[derive(Parser)]
#[command(name = "blocksync")]
#[command(version)]
#[command(styles = STYLES)]
#[command(about = "Block-level differential file sync")]
#[command(long_about = r#"
blocksync keeps a directory in sync with a shared remote, moving only the
blocks that changed.

Features:
  • Delta sync       - content-defined blocks, only missing ones transfer
  • History          - every version kept (per retention), restorable
  • Selective sync   - include/exclude subtrees per client
  • Safe conflicts   - concurrent edits end up side by side, never lost

Examples:
  blocksync sync ./docs --remote /mnt/share/docs-remote      One-time sync
  blocksync watch ./docs --remote /mnt/share/docs-remote     Continuous sync
  blocksync history ./docs --remote /mnt/share/r report.docx List versions
  blocksync scope ./docs --remote /mnt/share/r --exclude Music
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Local root and the remote it syncs with
#[derive(Args, Debug, Clone)]
struct Target {
    /// Local scope root
    root: PathBuf,

    /// Remote directory
    #[arg(short, long)]
    remote: PathBuf,

    /// Client name used for conflict copies (overrides config)
    #[arg(long)]
    client: Option<String>,

    /// Conflict policy: last-write-wins, keep-both, merge (overrides config)
    #[arg(long)]
    policy: Option<ConflictPolicy>,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync the root with the remote once
    Sync {
        #[command(flatten)]
        target: Target,
    },

    /// Watch and continuously sync changes
    Watch {
        #[command(flatten)]
        target: Target,

        /// Debounce delay in milliseconds
        #[arg(short, long, default_value = "300")]
        debounce: u64,

        /// Seconds between full passes that pick up remote changes
        #[arg(short, long, default_value = "30")]
        interval: u64,
    },

    /// Scan the root and show what a sync would look at
    Scan {
        /// Directory to scan
        root: PathBuf,

        /// Output format (json, summary)
        #[arg(short, long, default_value = "summary")]
        format: String,
    },

    /// List the versions of a file, newest first
    History {
        #[command(flatten)]
        target: Target,

        /// File path relative to the root
        path: String,
    },

    /// Make an earlier version of a file current again
    Restore {
        #[command(flatten)]
        target: Target,

        /// File path relative to the root
        path: String,

        /// Version id from `blocksync history`
        version: ManifestId,
    },

    /// Change the selective sync rules
    Scope {
        #[command(flatten)]
        target: Target,

        /// Sync this subtree
        #[arg(long)]
        include: Vec<String>,

        /// Do not sync this subtree
        #[arg(long)]
        exclude: Vec<String>,

        /// Drop all existing rules first
        #[arg(long)]
        reset: bool,
    },

    /// Show conflicts and how they were resolved
    Conflicts {
        #[command(flatten)]
        target: Target,

        /// Only unresolved conflicts
        #[arg(long)]
        pending: bool,
    },

    /// Show version and build info
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let session = debug_log::init(cli.verbose);
    let _log_guard = session.guard;
    debug!(log = %session.log_path.display(), "logging to file");

    match cli.command {
        Commands::Version => {
            eprintln!("blocksync {}", env!("CARGO_PKG_VERSION"));
            eprintln!("Built with Rust {}", env!("CARGO_PKG_RUST_VERSION"));
        }
        Commands::Scan { root, format } => scan_command(&root, &format)?,
        Commands::Sync { target } => sync_command(&target).await?,
        Commands::Watch {
            target,
            debounce,
            interval,
        } => watch_command(&target, debounce, interval).await?,
        Commands::History { target, path } => history_command(&target, &path)?,
        Commands::Restore {
            target,
            path,
            version,
        } => restore_command(&target, &path, version).await?,
        Commands::Scope {
            target,
            include,
            exclude,
            reset,
        } => scope_command(&target, include, exclude, reset).await?,
        Commands::Conflicts { target, pending } => conflicts_command(&target, pending)?,
    }

    Ok(())
}

fn load_config(target: &Target) -> Result<EngineConfig> {
    let mut config = EngineConfig::load(&target.root)?;
    if let Some(client) = &target.client {
        config.client_name.clone_from(client);
    }
    if let Some(policy) = target.policy {
        config.conflict_policy = policy;
    }
    Ok(config)
}

/// Open the engine with events flowing to the returned receiver
fn open_engine(target: &Target) -> Result<(SyncEngine, mpsc::Receiver<SyncEvent>)> {
    let config = load_config(target)?;
    let remote = LocalTransport::open(&target.remote)?;
    let (sink, events) = ChannelSink::new(1024);
    let engine = SyncEngine::builder(&target.root, Arc::new(remote))
        .config(config)
        .events(Arc::new(sink))
        .open()?;
    Ok((engine, events))
}

/// Print events until the engine (and with it the sink) is dropped
fn pump_events(
    mut events: mpsc::Receiver<SyncEvent>,
    progress: Arc<SyncProgress>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            progress.event(&event);
        }
    })
}

fn scan_command(root: &Path, format: &str) -> Result<()> {
    info!("Scanning {}...", root.display());

    // Only local state is read; the remote is never contacted
    let engine = SyncEngine::builder(root, Arc::new(MemoryTransport::new())).open()?;
    let (snapshot, diff) = engine.snapshot()?;

    match format {
        "json" => {
            let entries: Vec<_> = snapshot.files.values().collect();
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        _ => {
            let total_size: u64 = snapshot.files.values().map(|f| f.size).sum();
            eprintln!(
                "Files: {} ({})",
                snapshot.len(),
                humansize::format_size(total_size, humansize::BINARY)
            );
            eprintln!(
                "Changes since last sync: {} added, {} modified, {} removed",
                diff.added.len(),
                diff.modified.len(),
                diff.removed.len()
            );

            if snapshot.len() <= 20 {
                eprintln!("\nFiles:");
                for (path, entry) in &snapshot.files {
                    eprintln!(
                        "  {path} ({})",
                        humansize::format_size(entry.size, humansize::BINARY)
                    );
                }
            }
        }
    }

    Ok(())
}

async fn sync_command(target: &Target) -> Result<()> {
    let (engine, events) = open_engine(target)?;
    let progress = Arc::new(SyncProgress::start(&target.root.display().to_string()));
    let pump = pump_events(events, progress.clone());

    let report = engine.sync_all().await;
    drop(engine);
    pump.await?;

    let report = report?;
    progress.finish(&report);
    if !report.failures.is_empty() {
        bail!("{} files failed to sync", report.failures.len());
    }
    Ok(())
}

/// Scope-relative path for a watcher event, or `None` for engine files
fn relevant_path(root: &Path, path: &Path) -> Option<String> {
    let relative = normalize_path(&path.strip_prefix(root).ok()?.to_string_lossy());
    let first = relative.split('/').next()?;
    let name = relative.rsplit('/').next()?;
    if relative.is_empty()
        || first == STATE_DIR
        || first == ".git"
        || name == CONFIG_FILE
        || name.starts_with(TEMP_PREFIX)
    {
        return None;
    }
    Some(relative)
}

async fn watch_command(target: &Target, debounce_ms: u64, interval_secs: u64) -> Result<()> {
    let (engine, events) = open_engine(target)?;
    let root = std::fs::canonicalize(&target.root)?;
    let progress = Arc::new(SyncProgress::start(&target.root.display().to_string()));
    let _pump = pump_events(events, progress.clone());

    // Initial pass
    let report = engine.sync_all().await?;
    progress.finish(&report);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut debouncer = new_debouncer(
        Duration::from_millis(debounce_ms),
        None,
        move |result: DebounceEventResult| {
            if let Ok(events) = result {
                let _ = tx.send(events);
            }
        },
    )?;
    debouncer.watch(&root, RecursiveMode::Recursive)?;

    let mut full_pass = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    full_pass.tick().await;
    info!("Watching for changes (Ctrl+C to stop)...");

    loop {
        let reason = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                engine.cancel_all();
                break;
            }
            Some(batch) = rx.recv() => {
                let paths: BTreeSet<String> = batch
                    .iter()
                    .flat_map(|e| e.paths.iter())
                    .filter_map(|p| relevant_path(&root, p))
                    .filter(|p| engine.is_in_scope(p))
                    .collect();
                if paths.is_empty() {
                    continue;
                }
                for path in &paths {
                    debug!("  Changed: {path}");
                }
                format!("{} changed paths", paths.len())
            }
            _ = full_pass.tick() => "periodic pass".to_string(),
        };

        debug!(%reason, "syncing");
        match engine.sync_all().await {
            Ok(report) if report.changed().count() > 0 || !report.failures.is_empty() => {
                progress.finish(&report);
            }
            Ok(_) => {}
            Err(e) => warn!("Sync failed: {e}"),
        }
    }

    info!("Stopped watching");
    Ok(())
}

/// "5m ago" style age of a millisecond timestamp
fn ago(then_ms: i64, now_ms: i64) -> String {
    let secs = (now_ms - then_ms).max(0) / 1000;
    match secs {
        0..60 => format!("{secs}s ago"),
        60..3_600 => format!("{}m ago", secs / 60),
        3_600..86_400 => format!("{}h ago", secs / 3_600),
        _ => format!("{}d ago", secs / 86_400),
    }
}

fn history_command(target: &Target, path: &str) -> Result<()> {
    let (engine, _events) = open_engine(target)?;
    let now = now_ms();
    let mut count = 0;

    for (index, manifest) in engine.history(path).enumerate() {
        let manifest = manifest?;
        let marker = if index == 0 { "*" } else { " " };
        println!(
            "{marker} {}  {:>10}  {:>5} blocks  {:>8}  by {}",
            manifest.id,
            humansize::format_size(manifest.size, humansize::BINARY),
            manifest.blocks.len(),
            ago(manifest.created_at_ms, now),
            manifest.stamp.origin,
        );
        count += 1;
    }

    if count == 0 {
        bail!("no history for {path}");
    }
    Ok(())
}

async fn restore_command(target: &Target, path: &str, version: ManifestId) -> Result<()> {
    let (engine, _events) = open_engine(target)?;
    let report = engine.restore(path, version).await?;
    progress::print_status(
        "Restored",
        &format!(
            "{path} to {version} ({} blocks fetched)",
            report.downloaded.transferred
        ),
    );
    Ok(())
}

async fn scope_command(
    target: &Target,
    include: Vec<String>,
    exclude: Vec<String>,
    reset: bool,
) -> Result<()> {
    let mut config = load_config(target)?;
    if reset {
        config.scope_rules.clear();
    }
    for (prefix, included) in include
        .iter()
        .map(|p| (p, true))
        .chain(exclude.iter().map(|p| (p, false)))
    {
        let prefix = normalize_path(prefix);
        config.scope_rules.retain(|r| normalize_path(&r.path_prefix) != prefix);
        config.scope_rules.push(if included {
            ScopeRule::include(&prefix)
        } else {
            ScopeRule::exclude(&prefix)
        });
    }

    let (engine, events) = open_engine(target)?;
    let progress = Arc::new(SyncProgress::start(&target.root.display().to_string()));
    let pump = pump_events(events, progress.clone());
    let update = engine.set_scope(config.scope_rules.clone()).await;
    drop(engine);
    pump.await?;
    let update = update?;

    // Persist so the next run starts from the same rules
    let text = toml::to_string_pretty(&config).map_err(|e| eyre!("serializing config: {e}"))?;
    std::fs::write(target.root.join(CONFIG_FILE), text)?;

    for path in &update.change.newly_excluded {
        progress::print_warning("Excluded", path);
    }
    for path in &update.change.newly_included {
        progress::print_status("Included", path);
    }
    if let Some(report) = &update.rescan {
        progress.finish(report);
    }
    for rule in &config.scope_rules {
        println!("{rule}");
    }
    Ok(())
}

fn conflicts_command(target: &Target, pending: bool) -> Result<()> {
    let (engine, _events) = open_engine(target)?;
    let records = if pending {
        engine.pending_conflicts()?
    } else {
        engine.conflicts()?
    };

    if records.is_empty() {
        eprintln!("No conflicts");
        return Ok(());
    }
    let now = now_ms();
    for record in records {
        println!(
            "{}  {:<12} {:<10} {}{}",
            ago(record.detected_at_ms, now),
            record.resolution.to_string(),
            record.policy.to_string(),
            record.file_path,
            record
                .copy_path
                .map(|copy| format!(" -> {copy}"))
                .unwrap_or_default(),
        );
    }
    Ok(())
}

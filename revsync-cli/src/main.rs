//! revsync — revision replication tool.
//!
//! Supports:
//! - Committing files of a directory as a new revision
//! - Inspecting the latest commit of a directory
//! - Printing the session token a replicator hands out
//! - One-shot or continuous local-to-local replication
//!
//! # Usage
//!
//! ```bash
//! # Commit data files as the next generation
//! revsync commit --dir /path/to/index _0.dat _1.dat
//!
//! # Show the latest commit
//! revsync info /path/to/index
//!
//! # Hex dump of the session token for the latest commit
//! revsync token --dir /path/to/index
//!
//! # Replicate once, or every 5 seconds until Ctrl-C
//! revsync sync --source /path/to/index --dest /path/to/replica
//! revsync sync --source /path/to/index --dest /path/to/replica --interval-ms 5000
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use revsync_core::commit::{latest_commit, read_generation_marker};
use revsync_core::{
    CommitStore, Directory, FsDirectory, IndexReplicationHandler, IndexRevision,
    LocalReplicator, PerSessionDirectoryFactory, ReplicationClient, ReplicationConfig,
    ReplicationHandler, Replicator, SessionToken, UpdateOutcome,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "revsync")]
#[command(author = "Revsync Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Revision replication tool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Commit existing data files as the next generation
    Commit {
        /// Directory holding the files
        #[arg(short, long)]
        dir: String,
        /// Data files to reference, in order
        #[arg(required = true)]
        files: Vec<String>,
    },

    /// Display the latest commit of a directory
    Info {
        /// Directory path
        dir: String,
    },

    /// Print the session token for the latest commit, hex encoded
    Token {
        /// Directory path
        #[arg(short, long)]
        dir: String,
    },

    /// Replicate the latest commit of source into dest
    Sync {
        /// Source directory
        #[arg(short, long)]
        source: String,
        /// Destination directory
        #[arg(short, long)]
        dest: String,
        /// Scratch directory for in-flight sessions
        #[arg(short, long)]
        work_dir: Option<String>,
        /// Keep replicating at this interval until Ctrl-C
        #[arg(short, long)]
        interval_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("revsync=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Commit { dir, files } => cmd_commit(dir, files).await,

        Commands::Info { dir } => cmd_info(dir).await,

        Commands::Token { dir } => cmd_token(dir).await,

        Commands::Sync {
            source,
            dest,
            work_dir,
            interval_ms,
        } => cmd_sync(source, dest, work_dir, interval_ms).await,
    }
}

fn open_store(dir: &str) -> Result<Arc<CommitStore>> {
    let directory = FsDirectory::open(dir).with_context(|| format!("Failed to open {}", dir))?;
    Ok(Arc::new(CommitStore::open(Arc::new(directory))))
}

async fn cmd_commit(dir: String, files: Vec<String>) -> Result<()> {
    let store = open_store(&dir)?;
    let commit = store
        .commit(&files)
        .with_context(|| format!("Failed to commit in {}", dir))?;

    println!("Committed generation {:x}:", commit.generation);
    println!("  Pointer: {}", commit.pointer_name());
    println!("  Files:   {}", commit.files.len());
    Ok(())
}

async fn cmd_info(dir: String) -> Result<()> {
    let directory = FsDirectory::open(&dir).with_context(|| format!("Failed to open {}", dir))?;
    let commit = latest_commit(&directory)?
        .ok_or_else(|| anyhow!("No commit found in {}", dir))?;

    println!("Directory: {}", dir);
    println!("  Generation: {:x}", commit.generation);
    match read_generation_marker(&directory)? {
        Some(marker) if marker == commit.generation => println!("  Marker:     {:x}", marker),
        Some(marker) => println!("  Marker:     {:x} (stale)", marker),
        None => println!("  Marker:     (none)"),
    }

    let files = commit.revision_files(&directory)?;
    let total: u64 = files.iter().map(|f| f.size).sum();
    println!("  Files:      {} ({})", files.len(), format_size(total));
    for file in &files {
        println!("    {:<24} {}", file.file_name, format_size(file.size));
    }
    Ok(())
}

/// Session token a replicator publishing `dir` hands to a fresh replica
fn latest_token(dir: &str) -> Result<SessionToken> {
    let replicator = LocalReplicator::new();
    replicator.publish(Box::new(IndexRevision::new(open_store(dir)?)?))?;
    let token = replicator
        .check_for_update(None)?
        .ok_or_else(|| anyhow!("No revision published"))?;
    replicator.close()?;
    Ok(token)
}

async fn cmd_token(dir: String) -> Result<()> {
    let token = latest_token(&dir)?;
    println!("{}", hex::encode(token.to_bytes()?));
    Ok(())
}

/// Publish the latest commit of `store`; no-op if it is already current
fn publish_latest(replicator: &LocalReplicator, store: &Arc<CommitStore>) -> Result<()> {
    let revision = IndexRevision::new(Arc::clone(store))?;
    replicator.publish(Box::new(revision))?;
    Ok(())
}

fn print_outcome(outcome: &UpdateOutcome, handler: &IndexReplicationHandler) {
    match outcome {
        UpdateOutcome::UpToDate => println!("Already up to date."),
        UpdateOutcome::Aborted => println!("Sync aborted."),
        UpdateOutcome::Installed {
            version,
            files,
            bytes,
        } => {
            println!("\nSync completed:");
            println!("  Version: {}", version);
            println!("  Files:   {}", files);
            println!("  Bytes:   {}", format_size(*bytes));
            if let Some(state) = handler.installed_state() {
                println!(
                    "  At:      {}",
                    state.installed_at.with_timezone(&chrono::Local).to_rfc3339()
                );
            }
        }
    }
}

async fn cmd_sync(
    source: String,
    dest: String,
    work_dir: Option<String>,
    interval_ms: Option<u64>,
) -> Result<()> {
    let config = ReplicationConfig::load(Path::new(&dest))?;
    let work_dir = work_dir
        .map(PathBuf::from)
        .unwrap_or_else(|| Path::new(&dest).join(&config.working_dir));

    let store = open_store(&source)?;
    let replicator = Arc::new(LocalReplicator::new());
    replicator.set_expiration_threshold(config.session_expiration())?;
    let dest_dir: Arc<dyn Directory> =
        Arc::new(FsDirectory::open(&dest).with_context(|| format!("Failed to open {}", dest))?);
    let handler = Arc::new(IndexReplicationHandler::new(dest_dir, None)?);
    let client = ReplicationClient::new(
        Arc::clone(&replicator) as Arc<dyn Replicator>,
        Arc::clone(&handler) as Arc<dyn ReplicationHandler>,
        Arc::new(PerSessionDirectoryFactory::new(work_dir)),
    );

    println!("Starting sync...");
    println!("  Source:    {}", source);
    println!("  Dest:      {}", dest);
    println!(
        "  Installed: {}",
        handler.current_version().as_deref().unwrap_or("(none)")
    );

    publish_latest(&replicator, &store)?;
    let outcome = client.do_update()?;
    print_outcome(&outcome, &handler);

    let Some(interval_ms) = interval_ms else {
        replicator.close()?;
        return Ok(());
    };

    let interval = Duration::from_millis(interval_ms);
    client.start_update_thread(interval, Some(config.thread_name.as_str()))?;
    println!("\nWatching {} every {}ms, Ctrl-C to stop", source, interval_ms);

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = publish_latest(&replicator, &store) {
                    tracing::warn!("Failed to publish {}: {}", source, e);
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.close();
    replicator.close()?;
    println!(
        "\nStopped at version {}",
        handler.current_version().as_deref().unwrap_or("(none)")
    );
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

//! Command-line entry point for the whisper repository.
//!
//! # Responsibility
//! - Bulk-ingest a folder of text notes as whispers.
//! - Expose get, delete, graph tag lookup and outbox replay for operators.
//!
//! Configuration comes from the environment (see `WhisperConfig::from_env`).

use clap::{Parser, Subcommand};
use futures::future::join_all;
use log::{info, warn};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use whisper_core::{
    default_log_level, init_logging, open_outbox, GraphIndex, InMemoryGraphIndex,
    InMemoryPrimaryStore, IndexOutcome, NewWhisper, PrimaryStore, WhisperConfig, WhisperService,
};

const NOTE_EXTENSIONS: [&str; 2] = ["md", "txt"];

#[derive(Debug, Parser)]
#[command(
    name = "whisper",
    version = whisper_core::core_version(),
    about = "Dual-store whisper repository"
)]
struct Cli {
    /// Absolute directory for rotating log files; logging is off when unset.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Use in-process stores instead of MongoDB and Neo4j.
    #[arg(long, global = true)]
    in_memory: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create one whisper per `.md`/`.txt` file in a folder.
    Ingest {
        folder: PathBuf,
        /// Tag applied to every ingested whisper.
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Print one whisper as JSON.
    Get { id: String },
    /// Delete one whisper.
    Delete { id: String },
    /// Print the tags linked to a whisper in the graph index.
    Tags { id: String },
    /// Replay deferred graph projections once.
    Drain {
        #[arg(long)]
        limit: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli) -> Result<(), Box<dyn Error>> {
    let config = WhisperConfig::from_env()?;
    if let Some(dir) = cli.log_dir.as_ref() {
        let level = config.log_level.unwrap_or_else(default_log_level);
        init_logging(level, &dir.to_string_lossy())?;
    }

    if cli.in_memory {
        let service = WhisperService::new(
            InMemoryPrimaryStore::new(),
            InMemoryGraphIndex::new(),
            open_outbox(&config)?,
            &config,
        );
        run(Arc::new(service), cli.command, &config).await
    } else {
        let service = WhisperService::connect(&config).await?;
        run(Arc::new(service), cli.command, &config).await
    }
}

async fn run<P, G>(
    service: Arc<WhisperService<P, G>>,
    command: Command,
    config: &WhisperConfig,
) -> Result<(), Box<dyn Error>>
where
    P: PrimaryStore + 'static,
    G: GraphIndex + 'static,
{
    let result = dispatch(&service, command, config).await;
    service.shutdown().await?;
    result
}

async fn dispatch<P, G>(
    service: &Arc<WhisperService<P, G>>,
    command: Command,
    config: &WhisperConfig,
) -> Result<(), Box<dyn Error>>
where
    P: PrimaryStore + 'static,
    G: GraphIndex + 'static,
{
    match command {
        Command::Ingest { folder, tags } => ingest(service, &folder, &tags).await,
        Command::Get { id } => {
            match service.get(&id).await? {
                Some(whisper) => println!("{}", serde_json::to_string(&whisper)?),
                None => println!("not found: {id}"),
            }
            Ok(())
        }
        Command::Delete { id } => {
            let report = service.delete(&id).await?;
            println!("deleted={} index={}", report.value, describe(&report.index));
            Ok(())
        }
        Command::Tags { id } => {
            println!("{}", service.index_tags(&id).await?.join(","));
            Ok(())
        }
        Command::Drain { limit } => {
            let report = service
                .drain(limit.unwrap_or(config.drain_batch_size))
                .await?;
            let counts = service.outbox_counts()?;
            println!(
                "applied={} failed={} dead={} skipped={} pending={} dead_total={}",
                report.applied,
                report.failed,
                report.dead,
                report.skipped,
                counts.pending,
                counts.dead
            );
            Ok(())
        }
    }
}

async fn ingest<P, G>(
    service: &Arc<WhisperService<P, G>>,
    folder: &Path,
    tags: &[String],
) -> Result<(), Box<dyn Error>>
where
    P: PrimaryStore + 'static,
    G: GraphIndex + 'static,
{
    let files = note_files(folder)?;
    let (inputs, mut failed) = load_notes(&files, tags);

    let tasks = inputs.into_iter().map(|input| {
        let service = Arc::clone(service);
        async move { service.create(input).await }
    });

    let mut created = 0usize;
    let mut deferred = 0usize;
    for result in join_all(tasks).await {
        match result {
            Ok(report) => {
                created += 1;
                if report.is_partial() {
                    deferred += 1;
                }
                println!("{} index={}", report.value.id, describe(&report.index));
            }
            Err(err) => {
                failed += 1;
                eprintln!("create failed: {err}");
            }
        }
    }

    info!(
        "event=ingest_done module=cli status=ok files={} created={} deferred={} failed={}",
        files.len(),
        created,
        deferred,
        failed
    );
    println!("created={created} deferred={deferred} failed={failed}");
    Ok(())
}

/// Reads each file into a create input.
///
/// Unreadable files are counted and skipped; blank files are skipped.
fn load_notes(files: &[PathBuf], tags: &[String]) -> (Vec<NewWhisper>, usize) {
    let mut failed = 0usize;
    let mut inputs = Vec::with_capacity(files.len());
    for path in files {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) => {
                failed += 1;
                warn!(
                    "event=ingest_read module=cli status=error path={} error={}",
                    path.display(),
                    err
                );
                eprintln!("read failed: {}: {err}", path.display());
                continue;
            }
        };
        if text.trim().is_empty() {
            warn!(
                "event=ingest_skip module=cli status=skipped reason=blank path={}",
                path.display()
            );
            continue;
        }
        let source = format!("file://{}", path.display());
        inputs.push(
            NewWhisper::new(text)
                .with_source_url(source)
                .with_tags(tags.iter().cloned()),
        );
    }
    (inputs, failed)
}

fn note_files(folder: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(folder)? {
        let path = entry?.path();
        let is_note = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| NOTE_EXTENSIONS.contains(&ext));
        if path.is_file() && is_note {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn describe(outcome: &IndexOutcome) -> String {
    match outcome {
        IndexOutcome::Synced => "synced".to_string(),
        IndexOutcome::Untouched => "untouched".to_string(),
        IndexOutcome::Deferred { job_id, .. } => format!("deferred({job_id})"),
        IndexOutcome::Failed { error } => format!("failed({error})"),
    }
}

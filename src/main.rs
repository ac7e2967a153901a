//! livesync: replay an agent activity timeline through the realtime stack
//!
//! Runs the full sync layer (session, multiplexer, reconciliation engine and
//! timeline) against the in-process backend: a JSONL snapshot seeds the
//! resource, live JSONL rows are published as inserts.

use clap::Parser;
use livesync::config::{self, RealtimeConfig};
use livesync::error::{ConfigError, TransportError};
use livesync::resource::{RealtimeResource, fetch_fn};
use livesync::resources::activity::{self, ActivityFeed, AgentEventRow, summarize};
use livesync::transport::memory::MemoryBackend;
use livesync::{ChangeEvent, ChannelKey, RealtimeClient};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "livesync", about = "Realtime resource sync toolkit")]
struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Replay a snapshot plus live events into an ordered activity timeline
    Timeline {
        /// JSONL file with the historical `agent_events` rows
        snapshot: PathBuf,
        /// JSONL file of live rows to publish after mounting (`-` for stdin)
        #[arg(long)]
        live: Option<String>,
        /// Project the feed is scoped to
        #[arg(long, default_value = "local")]
        project: String,
        /// Print events as JSON lines instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration
    Config {
        /// Also write it to the config file
        #[arg(long)]
        save: bool,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("runtime: {0}")]
    Runtime(std::io::Error),
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_env("LIVESYNC_LOG").unwrap_or_else(|_| EnvFilter::new(default_level));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_json_line(source: &str, line: &str) -> Option<Value> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(v) => Some(v),
        Err(e) => {
            // Avoid logging the full line (may contain user content).
            warn!(source, error = %e, "skipping malformed line");
            None
        }
    }
}

async fn read_snapshot(path: &Path) -> Result<Vec<AgentEventRow>, CliError> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| CliError::Read {
            path: path.display().to_string(),
            source,
        })?;
    let source = path.display().to_string();
    let rows: Vec<AgentEventRow> = contents
        .lines()
        .filter_map(|line| parse_json_line(&source, line))
        .filter_map(|value| match serde_json::from_value(value) {
            Ok(row) => Some(row),
            Err(e) => {
                warn!(source = %source, error = %e, "skipping row that is not an agent event");
                None
            }
        })
        .collect();
    info!(rows = rows.len(), "snapshot loaded");
    Ok(rows)
}

/// Publish every line of `reader` as an insert and fold it into the feed.
async fn publish_live(
    reader: impl AsyncBufRead + Unpin,
    backend: &MemoryBackend,
    feed: &ActivityFeed,
    project: &str,
) -> Result<usize, CliError> {
    let key = ChannelKey::eq(activity::TABLE, "project_id", project);
    let mut lines = reader.lines();
    let mut published = 0;
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|source| CliError::Read {
            path: "live input".to_string(),
            source,
        })?
    {
        let Some(row) = parse_json_line("live", &line) else {
            continue;
        };
        let before = feed.len();
        let listeners = backend.emit(&key, ChangeEvent::insert(activity::TABLE, row));
        debug!(listeners, "live row published");
        published += feed.len() - before;
    }
    Ok(published)
}

async fn run_timeline(
    snapshot: PathBuf,
    live: Option<String>,
    project: String,
    json: bool,
) -> Result<(), CliError> {
    let settings = config::load_config();
    let rows = read_snapshot(&snapshot).await?;

    let backend = MemoryBackend::with_credential("local");
    let client = RealtimeClient::from_config(Arc::new(backend.clone()), &settings);
    let fetcher = fetch_fn(move |_scope: Option<String>| {
        let rows = rows.clone();
        async move { Ok(rows) }
    });
    let resource = RealtimeResource::new(
        client.clone(),
        activity::config(Some(project.clone()), fetcher).tuned(&settings),
    );
    let feed = ActivityFeed::new(resource);
    feed.mount().await?;
    info!(events = feed.len(), "snapshot replayed");

    match live.as_deref() {
        Some("-") => {
            let added =
                publish_live(BufReader::new(tokio::io::stdin()), &backend, &feed, &project).await?;
            info!(added, "live events applied");
        }
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .map_err(|source| CliError::Read {
                    path: path.to_string(),
                    source,
                })?;
            let added = publish_live(BufReader::new(file), &backend, &feed, &project).await?;
            info!(added, "live events applied");
        }
        None => {}
    }

    feed.unmount();
    client.dispose().await;

    for event in feed.events() {
        if json {
            println!("{}", serde_json::to_string(&event)?);
        } else {
            println!(
                "{}  {:<12} {}",
                event.timestamp,
                event.body.name(),
                summarize(&event)
            );
        }
    }
    if !json {
        match feed.current_phase() {
            Some(phase) => println!("current phase: {phase}"),
            None => println!("current phase: none"),
        }
    }
    Ok(())
}

fn run_config(save: bool) -> Result<(), CliError> {
    let settings: RealtimeConfig = config::load_config();
    println!("{}", serde_json::to_string_pretty(&settings)?);
    if save {
        config::save_config(&settings)?;
        if let Some(path) = config::config_path() {
            eprintln!("saved to {}", path.display());
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Command::Config { save } => run_config(save),
        Command::Timeline {
            snapshot,
            live,
            project,
            json,
        } => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(CliError::Runtime)
            .and_then(|rt| rt.block_on(run_timeline(snapshot, live, project, json))),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("livesync: {e}");
            ExitCode::FAILURE
        }
    }
}

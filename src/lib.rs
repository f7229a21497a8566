pub mod types;
pub mod config;
pub mod error;
pub mod seed;
pub mod topology;
pub mod ranking;
pub mod bindings;
pub mod engine;
pub mod handle;

#[cfg(test)]
mod fixtures;

use config::*;
use engine::{BracketSnapshot, ResolutionEvent};
use error::EngineError;
use handle::TournamentHandle;
use types::*;

use clap::Parser;
use std::{
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
};
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

// ── Command line ───────────────────────────────────────────────────────

/// Replay an event log against a bracket layout and print the resolved
/// bracket.
#[derive(Debug, Parser)]
#[command(name = "bracket-seed-resolver", version)]
pub struct Args {
    /// Bracket layout JSON. Bare file names resolve inside test_brackets/.
    #[arg(long, default_value = DEFAULT_BRACKET_FILE)]
    pub bracket: String,

    /// JSON array of resolution events, applied in order.
    #[arg(long)]
    pub events: Option<PathBuf>,

    /// Engine configuration JSON; falls back to BRACKET_ENGINE_CONFIG.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub pretty: bool,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("read {}: {source}", path.display())]
    Read { path: PathBuf, source: std::io::Error },
    #[error("parse {}: {source}", path.display())]
    Parse { path: PathBuf, source: serde_json::Error },
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("event {index} ({kind}) rejected: {source}")]
    Rejected { index: usize, kind: &'static str, source: EngineError },
    #[error("encode snapshot: {0}")]
    Encode(serde_json::Error),
}

// ── Loading ────────────────────────────────────────────────────────────

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, RunError> {
    let data = fs::read_to_string(path).map_err(|source| RunError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&data).map_err(|source| RunError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn load_layout(path: &Path) -> Result<TournamentConfig, RunError> {
    read_json(path)
}

pub fn load_events(path: &Path) -> Result<Vec<ResolutionEvent>, RunError> {
    read_json(path)
}

/// Builds the tournament and applies `events` in order, stopping at the
/// first rejection. Each committed change set goes to the audit log when
/// enabled.
pub fn replay(
    layout: &TournamentConfig,
    events: Vec<ResolutionEvent>,
    config: &EngineConfig,
) -> Result<Arc<BracketSnapshot>, RunError> {
    let tournament: SharedTournament = TournamentHandle::from_layout(layout, config.evaluator())?;
    let audit_path = config.audit_log.then(|| config.audit_log_path());

    for (index, event) in events.into_iter().enumerate() {
        let kind = event.kind();
        let changes = tournament
            .resolve(event)
            .map_err(|source| RunError::Rejected { index, kind, source })?;
        if let Some(path) = &audit_path {
            let payload = serde_json::to_value(&changes).unwrap_or_default();
            append_resolution_log(path, kind, &payload);
        }
    }
    Ok(tournament.snapshot())
}

// ── Entry point ────────────────────────────────────────────────────────

fn init_tracing(config: &EngineConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if config.log_dir.is_none() {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return None;
    }

    let logs_dir = config.logs_dir();
    fs::create_dir_all(&logs_dir).ok();
    let file_appender = tracing_appender::rolling::daily(&logs_dir, "resolver.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .init();
    Some(guard)
}

fn execute(args: &Args, config: &EngineConfig) -> Result<BracketSnapshot, RunError> {
    let bracket_path = resolve_bracket_path(&args.bracket);
    info!(bracket = %bracket_path.display(), "loading bracket layout");
    let layout = load_layout(&bracket_path)?;
    let events = match &args.events {
        Some(path) => load_events(path)?,
        None => Vec::new(),
    };
    if events.is_empty() {
        warn!("no events supplied; printing the primed bracket");
    }
    let snapshot = replay(&layout, events, config)?;
    Ok(snapshot.as_ref().clone())
}

pub fn run() -> ExitCode {
    load_env_file();
    let args = Args::parse();

    let config = match load_engine_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("bracket-seed-resolver: {e}");
            return ExitCode::FAILURE;
        }
    };
    let _guard = init_tracing(&config);
    info!(tie_breaks = ?config.tie_breaks, "bracket seed resolver starting");

    let snapshot = match execute(&args, &config) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            error!("{e}");
            eprintln!("bracket-seed-resolver: {e}");
            return ExitCode::FAILURE;
        }
    };
    let encoded = if args.pretty {
        serde_json::to_string_pretty(&snapshot)
    } else {
        serde_json::to_string(&snapshot)
    };
    match encoded.map_err(RunError::Encode) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

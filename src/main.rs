//! Operator CLI for the program list.
//!
//! Configuration comes from the environment (see `programdb::config::env_keys`);
//! `MAX_PROGRAMS` must be set. Input documents are read from stdin, results are
//! printed to stdout as JSON.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use programdb::config::env_keys;
use programdb::{EditRecord, ProgramRepository, StatusUpdate, StoreConfig};

#[derive(Parser, Debug)]
#[command(name = "programdb")]
#[command(version, about = "Inspect and edit the stored program list", long_about = None)]
struct Cli {
    /// Database file; overrides PROGRAMDB_ENDPOINT
    #[arg(long, global = true)]
    endpoint: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the stored programs in position order
    Load,
    /// Replace the stored programs with a JSON array read from stdin
    Save,
    /// Apply a JSON array of {"pid", "status"} updates read from stdin
    Patch,
    /// Print every recorded status transition
    History,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let endpoint = cli.endpoint.clone();
    let config = StoreConfig::from_lookup(|key| {
        if key == env_keys::ENDPOINT {
            if let Some(path) = &endpoint {
                return Some(path.display().to_string());
            }
        }
        std::env::var(key).ok()
    })
    .context("invalid configuration")?;

    let repo = ProgramRepository::new(config);

    match cli.command {
        Command::Load => {
            let programs = repo.load_all().await.map_err(with_status)?;
            print_json(&programs)?;
        }
        Command::Save => {
            let programs: Vec<EditRecord> =
                serde_json::from_str(&read_stdin()?).context("stdin is not a program list")?;
            repo.save_all(&programs).await.map_err(with_status)?;
            print_json(&serde_json::json!({ "saved": programs.len() }))?;
        }
        Command::Patch => {
            let updates: Vec<StatusUpdate> =
                serde_json::from_str(&read_stdin()?).context("stdin is not an update list")?;
            repo.apply_status_updates(&updates)
                .await
                .map_err(with_status)?;
            print_json(&serde_json::json!({ "updated": updates.len() }))?;
        }
        Command::History => {
            let rows = repo.load_history().await.map_err(with_status)?;
            print_json(&rows)?;
        }
    }

    Ok(())
}

fn with_status(e: programdb::ProgramError) -> anyhow::Error {
    let status = e.status_code();
    let kind = e.as_str();
    anyhow::Error::new(e).context(format!("request failed with status {status} ({kind})"))
}

fn read_stdin() -> Result<String> {
    let mut input = String::new();
    io::stdin()
        .read_to_string(&mut input)
        .context("failed to read stdin")?;
    Ok(input)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value)?;
    writeln!(stdout)?;
    stdout.flush()?;
    Ok(())
}

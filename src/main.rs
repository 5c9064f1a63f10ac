use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use vault_ledger::host::{Scenario, WorldEvent, WorldSnapshot};
use vault_ledger::{Address, Receipt, World};

/// Replays ledger and grant-vault scenarios against an in-memory host.
#[derive(Parser, Debug)]
#[command(name = "vault-ledger", author, version, about, long_about = None)]
struct Cli {
    /// Log filter (trace, debug, info, warn, error or a full EnvFilter directive)
    #[arg(long, default_value = "info", env = "VAULT_LEDGER_LOG")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay a JSON scenario and print receipts, events and the final state
    Run {
        /// Scenario file: { "genesis": {...}, "steps": [...] }
        script: PathBuf,
        /// Stop at the first reverted transaction
        #[arg(long)]
        fail_fast: bool,
        /// Pretty-print the JSON report
        #[arg(long)]
        pretty: bool,
        /// Write the report to a file instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Print the address derived from a label
    Address { label: String },
}

#[derive(Serialize)]
struct RunReport<'a> {
    receipts: &'a [Receipt],
    events: &'a [WorldEvent],
    snapshot: WorldSnapshot,
}

fn write_all(p: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = p.parent() {
        fs::create_dir_all(parent).ok();
    }
    let mut f = fs::File::create(p).with_context(|| format!("create {}", p.display()))?;
    f.write_all(bytes)
        .with_context(|| format!("write {}", p.display()))
}

fn run_cmd(script: &Path, fail_fast: bool, pretty: bool, out: Option<&Path>) -> Result<()> {
    let bytes = fs::read(script).with_context(|| format!("read {}", script.display()))?;
    let scenario = Scenario::from_json(&bytes)
        .with_context(|| format!("parse scenario {}", script.display()))?;

    let mut world = World::from_genesis(&scenario.genesis).context("apply genesis")?;
    info!(
        ledgers = scenario.genesis.ledgers.len(),
        vaults = scenario.genesis.vaults.len(),
        steps = scenario.steps.len(),
        "scenario loaded"
    );
    world
        .run_steps(&scenario.steps, fail_fast)
        .context("scenario aborted")?;

    let reverted = world
        .receipts()
        .iter()
        .filter(|r| !r.outcome.is_success())
        .count();
    info!(
        executed = world.receipts().len(),
        reverted,
        timestamp = world.timestamp(),
        "scenario finished"
    );

    let report = RunReport {
        receipts: world.receipts(),
        events: world.events(),
        snapshot: world.snapshot(),
    };
    let json = if pretty {
        serde_json::to_vec_pretty(&report)?
    } else {
        serde_json::to_vec(&report)?
    };
    match out {
        Some(path) => {
            write_all(path, &json)?;
            info!(path = %path.display(), "report written");
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&json)?;
            stdout.write_all(b"\n")?;
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(cli.log_level.as_str())
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Run {
            script,
            fail_fast,
            pretty,
            out,
        } => run_cmd(&script, fail_fast, pretty, out.as_deref()),
        Command::Address { label } => {
            let address =
                Address::resolve(&label).with_context(|| format!("resolve {label}"))?;
            println!("{address}");
            Ok(())
        }
    }
}

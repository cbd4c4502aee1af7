//! Scenario runner for the looper simulation.
#![forbid(unsafe_code)]

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use looper_sim::{Scenario, ScenarioRunner, SimConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "looper-sim")]
#[command(about = "Run deterministic looper/alarm scenarios against virtual time")]
struct Args {
    /// Tracing filter, e.g. `info` or `looper_sim=trace`.
    #[arg(long, env = "LOOPER_SIM_LOG", default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a scenario file and print its transcript as JSON.
    Run {
        scenario: PathBuf,
        /// JSON config used when the scenario does not embed one.
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        pretty: bool,
    },
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log_level).context("invalid --log-level")?)
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Run {
            scenario,
            config,
            pretty,
        } => {
            let base = match config {
                Some(path) => SimConfig::load(&path)
                    .with_context(|| format!("loading config {}", path.display()))?,
                None => SimConfig::from_env().context("reading LOOPER_SIM_* environment")?,
            };
            let loaded = Scenario::load(&scenario)
                .with_context(|| format!("loading scenario {}", scenario.display()))?;
            let transcript = ScenarioRunner::run(&loaded, base)
                .with_context(|| format!("running scenario {:?}", loaded.name))?;
            let out = if pretty {
                serde_json::to_string_pretty(&transcript)?
            } else {
                serde_json::to_string(&transcript)?
            };
            println!("{out}");
        }
    }
    Ok(())
}

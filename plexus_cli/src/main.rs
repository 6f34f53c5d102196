mod workloads;

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use plexus_core::{Runtime, RuntimeConfig};

/// Plexus runtime driver
#[derive(Parser)]
#[command(version)]
struct Opts {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// JSON file with runtime settings
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of worker threads
    #[arg(short, long)]
    workers: Option<usize>,

    /// Finished isolates kept for reuse
    #[arg(short, long)]
    recycle: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pass a counter around a ring of processes joined by synchronous channels
    Ring {
        #[arg(short, long, default_value = "8")]
        processes: usize,
        #[arg(short, long, default_value = "100")]
        rounds: usize,
    },
    /// Bounce values between the host and one process
    Pingpong {
        #[arg(short, long, default_value = "1000")]
        exchanges: usize,
        /// Use asynchronous channels
        #[arg(short, long)]
        asynchronous: bool,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn load_config(opts: &Opts) -> Result<RuntimeConfig> {
    let mut config = match &opts.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            RuntimeConfig::from_json_str(&text)?
        }
        None => RuntimeConfig::default(),
    };
    if let Some(workers) = opts.workers {
        config.workers = workers;
    }
    if let Some(recycle) = opts.recycle {
        config.recycle_limit = recycle;
    }
    Ok(config)
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    init_logging(opts.verbose);

    let config = load_config(&opts)?;
    log::debug!("config: {}", serde_json::to_string(&config)?);
    let mut runtime = Runtime::builder().config(config).build()?;

    let started = Instant::now();
    match opts.command {
        Command::Ring { processes, rounds } => {
            let total = workloads::ring(&mut runtime, processes, rounds)?;
            println!("ring of {} processes, {} rounds: counter reached {}", processes, rounds, total);
        }
        Command::Pingpong {
            exchanges,
            asynchronous,
        } => {
            workloads::pingpong(&mut runtime, exchanges, asynchronous)?;
            println!("{} exchanges completed", exchanges);
        }
    }
    runtime.wait();
    println!(
        "finished in {:?} on {} workers",
        started.elapsed(),
        runtime.worker_count()
    );
    Ok(())
}

//! Parley CLI - confidence-bidding task routing
//!
//! Usage:
//!   parley simulate <task> --worker NAME=SCRIPT ...   Route a task among scripted workers
//!   parley config init [PATH]                         Write a default .parley/config.toml
//!   parley config show [PATH]                         Print the effective configuration
//!   parley decode                                     Decode a channel message from stdin

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use parley_channel::{decode, ChannelMessage, Envelope, InMemoryBoard, ProtocolError};
use parley_core::{is_token, ParleyConfig, RoutingOutcome, TaskDescriptor};
use parley_router::{Router, ScriptedEvaluator, WorkerResponder};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "parley")]
#[command(author, version, about = "Confidence-bidding task routing")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Route a task among scripted workers on an in-memory channel
    Simulate {
        /// Task text
        task: String,

        /// Worker and its per-round confidence script, e.g. Beta=40,55 ('-' = silent)
        #[arg(short, long = "worker", value_name = "NAME=SCRIPT", required = true)]
        workers: Vec<String>,

        /// Delay before each worker reply
        #[arg(long, default_value = "0")]
        delay_ms: u64,

        /// Configuration file (defaults to .parley/config.toml when present)
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Who is submitting the task
        #[arg(long, default_value = "cli")]
        submitter: String,

        /// Print the outcome and transcript as JSON
        #[arg(long)]
        json: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },

    /// Decode a channel message read from stdin
    Decode,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write the default configuration
    Init {
        /// Project root (defaults to current directory)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Print the effective configuration
    Show {
        /// Project root (defaults to current directory)
        #[arg(default_value = ".")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Simulate {
            task,
            workers,
            delay_ms,
            config,
            submitter,
            json,
        } => cmd_simulate(task, workers, delay_ms, config, submitter, json).await,
        Commands::Config { action } => cmd_config(action),
        Commands::Decode => cmd_decode(),
    }
}

async fn cmd_simulate(
    text: String,
    worker_specs: Vec<String>,
    delay_ms: u64,
    config_path: Option<PathBuf>,
    submitter: String,
    json: bool,
) -> Result<()> {
    let mut config = load_config(config_path.as_deref())?;
    let delay = Duration::from_millis(delay_ms);
    let workers = worker_specs
        .iter()
        .map(|spec| parse_worker(spec))
        .collect::<Result<Vec<_>>>()?;

    // Scripted workers form the roster unless the config names one
    if config.workers.is_empty() {
        config.workers = workers.iter().map(|(name, _)| name.clone()).collect();
    }

    let board = InMemoryBoard::new();
    let channel_name = config.channel.name.clone();
    let stop = CancellationToken::new();
    let handles: Vec<_> = workers
        .into_iter()
        .map(|(name, evaluator)| {
            let responder = WorkerResponder::new(
                board.participant(name),
                channel_name.clone(),
                evaluator.with_delay(delay),
            )
            .with_poll_interval(config.routing.poll_interval());
            tokio::spawn(responder.run(stop.clone()))
        })
        .collect();

    let router = Router::new(board.participant(config.channel.coordinator.clone()), config);
    let task = TaskDescriptor::new(text, submitter);
    info!("Submitting task {}", task.id);
    let task_id = task.id.clone();
    let outcome = router
        .submit_task(task)
        .await
        .with_context(|| format!("Routing task {} failed", task_id))?;

    stop.cancel();
    join_all(handles).await;
    let transcript = board.transcript(&channel_name).await;

    if json {
        let report = serde_json::json!({
            "task_id": task_id,
            "outcome": outcome,
            "transcript": transcript
                .iter()
                .map(|m| serde_json::json!({
                    "position": m.position.0,
                    "author": m.author,
                    "timestamp": m.timestamp.to_rfc3339(),
                    "text": m.text,
                }))
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Task {}", task_id);
    println!("========");
    for message in &transcript {
        print_message(message);
    }
    println!();
    match outcome {
        RoutingOutcome::Decided(decision) => println!("Outcome: {}", decision),
        RoutingOutcome::Cancelled => println!("Outcome: cancelled"),
    }
    Ok(())
}

fn cmd_config(action: ConfigCommands) -> Result<()> {
    match action {
        ConfigCommands::Init { path } => {
            let written = ParleyConfig::write_default(&path)
                .with_context(|| format!("Failed to write config under {:?}", path))?;
            println!("Wrote {}", written.display());
        }
        ConfigCommands::Show { path } => {
            let config = ParleyConfig::load_or_default(&path)
                .with_context(|| format!("Failed to load config under {:?}", path))?;
            print!("{}", config.to_toml()?);
        }
    }
    Ok(())
}

fn cmd_decode() -> Result<()> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("Failed to read stdin")?;

    match decode(&input) {
        Ok(envelope) => {
            println!("kind: {}", envelope.kind());
            println!("task: {}", envelope.task_id());
            println!("{:#?}", envelope);
            Ok(())
        }
        Err(ProtocolError::NotProtocol) => {
            println!("not a parley message");
            Ok(())
        }
        Err(e) => bail!("Malformed message: {}", e),
    }
}

fn load_config(path: Option<&Path>) -> Result<ParleyConfig> {
    let config = match path {
        Some(path) => ParleyConfig::load(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => ParleyConfig::load_or_default(Path::new("."))
            .context("Failed to load .parley/config.toml")?,
    };
    Ok(config)
}

/// Parse `NAME=SCRIPT`
fn parse_worker(spec: &str) -> Result<(String, ScriptedEvaluator)> {
    let (name, script) = spec
        .split_once('=')
        .with_context(|| format!("Expected NAME=SCRIPT, got {:?}", spec))?;
    let name = name.trim();
    if !is_token(name) {
        bail!("Worker name {:?} must be a single word", name);
    }
    let evaluator = ScriptedEvaluator::parse(script)
        .with_context(|| format!("Invalid script for worker {}", name))?;
    Ok((name.to_string(), evaluator))
}

fn print_message(message: &ChannelMessage) {
    let summary = match decode(&message.text) {
        Ok(Envelope::Solicit(s)) => format!("solicit: {}", s.text),
        Ok(Envelope::Discuss(d)) => {
            let peers: Vec<String> = d
                .peers
                .iter()
                .map(|p| format!("{} {}%", p.worker, p.confidence))
                .collect();
            format!("discuss round {}: {}", d.round, peers.join(", "))
        }
        Ok(Envelope::Evaluate(e)) => format!("evaluate round {}: {}%", e.round, e.confidence),
        Ok(Envelope::Assign(a)) => format!("assign: {}", a.decision),
        Err(_) => message.text.clone(),
    };
    println!("{:>4} {:<12} {}", message.position.0, message.author, summary);
}

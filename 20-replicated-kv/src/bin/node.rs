//! CLI entry point for running one replica with an interactive prompt.
//!
//! # Example usage
//!
//! Start a 3-node cluster:
//! ```bash
//! # Terminal 1 (node 1)
//! cargo run --bin node -- \
//!   --id 1 --listen 127.0.0.1:7101 \
//!   --peer 1=127.0.0.1:7101,2=127.0.0.1:7102,3=127.0.0.1:7103
//!
//! # Terminal 2 (node 2)
//! cargo run --bin node -- \
//!   --id 2 --listen 127.0.0.1:7102 \
//!   --peer 1=127.0.0.1:7101,2=127.0.0.1:7102,3=127.0.0.1:7103
//!
//! # Terminal 3 (node 3)
//! cargo run --bin node -- \
//!   --id 3 --listen 127.0.0.1:7103 \
//!   --peer 1=127.0.0.1:7101,2=127.0.0.1:7102,3=127.0.0.1:7103
//! ```
//!
//! Logs go to stderr; set `RUST_LOG=replicated_kv=debug` for protocol detail.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueHint};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

use replicated_kv::config::{NodeConfig, Tuning, parse_peers};
use replicated_kv::protocol::{ConsoleCommand, HELP};
use replicated_kv::runtime::{NodeHandle, spawn_node};
use replicated_kv::transport::TcpTransport;

/// Command-line arguments for a replica.
#[derive(Parser, Debug)]
#[command(author, version, about = "Run a replicated key-value node")]
struct Args {
    /// Numeric node ID (must match one entry in --peer)
    #[arg(long)]
    id: u64,

    /// Address this node should listen on for peer messages, e.g. 127.0.0.1:7101
    #[arg(long, value_hint = ValueHint::Hostname)]
    listen: String,

    /// Comma-separated peer map: id=addr,id=addr,... (must include self)
    #[arg(long, value_delimiter = ',', value_hint = ValueHint::Other)]
    peer: Vec<String>,

    /// Silence in milliseconds before a peer is suspected
    #[arg(long, default_value_t = 1000, value_parser = clap::value_parser!(u64).range(1..=600_000))]
    failure_timeout_ms: u64,

    /// Milliseconds a candidate waits for votes
    #[arg(long, default_value_t = 1000, value_parser = clap::value_parser!(u64).range(1..=600_000))]
    election_timeout_ms: u64,

    /// Milliseconds the coordinator waits for votes and acks
    #[arg(long, default_value_t = 1000, value_parser = clap::value_parser!(u64).range(1..=600_000))]
    commit_timeout_ms: u64,

    /// Peers each gossip round is forwarded to
    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u64).range(1..=64))]
    gossip_fanout: u64,
}

impl Args {
    fn tuning(&self) -> Tuning {
        let failure_timeout = Duration::from_millis(self.failure_timeout_ms);
        Tuning {
            heartbeat_interval: failure_timeout / 2,
            failure_timeout,
            failed_after: failure_timeout * 5,
            election_timeout: Duration::from_millis(self.election_timeout_ms),
            commit_timeout: Duration::from_millis(self.commit_timeout_ms),
            gossip_fanout: self.gossip_fanout as usize,
            ..Tuning::default()
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let peers = parse_peers(&args.peer).context("invalid --peer list")?;
    let config = NodeConfig::new(args.id, args.listen.clone(), peers).with_tuning(args.tuning());
    config.validate()?;

    let (transport, inbox, addr) = TcpTransport::bind(&config).await?;
    let handle = spawn_node(&config, transport, inbox)?;
    info!(node = args.id, %addr, "ready, type HELP for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        prompt(args.id).await?;
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        match ConsoleCommand::parse(&line) {
            Ok(ConsoleCommand::Exit) => break,
            Ok(command) => run_command(&handle, command).await,
            Err(err) => println!("error: {err}"),
        }
    }

    handle.shutdown();
    info!(node = args.id, "exiting");
    Ok(())
}

async fn prompt(id: u64) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(format!("node{id}> ").as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}

async fn run_command(handle: &NodeHandle, command: ConsoleCommand) {
    match command {
        ConsoleCommand::Put {
            key,
            value,
            consistency,
        } => match handle.put(key.as_str(), value, consistency).await {
            Ok(()) => println!("OK ({consistency})"),
            Err(err) => println!("error: {err}"),
        },
        ConsoleCommand::Get { key, consistency } => match handle.get(key.as_str(), consistency).await {
            Ok(Some(value)) => println!("{key} = {value}"),
            Ok(None) => println!("{key} not found"),
            Err(err) => println!("error: {err}"),
        },
        ConsoleCommand::Delete { key, consistency } => match handle.delete(key.as_str(), consistency).await {
            Ok(()) => println!("deleted {key} ({consistency})"),
            Err(err) => println!("error: {err}"),
        },
        ConsoleCommand::Announce { text } => match handle.announce(text).await {
            Ok(message_id) => {
                tokio::time::sleep(Duration::from_millis(500)).await;
                match handle.gossip_coverage(message_id).await {
                    Ok(coverage) => println!("announced, {:.0}% acknowledged so far", coverage * 100.0),
                    Err(err) => println!("error: {err}"),
                }
            }
            Err(err) => println!("error: {err}"),
        },
        ConsoleCommand::Keys => match handle.get_all_keys().await {
            Ok(keys) if keys.is_empty() => println!("(no keys)"),
            Ok(keys) => println!("{}", keys.join(" ")),
            Err(err) => println!("error: {err}"),
        },
        ConsoleCommand::Status => match handle.status().await {
            Ok(status) => println!("{status}"),
            Err(err) => println!("error: {err}"),
        },
        ConsoleCommand::Campaign => match handle.campaign().await {
            Ok(()) => println!("election started"),
            Err(err) => println!("error: {err}"),
        },
        ConsoleCommand::Help => println!("{HELP}"),
        ConsoleCommand::Exit => warn!("exit handled by the prompt loop"),
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0

//! peerchat CLI - terminal chat in a peer-to-peer replicated room
//!
//! Creates or joins a room, replicates its log with every peer that holds
//! the same key, and renders each entry as it arrives. The room's writer
//! also sends each line to a completion endpoint and appends the reply.

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use peerchat_cli::completion::{DEFAULT_API_BASE, DEFAULT_MODEL};
use peerchat_cli::{render, ChatOrchestrator, CompletionBackend, OpenAiBackend, Turn};
use peerchat_core::storage::history_file_name;
use peerchat_core::{EntryLog, RoomIdentity, RoomKey, DEFAULT_CONTEXT_WINDOW};
use peerchat_network::config::{load_config, load_config_from, NodeConfig};
use peerchat_network::{Discovery, Keypair, PeerId, RoomNode, SwarmDiscovery, TcpTransport, Transport};

type InputLines = Lines<BufReader<Stdin>>;

/// Command-line arguments
#[derive(Parser, Debug)]
#[clap(
    name = "peerchat",
    about = "Peer-to-peer chat room with a replicated, hash-chained log",
    version
)]
struct Args {
    /// Create a new room and print its key
    #[clap(long, conflicts_with = "join")]
    create: bool,

    /// Join an existing room by its hex key
    #[clap(long)]
    join: Option<String>,

    /// Append to a joined room; the creator always appends
    #[clap(long)]
    writer: bool,

    /// Config file instead of the platform default
    #[clap(long)]
    config: Option<PathBuf>,

    /// Directory for persisted room logs
    #[clap(long)]
    data_dir: Option<PathBuf>,

    /// Keep the room log in memory only
    #[clap(long)]
    memory: bool,

    /// Model name sent to the completion endpoint
    #[clap(long, default_value = DEFAULT_MODEL)]
    model: String,

    /// Base URL of an OpenAI-compatible API
    #[clap(long, default_value = DEFAULT_API_BASE)]
    api_base: String,

    /// Entries sent as context besides the system prompt
    #[clap(long, default_value_t = DEFAULT_CONTEXT_WINDOW)]
    context_window: usize,

    /// Replication listen address
    #[clap(long)]
    listen: Option<SocketAddr>,

    /// Bootstrap multiaddr ending in /p2p/<peer id>; repeatable
    #[clap(long = "bootstrap")]
    bootstrap: Vec<String>,

    /// Disable local network discovery
    #[clap(long)]
    no_mdns: bool,

    /// Write logs to this file instead of stderr
    #[clap(long)]
    log_file: Option<PathBuf>,

    /// Enable debug logging and show entry digests
    #[clap(long)]
    debug: bool,
}

fn init_logging(debug: bool, log_file: Option<&PathBuf>) -> Result<()> {
    let default = if debug {
        "warn,peerchat=debug,peerchat_core=debug,peerchat_network=debug,peerchat_cli=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

/// Main entry point
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug, args.log_file.as_ref())?;

    let mut config = match &args.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    apply_overrides(&mut config, &args);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let (key, created) = choose_room(&args, &mut lines).await?;
    let writer = created || args.writer;
    let room = RoomIdentity::derive(&key);

    let log = if args.memory {
        EntryLog::new(room.chain_seed)
    } else {
        let path = config.resolve_data_dir()?.join(history_file_name(&room.topic));
        info!(path = %path.display(), "Opening room log");
        EntryLog::open(room.chain_seed, &path)
            .with_context(|| format!("Failed to open room log {}", path.display()))?
    };
    let log = Arc::new(log);

    let chat = if writer {
        let backend = OpenAiBackend::from_env(&args.api_base, args.model.clone())?;
        ChatOrchestrator::writer(Arc::clone(&log), backend, args.context_window)
    } else {
        ChatOrchestrator::replica(Arc::clone(&log))
    };
    chat.seed_system_prompt()?;

    let keypair = Keypair::generate_ed25519();
    let local_id = PeerId::from(keypair.public());
    let transport = TcpTransport::bind(config.listen_addr)
        .await
        .context("Failed to bind replication listener")?;
    let swarm = Arc::new(SwarmDiscovery::spawn(keypair, &config.discovery, transport.local_addr())?);
    let discovery: Arc<dyn Discovery> = swarm.clone();
    let node = RoomNode::open(local_id, room, Arc::clone(&log), transport, discovery, &config).await?;

    println!(
        "Room {} | peer {} | replication on {}",
        node.topic().short(),
        local_id,
        node.local_addr()
    );
    if writer {
        println!("\nChat session started. Type your message (or 'exit' to quit):");
    } else {
        println!("\nJoined as a read-only replica. Type 'exit' to quit.");
    }

    let renderer = spawn_renderer(Arc::clone(&log), args.debug);
    let result = run_chat_loop(&chat, &mut lines).await;

    if let Err(e) = node.close().await {
        warn!("Failed to close room cleanly: {:#}", e);
    }
    swarm.shutdown().await;
    renderer.abort();
    println!("Chat session ended.");
    result
}

fn apply_overrides(config: &mut NodeConfig, args: &Args) {
    if let Some(dir) = &args.data_dir {
        config.data_dir = Some(dir.clone());
    }
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    config.discovery.bootstrap_nodes.extend(args.bootstrap.iter().cloned());
    if args.no_mdns {
        config.discovery.enable_mdns = false;
    }
}

/// Room key from the flags, or from the interactive menu
async fn choose_room(args: &Args, lines: &mut InputLines) -> Result<(RoomKey, bool)> {
    if args.create {
        let key = RoomKey::generate();
        println!("Your new room key is: {key}");
        return Ok((key, true));
    }
    if let Some(hex) = &args.join {
        let key = hex.trim().parse::<RoomKey>().context("Invalid room key")?;
        return Ok((key, false));
    }

    println!("Welcome to peerchat!");
    println!("1. Create a new room");
    println!("2. Join an existing room");
    match prompt_line(lines, "Select an option (1 or 2): ").await?.as_str() {
        "1" => {
            let key = RoomKey::generate();
            println!("Your new room key is: {key}");
            Ok((key, true))
        }
        "2" => {
            let hex = prompt_line(lines, "Enter your room key: ").await?;
            let key = hex.parse::<RoomKey>().context("Invalid room key")?;
            Ok((key, false))
        }
        other => bail!("Invalid option {:?}", other),
    }
}

async fn prompt_line(lines: &mut InputLines, prompt: &str) -> Result<String> {
    print_prompt(prompt);
    let line = lines
        .next_line()
        .await?
        .ok_or_else(|| anyhow!("Input closed"))?;
    Ok(line.trim().to_string())
}

fn print_prompt(prompt: &str) {
    print!("{prompt}");
    let _ = std::io::stdout().flush();
}

/// Print every entry of the log, then follow it
fn spawn_renderer(log: Arc<EntryLog>, debug: bool) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut entries = log.subscribe(0);
        loop {
            let entry = entries.next().await;
            if debug {
                println!("{}", render::render_entry_debug(&entry));
            } else {
                println!("{}", render::render_entry(&entry));
            }
        }
    })
}

/// Read lines until `exit`, end of input or Ctrl+C
async fn run_chat_loop<B: CompletionBackend>(chat: &ChatOrchestrator<B>, lines: &mut InputLines) -> Result<()> {
    loop {
        print_prompt(render::prompt(chat.is_writer()));

        tokio::select! {
            _ = signal::ctrl_c() => {
                println!("\nReceived Ctrl+C, shutting down gracefully...");
                break;
            }

            line = lines.next_line() => {
                let Some(line) = line.context("Error reading input")? else {
                    break;
                };
                match chat.handle_line(&line).await? {
                    Turn::Exit => break,
                    Turn::Refused => {
                        println!("This peer is a read-only replica; restart with --writer to post.");
                    }
                    Turn::CompletionFailed { error, .. } => {
                        eprintln!("Error communicating with the completion endpoint: {error}");
                    }
                    Turn::Replied { .. } | Turn::Ignored => {}
                }
            }
        }
    }
    Ok(())
}

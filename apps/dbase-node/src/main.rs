use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use dbase_node::config::Config;
use dbase_node::logging::{self, LogConfig, LogLevel};
use dbase_node::protocol::{KvRecord, PeerId};
use dbase_node::storage::FsRecordStore;
use dbase_node::transfer::TransferOrchestrator;
use dbase_node::transport::InboundMessage;

#[derive(Parser, Debug)]
#[command(name = "dbase-node", about = "Replicate key/value records to peers over WebRTC")]
struct Cli {
    /// Identity announced to the relay. Defaults to a random UUID.
    #[arg(long, global = true, env = "DBASE_PEER_ID")]
    peer_id: Option<String>,

    #[arg(long, global = true, env = "DBASE_RELAY_URL")]
    relay_url: Option<String>,

    #[arg(long, global = true, help = "Write logs to a file instead of stderr")]
    log_file: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Receive records and messages until interrupted.
    Listen {
        #[arg(long, env = "DBASE_STORE_DIR")]
        store: Option<PathBuf>,
    },
    /// Copy every record in a JSON file to each target peer.
    Send {
        #[arg(long = "to", required = true, num_args = 1..)]
        to: Vec<String>,
        #[arg(long)]
        records: PathBuf,
    },
    /// Send one text message.
    Text {
        #[arg(long)]
        to: String,
        #[arg(long)]
        message: String,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RecordsFile {
    Many(Vec<KvRecord>),
    One(KvRecord),
}

fn load_records(path: &Path) -> Result<Vec<KvRecord>> {
    let raw = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let parsed: RecordsFile = serde_json::from_slice(&raw)
        .with_context(|| format!("{} is not a record or a list of records", path.display()))?;
    Ok(match parsed {
        RecordsFile::Many(records) => records,
        RecordsFile::One(record) => vec![record],
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let _log_guard = logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })?;

    let mut config = Config::from_env();
    if let Some(url) = cli.relay_url {
        config.relay_url = url;
    }
    if let Command::Listen { store: Some(dir) } = &cli.command {
        config.store_dir = dir.clone();
    }
    let peer_id = cli.peer_id.map(PeerId::new).unwrap_or_else(PeerId::random);

    let store = FsRecordStore::open(&config.store_dir)
        .await
        .with_context(|| format!("opening store {}", config.store_dir.display()))?;
    let orchestrator = TransferOrchestrator::start(&config, peer_id.clone(), Arc::new(store))
        .await
        .context("starting node")?;

    let outcome = match cli.command {
        Command::Listen { .. } => listen(&orchestrator, &config).await,
        Command::Send { to, records } => {
            let records = load_records(&records)?;
            let peers: Vec<PeerId> = to.into_iter().map(PeerId::new).collect();
            send(&orchestrator, &peers, &records).await
        }
        Command::Text { to, message } => orchestrator
            .send_text(&PeerId::new(to), message)
            .await
            .map_err(Into::into),
    };

    orchestrator.shutdown().await;
    outcome
}

async fn listen(orchestrator: &TransferOrchestrator, config: &Config) -> Result<()> {
    println!("peer id: {}", orchestrator.local_id());
    println!("storing records under {}", config.store_dir.display());
    let mut inbound = orchestrator.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(target: "dbase::node", "interrupted");
                return Ok(());
            }
            message = inbound.recv() => match message {
                Ok(InboundMessage::Text { from, content }) => println!("[{from}] {content}"),
                Ok(InboundMessage::Record { from, key }) => println!("[{from}] stored {key}"),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target: "dbase::node", skipped, "inbound notifications dropped");
                }
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

async fn send(
    orchestrator: &TransferOrchestrator,
    peers: &[PeerId],
    records: &[KvRecord],
) -> Result<()> {
    let results = orchestrator.copy_to_peers(peers, records).await;
    let mut failed = 0usize;
    for result in &results {
        match &result.outcome {
            Ok(count) => println!("{}: sent {count} record(s)", result.peer),
            Err(err) => {
                failed += 1;
                println!("{}: failed: {err}", result.peer);
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {} peer(s) failed", results.len());
    }
    Ok(())
}

//! dmlink -- command-line node for signed direct messages.
//!
//! ```text
//! dmlink keygen --out key.json
//! dmlink --key key.json --listen /ip4/0.0.0.0/tcp/9000 listen
//! dmlink --key key.json send --peer 12D3KooW... --addr /ip4/203.0.113.1/tcp/9000 --message hello
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

mod config;
mod key_io;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use tokio::sync::mpsc;

use dmlink_crypto::signing::Keypair;
use dmlink_network::events::InboundDirectMessage;
use dmlink_network::identity::NodeIdentity;
use dmlink_network::node::{NodeHandle, NodeLifecycle};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// dmlink -- authenticated peer-to-peer direct messages.
#[derive(Parser)]
#[command(name = "dmlink", version, about)]
struct Cli {
    /// Output in JSON format.
    #[arg(long, global = true)]
    json: bool,

    /// Load config from a JSON file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Key file holding the node identity. A fresh identity is
    /// generated for this run if omitted.
    #[arg(long, global = true)]
    key: Option<PathBuf>,

    /// P2P listen address.
    #[arg(long, global = true)]
    listen: Option<Multiaddr>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new key file.
    Keygen {
        /// Destination path.
        #[arg(long)]
        out: PathBuf,
    },
    /// Print the node id of the configured key.
    Id,
    /// Run a node and print every delivered message.
    Listen,
    /// Send one direct message and wait for the acknowledgement.
    Send {
        /// Recipient node id.
        #[arg(long)]
        peer: PeerId,
        /// Address of the recipient (repeatable).
        #[arg(long = "addr")]
        addrs: Vec<Multiaddr>,
        /// Message text.
        #[arg(long)]
        message: String,
    },
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let json = cli.json;

    if let Err(e) = dispatch(cli).await {
        if json {
            eprintln!("{}", serde_json::json!({ "error": e }));
        } else {
            eprintln!("error: {e}");
        }
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> Result<(), String> {
    let node_config = match &cli.config {
        Some(path) => config::NodeConfig::load(path)?,
        None => config::NodeConfig::default(),
    }
    .merge_cli(cli.listen, cli.key);

    match cli.command {
        Commands::Keygen { out } => keygen(&out, cli.json),
        Commands::Id => {
            let identity = load_identity(&node_config)?;
            print_id(&identity, cli.json);
            Ok(())
        }
        Commands::Listen => listen(node_config, cli.json).await,
        Commands::Send {
            peer,
            addrs,
            message,
        } => send(node_config, peer, addrs, &message, cli.json).await,
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn keygen(out: &std::path::Path, json: bool) -> Result<(), String> {
    if out.exists() {
        return Err(format!("refusing to overwrite '{}'", out.display()));
    }
    let keypair = Keypair::generate();
    key_io::save_key(out, &keypair)?;
    let identity = NodeIdentity::from_keypair(keypair).map_err(|e| e.to_string())?;
    print_id(&identity, json);
    Ok(())
}

async fn listen(cfg: config::NodeConfig, json: bool) -> Result<(), String> {
    let (node, mut inbox) = start_node(cfg).await?;

    // Give the swarm a moment to report the OS-assigned port.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let addrs = node.listen_addrs().await.map_err(|e| e.to_string())?;

    if json {
        let addrs: Vec<String> = addrs.iter().map(|a| a.to_string()).collect();
        println!(
            "{}",
            serde_json::json!({ "node_id": node.peer_id().to_base58(), "listen_addrs": addrs })
        );
    } else {
        println!("node id: {}", node.peer_id());
        for addr in &addrs {
            println!("listening on {}", addr.clone().with(Protocol::P2p(node.peer_id())));
        }
        println!("press Ctrl+C to stop");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received Ctrl+C, shutting down");
                break;
            }
            received = inbox.recv() => match received {
                Some(message) => print_message(&message, json),
                None => {
                    tracing::error!("inbox closed unexpectedly");
                    break;
                }
            },
        }
    }
    Ok(())
}

async fn send(
    cfg: config::NodeConfig,
    peer: PeerId,
    addrs: Vec<Multiaddr>,
    text: &str,
    json: bool,
) -> Result<(), String> {
    let (node, _inbox) = start_node(cfg).await?;
    for addr in addrs {
        node.add_address(peer, addr).map_err(|e| e.to_string())?;
    }

    let ack = node
        .send_direct_message(&peer, text)
        .await
        .map_err(|e| e.to_string())?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "status": "ok",
                "request_id": ack.request_id,
                "response_id": ack.response_id,
                "responder_node_id": ack.responder_node_id,
                "responded_at": ack.responded_at,
            })
        );
    } else {
        println!("delivered to {} (message id {})", ack.responder_node_id, ack.request_id);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn start_node(
    cfg: config::NodeConfig,
) -> Result<(NodeHandle, mpsc::UnboundedReceiver<InboundDirectMessage>), String> {
    let identity = Arc::new(load_identity(&cfg)?);
    let (tx, rx) = mpsc::unbounded_channel();
    let node = NodeLifecycle::new()
        .initialize(cfg.network, identity, tx)
        .await
        .map_err(|e| format!("node start failed: {e}"))?;
    Ok((node, rx))
}

fn load_identity(cfg: &config::NodeConfig) -> Result<NodeIdentity, String> {
    match &cfg.key_file {
        Some(path) => key_io::load_key(path),
        None => {
            tracing::warn!("no key file given, using an ephemeral identity");
            NodeIdentity::generate().map_err(|e| e.to_string())
        }
    }
}

fn print_id(identity: &NodeIdentity, json: bool) {
    if json {
        println!(
            "{}",
            serde_json::json!({
                "node_id": identity.node_id(),
                "public_key": hex::encode(identity.public_key().as_bytes()),
                "can_sign": identity.can_sign(),
            })
        );
    } else {
        println!("node id:    {}", identity.node_id());
        println!("public key: {}", hex::encode(identity.public_key().as_bytes()));
    }
}

fn print_message(message: &InboundDirectMessage, json: bool) {
    if json {
        println!(
            "{}",
            serde_json::json!({
                "from": message.sender.to_base58(),
                "message_id": message.message_id,
                "timestamp": message.timestamp,
                "client_version": message.client_version,
                "message": message.message,
            })
        );
    } else {
        println!("[{}] {}: {}", message.timestamp, message.sender, message.message);
    }
}

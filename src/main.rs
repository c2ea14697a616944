use std::net::{IpAddr, SocketAddr};

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use splice::{
    parse_public_addr, validate_port, BootstrapOutcome, HandlerRegistry, Node, NodeConfig,
    DEFAULT_PORT,
};

const CHAT_SERVICE: &str = "chat";

fn parse_port(s: &str) -> Result<u16, String> {
    let port: u32 = s
        .trim()
        .parse()
        .map_err(|_| format!("'{}' is an invalid port", s))?;
    validate_port(port).map_err(|e| e.to_string())
}

fn parse_public(s: &str) -> Result<SocketAddr, String> {
    parse_public_addr(s).map_err(|e| e.to_string())
}

/// Last six hex digits of the sender's public key.
fn sender_tag(public_key: &[u8; 32]) -> String {
    let hex = hex::encode(public_key);
    hex[hex.len() - 6..].to_string()
}

#[derive(Parser, Debug)]
#[command(name = "splice")]
#[command(author, version, about = "Peer-to-peer chat over a service discovery overlay", long_about = None)]
struct Args {
    /// Port to listen on.
    #[arg(short, long, default_value_t = DEFAULT_PORT, value_parser = parse_port)]
    port: u16,

    /// Enable debug logging.
    #[arg(short, long)]
    debug: bool,

    /// Known host:port to bootstrap from. Empty starts a new overlay.
    #[arg(long = "bootstrap-peer", visible_alias = "peer", value_name = "HOST:PORT", default_value = "")]
    bootstrap_peer: String,

    /// Address other nodes should dial, when it differs from the local one.
    #[arg(long, value_name = "HOST:PORT", value_parser = parse_public)]
    public_addr: Option<SocketAddr>,

    /// Interface to bind.
    #[arg(long, default_value = "0.0.0.0")]
    bind_ip: IpAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = NodeConfig {
        public_addr: args.public_addr,
        ..NodeConfig::bound_to(args.bind_ip, args.port)
    };

    let handlers = HandlerRegistry::new().with(CHAT_SERVICE, |msg| {
        println!("{}: {}", sender_tag(&msg.public_key), String::from_utf8_lossy(&msg.payload));
    });

    let node = Node::start(config, handlers, &args.bootstrap_peer).await?;
    info!("Node identity: {}", node.node_id());
    info!("Advertising {}", node.advertised_addr());
    if let BootstrapOutcome::Failed(reason) = node.bootstrap_outcome().await {
        warn!(reason = %reason, "continuing without bootstrap");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    // Graceful shutdown on Ctrl+C or end of input
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        info!("Input closed, exiting");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to read input");
                        break;
                    }
                };
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }

                let deliveries = node.broadcast(CHAT_SERVICE, text.as_bytes()).await;
                if deliveries.is_empty() {
                    debug!("no chat peers connected");
                }
                for delivery in deliveries {
                    if let Err(e) = delivery.result {
                        warn!(peer = %delivery.peer.short(), error = %e, "message not delivered");
                    }
                }
            }
        }
    }

    node.shutdown().await;
    Ok(())
}

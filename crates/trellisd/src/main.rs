use std::fs::File;
use std::net::SocketAddr;

use clap::Parser;
use time::macros::format_description;
use tracing_subscriber::{fmt, EnvFilter};
use url::Url;

use trellis::{Config, Mesh};

mod config;
use config::NodeConfig;

#[derive(Parser, Debug)]
#[command(name = "trellisd", version, about = "Overlay mesh node daemon")]
struct Args {
    /// Generate a new configuration and print to stdout
    #[arg(long)]
    genconf: bool,

    /// Read configuration from this file
    #[arg(long, default_value = "trellis.json")]
    useconffile: String,

    /// Run without a configuration file (ephemeral identity, defaults)
    #[arg(long)]
    autoconf: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    loglevel: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.genconf {
        println!("{}", serde_json::to_string_pretty(&NodeConfig::generate())?);
        return Ok(());
    }

    let filter = EnvFilter::try_new(&args.loglevel).unwrap_or_else(|_| EnvFilter::new("info"));
    let format =
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]");
    let timer = fmt::time::LocalTime::new(format);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_timer(timer)
        .init();

    let node_config = if args.autoconf {
        NodeConfig::generate()
    } else {
        let file = File::open(&args.useconffile)?;
        let text = std::io::read_to_string(file)?;
        serde_json::from_str::<NodeConfig>(&text)?
    };

    let id = node_config.node_id()?;
    let mesh = Mesh::with_id(
        id,
        Config::default()
            .with_port(node_config.port)
            .with_auto_connect(node_config.auto_connect),
    );
    tracing::info!("Your node id is {}", mesh.id());

    mesh.add_connection_listener(|peer| {
        tracing::info!(
            "peer {} joined the mesh ({} hop(s) away)",
            peer.id(),
            peer.distance()
        );
    });
    mesh.add_disconnection_listener(|peer| {
        tracing::info!("peer {} left the mesh", peer.id());
    });
    mesh.add_data_listener(|peer, data, to_all| {
        tracing::info!(
            "received {} byte(s) from {} (broadcast: {})",
            data.len(),
            peer.id(),
            to_all
        );
    });

    let mut joined = false;
    for uri in &node_config.peers {
        let addr = match resolve_peer(uri) {
            Ok(addr) => addr,
            Err(e) => {
                tracing::warn!("skipping peer {}: {}", uri, e);
                continue;
            }
        };
        match mesh.connect(addr.ip(), addr.port()).await {
            Ok(true) => {
                tracing::info!("joined the mesh through {}", uri);
                joined = true;
                break;
            }
            Ok(false) => tracing::warn!("could not join through {}", uri),
            Err(e) => tracing::error!("joining through {} failed: {}", uri, e),
        }
    }
    if !joined {
        if !node_config.peers.is_empty() {
            tracing::warn!("no configured peer was reachable, starting a new mesh");
        }
        mesh.run().await?;
    }
    tracing::info!("listening on port {}", mesh.port());

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    mesh.disconnect().await;
    Ok(())
}

/// Parse a `tcp://host:port` peer URI into a socket address.
fn resolve_peer(uri: &str) -> Result<SocketAddr, String> {
    let url = Url::parse(uri).map_err(|e| format!("invalid URI: {}", e))?;
    if url.scheme() != "tcp" {
        return Err(format!("unsupported scheme: {}", url.scheme()));
    }
    url.socket_addrs(|| Some(3479))
        .map_err(|e| format!("invalid address: {}", e))?
        .first()
        .copied()
        .ok_or_else(|| "no address resolved".to_string())
}

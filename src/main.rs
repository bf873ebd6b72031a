use clap::Parser;
use floodclone::floodclone::{Config, FloodClone, Mode};
use floodclone::{COMPLETION_PORT, DATA_PORT, PIECE_SIZE};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "floodclone", about = "Topology-aware one-shot file distribution")]
pub struct Args {
    /// Role of this node in the transfer.
    #[arg(long, value_enum)]
    mode: Mode,

    #[arg(long)]
    node_name: String,

    /// Name of the node the file originates from.
    #[arg(long)]
    src_name: String,

    /// File to distribute (source) or path to rebuild it at (destination).
    #[arg(long)]
    file: PathBuf,

    /// Directory the source writes its per-piece side files under.
    #[arg(long)]
    pieces_dir: PathBuf,

    /// Written on completion: start and end of the run in Unix microseconds.
    #[arg(long)]
    timestamp_file: PathBuf,

    /// Routing table JSON: {src: {dst: [[iface, hops, [path...]], ...]}}.
    #[arg(long)]
    network_info: String,

    /// Interface address JSON: {node: [[iface, ip], ...]}.
    #[arg(long)]
    ip_map: String,

    /// Bytes per piece; must agree across the whole fleet.
    #[arg(long, default_value_t = PIECE_SIZE)]
    piece_size: usize,

    /// TCP port for metadata and piece traffic.
    #[arg(long, default_value_t = DATA_PORT)]
    port: u16,

    /// TCP port for the completion barrier.
    #[arg(long, default_value_t = COMPLETION_PORT)]
    completion_port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let node = FloodClone::new(Config {
        mode: args.mode,
        node_name: args.node_name,
        src_name: args.src_name,
        file: args.file,
        pieces_dir: args.pieces_dir,
        timestamp_file: args.timestamp_file,
        network_info: args.network_info,
        ip_map: args.ip_map,
        piece_size: args.piece_size,
        data_port: args.port,
        completion_port: args.completion_port,
    })?;
    node.run().await
}

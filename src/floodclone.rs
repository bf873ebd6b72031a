use crate::barrier::{self, CompletionBarrier};
use crate::connection::{ConnectionManager, TransferError};
use crate::pool::{DEFAULT_WORKERS, WorkerPool};
use crate::storage::FileManager;
use crate::topology::Network;
use crate::wire::PieceRequest;
use anyhow::{Context, bail};
use clap::ValueEnum;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::info;

#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum Mode {
    Source,
    Destination,
}

pub struct Config {
    pub mode: Mode,
    pub node_name: String,
    pub src_name: String,
    /// Source: the file to distribute. Destination: where to rebuild it.
    pub file: PathBuf,
    pub pieces_dir: PathBuf,
    pub timestamp_file: PathBuf,
    /// Raw topology JSON, `{src: {dst: [[iface, hops, [path...]], ...]}}`.
    pub network_info: String,
    /// Raw interface-address JSON, `{node: [[iface, ip], ...]}`.
    pub ip_map: String,
    pub piece_size: usize,
    pub data_port: u16,
    pub completion_port: u16,
}

/// Drives one node through the transfer: source nodes serve until every
/// destination reports done; destination nodes download from their
/// one-hop neighbors, seed while doing so, then hold at the barrier until
/// the whole fleet is complete.
pub struct FloodClone {
    config: Config,
    network: Network,
    my_ip: Ipv4Addr,
    total_nodes: usize,
    pool: Arc<WorkerPool>,
    connections: Arc<ConnectionManager>,
    start_time: SystemTime,
}

impl FloodClone {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let network = Network::from_json(&config.network_info, &config.ip_map)?;
        let my_ip = network.node_ip(&config.node_name)?;
        let total_nodes = network.total_nodes();
        info!(
            "{} using IP {my_ip}, fleet of {total_nodes} nodes",
            config.node_name
        );
        let pool = Arc::new(WorkerPool::new(DEFAULT_WORKERS));
        let connections = ConnectionManager::new(config.data_port, Arc::clone(&pool));
        Ok(Self {
            config,
            network,
            my_ip,
            total_nodes,
            pool,
            connections,
            start_time: SystemTime::now(),
        })
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let outcome = match self.config.mode {
            Mode::Source => self.run_source().await,
            Mode::Destination => self.run_destination().await,
        };
        // best-effort teardown on both the happy and the fatal path
        self.connections.stop_listening().await;
        outcome?;
        self.pool.quiesce().await;
        Ok(())
    }

    async fn run_source(&self) -> anyhow::Result<()> {
        let barrier = CompletionBarrier::start(self.config.completion_port).await?;
        let storage = Arc::new(FileManager::source(
            &self.config.file,
            self.config.piece_size,
            self.my_ip,
        )?);
        info!(
            "source: serving {} in {} piece(s)",
            storage.metadata().filename,
            storage.num_pieces()
        );
        storage
            .spawn_piece_files(&self.pool, &self.config.pieces_dir)
            .await?;
        self.connections.set_file_manager(storage);
        self.connections.start_listening().await?;
        self.record_time().context("write timestamp file")?;

        // one signal from every destination
        let expected = self.total_nodes - 1;
        info!("source: waiting for {expected} completion signal(s)");
        barrier.wait_for(expected).await;
        info!("source: every destination is complete");
        barrier.stop().await;
        Ok(())
    }

    async fn run_destination(&self) -> anyhow::Result<()> {
        let barrier = CompletionBarrier::start(self.config.completion_port).await?;
        let neighbors = self.network.immediate_neighbors(&self.config.node_name)?;
        let first = self
            .network
            .connection_options(&self.config.node_name, &neighbors[0])?;
        info!(
            "destination: fetching metadata of {}'s file from {} ({})",
            self.config.src_name, neighbors[0], first[0].target_ip
        );
        let metadata = self
            .connections
            .request_metadata(first[0].target_ip, self.config.data_port)
            .await?;
        let num_pieces = metadata.num_pieces;
        let storage = Arc::new(FileManager::receiver(
            metadata,
            &self.config.file,
            self.config.piece_size,
        )?);
        self.connections.set_file_manager(Arc::clone(&storage));
        // listen only now: with the metadata known we can serve it too
        self.connections.start_listening().await?;

        let request = PieceRequest::full_range(num_pieces);
        'transfer: loop {
            for neighbor in &neighbors {
                let options = self
                    .network
                    .connection_options(&self.config.node_name, neighbor)?;
                info!(
                    "destination: requesting pieces from {neighbor} ({})",
                    options[0].target_ip
                );
                match self
                    .connections
                    .request_pieces(options[0].target_ip, self.config.data_port, &request)
                    .await
                {
                    Ok(()) => {
                        info!("destination: transfer from {neighbor} complete");
                        break 'transfer;
                    }
                    Err(e) => match e.downcast_ref::<TransferError>() {
                        Some(TransferError::Busy) => {
                            info!("destination: {neighbor} is busy, trying next neighbor");
                        }
                        Some(TransferError::NotAvailable) => {
                            info!("destination: {neighbor} has no pieces yet, trying next neighbor");
                        }
                        None => return Err(e),
                    },
                }
            }
            info!("destination: all neighbors busy, retrying shortly");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        self.pool.quiesce().await;
        for index in 0..storage.num_pieces() {
            if !storage.has_piece(index) {
                bail!("piece {index} missing after transfer");
            }
        }
        storage.reconstruct()?;
        self.record_time().context("write timestamp file")?;

        self.notify_peers().await?;
        // everyone but us and the source still has to finish
        let expected = self.total_nodes - 2;
        info!("destination: waiting for {expected} completion signal(s)");
        barrier.wait_for(expected).await;
        barrier.stop().await;
        Ok(())
    }

    async fn notify_peers(&self) -> anyhow::Result<()> {
        let mut peers = Vec::new();
        for node in self.network.peers_of(&self.config.node_name) {
            let options = self
                .network
                .connection_options(&self.config.node_name, &node)?;
            peers.push((node, options[0].target_ip));
        }
        barrier::notify_peers(&peers, self.config.completion_port).await;
        Ok(())
    }

    /// Two lines: start and end of this node's run, Unix microseconds.
    fn record_time(&self) -> anyhow::Result<()> {
        let micros = |t: SystemTime| {
            t.duration_since(UNIX_EPOCH)
                .expect("clock is before the Unix epoch")
                .as_micros()
        };
        let contents = format!("{}\n{}", micros(self.start_time), micros(SystemTime::now()));
        std::fs::write(&self.config.timestamp_file, contents)
            .with_context(|| format!("write {}", self.config.timestamp_file.display()))
    }
}

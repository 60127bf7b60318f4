//! Node assembly: wires the chain, pool, peers, sync engine, and RPC server
//! together and runs the service loops.
//!
//! Subsystems own their loops as tokio tasks. Shutdown is cooperative: a
//! process-wide cancellation token makes every loop exit at its next yield
//! point, and in-flight batches complete or roll back before `run` returns.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chain::{Chain, ChainError, ChainEvent};
use crate::config::MimbleConfig;
use crate::core::block::{BlockHeader, FullBlock};
use crate::core::hash::{Hash, Hashed};
use crate::core::transaction::Transaction;
use crate::p2p::peer::{run_peer, Direction, NodeAdapter, Peers};
use crate::p2p::protocol::{self, Locator, Message, PingInfo};
use crate::pool::{PoolConfig, ReorgedBlock, TransactionPool};
use crate::rpc::RpcServer;
use crate::store::{ChainStore, StoreError};
use crate::sync::SyncEngine;
use crate::txhashset::TxHashSet;

/// How often the sync engine re-evaluates.
const SYNC_TICK: Duration = Duration::from_secs(1);
/// Dandelion epoch length: the stempool fluffs at this cadence.
const DANDELION_EPOCH: Duration = Duration::from_secs(30);
/// How often spent outputs beyond the horizon are compacted away.
const COMPACTION_INTERVAL: Duration = Duration::from_secs(600);

/// Fatal startup errors, mapped to process exit codes in `main`.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("database open failed: {0}")]
    DbOpen(#[from] StoreError),
    #[error("chain state corrupt: {0}")]
    ChainInit(String),
}

/// The assembled node.
pub struct Server {
    pub chain: Arc<Chain>,
    pub pool: Arc<TransactionPool>,
    pub peers: Arc<Peers>,
    pub sync: Arc<SyncEngine>,
    config: MimbleConfig,
    shutdown: CancellationToken,
}

impl Server {
    /// Open state and wire the subsystems. No sockets yet.
    pub fn new(config: MimbleConfig) -> Result<Self, ServerError> {
        let data_dir = config.data_dir();
        let store = Arc::new(ChainStore::open(&data_dir.join("chain"))?);
        let txhashset = TxHashSet::open(&data_dir, &store)
            .map_err(|e| ServerError::ChainInit(e.to_string()))?;
        let chain = Arc::new(
            Chain::init(store, txhashset).map_err(|e| ServerError::ChainInit(e.to_string()))?,
        );
        let pool = Arc::new(TransactionPool::new(chain.clone(), PoolConfig::default()));
        let peers = Arc::new(Peers::new());
        let sync = Arc::new(SyncEngine::new(chain.clone(), peers.clone()));
        Ok(Server {
            chain,
            pool,
            peers,
            sync,
            config,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run every service loop until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let adapter: Arc<dyn NodeAdapter> = Arc::new(Adapter {
            chain: self.chain.clone(),
            pool: self.pool.clone(),
            peers: self.peers.clone(),
            sync: self.sync.clone(),
        });

        // P2P accept loop.
        let listen_addr: SocketAddr = format!("{}:{}", self.config.p2p.host, self.config.p2p.port)
            .parse()
            .map_err(|e| ServerError::ChainInit(format!("bad p2p listen address: {e}")))?;
        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(|e| ServerError::ChainInit(format!("p2p bind failed: {e}")))?;
        info!(%listen_addr, "p2p listening");
        {
            let peers = self.peers.clone();
            let adapter = adapter.clone();
            let shutdown = self.shutdown.clone();
            let max_peers = self.config.p2p.max_peers;
            let port = self.config.p2p.port;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        accepted = listener.accept() => {
                            let Ok((stream, addr)) = accepted else { continue };
                            if peers.count() >= max_peers {
                                debug!(%addr, "at peer capacity, dropping inbound");
                                continue;
                            }
                            let peers = peers.clone();
                            let adapter = adapter.clone();
                            tokio::spawn(async move {
                                if let Err(e) =
                                    run_peer(stream, Direction::Inbound, peers, adapter, port).await
                                {
                                    debug!(%addr, "inbound peer ended: {e}");
                                }
                            });
                        }
                    }
                }
            });
        }

        // Seed dialing.
        for seed in self.config.seed_addrs() {
            let peers = self.peers.clone();
            let adapter = adapter.clone();
            let port = self.config.p2p.port;
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                loop {
                    if shutdown.is_cancelled() {
                        break;
                    }
                    if peers.get(&seed).is_none() && !peers.is_banned(seed.ip()) {
                        match TcpStream::connect(seed).await {
                            Ok(stream) => {
                                let result = run_peer(
                                    stream,
                                    Direction::Outbound,
                                    peers.clone(),
                                    adapter.clone(),
                                    port,
                                )
                                .await;
                                if let Err(e) = result {
                                    debug!(%seed, "outbound peer ended: {e}");
                                }
                            }
                            Err(e) => debug!(%seed, "dial failed: {e}"),
                        }
                    }
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
            });
        }

        // RPC server.
        let rpc_addr: SocketAddr = format!("{}:{}", self.config.rpc.host, self.config.rpc.port)
            .parse()
            .map_err(|e| ServerError::ChainInit(format!("bad rpc listen address: {e}")))?;
        let rpc = Arc::new(RpcServer::new(self.chain.clone(), self.pool.clone()));
        {
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = rpc.serve(rpc_addr, shutdown).await {
                    warn!("rpc server stopped: {e}");
                }
            });
        }

        // Chain events → pool reconcile + block relay.
        {
            let chain = self.chain.clone();
            let pool = self.pool.clone();
            let peers = self.peers.clone();
            let mut events = self.chain.subscribe();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        event = events.recv() => match event {
                            Ok(ChainEvent::BlockAccepted { block, reorged_out }) => {
                                let reorged: Vec<ReorgedBlock> = reorged_out
                                    .iter()
                                    .filter_map(|b| {
                                        let prev = chain
                                            .get_header(&b.header.prev_hash)
                                            .ok()
                                            .flatten()?;
                                        Some(ReorgedBlock {
                                            block: b.clone(),
                                            prev_total_offset: prev.total_kernel_offset,
                                        })
                                    })
                                    .collect();
                                pool.reconcile(&block, &reorged);
                                for peer in peers.iter() {
                                    let _ = peer.send(Message::Header(Box::new(
                                        block.header.clone(),
                                    )));
                                }
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                warn!("event subscriber lagged by {n}");
                            }
                            Err(_) => break,
                        }
                    }
                }
            });
        }

        // Sync ticks, Dandelion epochs, compaction.
        let mut sync_tick = tokio::time::interval(SYNC_TICK);
        let mut fluff_tick = tokio::time::interval(DANDELION_EPOCH);
        let mut compact_tick = tokio::time::interval(COMPACTION_INTERVAL);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sync_tick.tick() => {
                    if let Err(e) = self.sync.tick() {
                        warn!("sync tick failed: {e}");
                    }
                }
                _ = fluff_tick.tick() => {
                    match self.pool.fluff_stempool() {
                        Ok(Some(tx)) => {
                            debug!("fluffing stem transactions");
                            for peer in self.peers.iter() {
                                let _ = peer.send(Message::Transaction(Box::new(tx.clone())));
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!("fluff failed: {e}"),
                    }
                }
                _ = compact_tick.tick() => {
                    if let Err(e) = self.chain.compact() {
                        warn!("compaction failed: {e}");
                    }
                }
            }
        }

        // Final durability pass before returning.
        self.chain.store().flush().ok();
        info!("node shut down cleanly");
        Ok(())
    }
}

/// The node-side message handlers handed to peer connections.
struct Adapter {
    chain: Arc<Chain>,
    pool: Arc<TransactionPool>,
    peers: Arc<Peers>,
    sync: Arc<SyncEngine>,
}

impl NodeAdapter for Adapter {
    fn chain_state(&self) -> PingInfo {
        match self.chain.head() {
            Ok(tip) => PingInfo {
                total_difficulty: tip.total_difficulty,
                height: tip.height,
            },
            Err(_) => PingInfo {
                total_difficulty: 0,
                height: 0,
            },
        }
    }

    fn get_block(&self, hash: &Hash) -> Option<FullBlock> {
        self.chain.get_block(hash).ok().flatten()
    }

    fn headers_for_locator(&self, locator: &Locator) -> Vec<BlockHeader> {
        protocol::headers_for_locator(
            locator,
            |hash| self.chain.get_header(hash).ok().flatten(),
            |height| self.chain.store().header_hash_by_height(height).ok().flatten(),
        )
    }

    fn build_archive(&self) -> Option<(u64, Hash, Vec<u8>)> {
        self.sync.build_archive_response()
    }

    fn on_header(&self, header: BlockHeader, from: SocketAddr) {
        let hash = header.hash();
        match self.chain.process_header(&header) {
            Ok(()) | Err(ChainError::AlreadyKnown) => {
                // Announced header we do not have the block for: fetch it.
                if self.chain.get_block(&hash).ok().flatten().is_none() {
                    if let Some(peer) = self.peers.get(&from) {
                        let _ = peer.send(Message::GetBlock(hash));
                    }
                }
            }
            Err(ChainError::UnknownHeader(_)) => {
                // Out of order announcement; sync will catch up.
            }
            Err(e) => {
                warn!(%from, "bad announced header: {e}");
                self.peers.report_misbehavior(
                    &from,
                    crate::consensus::BAN_THRESHOLD,
                    "invalid header",
                );
            }
        }
    }

    fn on_headers(&self, headers: Vec<BlockHeader>, from: SocketAddr) {
        self.sync.handle_headers(headers, from);
    }

    fn on_block(&self, block: FullBlock, from: SocketAddr) {
        self.sync.handle_block(block, from);
    }

    fn on_transaction(&self, tx: Transaction, stem: bool, from: SocketAddr) {
        let result = if stem {
            self.pool.add_to_stempool(tx.clone())
        } else {
            self.pool.add_to_mempool(tx.clone())
        };
        match result {
            Ok(_) => {
                if stem {
                    // Pass the stem along to one random peer; the epoch
                    // timer fluffs whatever remains.
                    let candidates: Vec<_> = self
                        .peers
                        .iter()
                        .into_iter()
                        .filter(|p| p.addr != from)
                        .collect();
                    if let Some(relay) = candidates.choose(&mut rand::thread_rng()) {
                        let _ = relay.send(Message::StemTransaction(Box::new(tx)));
                    }
                } else {
                    for peer in self.peers.iter() {
                        if peer.addr != from {
                            let _ = peer.send(Message::Transaction(Box::new(tx.clone())));
                        }
                    }
                }
            }
            Err(e) => debug!(%from, "transaction rejected: {e}"),
        }
    }

    fn on_archive(&self, _height: u64, hash: Hash, bytes: Vec<u8>, from: SocketAddr) {
        let _ = self.sync.handle_archive(hash, bytes, from);
    }

    fn peer_addrs_to_share(&self) -> Vec<String> {
        self.peers
            .addrs()
            .into_iter()
            .map(|a| a.to_string())
            .collect()
    }

    fn on_peer_addrs(&self, addrs: Vec<String>) {
        // Candidates for future dialing; for now just log discovery.
        debug!(count = addrs.len(), "received peer addresses");
    }
}

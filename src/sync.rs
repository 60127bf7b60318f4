//! The synchronization state machine.
//!
//! ```text
//!   NOT_SYNCING → SYNCING_HEADERS → SYNCING_TXHASHSET → PROCESSING_TXHASHSET
//!     → SYNCING_BLOCKS → NOT_SYNCING
//!                          ↑
//!       TXHASHSET_SYNC_FAILED ──────────────┘ (retry with a different peer)
//! ```
//!
//! Header sync starts when the best peer's advertised work exceeds ours by
//! the sync threshold. Once headers catch up, a node within the cut-through
//! horizon of the peer tip fetches blocks directly; a node further behind
//! downloads a TxHashSet archive and validates it end-to-end before swapping
//! it into live state. Archive failures ban the serving peer, remember it as
//! failed, and back off; after enough failures the failed set is cleared to
//! widen selection.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::chain::{Chain, ChainError};
use crate::consensus;
use crate::core::block::BlockHeader;
use crate::core::hash::Hash;
use crate::p2p::peer::{Peers, PEER_TIMEOUT};
use crate::p2p::protocol::{self, Message};
use crate::txhashset::TxHashSetArchive;

/// Archive attempts against distinct peers before widening selection.
const ARCHIVE_ATTEMPTS_BEFORE_WIDENING: u32 = 3;
/// Backoff after a failed archive attempt.
const ARCHIVE_RETRY_BACKOFF: Duration = Duration::from_secs(30);
/// Blocks requested per sync tick.
const BLOCK_BATCH: u64 = 16;

/// Errors surfaced by the sync engine.
#[derive(Clone, Debug, Error)]
pub enum SyncError {
    #[error("downloaded archive is invalid: {0}")]
    ArchiveInvalid(String),
    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// The sync states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncStatus {
    NotSyncing,
    SyncingHeaders,
    SyncingTxHashSet,
    ProcessingTxHashSet,
    SyncingBlocks,
    TxHashSetSyncFailed,
}

/// An outstanding request with its deadline.
#[derive(Clone, Debug)]
struct Outstanding {
    peer: SocketAddr,
    what: &'static str,
    deadline: Instant,
}

/// The per-node sync engine. `tick` drives transitions; message handlers
/// feed results back in.
pub struct SyncEngine {
    chain: Arc<Chain>,
    peers: Arc<Peers>,
    state: Mutex<EngineState>,
}

struct EngineState {
    status: SyncStatus,
    outstanding: Option<Outstanding>,
    failed_archive_peers: HashSet<SocketAddr>,
    archive_attempts: u32,
    backoff_until: Option<Instant>,
}

impl SyncEngine {
    pub fn new(chain: Arc<Chain>, peers: Arc<Peers>) -> Self {
        SyncEngine {
            chain,
            peers,
            state: Mutex::new(EngineState {
                status: SyncStatus::NotSyncing,
                outstanding: None,
                failed_archive_peers: HashSet::new(),
                archive_attempts: 0,
                backoff_until: None,
            }),
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.state.lock().expect("sync lock").status
    }

    /// Evaluate the state machine and issue whatever request is due.
    pub fn tick(&self) -> Result<SyncStatus, SyncError> {
        let head = self.chain.head()?;
        let header_head = self.chain.header_head()?;
        let Some(best_peer) = self.peers.most_work_peer() else {
            return Ok(self.set_status(SyncStatus::NotSyncing));
        };
        let peer_diff = best_peer.total_difficulty();
        let peer_height = best_peer.height();

        let mut state = self.state.lock().expect("sync lock");

        // Expire a timed-out request and demote the slow peer.
        if let Some(outstanding) = &state.outstanding {
            if Instant::now() >= outstanding.deadline {
                let peer = outstanding.peer;
                let what = outstanding.what;
                state.outstanding = None;
                drop(state);
                self.peers.report_misbehavior(&peer, 10, what);
                state = self.state.lock().expect("sync lock");
            } else {
                return Ok(state.status);
            }
        }

        // Caught up with the network: nothing to do.
        if peer_diff < head.total_difficulty + consensus::HEADER_SYNC_THRESHOLD {
            state.status = SyncStatus::NotSyncing;
            return Ok(state.status);
        }

        // Headers first.
        if header_head.total_difficulty < peer_diff {
            state.status = SyncStatus::SyncingHeaders;
            let locator = protocol::build_locator(header_head.height, |height| {
                self.chain.store().header_hash_by_height(height).ok().flatten()
            });
            debug!(peer = %best_peer.addr, our_height = header_head.height, "requesting headers");
            if best_peer.send(Message::GetHeaders(locator)).is_ok() {
                state.outstanding = Some(Outstanding {
                    peer: best_peer.addr,
                    what: "headers request timed out",
                    deadline: Instant::now() + PEER_TIMEOUT,
                });
            }
            return Ok(state.status);
        }

        // Headers are caught up. Within the horizon: fetch blocks. Beyond
        // it: fetch an archive.
        let far_behind = head
            .height
            .saturating_add(consensus::CUT_THROUGH_HORIZON)
            < peer_height;
        if far_behind {
            if let Some(until) = state.backoff_until {
                if Instant::now() < until {
                    return Ok(state.status);
                }
            }
            if state.archive_attempts >= ARCHIVE_ATTEMPTS_BEFORE_WIDENING {
                info!("widening archive peer selection");
                state.failed_archive_peers.clear();
                state.archive_attempts = 0;
            }
            // Pick the best peer we have not failed against.
            let candidate = self
                .peers
                .iter()
                .into_iter()
                .filter(|p| !state.failed_archive_peers.contains(&p.addr))
                .max_by_key(|p| p.total_difficulty());
            let Some(peer) = candidate else {
                state.status = SyncStatus::TxHashSetSyncFailed;
                return Ok(state.status);
            };

            let horizon_height = peer_height.saturating_sub(consensus::CUT_THROUGH_HORIZON);
            let horizon_hash = self
                .chain
                .store()
                .header_hash_by_height(horizon_height)
                .ok()
                .flatten()
                .unwrap_or(crate::core::hash::ZERO_HASH);
            state.status = SyncStatus::SyncingTxHashSet;
            info!(peer = %peer.addr, horizon_height, "requesting txhashset archive");
            if peer
                .send(Message::TxHashSetRequest {
                    height: horizon_height,
                    hash: horizon_hash,
                })
                .is_ok()
            {
                state.outstanding = Some(Outstanding {
                    peer: peer.addr,
                    what: "archive request timed out",
                    deadline: Instant::now() + PEER_TIMEOUT * 4,
                });
            }
            return Ok(state.status);
        }

        // Block-by-block catch-up toward the header head.
        if head.height < header_head.height {
            state.status = SyncStatus::SyncingBlocks;
            let from = head.height + 1;
            let to = (from + BLOCK_BATCH - 1).min(header_head.height);
            for height in from..=to {
                if let Ok(Some(hash)) = self.chain.store().header_hash_by_height(height) {
                    if self.chain.store().block_exists(&hash).unwrap_or(false) {
                        continue;
                    }
                    let _ = best_peer.send(Message::GetBlock(hash));
                }
            }
            state.outstanding = Some(Outstanding {
                peer: best_peer.addr,
                what: "block request timed out",
                deadline: Instant::now() + PEER_TIMEOUT,
            });
            return Ok(state.status);
        }

        state.status = SyncStatus::NotSyncing;
        Ok(state.status)
    }

    fn set_status(&self, status: SyncStatus) -> SyncStatus {
        self.state.lock().expect("sync lock").status = status;
        status
    }

    fn clear_outstanding(&self) {
        self.state.lock().expect("sync lock").outstanding = None;
    }

    /// A batch of headers arrived. Invalid headers ban the peer.
    pub fn handle_headers(&self, headers: Vec<BlockHeader>, from: SocketAddr) {
        self.clear_outstanding();
        for header in headers {
            match self.chain.process_header(&header) {
                Ok(()) => {}
                Err(ChainError::AlreadyKnown) => {}
                Err(ChainError::UnknownHeader(_)) => {
                    // Batch did not connect; a later locator round will.
                    break;
                }
                Err(e) => {
                    warn!(%from, "invalid header from peer: {e}");
                    self.peers
                        .report_misbehavior(&from, consensus::BAN_THRESHOLD, "invalid header");
                    return;
                }
            }
        }
    }

    /// A block arrived during sync (or relay). Invalid blocks ban the peer;
    /// orphans just wait.
    pub fn handle_block(&self, block: crate::core::block::FullBlock, from: SocketAddr) {
        self.clear_outstanding();
        match self.chain.process_block(block) {
            Ok(_) => {}
            Err(ChainError::AlreadyKnown) | Err(ChainError::OrphanBlock(_)) => {}
            Err(ChainError::Store(e)) => warn!("store error processing block: {e}"),
            Err(e) => {
                warn!(%from, "invalid block from peer: {e}");
                self.peers
                    .report_misbehavior(&from, consensus::BAN_THRESHOLD, "invalid block");
            }
        }
    }

    /// A TxHashSet archive arrived: validate end-to-end, swap on success,
    /// ban and back off on failure.
    pub fn handle_archive(
        &self,
        claimed_hash: Hash,
        bytes: Vec<u8>,
        from: SocketAddr,
    ) -> Result<(), SyncError> {
        self.clear_outstanding();
        self.set_status(SyncStatus::ProcessingTxHashSet);

        let result = (|| -> Result<(), SyncError> {
            let archive: TxHashSetArchive = bincode::deserialize(&bytes)
                .map_err(|e| SyncError::ArchiveInvalid(e.to_string()))?;
            if archive.header_hash != claimed_hash {
                return Err(SyncError::ArchiveInvalid(
                    "archive does not match claimed header".into(),
                ));
            }
            self.chain.apply_archive(archive).map_err(|e| match e {
                ChainError::TxHashSet(inner) => SyncError::ArchiveInvalid(inner.to_string()),
                ChainError::UnknownHeader(h) => {
                    SyncError::ArchiveInvalid(format!("unknown archive header {h}"))
                }
                other => SyncError::Chain(other),
            })
        })();

        let mut state = self.state.lock().expect("sync lock");
        match result {
            Ok(()) => {
                state.status = SyncStatus::SyncingBlocks;
                state.failed_archive_peers.clear();
                state.archive_attempts = 0;
                state.backoff_until = None;
                Ok(())
            }
            Err(e) => {
                warn!(%from, "archive rejected: {e}");
                state.status = SyncStatus::TxHashSetSyncFailed;
                state.failed_archive_peers.insert(from);
                state.archive_attempts += 1;
                state.backoff_until = Some(Instant::now() + ARCHIVE_RETRY_BACKOFF);
                drop(state);
                self.peers
                    .report_misbehavior(&from, consensus::BAN_THRESHOLD, "invalid archive");
                Err(e)
            }
        }
    }

    /// Serve our archive to a requesting peer.
    pub fn build_archive_response(&self) -> Option<(u64, Hash, Vec<u8>)> {
        let head = self.chain.head().ok()?;
        let archive = self.chain.build_archive().ok()?;
        let bytes = bincode::serialize(&archive).ok()?;
        Some((head.height, head.hash, bytes))
    }
}

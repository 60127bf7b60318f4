//! The chain: best-chain selection, the block processing pipeline, reorgs,
//! and the orphan pool.
//!
//! Block application is strictly serialized on the chain writer (the
//! TxHashSet lock): no two blocks are ever applied concurrently. A block is
//! accepted by staging `{store batch, MMR appends, bitmap updates}` and
//! committing all three together, or discarding all three on any failure.
//! A reorg that fails part-way discards the same way, restoring the exact
//! pre-reorg state.
//!
//! Accepted blocks are announced on a broadcast channel; the pool and the
//! P2P layer subscribe rather than holding pointers back into the chain.

pub mod orphans;

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::consensus;
use crate::core::block::{genesis, BlockHeader, FullBlock};
use crate::core::hash::{Hash, Hashed};
use crate::crypto::commitment::Commitment;
use crate::store::{ChainStore, IndexedBatch, OutputPos, StoreError, Tip};
use crate::txhashset::{Snapshot, TxHashSet, TxHashSetArchive, TxHashSetError};
use crate::validation::{
    self, validate_block, validate_block_self, validate_block_sums, validate_header,
    ValidationError, ValidationMode,
};
use orphans::OrphanPool;

/// Errors from the chain pipeline.
#[derive(Clone, Debug, Error)]
pub enum ChainError {
    #[error("block {0} is an orphan, parent unknown")]
    OrphanBlock(Hash),
    #[error("block already known")]
    AlreadyKnown,
    #[error("unknown header {0}")]
    UnknownHeader(Hash),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    TxHashSet(#[from] TxHashSetError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("consensus invariant broken: {0}")]
    Fatal(String),
}

/// Published on every best-chain change.
#[derive(Clone, Debug)]
pub enum ChainEvent {
    BlockAccepted {
        block: Arc<FullBlock>,
        /// Blocks unwound by a reorg, tip-first. Empty on a plain extension.
        reorged_out: Vec<Arc<FullBlock>>,
    },
}

/// The chain writer and its committed state.
pub struct Chain {
    store: Arc<ChainStore>,
    txhashset: Mutex<TxHashSet>,
    orphans: OrphanPool,
    events: broadcast::Sender<ChainEvent>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Chain {
    /// Open the chain, bootstrapping genesis on first run.
    pub fn init(store: Arc<ChainStore>, txhashset: TxHashSet) -> Result<Self, ChainError> {
        let (events, _) = broadcast::channel(256);
        let chain = Chain {
            store,
            txhashset: Mutex::new(txhashset),
            orphans: OrphanPool::new(),
            events,
        };

        if chain.store.head()?.is_none() {
            let block = genesis();
            info!(hash = %block.hash(), "initializing chain at genesis");
            let mut state = chain.txhashset.lock().expect("chain writer lock");
            let mut batch = IndexedBatch::new(&chain.store);
            state.apply_block(&block, &mut batch)?;
            let tip = Tip::from_header(&block.header);
            batch.inner().save_block(&block);
            batch
                .inner()
                .save_block_sums(&block.hash(), &validation::genesis_block_sums());
            batch.inner().save_height_index(0, &block.hash());
            batch.inner().save_head(&tip);
            batch.inner().save_header_head(&tip);
            state.flush()?;
            batch.commit()?;
        }
        Ok(chain)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &Arc<ChainStore> {
        &self.store
    }

    pub fn head(&self) -> Result<Tip, ChainError> {
        self.store
            .head()?
            .ok_or_else(|| ChainError::Fatal("chain has no head".into()))
    }

    pub fn header_head(&self) -> Result<Tip, ChainError> {
        self.store
            .header_head()?
            .ok_or_else(|| ChainError::Fatal("chain has no header head".into()))
    }

    pub fn head_header(&self) -> Result<BlockHeader, ChainError> {
        let head = self.head()?;
        self.store
            .get_header(&head.hash)?
            .ok_or(ChainError::UnknownHeader(head.hash))
    }

    pub fn get_block(&self, hash: &Hash) -> Result<Option<FullBlock>, ChainError> {
        Ok(self.store.get_block(hash)?)
    }

    pub fn get_header(&self, hash: &Hash) -> Result<Option<BlockHeader>, ChainError> {
        Ok(self.store.get_header(hash)?)
    }

    pub fn get_header_by_height(&self, height: u64) -> Result<Option<BlockHeader>, ChainError> {
        match self.store.header_hash_by_height(height)? {
            Some(hash) => Ok(self.store.get_header(&hash)?),
            None => Ok(None),
        }
    }

    /// Whether a header sits on the current best chain.
    fn on_best_chain(&self, header: &BlockHeader) -> Result<bool, ChainError> {
        Ok(self.store.header_hash_by_height(header.height)? == Some(header.hash()))
    }

    /// An unspent output's position, if the commitment is currently
    /// spendable. This is the read-only UTXO view handed to the pool and
    /// the wallet.
    pub fn get_unspent(&self, commitment: &Commitment) -> Result<Option<OutputPos>, ChainError> {
        match self.store.get_output_pos(commitment)? {
            Some(pos) => {
                let state = self.txhashset.lock().expect("chain writer lock");
                if state.is_unspent(pos.pos) {
                    Ok(Some(pos))
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }

    /// A consistent read view of the UTXO state.
    pub fn utxo_snapshot(&self) -> Result<Snapshot, ChainError> {
        let state = self.txhashset.lock().expect("chain writer lock");
        Ok(state.snapshot()?)
    }

    /// Accept a header during header-first sync. Headers must arrive in
    /// order; the parent has to be known already.
    pub fn process_header(&self, header: &BlockHeader) -> Result<(), ChainError> {
        let hash = header.hash();
        if self.store.header_exists(&hash)? {
            return Err(ChainError::AlreadyKnown);
        }
        let prev = self
            .store
            .get_header(&header.prev_hash)?
            .ok_or(ChainError::UnknownHeader(header.prev_hash))?;
        let window = validation::difficulty_window(&prev, |h| {
            self.store.get_header(h).ok().flatten()
        });
        validate_header(header, &prev, &window, now_secs())?;

        let mut batch = IndexedBatch::new(&self.store);
        batch.inner().save_header(header);
        let tip = Tip::from_header(header);
        let best = self.header_head()?;
        if tip.total_difficulty > best.total_difficulty {
            batch.inner().save_header_head(&tip);
            batch.inner().save_sync_head(&tip);
            // Index header heights beyond the applied chain so block sync
            // can request bodies by height. Heights at or below the block
            // head stay owned by the applied chain.
            if header.height > self.head()?.height {
                batch.inner().save_height_index(header.height, &hash);
            }
        }
        batch.commit()?;
        debug!(height = header.height, hash = %hash, "accepted header");
        Ok(())
    }

    /// Accept a block: validate, apply or reorg, commit atomically, publish.
    ///
    /// Returns the new head tip when the block advanced the best chain.
    pub fn process_block(&self, block: FullBlock) -> Result<Option<Tip>, ChainError> {
        let hash = block.hash();
        if self.store.block_exists(&hash)? {
            return Err(ChainError::AlreadyKnown);
        }

        // A parentless block waits in the orphan pool.
        let prev_header = match self.store.get_header(&block.header.prev_hash)? {
            Some(header) => header,
            None => {
                debug!(hash = %hash, parent = %block.header.prev_hash, "orphan block");
                self.orphans.add(block);
                return Err(ChainError::OrphanBlock(hash));
            }
        };

        let window = validation::difficulty_window(&prev_header, |h| {
            self.store.get_header(h).ok().flatten()
        });
        validate_header(&block.header, &prev_header, &window, now_secs())?;
        validate_block_self(&block)?;

        let head = self.head()?;
        let advanced = if block.header.prev_hash == head.hash {
            self.extend_head(&block, &prev_header)?;
            Some(self.head()?)
        } else if block.header.total_difficulty > head.total_difficulty {
            // A heavier fork: unwind to the common ancestor and switch.
            self.reorg(&block)?;
            Some(self.head()?)
        } else {
            // A side block; keep it around in case its fork wins later.
            let mut batch = IndexedBatch::new(&self.store);
            batch.inner().save_block(&block);
            batch.commit()?;
            debug!(hash = %hash, height = block.height(), "stored side-chain block");
            None
        };

        // A parent arriving may free a waiting child.
        self.promote_orphans(hash);
        Ok(advanced)
    }

    /// Apply a block that extends the current head.
    fn extend_head(&self, block: &FullBlock, prev_header: &BlockHeader) -> Result<(), ChainError> {
        let mut state = self.txhashset.lock().expect("chain writer lock");
        let mut batch = IndexedBatch::new(&self.store);

        let result = self.stage_block(block, prev_header, &mut state, &mut batch);
        match result {
            Ok(()) => {
                let tip = Tip::from_header(&block.header);
                batch.inner().save_head(&tip);
                let header_head = self.header_head()?;
                if tip.total_difficulty > header_head.total_difficulty {
                    batch.inner().save_header_head(&tip);
                }
                state.flush()?;
                batch.commit()?;
                drop(state);
                info!(height = block.height(), hash = %block.hash(), "accepted block");
                let _ = self.events.send(ChainEvent::BlockAccepted {
                    block: Arc::new(block.clone()),
                    reorged_out: vec![],
                });
                Ok(())
            }
            Err(e) => {
                state.discard(&self.store);
                Err(e)
            }
        }
    }

    /// Validate against state and stage one block into `state` + `batch`.
    fn stage_block(
        &self,
        block: &FullBlock,
        prev_header: &BlockHeader,
        state: &mut TxHashSet,
        batch: &mut IndexedBatch<'_>,
    ) -> Result<(), ChainError> {
        validate_block(block, ValidationMode::FullState, Some(batch))?;
        state.apply_block(block, batch)?;

        let prev_sums = batch
            .get_block_sums(&block.header.prev_hash)?
            .ok_or_else(|| ChainError::Fatal("missing parent block sums".into()))?;
        let sums = validate_block_sums(block, &prev_sums, &prev_header.total_kernel_offset)?;

        batch.inner().save_block(block);
        batch.save_block_sums(&block.hash(), &sums);
        batch.inner().save_height_index(block.height(), &block.hash());
        Ok(())
    }

    /// Switch to a heavier fork ending in `fork_tip`.
    ///
    /// The whole reorg is one atomic unit: if any fork block fails
    /// validation, every staged change is discarded and the original chain
    /// remains exactly as it was.
    fn reorg(&self, fork_tip: &FullBlock) -> Result<(), ChainError> {
        // Collect the fork branch back to the first ancestor on the best
        // chain.
        let mut fork_blocks = vec![fork_tip.clone()];
        let ancestor = loop {
            let cursor = fork_blocks.last().expect("nonempty fork branch");
            let prev_hash = cursor.header.prev_hash;
            let prev_header = self
                .store
                .get_header(&prev_hash)?
                .ok_or(ChainError::OrphanBlock(cursor.hash()))?;
            if self.on_best_chain(&prev_header)? {
                break prev_header;
            }
            let prev_block = self
                .store
                .get_block(&prev_hash)?
                .ok_or(ChainError::OrphanBlock(cursor.hash()))?;
            fork_blocks.push(prev_block);
        };
        fork_blocks.reverse();

        let mut state = self.txhashset.lock().expect("chain writer lock");
        let mut batch = IndexedBatch::new(&self.store);

        let result = (|| -> Result<Vec<Arc<FullBlock>>, ChainError> {
            // Unwind the current chain down to the ancestor, tip first,
            // replaying each block's recorded spent set.
            let mut unwound = vec![];
            let mut tip_hash = self.head()?.hash;
            while tip_hash != ancestor.hash() {
                let block = self
                    .store
                    .get_block(&tip_hash)?
                    .ok_or_else(|| ChainError::Fatal("best-chain block missing".into()))?;
                let prev_header = self
                    .store
                    .get_header(&block.header.prev_hash)?
                    .ok_or(ChainError::UnknownHeader(block.header.prev_hash))?;
                let spent = self.store.get_spent_outputs(&tip_hash)?;
                state.rewind_block(&block, &prev_header, &spent, &mut batch)?;
                batch.inner().delete_height_index(block.height());
                tip_hash = block.header.prev_hash;
                unwound.push(Arc::new(block));
            }

            // Apply the fork, oldest first. Self-consistency re-runs inside
            // stage_block for blocks read back from the store.
            let mut prev_header = ancestor.clone();
            for block in &fork_blocks {
                self.stage_block(block, &prev_header, &mut state, &mut batch)
                    .map_err(|e| {
                        warn!(hash = %block.hash(), "fork block failed during reorg: {e}");
                        e
                    })?;
                prev_header = block.header.clone();
            }
            Ok(unwound)
        })();

        match result {
            Ok(unwound) => {
                let tip = Tip::from_header(&fork_tip.header);
                batch.inner().save_head(&tip);
                let header_head = self.header_head()?;
                if tip.total_difficulty > header_head.total_difficulty {
                    batch.inner().save_header_head(&tip);
                }
                state.flush()?;
                batch.commit()?;
                drop(state);
                info!(
                    height = fork_tip.height(),
                    hash = %fork_tip.hash(),
                    unwound = unwound.len(),
                    "reorged to heavier fork"
                );
                let _ = self.events.send(ChainEvent::BlockAccepted {
                    block: Arc::new(fork_tip.clone()),
                    reorged_out: unwound,
                });
                Ok(())
            }
            Err(e) => {
                state.discard(&self.store);
                Err(e)
            }
        }
    }

    /// Re-admit any orphan whose parent just landed, cascading.
    fn promote_orphans(&self, parent: Hash) {
        let mut parents = vec![parent];
        while let Some(parent) = parents.pop() {
            if let Some(child) = self.orphans.take_child_of(&parent) {
                let child_hash = child.hash();
                match self.process_block(child) {
                    Ok(_) => parents.push(child_hash),
                    Err(ChainError::OrphanBlock(_)) | Err(ChainError::AlreadyKnown) => {}
                    Err(e) => warn!(hash = %child_hash, "promoted orphan rejected: {e}"),
                }
            }
        }
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    /// Export the TxHashSet at the current head for a syncing peer.
    pub fn build_archive(&self) -> Result<TxHashSetArchive, ChainError> {
        let head = self.head()?;
        let state = self.txhashset.lock().expect("chain writer lock");
        Ok(state.to_archive(head.hash, &self.store))
    }

    /// Validate a downloaded archive end-to-end against its target header
    /// and swap it into live state.
    ///
    /// The header must already be known from header sync. Nothing is
    /// replaced until the archive fully validates.
    pub fn apply_archive(&self, archive: TxHashSetArchive) -> Result<(), ChainError> {
        let header = self
            .store
            .get_header(&archive.header_hash)?
            .ok_or(ChainError::UnknownHeader(archive.header_hash))?;

        let candidate = TxHashSet::from_archive(&archive)?;
        candidate.validate_full(&header)?;

        let mut batch = IndexedBatch::new(&self.store);
        // Rebuild the output index from the archive.
        let stale: Vec<Commitment> = self.store.output_pos_iter().map(|(c, _)| c).collect();
        for commitment in stale {
            batch.delete_output_pos(&commitment);
        }
        for (commitment, pos) in &archive.output_positions {
            batch.save_output_pos(commitment, pos);
        }
        let tip = Tip::from_header(&header);
        batch.inner().save_head(&tip);
        batch.inner().save_height_index(header.height, &header.hash());

        let mut state = self.txhashset.lock().expect("chain writer lock");
        *state = candidate;
        state.flush()?;
        batch.commit()?;
        drop(state);
        info!(height = header.height, "installed txhashset archive");
        let _ = self.events.send(ChainEvent::BlockAccepted {
            block: Arc::new(FullBlock::new(
                header,
                crate::core::transaction::TransactionBody::empty(),
            )),
            reorged_out: vec![],
        });
        Ok(())
    }

    /// Prune spent outputs beyond the cut-through horizon and compact the
    /// MMR data files.
    pub fn compact(&self) -> Result<(), ChainError> {
        let head = self.head()?;
        let horizon = head.height.saturating_sub(consensus::CUT_THROUGH_HORIZON);
        if horizon == 0 {
            return Ok(());
        }
        let mut prunable = vec![];
        for height in 1..=horizon {
            if let Some(hash) = self.store.header_hash_by_height(height)? {
                for spent in self.store.get_spent_outputs(&hash)? {
                    prunable.push(spent.pos.pos);
                }
            }
        }
        let mut state = self.txhashset.lock().expect("chain writer lock");
        state.compact(&prunable)?;
        state.flush()?;
        Ok(())
    }
}

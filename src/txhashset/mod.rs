//! The TxHashSet: three coordinated MMRs plus the unspent bitmap.
//!
//! - `output` MMR — leaves are output identifiers (features + commitment)
//! - `rangeproof` MMR — leaves are the outputs' range proofs, position-locked
//!   to the output MMR
//! - `kernel` MMR — leaves are kernels, never pruned: the full kernel history
//!
//! The unspent bitmap marks which output leaves are currently spendable.
//! Applying a block consumes inputs before appending outputs, so an output
//! cut through within the block can never transiently appear spendable.
//! Every mutation stages against the MMR backends and is only made durable
//! together with the block database batch; `discard` rolls both back.

use std::collections::BTreeSet;
use std::path::Path;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consensus;
use crate::core::block::{BlockHeader, FullBlock};
use crate::core::hash::{Hash, Hashed};
use crate::core::transaction::{Overage, OutputIdentifier, TxKernel};
use crate::crypto::commitment::Commitment;
use crate::crypto::rangeproof::{self, RangeProof};
use crate::crypto::CryptoError;
use crate::mmr::backend::MmrState;
use crate::mmr::{Backend, FileBackend, MemBackend, MmrError, Pmmr};
use crate::store::{ChainStore, IndexedBatch, OutputPos, SpentOutput, StoreError};

/// Errors from TxHashSet operations.
#[derive(Clone, Debug, Error)]
pub enum TxHashSetError {
    #[error("input not found or already spent: {0}")]
    InputNotFound(Commitment),
    #[error("output commitment already in the unspent set: {0}")]
    DuplicateCommitment(Commitment),
    #[error("{0} root or size does not match the header")]
    RootMismatch(&'static str),
    #[error("coordinated MMRs diverged: {0}")]
    InvariantBroken(&'static str),
    #[error("archive invalid: {0}")]
    InvalidArchive(String),
    #[error(transparent)]
    Mmr(#[from] MmrError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

type BoxBackend = Box<dyn Backend + Send + Sync>;

/// The three roots a header commits to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Roots {
    pub output_root: Hash,
    pub range_proof_root: Hash,
    pub kernel_root: Hash,
}

/// A read-only view for query concurrency: roots, sizes, and the unspent
/// output set at a committed state.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub roots: Roots,
    pub output_mmr_size: u64,
    pub kernel_mmr_size: u64,
    pub unspent: BTreeSet<u64>,
}

impl Snapshot {
    pub fn is_unspent(&self, pos: u64) -> bool {
        self.unspent.contains(&pos)
    }
}

/// Everything needed to reconstruct a TxHashSet at a horizon header.
#[derive(Clone, Serialize, Deserialize)]
pub struct TxHashSetArchive {
    pub header_hash: Hash,
    pub output: MmrState,
    pub rangeproof: MmrState,
    pub kernel: MmrState,
    pub unspent: Vec<u64>,
    /// Output positions with creation heights, for maturity checks after
    /// restore.
    pub output_positions: Vec<(Commitment, OutputPos)>,
}

pub struct TxHashSet {
    output_pmmr: Pmmr<OutputIdentifier, BoxBackend>,
    rproof_pmmr: Pmmr<RangeProof, BoxBackend>,
    kernel_pmmr: Pmmr<TxKernel, BoxBackend>,
    unspent: BTreeSet<u64>,
}

impl TxHashSet {
    /// Open file-backed MMRs under `root_dir/txhashset/{output,rangeproof,kernel}`,
    /// rebuilding the unspent bitmap from the store's output-position index.
    pub fn open(root_dir: &Path, store: &ChainStore) -> Result<Self, TxHashSetError> {
        let base = root_dir.join("txhashset");
        let output: BoxBackend = Box::new(FileBackend::open(&base.join("output"))?);
        let rangeproof: BoxBackend = Box::new(FileBackend::open(&base.join("rangeproof"))?);
        let kernel: BoxBackend = Box::new(FileBackend::open(&base.join("kernel"))?);
        let unspent = store.output_pos_iter().map(|(_, pos)| pos.pos).collect();
        Ok(TxHashSet {
            output_pmmr: Pmmr::new(output)?,
            rproof_pmmr: Pmmr::new(rangeproof)?,
            kernel_pmmr: Pmmr::new(kernel)?,
            unspent,
        })
    }

    /// An in-memory TxHashSet (tests, archive validation).
    pub fn in_memory() -> Result<Self, TxHashSetError> {
        let output: BoxBackend = Box::new(MemBackend::new());
        let rangeproof: BoxBackend = Box::new(MemBackend::new());
        let kernel: BoxBackend = Box::new(MemBackend::new());
        Ok(TxHashSet {
            output_pmmr: Pmmr::new(output)?,
            rproof_pmmr: Pmmr::new(rangeproof)?,
            kernel_pmmr: Pmmr::new(kernel)?,
            unspent: BTreeSet::new(),
        })
    }

    /// Rebuild from an archive image. The caller still has to validate it.
    pub fn from_archive(archive: &TxHashSetArchive) -> Result<Self, TxHashSetError> {
        let output: BoxBackend = Box::new(MemBackend::from_state(archive.output.clone()));
        let rangeproof: BoxBackend = Box::new(MemBackend::from_state(archive.rangeproof.clone()));
        let kernel: BoxBackend = Box::new(MemBackend::from_state(archive.kernel.clone()));
        Ok(TxHashSet {
            output_pmmr: Pmmr::new(output)
                .map_err(|e| TxHashSetError::InvalidArchive(e.to_string()))?,
            rproof_pmmr: Pmmr::new(rangeproof)
                .map_err(|e| TxHashSetError::InvalidArchive(e.to_string()))?,
            kernel_pmmr: Pmmr::new(kernel)
                .map_err(|e| TxHashSetError::InvalidArchive(e.to_string()))?,
            unspent: archive.unspent.iter().copied().collect(),
        })
    }

    /// Export the full state at the current position.
    pub fn to_archive(&self, header_hash: Hash, store: &ChainStore) -> TxHashSetArchive {
        TxHashSetArchive {
            header_hash,
            output: self.output_pmmr.backend().export_state(),
            rangeproof: self.rproof_pmmr.backend().export_state(),
            kernel: self.kernel_pmmr.backend().export_state(),
            unspent: self.unspent.iter().copied().collect(),
            output_positions: store.output_pos_iter().collect(),
        }
    }

    pub fn roots(&self) -> Result<Roots, TxHashSetError> {
        Ok(Roots {
            output_root: self.output_pmmr.root()?,
            range_proof_root: self.rproof_pmmr.root()?,
            kernel_root: self.kernel_pmmr.root()?,
        })
    }

    pub fn output_mmr_size(&self) -> u64 {
        self.output_pmmr.size()
    }

    pub fn kernel_mmr_size(&self) -> u64 {
        self.kernel_pmmr.size()
    }

    pub fn is_unspent(&self, pos: u64) -> bool {
        self.unspent.contains(&pos)
    }

    /// The output identifier at an MMR position, if still present.
    pub fn output_at(&self, pos: u64) -> Option<OutputIdentifier> {
        self.output_pmmr.get_leaf(pos)
    }

    /// A read-only view of the committed state.
    pub fn snapshot(&self) -> Result<Snapshot, TxHashSetError> {
        Ok(Snapshot {
            roots: self.roots()?,
            output_mmr_size: self.output_pmmr.size(),
            kernel_mmr_size: self.kernel_pmmr.size(),
            unspent: self.unspent.clone(),
        })
    }

    /// Apply a block on top of the current state.
    ///
    /// Inputs are consumed first, outputs appended second, kernels last. The
    /// resulting roots and sizes must match the block header exactly. All
    /// store mutations go through `batch`; nothing is durable until the
    /// caller flushes the MMRs and commits the batch together.
    pub fn apply_block(
        &mut self,
        block: &FullBlock,
        batch: &mut IndexedBatch<'_>,
    ) -> Result<(), TxHashSetError> {
        let height = block.height();
        let mut spent_this_block = Vec::with_capacity(block.body.inputs.len());

        for input in &block.body.inputs {
            let pos = batch
                .get_output_pos(&input.commitment)?
                .ok_or(TxHashSetError::InputNotFound(input.commitment))?;
            if !self.unspent.remove(&pos.pos) {
                return Err(TxHashSetError::InputNotFound(input.commitment));
            }
            batch.delete_output_pos(&input.commitment);
            spent_this_block.push(SpentOutput {
                commitment: input.commitment,
                pos,
            });
        }

        for output in &block.body.outputs {
            if let Some(existing) = batch.get_output_pos(&output.commitment)? {
                // A commitment may recur only if its previous instance is no
                // longer unspent (it was consumed above or long ago).
                if self.unspent.contains(&existing.pos) {
                    return Err(TxHashSetError::DuplicateCommitment(output.commitment));
                }
            }
            let out_pos = self.output_pmmr.push(&output.identifier())?;
            let proof_pos = self.rproof_pmmr.push(&output.proof)?;
            if out_pos != proof_pos {
                return Err(TxHashSetError::InvariantBroken(
                    "output and rangeproof MMRs out of step",
                ));
            }
            self.unspent.insert(out_pos);
            batch.save_output_pos(
                &output.commitment,
                &OutputPos {
                    pos: out_pos,
                    height,
                    coinbase: output.is_coinbase(),
                },
            );
        }

        for kernel in &block.body.kernels {
            self.kernel_pmmr.push(kernel)?;
        }

        let header = &block.header;
        if self.output_pmmr.size() != header.output_mmr_size {
            return Err(TxHashSetError::RootMismatch("output size"));
        }
        if self.kernel_pmmr.size() != header.kernel_mmr_size {
            return Err(TxHashSetError::RootMismatch("kernel size"));
        }
        let roots = self.roots()?;
        if roots.output_root != header.output_root {
            return Err(TxHashSetError::RootMismatch("output"));
        }
        if roots.range_proof_root != header.range_proof_root {
            return Err(TxHashSetError::RootMismatch("range proof"));
        }
        if roots.kernel_root != header.kernel_root {
            return Err(TxHashSetError::RootMismatch("kernel"));
        }

        batch.inner().save_spent_outputs(&block.hash(), &spent_this_block);
        Ok(())
    }

    /// Undo one block: re-add its spent outputs, drop its created outputs,
    /// and truncate the MMRs to the parent's sizes.
    ///
    /// Blocks must be unwound tip-first; `spent` is the undo set recorded
    /// when the block was applied.
    pub fn rewind_block(
        &mut self,
        block: &FullBlock,
        prev_header: &BlockHeader,
        spent: &[SpentOutput],
        batch: &mut IndexedBatch<'_>,
    ) -> Result<(), TxHashSetError> {
        // Created outputs disappear with the truncation below; drop their
        // index entries and bits first.
        for output in &block.body.outputs {
            batch.delete_output_pos(&output.commitment);
        }
        self.unspent
            .retain(|pos| *pos < prev_header.output_mmr_size);

        // Spent outputs come back to life exactly where they were.
        for entry in spent {
            batch.save_output_pos(&entry.commitment, &entry.pos);
            self.unspent.insert(entry.pos.pos);
        }
        batch.inner().delete_spent_outputs(&block.hash());

        self.output_pmmr.rewind(prev_header.output_mmr_size)?;
        self.rproof_pmmr.rewind(prev_header.output_mmr_size)?;
        self.kernel_pmmr.rewind(prev_header.kernel_mmr_size)?;
        Ok(())
    }

    /// Prune the given spent output leaf positions and drop their data.
    ///
    /// The caller (the chain) collects positions from the undo sets of
    /// blocks at or below the cut-through horizon; rewind never crosses the
    /// horizon, so pruned data is never needed again. Roots are unaffected
    /// by construction: node hashes stay in place.
    pub fn compact(&mut self, prunable: &[u64]) -> Result<(), TxHashSetError> {
        for &pos in prunable {
            if self.unspent.contains(&pos) {
                return Err(TxHashSetError::InvariantBroken(
                    "attempted to prune an unspent output",
                ));
            }
            if self.output_pmmr.backend().is_pruned(pos) {
                continue;
            }
            self.output_pmmr.prune(pos)?;
            self.rproof_pmmr.prune(pos)?;
        }
        self.output_pmmr.compact()?;
        self.rproof_pmmr.compact()?;
        Ok(())
    }

    /// Persist staged MMR mutations. Called together with the store batch
    /// commit.
    pub fn flush(&mut self) -> Result<(), TxHashSetError> {
        self.output_pmmr.flush()?;
        self.rproof_pmmr.flush()?;
        self.kernel_pmmr.flush()?;
        Ok(())
    }

    /// Drop staged MMR mutations after a failed application.
    pub fn discard(&mut self, store: &ChainStore) {
        self.output_pmmr.discard();
        self.rproof_pmmr.discard();
        self.kernel_pmmr.discard();
        self.unspent = store.output_pos_iter().map(|(_, pos)| pos.pos).collect();
    }

    /// Validate the whole set against a head header: every range proof,
    /// every kernel signature, and the global commitment-sum identity.
    pub fn validate_full(&self, head: &BlockHeader) -> Result<(), TxHashSetError> {
        let roots = self.roots()?;
        if roots.output_root != head.output_root
            || roots.range_proof_root != head.range_proof_root
            || roots.kernel_root != head.kernel_root
            || self.output_pmmr.size() != head.output_mmr_size
            || self.kernel_pmmr.size() != head.kernel_mmr_size
        {
            return Err(TxHashSetError::RootMismatch("full validation"));
        }

        // Batched range proof verification over all unspent outputs.
        let mut proof_pairs = Vec::new();
        for pos in self.output_pmmr.leaf_positions() {
            if !self.unspent.contains(&pos) {
                continue;
            }
            let identifier = self
                .output_pmmr
                .get_leaf(pos)
                .ok_or(TxHashSetError::InvariantBroken("unspent leaf missing"))?;
            let proof = self
                .rproof_pmmr
                .get_leaf(pos)
                .ok_or(TxHashSetError::InvariantBroken("unspent proof missing"))?;
            proof_pairs.push((identifier.commitment, proof));
        }
        rangeproof::verify_batch(&proof_pairs)?;

        // Batched kernel signature verification over the full history.
        let kernels: Vec<TxKernel> = self
            .kernel_pmmr
            .leaf_positions()
            .into_iter()
            .filter_map(|pos| self.kernel_pmmr.get_leaf(pos))
            .collect();
        kernels
            .par_iter()
            .map(|kernel| kernel.verify())
            .collect::<Result<Vec<()>, CryptoError>>()?;

        // Global identity: Σ unspent − supply·H == Σ excess + offset·G.
        let unspent_commitments: Vec<Commitment> = proof_pairs.iter().map(|(c, _)| *c).collect();
        let excesses: Vec<Commitment> = kernels.iter().map(|k| k.excess).collect();
        let supply = head.height.saturating_mul(consensus::REWARD);
        crate::core::transaction::verify_kernel_sums(
            &[],
            &unspent_commitments,
            &excesses,
            Overage::Reward(supply),
            &head.total_kernel_offset,
        )
        .map_err(|e| TxHashSetError::InvalidArchive(e.to_string()))?;
        Ok(())
    }

    /// Fill a header skeleton's roots and sizes from the current state.
    pub fn seal_header(&self, header: &mut BlockHeader) -> Result<(), TxHashSetError> {
        let roots = self.roots()?;
        header.output_root = roots.output_root;
        header.range_proof_root = roots.range_proof_root;
        header.kernel_root = roots.kernel_root;
        header.output_mmr_size = self.output_pmmr.size();
        header.kernel_mmr_size = self.kernel_pmmr.size();
        Ok(())
    }
}

//! Block and header validation.
//!
//! Three tiers, all free functions over data:
//! - header-only: version, timestamps, difficulty retarget, proof of work
//! - self-consistent: everything checkable from the block alone
//! - full-state: the parts that need the UTXO set and the block database
//!
//! The tiers are total and deterministic; callers choose how far to go with
//! [`ValidationMode`].

use rayon::prelude::*;
use thiserror::Error;

use crate::consensus;
use crate::core::block::{BlockHeader, FullBlock};
use crate::core::hash::Hash;
use crate::core::transaction::TxError;
use crate::crypto::commitment::{commit_blind_only, commit_sum, commit_value_only, Commitment};
use crate::crypto::rangeproof;
use crate::crypto::CryptoError;
use crate::store::{BlockSums, IndexedBatch, StoreError};

/// How much of a block to validate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidationMode {
    HeaderOnly,
    SelfConsistent,
    FullState,
}

/// Run the checks a mode implies on a block whose header has already been
/// anchored to its parent. `HeaderOnly` stops there; `SelfConsistent` adds
/// the block-local rules; `FullState` also resolves inputs and maturity
/// through the staged index.
pub fn validate_block(
    block: &FullBlock,
    mode: ValidationMode,
    batch: Option<&IndexedBatch<'_>>,
) -> Result<(), ValidationError> {
    if mode == ValidationMode::HeaderOnly {
        return Ok(());
    }
    validate_block_self(block)?;
    if mode == ValidationMode::FullState {
        let batch = batch.expect("full-state validation requires a staged index");
        validate_block_inputs(block, batch)?;
    }
    Ok(())
}

/// Validation failures. Each variant names the rule that broke.
#[derive(Clone, Debug, Error)]
pub enum ValidationError {
    #[error("unknown header version {0}")]
    UnknownVersion(u16),
    #[error("header height {got} does not follow parent height {parent}")]
    WrongHeight { parent: u64, got: u64 },
    #[error("timestamp not after parent")]
    TimestampTooOld,
    #[error("timestamp more than {0}s in the future")]
    TimestampTooNew(u64),
    #[error("header ancestry root does not chain from parent")]
    WrongPrevRoot,
    #[error("claimed difficulty {got} does not match retarget {want}")]
    WrongDifficulty { want: u64, got: u64 },
    #[error("proof of work does not meet target difficulty")]
    InvalidPow,
    #[error("kernel lock height {lock_height} exceeds block height {height}")]
    KernelLockHeight { lock_height: u64, height: u64 },
    #[error("coinbase spent before maturity")]
    ImmatureCoinbase,
    #[error("input not found in the unspent set: {0}")]
    InputNotFound(Commitment),
    #[error("block sums do not balance")]
    BlockSumMismatch,
    #[error(transparent)]
    Body(#[from] TxError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Validate a header against its parent.
///
/// `window` is the `(timestamp, difficulty)` retarget window ending at the
/// parent, oldest first; `now` is local wall time in seconds.
pub fn validate_header(
    header: &BlockHeader,
    prev: &BlockHeader,
    window: &[(u64, u64)],
    now: u64,
) -> Result<(), ValidationError> {
    if !consensus::valid_header_version(header.version) {
        return Err(ValidationError::UnknownVersion(header.version));
    }
    if header.height != prev.height + 1 {
        return Err(ValidationError::WrongHeight {
            parent: prev.height,
            got: header.height,
        });
    }
    if header.timestamp <= prev.timestamp {
        return Err(ValidationError::TimestampTooOld);
    }
    if header.timestamp > now + consensus::FUTURE_TIME_LIMIT {
        return Err(ValidationError::TimestampTooNew(
            consensus::FUTURE_TIME_LIMIT,
        ));
    }
    if header.prev_root != prev.next_prev_root() {
        return Err(ValidationError::WrongPrevRoot);
    }

    let required = consensus::next_difficulty(window);
    let claimed = header.claimed_difficulty(prev.total_difficulty);
    if claimed != required {
        return Err(ValidationError::WrongDifficulty {
            want: required,
            got: claimed,
        });
    }
    if !header.pow_meets(required) {
        return Err(ValidationError::InvalidPow);
    }
    Ok(())
}

/// Validate everything checkable from the block alone: canonical body,
/// cut-through, weight, kernel features, range proofs, kernel signatures,
/// kernel lock heights, and the coinbase identity.
///
/// The result is cached on the block, so revalidation on another path is a
/// no-op.
pub fn validate_block_self(block: &FullBlock) -> Result<(), ValidationError> {
    if block.was_validated() {
        return Ok(());
    }

    block.body.verify_canonical()?;
    block.body.verify_cut_through()?;
    block.body.verify_weight()?;
    block.body.verify_kernel_features()?;

    for kernel in &block.body.kernels {
        if kernel.lock_height > block.height() {
            return Err(ValidationError::KernelLockHeight {
                lock_height: kernel.lock_height,
                height: block.height(),
            });
        }
    }

    let proof_pairs: Vec<_> = block
        .body
        .outputs
        .iter()
        .map(|o| (o.commitment, o.proof.clone()))
        .collect();
    rangeproof::verify_batch(&proof_pairs)?;

    block
        .body
        .kernels
        .par_iter()
        .map(|kernel| kernel.verify())
        .collect::<Result<Vec<()>, CryptoError>>()?;

    block.verify_coinbase()?;

    block.mark_validated();
    Ok(())
}

/// Validate a block against chain state through the staged index: every
/// input exists unspent and spent coinbases are mature.
///
/// The existence check itself is enforced again inside
/// `TxHashSet::apply_block`; this pass runs first so a bad block fails
/// before any state is staged.
pub fn validate_block_inputs(
    block: &FullBlock,
    batch: &IndexedBatch<'_>,
) -> Result<(), ValidationError> {
    for input in &block.body.inputs {
        let pos = batch
            .get_output_pos(&input.commitment)?
            .ok_or(ValidationError::InputNotFound(input.commitment))?;
        if pos.coinbase && block.height() < pos.height + consensus::COINBASE_MATURITY {
            return Err(ValidationError::ImmatureCoinbase);
        }
    }
    Ok(())
}

/// Chain the block-sum identity forward from the parent's sums.
///
/// Returns the new cumulative sums on success. Both sides are computed
/// independently and compared, so there is no path that trusts the block.
pub fn validate_block_sums(
    block: &FullBlock,
    prev_sums: &BlockSums,
    prev_offset: &crate::crypto::commitment::BlindingFactor,
) -> Result<BlockSums, ValidationError> {
    block.verify_kernel_sums(prev_offset)?;

    let block_offset = crate::crypto::commitment::add_blinding_factors(
        &[block.header.total_kernel_offset.clone()],
        &[prev_offset.clone()],
    );

    let mut utxo_pos = block.output_commitments();
    utxo_pos.push(prev_sums.utxo_sum);
    let mut utxo_neg = block.input_commitments();
    utxo_neg.push(commit_value_only(consensus::REWARD));
    let utxo_sum = commit_sum(&utxo_pos, &utxo_neg)?;

    let mut kernel_pos: Vec<Commitment> = block.body.kernel_excesses();
    kernel_pos.push(prev_sums.kernel_sum);
    if !block_offset.is_zero() {
        kernel_pos.push(commit_blind_only(&block_offset));
    }
    let kernel_sum = commit_sum(&kernel_pos, &[])?;

    if utxo_sum != kernel_sum {
        return Err(ValidationError::BlockSumMismatch);
    }
    Ok(BlockSums {
        utxo_sum,
        kernel_sum,
    })
}

/// The sums of an empty chain (genesis parent).
pub fn genesis_block_sums() -> BlockSums {
    let identity = commit_sum(&[], &[]).expect("identity commitment");
    BlockSums {
        utxo_sum: identity,
        kernel_sum: identity,
    }
}

/// Build the retarget window ending at `prev` by walking parent links
/// through `get_header`.
pub fn difficulty_window<F>(prev: &BlockHeader, get_header: F) -> Vec<(u64, u64)>
where
    F: Fn(&Hash) -> Option<BlockHeader>,
{
    let mut window = Vec::with_capacity(consensus::DIFFICULTY_ADJUST_WINDOW as usize + 1);
    let mut cursor = prev.clone();
    loop {
        let difficulty = if cursor.height == 0 {
            consensus::GENESIS_DIFFICULTY
        } else {
            match get_header(&cursor.prev_hash) {
                Some(parent) => {
                    let d = cursor.claimed_difficulty(parent.total_difficulty);
                    window.push((cursor.timestamp, d));
                    if window.len() as u64 > consensus::DIFFICULTY_ADJUST_WINDOW {
                        break;
                    }
                    cursor = parent;
                    continue;
                }
                None => consensus::GENESIS_DIFFICULTY,
            }
        };
        window.push((cursor.timestamp, difficulty));
        break;
    }
    window.reverse();
    window
}

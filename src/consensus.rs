//! Consensus rules and constants.
//!
//! Everything in this module is consensus-critical: block reward and fee
//! policy, body weight accounting, coinbase maturity, the cut-through
//! horizon, and the damped moving-average difficulty retarget.

use crate::core::hash::{Hash, ZERO_HASH};
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};

/// Base units per coin.
pub const COIN: u64 = 1_000_000_000;

/// Block subsidy paid to the coinbase kernel of every block.
pub const REWARD: u64 = 60 * COIN;

/// Target seconds between blocks.
pub const BLOCK_TIME_SEC: u64 = 60;

/// Number of blocks in a nominal day.
pub const DAY_HEIGHT: u64 = 24 * 3600 / BLOCK_TIME_SEC;

/// A coinbase output may not be spent until this many blocks after the block
/// that created it.
pub const COINBASE_MATURITY: u64 = DAY_HEIGHT;

/// Blocks behind the tip beyond which spent outputs may be pruned and past
/// which a new node fetches a TxHashSet archive instead of full blocks.
pub const CUT_THROUGH_HORIZON: u64 = 48 * 3600 / BLOCK_TIME_SEC;

/// Maximum seconds a header timestamp may lie in the future of local time.
pub const FUTURE_TIME_LIMIT: u64 = 12 * BLOCK_TIME_SEC;

/// Weight of a block input.
pub const INPUT_WEIGHT: u64 = 1;
/// Weight of a block output (dominated by its range proof).
pub const OUTPUT_WEIGHT: u64 = 21;
/// Weight of a kernel.
pub const KERNEL_WEIGHT: u64 = 3;

/// Maximum total weight of a block body, coinbase included.
pub const MAX_BLOCK_WEIGHT: u64 = 40_000;

/// Fee charged per unit of transaction weight by the relay policy.
pub const MIN_FEE_PER_WEIGHT: u64 = 1_000;

/// Headers per difficulty adjustment window.
pub const DIFFICULTY_ADJUST_WINDOW: u64 = 60;

/// Ideal span of a full adjustment window, in seconds.
pub const BLOCK_TIME_WINDOW: u64 = DIFFICULTY_ADJUST_WINDOW * BLOCK_TIME_SEC;

/// Damping factor applied to the observed window span.
pub const DAMP_FACTOR: u64 = 3;

/// Clamp bound on the damped window span, as a factor of the ideal span.
pub const CLAMP_FACTOR: u64 = 2;

/// Floor for per-block difficulty.
pub const MIN_DIFFICULTY: u64 = 1;

/// Difficulty assigned to the genesis block.
pub const GENESIS_DIFFICULTY: u64 = MIN_DIFFICULTY;

/// Header protocol versions this node accepts.
pub const VALID_HEADER_VERSIONS: std::ops::RangeInclusive<u16> = 1..=1;

/// Headers requested per sync batch.
pub const HEADER_BATCH_SIZE: u64 = 512;

/// Total-difficulty lead a peer must advertise before header sync starts.
pub const HEADER_SYNC_THRESHOLD: u64 = 1;

/// Ban score at which a peer is banned outright.
pub const BAN_THRESHOLD: u32 = 100;

/// Total block subsidy plus fees claimable by a block's coinbase.
pub fn block_reward(fee_sum: u64) -> u64 {
    REWARD.saturating_add(fee_sum)
}

/// Body weight from element counts.
pub fn body_weight(inputs: u64, outputs: u64, kernels: u64) -> u64 {
    inputs * INPUT_WEIGHT + outputs * OUTPUT_WEIGHT + kernels * KERNEL_WEIGHT
}

/// Minimum fee the relay policy accepts for a transaction of the given weight.
pub fn min_relay_fee(weight: u64) -> u64 {
    weight.saturating_mul(MIN_FEE_PER_WEIGHT)
}

/// Whether a header version is recognized by this node.
pub fn valid_header_version(version: u16) -> bool {
    VALID_HEADER_VERSIONS.contains(&version)
}

fn damp(actual: u64, goal: u64) -> u64 {
    (actual + (DAMP_FACTOR - 1) * goal) / DAMP_FACTOR
}

fn clamp(actual: u64, goal: u64) -> u64 {
    actual.clamp(goal / CLAMP_FACTOR, goal.saturating_mul(CLAMP_FACTOR))
}

/// Difficulty for the next block from the most recent window of headers.
///
/// `window` is `(timestamp, difficulty)` pairs ordered oldest first, ideally
/// `DIFFICULTY_ADJUST_WINDOW + 1` of them. The observed window span is damped
/// toward the ideal span and clamped, then the summed window difficulty is
/// rescaled onto the target block time.
pub fn next_difficulty(window: &[(u64, u64)]) -> u64 {
    if window.len() < 2 {
        return MIN_DIFFICULTY;
    }
    let ts_delta = window[window.len() - 1].0.saturating_sub(window[0].0).max(1);
    let diff_sum: u64 = window.iter().skip(1).map(|(_, d)| *d).sum();

    // Rescale the ideal span to however many intervals we actually have so
    // early chains (fewer than a full window of headers) retarget sanely.
    let goal = (window.len() as u64 - 1) * BLOCK_TIME_SEC;
    let adj_ts = clamp(damp(ts_delta, goal), goal);

    (diff_sum.saturating_mul(BLOCK_TIME_SEC) / adj_ts.max(1)).max(MIN_DIFFICULTY)
}

type Blake2b256 = Blake2b<U32>;

/// Digest a header's pre-PoW serialization with a nonce.
///
/// The chain commits to a hash target: a header's work is the scaled
/// inverse of its digest, so difficulty comparisons and retargeting work
/// over plain digests.
pub fn pow_digest(pre_pow: &[u8], nonce: u64) -> Hash {
    let mut hasher = Blake2b256::new();
    hasher.update(pre_pow);
    hasher.update(nonce.to_be_bytes());
    let out = hasher.finalize();
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&out);
    Hash::from_bytes(bytes)
}

/// Difficulty achieved by a PoW digest: the scaled inverse of its leading
/// 64 bits. An all-zero prefix maxes out rather than dividing by zero.
pub fn pow_difficulty(digest: &Hash) -> u64 {
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.as_bytes()[..8]);
    let num = u64::from_be_bytes(prefix);
    if num == 0 {
        u64::MAX
    } else {
        u64::MAX / num
    }
}

/// Difficulty achieved by a digest under a secondary scaling factor.
pub fn pow_difficulty_scaled(digest: &Hash, scaling: u32) -> u64 {
    pow_difficulty(digest).saturating_mul(scaling.max(1) as u64)
}

/// Hash of the empty MMR, used for genesis roots.
pub fn empty_mmr_root() -> Hash {
    ZERO_HASH
}

//! Block headers and full blocks.
//!
//! A header commits to the three TxHashSet roots, the cumulative kernel
//! offset, the MMR sizes, and the proof of work. A full block is a header
//! plus a transaction body; its hash is its header's hash.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::consensus;
use crate::core::hash::{hash_bytes, DefaultHashable, Hash, Hashed, ZERO_HASH};
use crate::core::transaction::{
    Overage, Transaction, TransactionBody, TxError,
};
use crate::crypto::commitment::{
    add_blinding_factors, commit_sum, commit_value_only, BlindingFactor, Commitment,
};
use crate::ser::{self, Readable, Reader, SerError, Writeable, Writer};

/// A block header.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BlockHeader {
    pub version: u16,
    pub height: u64,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
    pub prev_hash: Hash,
    /// Running commitment to the whole header ancestry:
    /// `H(prev.prev_root || prev_hash)`.
    pub prev_root: Hash,
    pub output_root: Hash,
    pub range_proof_root: Hash,
    pub kernel_root: Hash,
    /// Cumulative kernel offset over the whole chain up to this block.
    pub total_kernel_offset: BlindingFactor,
    pub output_mmr_size: u64,
    pub kernel_mmr_size: u64,
    /// Cumulative chain difficulty including this block.
    pub total_difficulty: u64,
    /// Secondary proof-of-work scaling factor.
    pub scaling_difficulty: u32,
    pub nonce: u64,
    /// The proof-of-work digest over `pre_pow() || nonce`.
    pub pow: Hash,
}

impl BlockHeader {
    /// Serialization of everything the proof of work commits to.
    pub fn pre_pow(&self) -> Vec<u8> {
        let mut writer = Writer::new();
        writer.write_u16(self.version);
        writer.write_u64(self.height);
        writer.write_u64(self.timestamp);
        self.prev_hash.write(&mut writer);
        self.prev_root.write(&mut writer);
        self.output_root.write(&mut writer);
        self.range_proof_root.write(&mut writer);
        self.kernel_root.write(&mut writer);
        self.total_kernel_offset.write(&mut writer);
        writer.write_u64(self.output_mmr_size);
        writer.write_u64(self.kernel_mmr_size);
        writer.write_u64(self.total_difficulty);
        writer.write_u32(self.scaling_difficulty);
        writer.into_vec()
    }

    /// The difficulty this single block claims over its parent.
    pub fn claimed_difficulty(&self, prev_total: u64) -> u64 {
        self.total_difficulty.saturating_sub(prev_total)
    }

    /// Whether the PoW digest is consistent and meets `target` under the
    /// header's scaling factor.
    pub fn pow_meets(&self, target: u64) -> bool {
        let digest = consensus::pow_digest(&self.pre_pow(), self.nonce);
        digest == self.pow
            && consensus::pow_difficulty_scaled(&digest, self.scaling_difficulty) >= target
    }

    /// The header-ancestry root a child of this header must carry.
    pub fn next_prev_root(&self) -> Hash {
        let mut data = Vec::with_capacity(64);
        data.extend_from_slice(self.prev_root.as_bytes());
        data.extend_from_slice(self.hash().as_bytes());
        hash_bytes(&data)
    }
}

impl Writeable for BlockHeader {
    fn write(&self, writer: &mut Writer) {
        writer.write_fixed(&self.pre_pow());
        writer.write_u64(self.nonce);
        self.pow.write(writer);
    }
}

impl Readable for BlockHeader {
    fn read(reader: &mut Reader<'_>) -> Result<Self, SerError> {
        let version = reader.read_u16()?;
        let height = reader.read_u64()?;
        let timestamp = reader.read_u64()?;
        let prev_hash = Hash::read(reader)?;
        let prev_root = Hash::read(reader)?;
        let output_root = Hash::read(reader)?;
        let range_proof_root = Hash::read(reader)?;
        let kernel_root = Hash::read(reader)?;
        let total_kernel_offset = BlindingFactor::read(reader)?;
        let output_mmr_size = reader.read_u64()?;
        let kernel_mmr_size = reader.read_u64()?;
        let total_difficulty = reader.read_u64()?;
        let scaling_difficulty = reader.read_u32()?;
        let nonce = reader.read_u64()?;
        let pow = Hash::read(reader)?;
        Ok(BlockHeader {
            version,
            height,
            timestamp,
            prev_hash,
            prev_root,
            output_root,
            range_proof_root,
            kernel_root,
            total_kernel_offset,
            output_mmr_size,
            kernel_mmr_size,
            total_difficulty,
            scaling_difficulty,
            nonce,
            pow,
        })
    }
}

impl DefaultHashable for BlockHeader {}

/// A header plus its body. The self-consistency result is cached so a block
/// revalidated on a second path is a no-op.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct FullBlock {
    pub header: BlockHeader,
    pub body: TransactionBody,
    #[serde(skip)]
    validated: AtomicBool,
}

impl Clone for FullBlock {
    fn clone(&self) -> Self {
        FullBlock {
            header: self.header.clone(),
            body: self.body.clone(),
            validated: AtomicBool::new(self.validated.load(Ordering::Relaxed)),
        }
    }
}

impl PartialEq for FullBlock {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header && self.body == other.body
    }
}

impl FullBlock {
    pub fn new(header: BlockHeader, body: TransactionBody) -> Self {
        FullBlock {
            header,
            body,
            validated: AtomicBool::new(false),
        }
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn was_validated(&self) -> bool {
        self.validated.load(Ordering::Acquire)
    }

    pub fn mark_validated(&self) {
        self.validated.store(true, Ordering::Release);
    }

    pub fn total_fees(&self) -> Result<u64, TxError> {
        self.body.fee()
    }

    pub fn input_commitments(&self) -> Vec<Commitment> {
        self.body.input_commitments()
    }

    pub fn output_commitments(&self) -> Vec<Commitment> {
        self.body.output_commitments()
    }

    /// Coinbase identity: coinbase-marked outputs balance the
    /// coinbase-marked kernels plus `(reward + fees)·H`.
    pub fn verify_coinbase(&self) -> Result<(), TxError> {
        let coinbase_outputs: Vec<Commitment> = self
            .body
            .outputs
            .iter()
            .filter(|o| o.is_coinbase())
            .map(|o| o.commitment)
            .collect();
        let coinbase_excesses: Vec<Commitment> = self
            .body
            .kernels
            .iter()
            .filter(|k| k.is_coinbase())
            .map(|k| k.excess)
            .collect();
        if coinbase_outputs.is_empty() != coinbase_excesses.is_empty() {
            return Err(TxError::CoinbaseSumMismatch);
        }
        if coinbase_outputs.is_empty() {
            return Ok(());
        }

        let reward = consensus::block_reward(self.total_fees()?);
        let output_adjusted = commit_sum(&coinbase_outputs, &[commit_value_only(reward)])?;
        let kernel_sum = commit_sum(&coinbase_excesses, &[])?;
        if output_adjusted != kernel_sum {
            return Err(TxError::CoinbaseSumMismatch);
        }
        Ok(())
    }

    /// The block-scope commitment-sum identity:
    /// `Σ outputs − Σ inputs − reward·H == Σ excess + block_offset·G`,
    /// where `block_offset` is the header's cumulative offset minus the
    /// parent's. Fees cancel between transaction kernels and the coinbase
    /// output, leaving only the subsidy as overage.
    pub fn verify_kernel_sums(&self, prev_offset: &BlindingFactor) -> Result<(), TxError> {
        let block_offset = add_blinding_factors(
            &[self.header.total_kernel_offset.clone()],
            &[prev_offset.clone()],
        );
        crate::core::transaction::verify_kernel_sums(
            &self.body.input_commitments(),
            &self.body.output_commitments(),
            &self.body.kernel_excesses(),
            Overage::Reward(consensus::REWARD),
            &block_offset,
        )
    }
}

impl Writeable for FullBlock {
    fn write(&self, writer: &mut Writer) {
        self.header.write(writer);
        self.body.write(writer);
    }
}

impl Readable for FullBlock {
    fn read(reader: &mut Reader<'_>) -> Result<Self, SerError> {
        let header = BlockHeader::read(reader)?;
        let body = TransactionBody::read(reader)?;
        Ok(FullBlock::new(header, body))
    }
}

/// The genesis block: an empty body over empty MMRs.
pub fn genesis() -> FullBlock {
    let mut header = BlockHeader {
        version: 1,
        height: 0,
        timestamp: 1_700_000_000,
        prev_hash: ZERO_HASH,
        prev_root: ZERO_HASH,
        output_root: consensus::empty_mmr_root(),
        range_proof_root: consensus::empty_mmr_root(),
        kernel_root: consensus::empty_mmr_root(),
        total_kernel_offset: BlindingFactor::zero(),
        output_mmr_size: 0,
        kernel_mmr_size: 0,
        total_difficulty: consensus::GENESIS_DIFFICULTY,
        scaling_difficulty: 1,
        nonce: 0,
        pow: ZERO_HASH,
    };
    header.pow = consensus::pow_digest(&header.pre_pow(), header.nonce);
    FullBlock::new(header, TransactionBody::empty())
}

/// The genesis block hash, compared during the P2P handshake.
pub fn genesis_hash() -> Hash {
    genesis().hash()
}

/// Assemble a block on `prev` from a template transaction (the aggregated
/// pool contents) plus a coinbase output and kernel.
///
/// Roots and MMR sizes are left zeroed; the chain pipeline fills them in
/// after applying the body against the parent state.
pub fn build_block_skeleton(
    prev: &BlockHeader,
    transactions: &[Transaction],
    coinbase_output: crate::core::transaction::Output,
    coinbase_kernel: crate::core::transaction::TxKernel,
    timestamp: u64,
    difficulty: u64,
) -> Result<FullBlock, TxError> {
    let agg = crate::core::transaction::aggregate(transactions)?;
    let inputs = agg.body.inputs.clone();
    let mut outputs = agg.body.outputs.clone();
    let mut kernels = agg.body.kernels.clone();
    outputs.push(coinbase_output);
    kernels.push(coinbase_kernel);
    let body = TransactionBody::new(inputs, outputs, kernels)?;

    let total_kernel_offset =
        add_blinding_factors(&[prev.total_kernel_offset.clone(), agg.offset.clone()], &[]);

    let header = BlockHeader {
        version: 1,
        height: prev.height + 1,
        timestamp,
        prev_hash: prev.hash(),
        prev_root: prev.next_prev_root(),
        output_root: ZERO_HASH,
        range_proof_root: ZERO_HASH,
        kernel_root: ZERO_HASH,
        total_kernel_offset,
        output_mmr_size: 0,
        kernel_mmr_size: 0,
        total_difficulty: prev.total_difficulty.saturating_add(difficulty),
        scaling_difficulty: 1,
        nonce: 0,
        pow: ZERO_HASH,
    };
    Ok(FullBlock::new(header, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transaction::test_util::*;
    use crate::core::transaction::{KernelFeatures, OutputFeatures};

    fn coinbase_parts(fees: u64) -> (crate::core::transaction::Output, crate::core::transaction::TxKernel) {
        let blind = BlindingFactor::from_bytes([42u8; 32]);
        let reward = consensus::block_reward(fees);
        let output = build_output(reward, &blind, OutputFeatures::Coinbase);
        let kernel = build_kernel(KernelFeatures::Coinbase, 0, 0, &blind);
        (output, kernel)
    }

    #[test]
    fn genesis_is_stable() {
        let g1 = genesis();
        let g2 = genesis();
        assert_eq!(g1.hash(), g2.hash());
        assert_eq!(g1.height(), 0);
        assert_eq!(g1.header.total_difficulty, consensus::GENESIS_DIFFICULTY);
    }

    #[test]
    fn header_roundtrip_byte_equal() {
        let header = genesis().header;
        let bytes = ser::ser_vec(&header);
        let header2: BlockHeader = ser::deser(&bytes).unwrap();
        assert_eq!(header2, header);
        assert_eq!(ser::ser_vec(&header2), bytes);
    }

    #[test]
    fn block_roundtrip() {
        let g = genesis();
        let bytes = ser::ser_vec(&g);
        let block: FullBlock = ser::deser(&bytes).unwrap();
        assert_eq!(block, g);
    }

    #[test]
    fn coinbase_identity_holds() {
        let (output, kernel) = coinbase_parts(0);
        let body = TransactionBody::new(vec![], vec![output], vec![kernel]).unwrap();
        let mut header = genesis().header;
        header.height = 1;
        let block = FullBlock::new(header, body);
        block.verify_coinbase().unwrap();
    }

    #[test]
    fn coinbase_identity_rejects_inflation() {
        let blind = BlindingFactor::from_bytes([42u8; 32]);
        // Claim one extra unit over the subsidy.
        let output = build_output(consensus::REWARD + 1, &blind, OutputFeatures::Coinbase);
        let kernel = build_kernel(KernelFeatures::Coinbase, 0, 0, &blind);
        let body = TransactionBody::new(vec![], vec![output], vec![kernel]).unwrap();
        let block = FullBlock::new(genesis().header, body);
        assert!(matches!(
            block.verify_coinbase(),
            Err(TxError::CoinbaseSumMismatch)
        ));
    }

    #[test]
    fn coinbase_output_without_kernel_rejected() {
        let blind = BlindingFactor::from_bytes([42u8; 32]);
        let output = build_output(consensus::REWARD, &blind, OutputFeatures::Coinbase);
        let body = TransactionBody::new(vec![], vec![output], vec![]).unwrap();
        let block = FullBlock::new(genesis().header, body);
        assert!(block.verify_coinbase().is_err());
    }

    #[test]
    fn block_kernel_sums_with_tx_and_coinbase() {
        // One transaction plus a fee-claiming coinbase balances at block scope.
        let tx = build_tx(
            100_000,
            &BlindingFactor::from_bytes([1u8; 32]),
            &BlindingFactor::from_bytes([2u8; 32]),
            8_000,
        );
        let prev = genesis().header;
        let (output, kernel) = coinbase_parts(8_000);
        let block =
            build_block_skeleton(&prev, &[tx], output, kernel, prev.timestamp + 60, 1).unwrap();
        block
            .verify_kernel_sums(&prev.total_kernel_offset)
            .unwrap();
        block.verify_coinbase().unwrap();
    }

    #[test]
    fn validated_flag_persists_across_clone() {
        let block = genesis();
        assert!(!block.was_validated());
        block.mark_validated();
        assert!(block.was_validated());
        assert!(block.clone().was_validated());
    }

    #[test]
    fn prev_root_chains_headers() {
        let g = genesis().header;
        let child_root = g.next_prev_root();
        assert_ne!(child_root, g.prev_root);
        // Deterministic.
        assert_eq!(child_root, g.next_prev_root());
    }
}

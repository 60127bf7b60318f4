//! Shared helpers for integration tests: deterministic transaction builders
//! and a shadow-state harness that seals valid blocks against a mirror of
//! the chain state.
#![allow(dead_code)]

use mimble::consensus;
use mimble::core::block::{build_block_skeleton, genesis, BlockHeader, FullBlock};
use mimble::core::transaction::{
    kernel_sig_msg, Input, KernelFeatures, Output, OutputFeatures, Transaction, TransactionBody,
    TxKernel,
};
use mimble::crypto::commitment::{
    add_blinding_factors, commit, commit_blind_only, BlindingFactor,
};
use mimble::crypto::keys::SecretKey;
use mimble::crypto::rangeproof::{self, PROOF_MESSAGE_LEN};
use mimble::crypto::schnorr;
use mimble::core::hash::{hash_bytes, Hashed};
use mimble::store::{ChainStore, IndexedBatch};
use mimble::txhashset::{TxHashSet, TxHashSetError};
use mimble::validation;

pub fn build_output(value: u64, blinding: &BlindingFactor, features: OutputFeatures) -> Output {
    let commitment = commit(value, blinding);
    let nonce = hash_bytes(b"integration rewind nonce");
    let proof = rangeproof::prove(value, blinding, &nonce, &[0u8; PROOF_MESSAGE_LEN]).unwrap();
    Output {
        features,
        commitment,
        proof,
    }
}

pub fn build_kernel(
    features: KernelFeatures,
    fee: u64,
    lock_height: u64,
    excess_blind: &BlindingFactor,
) -> TxKernel {
    let excess = commit_blind_only(excess_blind);
    let msg = kernel_sig_msg(features, fee, lock_height);
    let sig = schnorr::sign_single(&SecretKey::from(excess_blind), &msg);
    TxKernel {
        features,
        fee,
        lock_height,
        excess,
        excess_sig: sig,
    }
}

/// A valid single-party transaction spending `input_value` under
/// `input_blind` into one output plus fee.
pub fn build_tx(
    input_value: u64,
    input_blind: &BlindingFactor,
    input_features: OutputFeatures,
    output_blind: &BlindingFactor,
    fee: u64,
) -> Transaction {
    let input = Input {
        features: input_features,
        commitment: commit(input_value, input_blind),
    };
    let output = build_output(input_value - fee, output_blind, OutputFeatures::Plain);

    let offset = BlindingFactor::random();
    let excess_blind = add_blinding_factors(
        &[output_blind.clone()],
        &[input_blind.clone(), offset.clone()],
    );
    let kernel = build_kernel(KernelFeatures::Plain, fee, 0, &excess_blind);
    let body = TransactionBody::new(vec![input], vec![output], vec![kernel]).unwrap();
    Transaction::new(offset, body)
}

/// A mirror of chain state used to seal headers (roots, sizes, difficulty,
/// proof of work) for blocks the tests then feed to a real chain.
pub struct Harness {
    pub store: ChainStore,
    pub state: TxHashSet,
}

impl Harness {
    pub fn new() -> Self {
        let store = ChainStore::open_temporary().unwrap();
        let state = TxHashSet::in_memory().unwrap();
        let mut harness = Harness { store, state };
        harness.apply(&genesis());
        harness
    }

    fn required_difficulty(&self, prev: &BlockHeader) -> u64 {
        let window =
            validation::difficulty_window(prev, |h| self.store.get_header(h).ok().flatten());
        consensus::next_difficulty(&window)
    }

    /// Build a sealed, fully valid child of `prev` carrying `txs` and a
    /// coinbase derived from `coinbase_seed`. Does not advance the harness.
    pub fn build_block(
        &mut self,
        prev: &BlockHeader,
        txs: &[Transaction],
        coinbase_seed: u8,
    ) -> FullBlock {
        let fees: u64 = txs.iter().map(|t| t.fee().unwrap()).sum();
        let blind = BlindingFactor::from_bytes([coinbase_seed; 32]);
        let reward = consensus::block_reward(fees);
        let coinbase_out = build_output(reward, &blind, OutputFeatures::Coinbase);
        let coinbase_kernel = build_kernel(KernelFeatures::Coinbase, 0, 0, &blind);

        let difficulty = self.required_difficulty(prev);
        let mut block = build_block_skeleton(
            prev,
            txs,
            coinbase_out,
            coinbase_kernel,
            prev.timestamp + consensus::BLOCK_TIME_SEC,
            difficulty,
        )
        .unwrap();

        // Dry-run against the shadow state to learn the roots and sizes,
        // then discard the staging.
        let mut batch = IndexedBatch::new(&self.store);
        let result = self.state.apply_block(&block, &mut batch);
        assert!(
            matches!(result, Err(TxHashSetError::RootMismatch(_))),
            "dry run should stop at root comparison: {result:?}"
        );
        self.state.seal_header(&mut block.header).unwrap();
        self.state.discard(&self.store);

        // Seal the proof of work.
        loop {
            let digest = consensus::pow_digest(&block.header.pre_pow(), block.header.nonce);
            if consensus::pow_difficulty_scaled(&digest, block.header.scaling_difficulty)
                >= difficulty
            {
                block.header.pow = digest;
                break;
            }
            block.header.nonce += 1;
        }
        block
    }

    /// Advance the shadow state by a sealed block.
    pub fn apply(&mut self, block: &FullBlock) {
        let mut batch = IndexedBatch::new(&self.store);
        self.state.apply_block(block, &mut batch).unwrap();
        batch.inner().save_block(block);
        self.state.flush().unwrap();
        batch.commit().unwrap();
    }

    /// Build and immediately apply, returning the block.
    pub fn extend(
        &mut self,
        prev: &BlockHeader,
        txs: &[Transaction],
        coinbase_seed: u8,
    ) -> FullBlock {
        let block = self.build_block(prev, txs, coinbase_seed);
        self.apply(&block);
        block
    }

    pub fn genesis_header(&self) -> BlockHeader {
        genesis().header
    }
}

/// The commitment of the coinbase output minted with `seed` and `fees`.
pub fn coinbase_commitment(seed: u8, fees: u64) -> mimble::crypto::commitment::Commitment {
    commit(
        consensus::block_reward(fees),
        &BlindingFactor::from_bytes([seed; 32]),
    )
}

/// Quick hash accessor used across tests.
pub fn block_hash(block: &FullBlock) -> mimble::core::hash::Hash {
    block.hash()
}

#[allow(dead_code)]
pub fn header_hash(header: &BlockHeader) -> mimble::core::hash::Hash {
    header.hash()
}

//! The transaction pool: a public mempool and a Dandelion stempool.
//!
//! Acceptance requires a fully self-valid transaction whose inputs resolve
//! either to unspent chain outputs or to outputs produced by earlier pool
//! transactions, with no double spend inside the pool. Conflicts resolve by
//! fee rate: the cheaper transaction (and everything chained on it) is
//! evicted. Pool mutations are serialized behind one lock; the chain feeds
//! the pool through `reconcile` on every best-chain change.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::debug;

use crate::chain::{Chain, ChainError};
use crate::consensus;
use crate::core::hash::{Hash, Hashed};
use crate::core::transaction::{
    self, KernelFeatures, OutputFeatures, Transaction, TxError,
};
use crate::crypto::commitment::{add_blinding_factors, Commitment};
use crate::store::OutputPos;

/// Errors from pool operations.
#[derive(Clone, Debug, Error)]
pub enum PoolError {
    #[error("transaction already in pool")]
    Duplicate,
    #[error("transaction fee {fee} below relay minimum {min_fee}")]
    FeeTooLow { fee: u64, min_fee: u64 },
    #[error("input not found on chain or in pool: {0}")]
    InputNotFound(Commitment),
    #[error("input double-spends pool transaction")]
    DoubleSpend(Commitment),
    #[error("coinbase spent before maturity")]
    ImmatureCoinbase,
    #[error("kernel lock height {0} not yet reached")]
    ImmatureTransaction(u64),
    #[error("coinbase features have no place in pool transactions")]
    CoinbaseInPool,
    #[error("pool full and fee rate too low to displace anything")]
    OverCapacity,
    #[error(transparent)]
    Tx(#[from] TxError),
    #[error("chain query failed: {0}")]
    Chain(String),
}

/// Read-only chain view the pool depends on.
pub trait BlockchainView: Send + Sync {
    fn head_height(&self) -> Result<u64, PoolError>;
    fn get_unspent(&self, commitment: &Commitment) -> Result<Option<OutputPos>, PoolError>;
}

impl BlockchainView for Chain {
    fn head_height(&self) -> Result<u64, PoolError> {
        self.head()
            .map(|tip| tip.height)
            .map_err(|e: ChainError| PoolError::Chain(e.to_string()))
    }

    fn get_unspent(&self, commitment: &Commitment) -> Result<Option<OutputPos>, PoolError> {
        Chain::get_unspent(self, commitment).map_err(|e| PoolError::Chain(e.to_string()))
    }
}

/// Pool configuration.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Total weight cap across the mempool.
    pub max_pool_weight: u64,
    /// Cap on evictions a single insert may trigger.
    pub max_evictions: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_pool_weight: 4 * consensus::MAX_BLOCK_WEIGHT,
            max_evictions: 32,
        }
    }
}

#[derive(Clone, Debug)]
struct PoolEntry {
    tx: Transaction,
    hash: Hash,
    fee: u64,
    weight: u64,
    at: u64,
}

impl PoolEntry {
    /// Integer-scaled fee per weight for conflict resolution.
    fn fee_rate(&self) -> u64 {
        self.fee.saturating_mul(1_000) / self.weight.max(1)
    }
}

/// One tier of the pool (mempool or stempool).
#[derive(Default)]
struct Tier {
    entries: Vec<PoolEntry>,
    /// input commitment -> spending tx hash
    spent: HashMap<Commitment, Hash>,
    /// output commitment -> producing tx hash
    produced: HashMap<Commitment, Hash>,
}

impl Tier {
    fn contains(&self, hash: &Hash) -> bool {
        self.entries.iter().any(|e| e.hash == *hash)
    }

    fn total_weight(&self) -> u64 {
        self.entries.iter().map(|e| e.weight).sum()
    }

    fn insert(&mut self, entry: PoolEntry) {
        for input in &entry.tx.body.inputs {
            self.spent.insert(input.commitment, entry.hash);
        }
        for output in &entry.tx.body.outputs {
            self.produced.insert(output.commitment, entry.hash);
        }
        self.entries.push(entry);
    }

    /// Remove a transaction and everything chained on its outputs.
    /// Returns removed entry count.
    fn remove_with_descendants(&mut self, hash: &Hash) -> usize {
        let mut doomed = vec![*hash];
        let mut removed = 0;
        while let Some(target) = doomed.pop() {
            let Some(idx) = self.entries.iter().position(|e| e.hash == target) else {
                continue;
            };
            let entry = self.entries.remove(idx);
            removed += 1;
            for input in &entry.tx.body.inputs {
                self.spent.remove(&input.commitment);
            }
            for output in &entry.tx.body.outputs {
                self.produced.remove(&output.commitment);
                if let Some(child) = self.spent.get(&output.commitment) {
                    doomed.push(*child);
                }
            }
        }
        removed
    }

    fn transactions(&self) -> Vec<Transaction> {
        self.entries.iter().map(|e| e.tx.clone()).collect()
    }
}

/// The two-tier transaction pool.
pub struct TransactionPool {
    chain: Arc<dyn BlockchainView>,
    config: PoolConfig,
    state: Mutex<PoolState>,
}

#[derive(Default)]
struct PoolState {
    mempool: Tier,
    stempool: Tier,
    counter: u64,
}

impl TransactionPool {
    pub fn new(chain: Arc<dyn BlockchainView>, config: PoolConfig) -> Self {
        TransactionPool {
            chain,
            config,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn mempool_count(&self) -> usize {
        self.state.lock().expect("pool lock").mempool.entries.len()
    }

    pub fn stempool_count(&self) -> usize {
        self.state.lock().expect("pool lock").stempool.entries.len()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        let state = self.state.lock().expect("pool lock");
        state.mempool.contains(hash) || state.stempool.contains(hash)
    }

    /// Accept a transaction into the public mempool.
    pub fn add_to_mempool(&self, tx: Transaction) -> Result<Hash, PoolError> {
        self.accept(tx, false)
    }

    /// Accept a transaction into the stempool (Dandelion stem phase).
    pub fn add_to_stempool(&self, tx: Transaction) -> Result<Hash, PoolError> {
        self.accept(tx, true)
    }

    fn accept(&self, tx: Transaction, stem: bool) -> Result<Hash, PoolError> {
        let hash = tx.hash();
        let head_height = self.chain.head_height()?;
        let next_height = head_height + 1;

        let mut state = self.state.lock().expect("pool lock");
        if state.mempool.contains(&hash) || state.stempool.contains(&hash) {
            return Err(PoolError::Duplicate);
        }

        // Full self-consistency: proofs, signatures, sums.
        tx.validate()?;

        // Coinbase parts only ever come from block assembly.
        if tx.body.outputs.iter().any(|o| o.features == OutputFeatures::Coinbase)
            || tx.body.kernels.iter().any(|k| k.features == KernelFeatures::Coinbase)
        {
            return Err(PoolError::CoinbaseInPool);
        }

        let weight = tx.weight();
        let fee = tx.fee()?;
        let min_fee = consensus::min_relay_fee(weight);
        if fee < min_fee {
            return Err(PoolError::FeeTooLow { fee, min_fee });
        }

        let lock_height = tx.lock_height();
        if lock_height > next_height {
            return Err(PoolError::ImmatureTransaction(lock_height));
        }

        let entry = PoolEntry {
            hash,
            fee,
            weight,
            at: state.counter,
            tx,
        };
        let fee_rate = entry.fee_rate();

        // Resolve every input and collect conflicts.
        let mut conflicts = vec![];
        {
            let tiers: [&Tier; 2] = if stem {
                [&state.stempool, &state.mempool]
            } else {
                [&state.mempool, &state.mempool]
            };
            for input in &entry.tx.body.inputs {
                let on_chain = self.chain.get_unspent(&input.commitment)?;
                let in_pool = tiers
                    .iter()
                    .any(|t| t.produced.contains_key(&input.commitment));
                match on_chain {
                    Some(pos) => {
                        if pos.coinbase && next_height < pos.height + consensus::COINBASE_MATURITY
                        {
                            return Err(PoolError::ImmatureCoinbase);
                        }
                    }
                    None if in_pool => {}
                    None => return Err(PoolError::InputNotFound(input.commitment)),
                }
                for tier in &tiers {
                    if let Some(spender) = tier.spent.get(&input.commitment) {
                        conflicts.push(*spender);
                    }
                }
            }
        }

        // Fee-rate conflict resolution: the loser is evicted with its
        // descendants, or the newcomer is refused.
        conflicts.sort();
        conflicts.dedup();
        for conflict in conflicts {
            let tier = if stem && state.stempool.contains(&conflict) {
                &mut state.stempool
            } else {
                &mut state.mempool
            };
            let existing_rate = tier
                .entries
                .iter()
                .find(|e| e.hash == conflict)
                .map(|e| e.fee_rate())
                .unwrap_or(0);
            if fee_rate <= existing_rate {
                let spent_commit = entry
                    .tx
                    .body
                    .inputs
                    .first()
                    .map(|i| i.commitment)
                    .unwrap_or(Commitment::from_bytes([0u8; 32]));
                return Err(PoolError::DoubleSpend(spent_commit));
            }
            let evicted = tier.remove_with_descendants(&conflict);
            debug!(evicted, "evicted lower-fee conflict from pool");
        }

        // Capacity: shed the lowest fee rates (never the newcomer's betters).
        let tier = if stem {
            &mut state.stempool
        } else {
            &mut state.mempool
        };
        let mut evictions = 0;
        while tier.total_weight() + weight > self.config.max_pool_weight {
            if evictions >= self.config.max_evictions {
                return Err(PoolError::OverCapacity);
            }
            let lowest = tier
                .entries
                .iter()
                .min_by_key(|e| (e.fee_rate(), std::cmp::Reverse(e.at)))
                .map(|e| (e.hash, e.fee_rate()));
            match lowest {
                Some((_, rate)) if rate >= fee_rate => return Err(PoolError::OverCapacity),
                Some((victim, _)) => {
                    evictions += tier.remove_with_descendants(&victim);
                }
                None => return Err(PoolError::OverCapacity),
            }
        }

        tier.insert(entry);
        state.counter += 1;
        Ok(hash)
    }

    /// Move the whole stempool into the mempool as one aggregated
    /// transaction (Dandelion fluff). Returns the aggregate for broadcast.
    pub fn fluff_stempool(&self) -> Result<Option<Transaction>, PoolError> {
        let stem_txs = {
            let mut state = self.state.lock().expect("pool lock");
            let txs = state.stempool.transactions();
            state.stempool = Tier::default();
            txs
        };
        if stem_txs.is_empty() {
            return Ok(None);
        }
        let agg = transaction::aggregate(&stem_txs)?;
        match self.add_to_mempool(agg.clone()) {
            Ok(_) | Err(PoolError::Duplicate) => Ok(Some(agg)),
            Err(e) => Err(e),
        }
    }

    /// Assemble the transaction set for a block template: take mempool
    /// transactions in insertion order while they fit the weight budget
    /// (skipping anything chained on a skipped parent), aggregate them, and
    /// verify the aggregate before handing it out.
    pub fn build_block_template(&self) -> Result<Option<Transaction>, PoolError> {
        let state = self.state.lock().expect("pool lock");
        // Leave room for the coinbase output and kernel.
        let budget =
            consensus::MAX_BLOCK_WEIGHT - consensus::body_weight(0, 1, 1);

        let mut selected: Vec<&PoolEntry> = vec![];
        let mut selected_outputs: HashMap<Commitment, ()> = HashMap::new();
        let mut weight = 0u64;
        for entry in &state.mempool.entries {
            if weight + entry.weight > budget {
                continue;
            }
            // Chain-of-pool inputs must come from an already selected tx or
            // the chain itself.
            let deps_ok = entry.tx.body.inputs.iter().all(|input| {
                selected_outputs.contains_key(&input.commitment)
                    || !state.mempool.produced.contains_key(&input.commitment)
            });
            if !deps_ok {
                continue;
            }
            weight += entry.weight;
            for output in &entry.tx.body.outputs {
                selected_outputs.insert(output.commitment, ());
            }
            selected.push(entry);
        }
        if selected.is_empty() {
            return Ok(None);
        }
        let txs: Vec<Transaction> = selected.iter().map(|e| e.tx.clone()).collect();
        drop(state);

        let agg = transaction::aggregate(&txs)?;
        agg.validate()?;
        Ok(Some(agg))
    }

    /// Rebalance after a best-chain change.
    ///
    /// Mined transactions leave the pool, transactions double-spent by the
    /// block are evicted with their descendants, surviving pool chains are
    /// re-admitted, and transactions from reorged-out blocks are offered
    /// back to the mempool as aggregates.
    pub fn reconcile(
        &self,
        block: &crate::core::block::FullBlock,
        reorged_out: &[ReorgedBlock],
    ) {
        let survivors = {
            let mut state = self.state.lock().expect("pool lock");

            let block_kernels: HashMap<Commitment, ()> = block
                .body
                .kernels
                .iter()
                .map(|k| (k.excess, ()))
                .collect();
            let block_inputs: HashMap<Commitment, ()> = block
                .body
                .inputs
                .iter()
                .map(|i| (i.commitment, ()))
                .collect();

            let mut survivors: Vec<Transaction> = vec![];
            for tier in [
                std::mem::take(&mut state.mempool),
                std::mem::take(&mut state.stempool),
            ] {
                for entry in tier.entries {
                    let mined = entry
                        .tx
                        .body
                        .kernels
                        .iter()
                        .all(|k| block_kernels.contains_key(&k.excess));
                    if mined {
                        continue;
                    }
                    let double_spent = entry
                        .tx
                        .body
                        .inputs
                        .iter()
                        .any(|i| block_inputs.contains_key(&i.commitment));
                    if double_spent {
                        continue;
                    }
                    survivors.push(entry.tx);
                }
            }
            state.counter = 0;
            survivors
        };

        // Transactions from unwound blocks come back as one aggregate each.
        for reorged in reorged_out {
            if let Some(tx) = reorged.as_pool_transaction() {
                let _ = self.add_to_mempool(tx);
            }
        }

        // Re-admit survivors in their old order; anything that no longer
        // resolves simply fails acceptance and is dropped.
        for tx in survivors {
            let _ = self.add_to_mempool(tx);
        }
    }
}

/// A reorged-out block paired with its parent's cumulative kernel offset,
/// enough to reconstitute its non-coinbase content as a pool transaction.
#[derive(Clone, Debug)]
pub struct ReorgedBlock {
    pub block: Arc<crate::core::block::FullBlock>,
    pub prev_total_offset: crate::crypto::commitment::BlindingFactor,
}

impl ReorgedBlock {
    /// Strip the coinbase and return the rest as a transaction carrying the
    /// block's own offset.
    pub fn as_pool_transaction(&self) -> Option<Transaction> {
        let body = &self.block.body;
        let outputs: Vec<_> = body
            .outputs
            .iter()
            .filter(|o| o.features != OutputFeatures::Coinbase)
            .cloned()
            .collect();
        let kernels: Vec<_> = body
            .kernels
            .iter()
            .filter(|k| k.features != KernelFeatures::Coinbase)
            .cloned()
            .collect();
        if kernels.is_empty() {
            return None;
        }
        let offset = add_blinding_factors(
            &[self.block.header.total_kernel_offset.clone()],
            &[self.prev_total_offset.clone()],
        );
        let body =
            transaction::TransactionBody::new(body.inputs.clone(), outputs, kernels).ok()?;
        Some(Transaction::new(offset, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transaction::test_util::*;
    use crate::crypto::commitment::{commit, BlindingFactor};
    use std::collections::HashMap as StdHashMap;
    use std::sync::RwLock;

    /// A stub chain exposing a configurable UTXO set.
    #[derive(Default)]
    struct MockChain {
        height: u64,
        utxos: RwLock<StdHashMap<Commitment, OutputPos>>,
    }

    impl MockChain {
        fn with_utxo(height: u64, entries: &[(Commitment, OutputPos)]) -> Arc<Self> {
            let chain = MockChain {
                height,
                utxos: RwLock::new(entries.iter().cloned().collect()),
            };
            Arc::new(chain)
        }
    }

    impl BlockchainView for MockChain {
        fn head_height(&self) -> Result<u64, PoolError> {
            Ok(self.height)
        }
        fn get_unspent(&self, commitment: &Commitment) -> Result<Option<OutputPos>, PoolError> {
            Ok(self.utxos.read().unwrap().get(commitment).copied())
        }
    }

    fn plain_pos(height: u64) -> OutputPos {
        OutputPos {
            pos: 0,
            height,
            coinbase: false,
        }
    }

    fn funded_tx(seed: u8, value: u64, fee: u64) -> (Transaction, Commitment) {
        let input_blind = BlindingFactor::from_bytes([seed; 32]);
        let output_blind = BlindingFactor::from_bytes([seed.wrapping_add(1); 32]);
        let tx = build_tx(value, &input_blind, &output_blind, fee);
        let input_commit = commit(value, &input_blind);
        (tx, input_commit)
    }

    const FEE: u64 = 40_000; // comfortably above min_relay_fee for 1-in/1-out

    #[test]
    fn accepts_valid_transaction() {
        let (tx, input) = funded_tx(1, 1_000_000, FEE);
        let chain = MockChain::with_utxo(10, &[(input, plain_pos(1))]);
        let pool = TransactionPool::new(chain, PoolConfig::default());
        pool.add_to_mempool(tx).unwrap();
        assert_eq!(pool.mempool_count(), 1);
    }

    #[test]
    fn rejects_duplicate() {
        let (tx, input) = funded_tx(1, 1_000_000, FEE);
        let chain = MockChain::with_utxo(10, &[(input, plain_pos(1))]);
        let pool = TransactionPool::new(chain, PoolConfig::default());
        pool.add_to_mempool(tx.clone()).unwrap();
        assert!(matches!(
            pool.add_to_mempool(tx),
            Err(PoolError::Duplicate)
        ));
    }

    #[test]
    fn rejects_unknown_input() {
        let (tx, _) = funded_tx(1, 1_000_000, FEE);
        let chain = MockChain::with_utxo(10, &[]);
        let pool = TransactionPool::new(chain, PoolConfig::default());
        assert!(matches!(
            pool.add_to_mempool(tx),
            Err(PoolError::InputNotFound(_))
        ));
    }

    #[test]
    fn rejects_low_fee() {
        let (tx, input) = funded_tx(1, 1_000_000, 10);
        let chain = MockChain::with_utxo(10, &[(input, plain_pos(1))]);
        let pool = TransactionPool::new(chain, PoolConfig::default());
        assert!(matches!(
            pool.add_to_mempool(tx),
            Err(PoolError::FeeTooLow { .. })
        ));
    }

    #[test]
    fn rejects_immature_coinbase_spend() {
        let (tx, input) = funded_tx(1, 1_000_000, FEE);
        let pos = OutputPos {
            pos: 0,
            height: 5,
            coinbase: true,
        };
        let chain = MockChain::with_utxo(10, &[(input, pos)]);
        let pool = TransactionPool::new(chain, PoolConfig::default());
        assert!(matches!(
            pool.add_to_mempool(tx),
            Err(PoolError::ImmatureCoinbase)
        ));
    }

    #[test]
    fn chain_of_pool_accepted() {
        // tx2 spends tx1's unconfirmed output.
        let a = BlindingFactor::from_bytes([1u8; 32]);
        let b = BlindingFactor::from_bytes([2u8; 32]);
        let c = BlindingFactor::from_bytes([3u8; 32]);
        let tx1 = build_tx(1_000_000, &a, &b, FEE);
        let tx2 = build_tx(1_000_000 - FEE, &b, &c, FEE);
        let input1 = commit(1_000_000, &a);

        let chain = MockChain::with_utxo(10, &[(input1, plain_pos(1))]);
        let pool = TransactionPool::new(chain, PoolConfig::default());
        pool.add_to_mempool(tx1).unwrap();
        pool.add_to_mempool(tx2).unwrap();
        assert_eq!(pool.mempool_count(), 2);
    }

    #[test]
    fn double_spend_resolved_by_fee_rate() {
        let a = BlindingFactor::from_bytes([1u8; 32]);
        let input = commit(1_000_000, &a);
        let cheap = build_tx(1_000_000, &a, &BlindingFactor::from_bytes([2u8; 32]), FEE);
        let rich = build_tx(
            1_000_000,
            &a,
            &BlindingFactor::from_bytes([3u8; 32]),
            FEE * 2,
        );

        let chain = MockChain::with_utxo(10, &[(input, plain_pos(1))]);
        let pool = TransactionPool::new(chain, PoolConfig::default());
        pool.add_to_mempool(cheap.clone()).unwrap();

        // Higher fee displaces the incumbent.
        pool.add_to_mempool(rich.clone()).unwrap();
        assert_eq!(pool.mempool_count(), 1);
        assert!(pool.contains(&rich.hash()));

        // And the displaced one cannot return.
        assert!(matches!(
            pool.add_to_mempool(cheap),
            Err(PoolError::DoubleSpend(_))
        ));
    }

    #[test]
    fn eviction_takes_descendants() {
        let a = BlindingFactor::from_bytes([1u8; 32]);
        let b = BlindingFactor::from_bytes([2u8; 32]);
        let c = BlindingFactor::from_bytes([3u8; 32]);
        let tx1 = build_tx(1_000_000, &a, &b, FEE);
        let tx2 = build_tx(1_000_000 - FEE, &b, &c, FEE);
        let input1 = commit(1_000_000, &a);

        let chain = MockChain::with_utxo(10, &[(input1, plain_pos(1))]);
        let pool = TransactionPool::new(chain, PoolConfig::default());
        pool.add_to_mempool(tx1).unwrap();
        pool.add_to_mempool(tx2).unwrap();

        // A richer double spend of the root evicts the whole chain.
        let rich = build_tx(
            1_000_000,
            &a,
            &BlindingFactor::from_bytes([4u8; 32]),
            FEE * 3,
        );
        pool.add_to_mempool(rich).unwrap();
        assert_eq!(pool.mempool_count(), 1);
    }

    #[test]
    fn stempool_and_fluff() {
        let (tx, input) = funded_tx(1, 1_000_000, FEE);
        let chain = MockChain::with_utxo(10, &[(input, plain_pos(1))]);
        let pool = TransactionPool::new(chain, PoolConfig::default());

        pool.add_to_stempool(tx).unwrap();
        assert_eq!(pool.stempool_count(), 1);
        assert_eq!(pool.mempool_count(), 0);

        let fluffed = pool.fluff_stempool().unwrap().unwrap();
        assert_eq!(pool.stempool_count(), 0);
        assert_eq!(pool.mempool_count(), 1);
        fluffed.validate().unwrap();
    }

    #[test]
    fn block_template_aggregates_and_validates() {
        let a = BlindingFactor::from_bytes([1u8; 32]);
        let b = BlindingFactor::from_bytes([2u8; 32]);
        let c = BlindingFactor::from_bytes([3u8; 32]);
        let tx1 = build_tx(1_000_000, &a, &b, FEE);
        let tx2 = build_tx(1_000_000 - FEE, &b, &c, FEE);
        let input1 = commit(1_000_000, &a);

        let chain = MockChain::with_utxo(10, &[(input1, plain_pos(1))]);
        let pool = TransactionPool::new(chain, PoolConfig::default());
        pool.add_to_mempool(tx1).unwrap();
        pool.add_to_mempool(tx2).unwrap();

        let template = pool.build_block_template().unwrap().unwrap();
        // Chained pair cut through: one input, one output, two kernels.
        assert_eq!(template.body.inputs.len(), 1);
        assert_eq!(template.body.outputs.len(), 1);
        assert_eq!(template.body.kernels.len(), 2);
    }

    #[test]
    fn reconcile_removes_mined_and_double_spent() {
        let a = BlindingFactor::from_bytes([1u8; 32]);
        let input = commit(1_000_000, &a);
        let mined = build_tx(1_000_000, &a, &BlindingFactor::from_bytes([2u8; 32]), FEE);
        let loser = build_tx(1_000_000, &a, &BlindingFactor::from_bytes([3u8; 32]), FEE * 2);

        let chain = MockChain::with_utxo(10, &[(input, plain_pos(1))]);
        let pool = TransactionPool::new(chain, PoolConfig::default());
        pool.add_to_mempool(loser).unwrap();

        // A block mines `mined`, double-spending `loser`.
        let body = mined.body.clone();
        let mut header = crate::core::block::genesis().header;
        header.height = 11;
        let block = crate::core::block::FullBlock::new(header, body);
        pool.reconcile(&block, &[]);
        assert_eq!(pool.mempool_count(), 0);
    }
}

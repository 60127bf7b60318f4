//! Property-style checks over the consensus structures: canonical
//! serialization round-trips, MMR prune/rewind invariants, TxHashSet
//! apply/rewind symmetry, pool consistency after a block, and the slate
//! signature identity.

mod common;

use std::sync::Arc;

use common::*;
use mimble::consensus;
use mimble::core::hash::Hashed;
use mimble::core::transaction::{OutputFeatures, Transaction};
use mimble::crypto::commitment::{commit, BlindingFactor, Commitment};
use mimble::mmr::{leaf_index_to_pos, MemBackend, Pmmr};
use mimble::pool::{BlockchainView, PoolConfig, PoolError, TransactionPool};
use mimble::ser;
use mimble::store::{ChainStore, IndexedBatch, OutputPos};

/// A tiny deterministic PRNG so property loops are reproducible.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0
    }
}

#[test]
fn serialization_roundtrips_are_byte_equal() {
    // Property 2: deserialize(serialize(x)) == x with byte-equal
    // re-serialization, across headers, blocks, and transactions.
    let mut harness = Harness::new();
    let tx = build_tx(
        5_000_000,
        &BlindingFactor::from_bytes([1u8; 32]),
        OutputFeatures::Plain,
        &BlindingFactor::from_bytes([2u8; 32]),
        50_000,
    );
    let b1 = harness.extend(&harness.genesis_header(), &[], 1);
    let b2 = harness.build_block(&b1.header.clone(), &[], 2);

    let tx_bytes = ser::ser_vec(&tx);
    let tx2: Transaction = ser::deser(&tx_bytes).unwrap();
    assert_eq!(tx2, tx);
    assert_eq!(ser::ser_vec(&tx2), tx_bytes);

    for block in [&b1, &b2] {
        let bytes = ser::ser_vec(block);
        let decoded: mimble::core::block::FullBlock = ser::deser(&bytes).unwrap();
        assert_eq!(&decoded, block);
        assert_eq!(ser::ser_vec(&decoded), bytes);

        let header_bytes = ser::ser_vec(&block.header);
        let header: mimble::core::block::BlockHeader = ser::deser(&header_bytes).unwrap();
        assert_eq!(header, block.header);
        assert_eq!(ser::ser_vec(&header), header_bytes);
        assert_eq!(header.hash(), block.hash());
    }
}

#[test]
fn mmr_root_is_invariant_under_pruning() {
    // Property 3: for any sequence of appends then prunes, the root equals
    // the root of the same appends without prunes.
    let mut rng = Lcg(0xfeed);
    for round in 0..10 {
        let leaf_count = 1 + (rng.next() % 40) as u64;
        let mut pruned: Pmmr<u64, MemBackend> = Pmmr::new(MemBackend::new()).unwrap();
        let mut pristine: Pmmr<u64, MemBackend> = Pmmr::new(MemBackend::new()).unwrap();
        for i in 0..leaf_count {
            let leaf = rng.next();
            pruned.push(&leaf).unwrap();
            pristine.push(&leaf).unwrap();
        }
        // Prune a random subset of leaves.
        for leaf_idx in 0..leaf_count {
            if rng.next() % 3 == 0 {
                pruned.prune(leaf_index_to_pos(leaf_idx)).unwrap();
            }
        }
        pruned.compact().unwrap();
        assert_eq!(
            pruned.root().unwrap(),
            pristine.root().unwrap(),
            "round {round} with {leaf_count} leaves"
        );
    }
}

#[test]
fn mmr_rewind_undoes_appends() {
    // Property 4: rewind(n) after appending xs of length n restores the
    // pre-append state, and re-appending reproduces it.
    let mut rng = Lcg(0xbeef);
    for _ in 0..10 {
        let base_count = (rng.next() % 20) as u64;
        let extra_count = 1 + (rng.next() % 20) as u64;

        let mut pmmr: Pmmr<u64, MemBackend> = Pmmr::new(MemBackend::new()).unwrap();
        for _ in 0..base_count {
            pmmr.push(&rng.next()).unwrap();
        }
        let base_size = pmmr.size();
        let base_root = pmmr.root().unwrap();

        let extras: Vec<u64> = (0..extra_count).map(|_| rng.next()).collect();
        for leaf in &extras {
            pmmr.push(leaf).unwrap();
        }
        let extended_root = pmmr.root().unwrap();

        pmmr.rewind(base_size).unwrap();
        assert_eq!(pmmr.size(), base_size);
        assert_eq!(pmmr.root().unwrap(), base_root);

        for leaf in &extras {
            pmmr.push(leaf).unwrap();
        }
        assert_eq!(pmmr.root().unwrap(), extended_root);
    }
}

#[test]
fn txhashset_apply_then_rewind_is_identity() {
    // Property 5: apply_block followed by rewind to the parent restores the
    // MMR roots, sizes, and unspent bitmap exactly.
    let mut harness = Harness::new();
    let b1 = harness.extend(&harness.genesis_header(), &[], 3);

    // Spend the b1 coinbase in b2 so the rewind exercises bitmap undo.
    let spend = build_tx(
        consensus::block_reward(0),
        &BlindingFactor::from_bytes([3u8; 32]),
        OutputFeatures::Coinbase,
        &BlindingFactor::from_bytes([4u8; 32]),
        1_000,
    );
    let before = harness.state.snapshot().unwrap();
    let b2 = harness.build_block(&b1.header.clone(), &[spend], 5);
    harness.apply(&b2);
    let after = harness.state.snapshot().unwrap();
    assert_ne!(before.roots, after.roots);

    let spent = harness.store.get_spent_outputs(&b2.hash()).unwrap();
    assert_eq!(spent.len(), 1);
    let mut batch = IndexedBatch::new(&harness.store);
    harness
        .state
        .rewind_block(&b2, &b1.header, &spent, &mut batch)
        .unwrap();
    harness.state.flush().unwrap();
    batch.commit().unwrap();

    let rewound = harness.state.snapshot().unwrap();
    assert_eq!(rewound.roots, before.roots);
    assert_eq!(rewound.output_mmr_size, before.output_mmr_size);
    assert_eq!(rewound.kernel_mmr_size, before.kernel_mmr_size);
    assert_eq!(rewound.unspent, before.unspent);
}

/// A standalone UTXO view for pool property checks.
struct FixedUtxo {
    height: u64,
    utxos: Vec<(Commitment, OutputPos)>,
}

impl BlockchainView for FixedUtxo {
    fn head_height(&self) -> Result<u64, PoolError> {
        Ok(self.height)
    }
    fn get_unspent(&self, commitment: &Commitment) -> Result<Option<OutputPos>, PoolError> {
        Ok(self
            .utxos
            .iter()
            .find(|(c, _)| c == commitment)
            .map(|(_, p)| *p))
    }
}

#[test]
fn pool_spends_only_known_outputs_after_block() {
    // Property 7: after a block applies, every surviving pool transaction
    // spends only outputs in the post-block UTXO set or produced by an
    // earlier pool transaction.
    let a = BlindingFactor::from_bytes([1u8; 32]);
    let b = BlindingFactor::from_bytes([2u8; 32]);
    let c = BlindingFactor::from_bytes([3u8; 32]);
    let d = BlindingFactor::from_bytes([4u8; 32]);

    let utxo_a = commit(10_000_000, &a);
    let utxo_d = commit(8_000_000, &d);
    let view = Arc::new(FixedUtxo {
        height: 10,
        utxos: vec![
            (
                utxo_a,
                OutputPos {
                    pos: 0,
                    height: 1,
                    coinbase: false,
                },
            ),
            (
                utxo_d,
                OutputPos {
                    pos: 1,
                    height: 1,
                    coinbase: false,
                },
            ),
        ],
    });
    let pool = TransactionPool::new(view.clone(), PoolConfig::default());

    // tx1 spends A; tx2 chains on tx1; tx3 spends D independently.
    let tx1 = build_tx(10_000_000, &a, OutputFeatures::Plain, &b, 50_000);
    let tx2 = build_tx(9_950_000, &b, OutputFeatures::Plain, &c, 50_000);
    let tx3 = build_tx(
        8_000_000,
        &d,
        OutputFeatures::Plain,
        &BlindingFactor::from_bytes([5u8; 32]),
        50_000,
    );
    pool.add_to_mempool(tx1.clone()).unwrap();
    pool.add_to_mempool(tx2.clone()).unwrap();
    pool.add_to_mempool(tx3.clone()).unwrap();
    assert_eq!(pool.mempool_count(), 3);

    // A block mines tx1.
    let mut header = mimble::core::block::genesis().header;
    header.height = 11;
    let block = mimble::core::block::FullBlock::new(header, tx1.body.clone());
    pool.reconcile(&block, &[]);

    // tx1 left as mined; tx2 survives (chains on tx1's output, now in the
    // UTXO set conceptually) only if the view knows it. Our fixed view does
    // not, so tx2 must have been dropped, and tx3 must survive.
    assert!(pool.contains(&tx3.hash()));
    assert!(!pool.contains(&tx1.hash()));
    assert!(!pool.contains(&tx2.hash()));
    assert_eq!(pool.mempool_count(), 1);
}

#[test]
fn pool_keeps_chained_survivors_when_parent_confirms() {
    // The chain-of-pool survivor is re-accepted when the post-block UTXO
    // view contains the parent's output.
    let a = BlindingFactor::from_bytes([1u8; 32]);
    let b = BlindingFactor::from_bytes([2u8; 32]);
    let c = BlindingFactor::from_bytes([3u8; 32]);

    let tx1 = build_tx(10_000_000, &a, OutputFeatures::Plain, &b, 50_000);
    let tx2 = build_tx(9_950_000, &b, OutputFeatures::Plain, &c, 50_000);
    let mid_output = commit(9_950_000, &b);

    // The view models the post-block state: tx1 already mined.
    let view = Arc::new(FixedUtxo {
        height: 11,
        utxos: vec![(
            mid_output,
            OutputPos {
                pos: 5,
                height: 11,
                coinbase: false,
            },
        )],
    });
    let pool = TransactionPool::new(view, PoolConfig::default());
    pool.add_to_mempool(tx2.clone()).unwrap();

    let mut header = mimble::core::block::genesis().header;
    header.height = 11;
    let block = mimble::core::block::FullBlock::new(header, tx1.body.clone());
    pool.reconcile(&block, &[]);
    assert!(pool.contains(&tx2.hash()));
}

#[test]
fn finalized_slate_kernel_verifies_under_participant_sum() {
    // Property 8: the finalized kernel signature verifies under the sum of
    // participant public excesses.
    use mimble::crypto::keys::Keychain;
    use mimble::wallet::builder::{self, SelectionStrategy};
    use mimble::wallet::OwnedOutput;

    let mut rng = Lcg(0xabcd);
    for round in 0..3 {
        let seed_a = [(round + 1) as u8; 32];
        let seed_b = [(round + 101) as u8; 32];
        let keychain_a = Keychain::from_seed(seed_a);
        let keychain_b = Keychain::from_seed(seed_b);

        let value = 1_000_000 + (rng.next() % 1_000_000);
        let amount = value / 2;
        let funds = vec![OwnedOutput {
            key_index: 0,
            value,
            commitment: commit(value, &keychain_a.derive_blinding(0)),
        }];

        let (mut slate, ctx) = builder::sender_round_1(
            &keychain_a,
            &funds,
            amount,
            SelectionStrategy::SmallestFirst,
            Some(10_000),
            5,
            0,
            7,
        )
        .unwrap();
        builder::receive(&keychain_b, &mut slate, 3).unwrap();
        let tx = builder::finalize(&mut slate, &ctx).unwrap();

        let participant_sum = slate.public_blind_sum().unwrap();
        assert_eq!(
            tx.body.kernels[0].excess.as_bytes(),
            participant_sum.as_bytes()
        );
        tx.body.kernels[0].verify().unwrap();
        tx.validate().unwrap();
    }
}

#[test]
fn accepted_blocks_balance() {
    // Property 1: any accepted block satisfies the commitment-sum identity;
    // a tampered fee breaks acceptance.
    let chain = {
        let store = Arc::new(ChainStore::open_temporary().unwrap());
        Arc::new(
            mimble::chain::Chain::init(store, mimble::txhashset::TxHashSet::in_memory().unwrap())
                .unwrap(),
        )
    };
    let mut harness = Harness::new();
    let b1 = harness.extend(&harness.genesis_header(), &[], 7);
    chain.process_block(b1.clone()).unwrap();

    // A block that simply inflates its coinbase cannot be sealed into a
    // consistent header by any honest path; emulate an attacker editing the
    // body after sealing.
    let mut bad = harness.build_block(&b1.header.clone(), &[], 8);
    let blind = BlindingFactor::from_bytes([99u8; 32]);
    bad.body.outputs[0] = build_output(
        consensus::block_reward(0) + 1,
        &blind,
        OutputFeatures::Coinbase,
    );
    assert!(chain.process_block(bad).is_err());
}

//! # Mimble
//!
//! A Mimblewimble full node and wallet:
//! - **Confidential transactions** — Pedersen commitments over Ristretto with
//!   bulletproof range proofs; no addresses or amounts on chain
//! - **Three-MMR UTXO engine** — outputs, range proofs, and kernels in
//!   append-only Merkle Mountain Ranges with pruning and rewind
//! - **Header-first sync** — headers, then a horizon TxHashSet archive, then
//!   block-by-block catch-up
//! - **Interactive transactions** — round-based slate exchange aggregating
//!   partial Schnorr signatures into a single kernel

pub mod chain;
pub mod config;
pub mod consensus;
pub mod core;
pub mod crypto;
pub mod mmr;
pub mod node;
pub mod p2p;
pub mod pool;
pub mod rpc;
pub mod ser;
pub mod store;
pub mod sync;
pub mod txhashset;
pub mod validation;
pub mod wallet;

/// Node version reported over RPC and in the P2P handshake.
pub const NODE_VERSION: &str = env!("CARGO_PKG_VERSION");

//! Cryptographic primitives: Pedersen commitments, bulletproof range proofs,
//! and aggregate Schnorr signatures, all over the Ristretto group.
//!
//! The two generators are the `bulletproofs` Pedersen pair: values commit on
//! `B` and blinding factors on `B_blinding`, so a commitment is
//! `v·H + r·G` with `H = B` and `G = B_blinding`. Public keys (kernel
//! excesses, slate nonces) live on `G`, which keeps kernel signatures and
//! commitment arithmetic in one group.

pub mod commitment;
pub mod keys;
pub mod rangeproof;
pub mod schnorr;

use thiserror::Error;

/// Errors from cryptographic primitives, one class per primitive.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("point fails to decompress or is not on the curve")]
    InvalidPoint,
    #[error("signature does not verify")]
    InvalidSignature,
    #[error("range proof is malformed or does not verify")]
    ProofMalformed,
}

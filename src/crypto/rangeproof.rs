//! Bulletproof range proofs with a wallet-rewind envelope.
//!
//! Every confidential output proves its value lies in `[0, 2^64)` without
//! revealing it. Appended to the bulletproof is a 64-byte envelope: the
//! output's `(value, blinding, message)` XOR-encrypted under a keystream
//! derived from the owner's rewind nonce and the commitment, plus a check
//! tag. Rewinding with the right nonce recovers the opening and is accepted
//! only if it recommits to the same point, so wallet restore can recognize
//! owned outputs from chain data alone.

use blake2::digest::consts::{U32, U64};
use blake2::{Blake2b, Digest};
use bulletproofs::{BulletproofGens, PedersenGens, RangeProof as Bulletproof};
use merlin::Transcript;
use rayon::prelude::*;
use std::sync::OnceLock;

use super::commitment::{commit, BlindingFactor, Commitment};
use super::CryptoError;
use crate::core::hash::Hash;
use crate::ser::{Readable, Reader, SerError, Writeable, Writer};

type Blake2b256 = Blake2b<U32>;
type Blake2b512 = Blake2b<U64>;

/// Bits proven by every range proof.
pub const PROOF_BITS: usize = 64;

/// Length of the free-form message embedded in the rewind envelope.
pub const PROOF_MESSAGE_LEN: usize = 16;

/// Envelope layout: value (8) + blinding (32) + message (16) + tag (8).
const ENVELOPE_LEN: usize = 64;
const ENVELOPE_PLAIN_LEN: usize = 56;

/// Upper bound on a serialized proof; anything larger is malformed.
pub const MAX_PROOF_SIZE: usize = 1024;

const TRANSCRIPT_LABEL: &[u8] = b"mimble.rangeproof";

fn bulletproof_gens() -> &'static BulletproofGens {
    static GENS: OnceLock<BulletproofGens> = OnceLock::new();
    GENS.get_or_init(|| BulletproofGens::new(PROOF_BITS, 1))
}

/// A serialized range proof: bulletproof bytes followed by the envelope.
#[derive(Clone, PartialEq, Eq)]
pub struct RangeProof {
    bytes: Vec<u8>,
}

impl std::fmt::Debug for RangeProof {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RangeProof({} bytes)", self.bytes.len())
    }
}

impl RangeProof {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() < ENVELOPE_LEN || bytes.len() > MAX_PROOF_SIZE {
            return Err(CryptoError::ProofMalformed);
        }
        Ok(RangeProof { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn split(&self) -> (&[u8], &[u8]) {
        self.bytes.split_at(self.bytes.len() - ENVELOPE_LEN)
    }
}

impl Writeable for RangeProof {
    fn write(&self, writer: &mut Writer) {
        writer.write_bytes_long(&self.bytes);
    }
}

impl Readable for RangeProof {
    fn read(reader: &mut Reader<'_>) -> Result<Self, SerError> {
        let bytes = reader.read_bytes_long(MAX_PROOF_SIZE as u64)?;
        if bytes.len() < ENVELOPE_LEN {
            return Err(SerError::Corrupted("range proof too short"));
        }
        Ok(RangeProof { bytes })
    }
}

impl serde::Serialize for RangeProof {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&hex::encode(&self.bytes))
        } else {
            serializer.serialize_bytes(&self.bytes)
        }
    }
}

impl<'de> serde::Deserialize<'de> for RangeProof {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;
        let bytes = if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            hex::decode(s).map_err(|_| D::Error::custom("invalid proof hex"))?
        } else {
            Vec::<u8>::deserialize(deserializer)?
        };
        RangeProof::from_bytes(bytes).map_err(|_| D::Error::custom("invalid proof length"))
    }
}

/// The opening recovered from a proof by rewinding.
#[derive(Clone, Debug)]
pub struct RewoundProof {
    pub value: u64,
    pub blinding: BlindingFactor,
    pub message: [u8; PROOF_MESSAGE_LEN],
}

fn envelope_keystream(nonce: &Hash, commitment: &Commitment) -> [u8; ENVELOPE_PLAIN_LEN] {
    let mut hasher = Blake2b512::new();
    hasher.update(b"mimble.rangeproof.envelope");
    hasher.update(nonce.as_bytes());
    hasher.update(commitment.as_bytes());
    let out = hasher.finalize();
    let mut stream = [0u8; ENVELOPE_PLAIN_LEN];
    stream.copy_from_slice(&out[..ENVELOPE_PLAIN_LEN]);
    stream
}

fn envelope_tag(nonce: &Hash, commitment: &Commitment, plain: &[u8]) -> [u8; 8] {
    let mut hasher = Blake2b256::new();
    hasher.update(b"mimble.rangeproof.tag");
    hasher.update(nonce.as_bytes());
    hasher.update(commitment.as_bytes());
    hasher.update(plain);
    let out = hasher.finalize();
    let mut tag = [0u8; 8];
    tag.copy_from_slice(&out[..8]);
    tag
}

/// Prove that `commit(value, blinding)` commits to a 64-bit value, embedding
/// `(value, blinding, message)` in the rewind envelope under `rewind_nonce`.
pub fn prove(
    value: u64,
    blinding: &BlindingFactor,
    rewind_nonce: &Hash,
    message: &[u8; PROOF_MESSAGE_LEN],
) -> Result<RangeProof, CryptoError> {
    let pc_gens = PedersenGens::default();
    let mut transcript = Transcript::new(TRANSCRIPT_LABEL);
    let (proof, committed) = Bulletproof::prove_single(
        bulletproof_gens(),
        &pc_gens,
        &mut transcript,
        value,
        &blinding.scalar(),
        PROOF_BITS,
    )
    .map_err(|_| CryptoError::ProofMalformed)?;

    let commitment = Commitment::from_bytes(committed.to_bytes());
    debug_assert_eq!(commitment, commit(value, blinding));

    let mut plain = [0u8; ENVELOPE_PLAIN_LEN];
    plain[..8].copy_from_slice(&value.to_be_bytes());
    plain[8..40].copy_from_slice(&blinding.to_bytes());
    plain[40..].copy_from_slice(message);

    let stream = envelope_keystream(rewind_nonce, &commitment);
    let tag = envelope_tag(rewind_nonce, &commitment, &plain);

    let mut bytes = proof.to_bytes();
    for (p, k) in plain.iter().zip(stream.iter()) {
        bytes.push(p ^ k);
    }
    bytes.extend_from_slice(&tag);
    RangeProof::from_bytes(bytes)
}

/// Verify a single proof against its commitment.
pub fn verify(commitment: &Commitment, proof: &RangeProof) -> Result<(), CryptoError> {
    let (proof_bytes, _) = proof.split();
    let bulletproof =
        Bulletproof::from_bytes(proof_bytes).map_err(|_| CryptoError::ProofMalformed)?;
    let pc_gens = PedersenGens::default();
    let mut transcript = Transcript::new(TRANSCRIPT_LABEL);
    bulletproof
        .verify_single(
            bulletproof_gens(),
            &pc_gens,
            &mut transcript,
            &curve25519_dalek::ristretto::CompressedRistretto(*commitment.as_bytes()),
            PROOF_BITS,
        )
        .map_err(|_| CryptoError::ProofMalformed)
}

/// Verify many proofs, fanning out over the worker pool. Returns the first
/// failure if any proof is bad.
pub fn verify_batch(proofs: &[(Commitment, RangeProof)]) -> Result<(), CryptoError> {
    proofs
        .par_iter()
        .map(|(commitment, proof)| verify(commitment, proof))
        .collect::<Result<Vec<()>, CryptoError>>()?;
    Ok(())
}

/// Attempt to rewind a proof with a nonce.
///
/// Returns the recovered opening only when the envelope tag matches and the
/// opening recommits to `commitment`; any other proof yields `None`.
pub fn rewind(
    commitment: &Commitment,
    proof: &RangeProof,
    rewind_nonce: &Hash,
) -> Option<RewoundProof> {
    let (_, envelope) = proof.split();
    let stream = envelope_keystream(rewind_nonce, commitment);

    let mut plain = [0u8; ENVELOPE_PLAIN_LEN];
    for (i, (c, k)) in envelope[..ENVELOPE_PLAIN_LEN].iter().zip(stream.iter()).enumerate() {
        plain[i] = c ^ k;
    }
    let tag = envelope_tag(rewind_nonce, commitment, &plain);
    // Constant-time: rewind scans foreign proofs with a secret-derived
    // nonce.
    if !bool::from(subtle::ConstantTimeEq::ct_eq(
        tag.as_slice(),
        &envelope[ENVELOPE_PLAIN_LEN..],
    )) {
        return None;
    }

    let value = u64::from_be_bytes(plain[..8].try_into().unwrap());
    let blinding = BlindingFactor::from_bytes(plain[8..40].try_into().unwrap());
    let mut message = [0u8; PROOF_MESSAGE_LEN];
    message.copy_from_slice(&plain[40..]);

    if commit(value, &blinding) != *commitment {
        return None;
    }
    Some(RewoundProof {
        value,
        blinding,
        message,
    })
}

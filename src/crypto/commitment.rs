//! Pedersen commitments to confidential amounts.
//!
//! A commitment is `v·H + r·G` for value `v` and blinding factor `r`.
//! Commitment arithmetic is what makes the chain balance: sums of outputs
//! minus sums of inputs collapse to kernel excesses (plus the offset), and
//! every validator checks exactly that identity.

use std::fmt;

use bulletproofs::PedersenGens;
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::Identity;
use rand::rngs::OsRng;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::CryptoError;
use crate::ser::{Readable, Reader, SerError, Writeable, Writer};

/// The shared Pedersen generator pair (`H = B`, `G = B_blinding`).
pub fn pedersen_gens() -> PedersenGens {
    PedersenGens::default()
}

/// A 32-byte compressed Ristretto Pedersen commitment.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Commitment([u8; 32]);

impl Commitment {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Commitment(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Some(Commitment(bytes.try_into().ok()?))
    }

    pub(crate) fn decompress(&self) -> Result<RistrettoPoint, CryptoError> {
        CompressedRistretto(self.0)
            .decompress()
            .ok_or(CryptoError::InvalidPoint)
    }

    pub(crate) fn from_point(point: RistrettoPoint) -> Self {
        Commitment(point.compress().to_bytes())
    }
}

impl fmt::Display for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Commitment({})", hex::encode(&self.0[..4]))
    }
}

impl Writeable for Commitment {
    fn write(&self, writer: &mut Writer) {
        writer.write_fixed(&self.0);
    }
}

impl Readable for Commitment {
    fn read(reader: &mut Reader<'_>) -> Result<Self, SerError> {
        Ok(Commitment(reader.read_fixed_32()?))
    }
}

impl serde::Serialize for Commitment {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> serde::Deserialize<'de> for Commitment {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            Commitment::from_hex(&s).ok_or_else(|| D::Error::custom("invalid commitment hex"))
        } else {
            let bytes = Vec::<u8>::deserialize(deserializer)?;
            let arr: [u8; 32] = bytes
                .try_into()
                .map_err(|_| D::Error::custom("invalid commitment length"))?;
            Ok(Commitment(arr))
        }
    }
}

/// A blinding factor: a secret scalar hiding the committed value.
///
/// Debug output is redacted to prevent accidental logging of secret values.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct BlindingFactor(Scalar);

impl fmt::Debug for BlindingFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BlindingFactor([REDACTED])")
    }
}

impl BlindingFactor {
    /// Generate a random blinding factor.
    pub fn random() -> Self {
        BlindingFactor(Scalar::random(&mut OsRng))
    }

    /// The zero blinding factor (transparent commitments).
    pub fn zero() -> Self {
        BlindingFactor(Scalar::ZERO)
    }

    /// Create from known bytes, reduced mod the group order.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        BlindingFactor(Scalar::from_bytes_mod_order(bytes))
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn is_zero(&self) -> bool {
        self.0 == Scalar::ZERO
    }

    pub(crate) fn scalar(&self) -> Scalar {
        self.0
    }

    pub(crate) fn from_scalar(scalar: Scalar) -> Self {
        BlindingFactor(scalar)
    }
}

// Equality on the public uses of a blinding factor (kernel offsets in
// headers and slates); not constant-time.
impl PartialEq for BlindingFactor {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for BlindingFactor {}

impl serde::Serialize for BlindingFactor {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&hex::encode(self.to_bytes()))
        } else {
            serializer.serialize_bytes(&self.to_bytes())
        }
    }
}

impl<'de> serde::Deserialize<'de> for BlindingFactor {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;
        let bytes = if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            hex::decode(s).map_err(|_| D::Error::custom("invalid blinding hex"))?
        } else {
            Vec::<u8>::deserialize(deserializer)?
        };
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| D::Error::custom("invalid blinding length"))?;
        Ok(BlindingFactor::from_bytes(arr))
    }
}

impl Writeable for BlindingFactor {
    fn write(&self, writer: &mut Writer) {
        writer.write_fixed(&self.0.to_bytes());
    }
}

impl Readable for BlindingFactor {
    fn read(reader: &mut Reader<'_>) -> Result<Self, SerError> {
        Ok(BlindingFactor::from_bytes(reader.read_fixed_32()?))
    }
}

/// Commit to `value` under `blinding`: `value·H + blinding·G`.
pub fn commit(value: u64, blinding: &BlindingFactor) -> Commitment {
    let point = pedersen_gens().commit(Scalar::from(value), blinding.0);
    Commitment::from_point(point)
}

/// A transparent commitment `value·H` with zero blinding, used for the
/// reward-plus-fees over-commitment in balance checks.
pub fn commit_value_only(value: u64) -> Commitment {
    commit(value, &BlindingFactor::zero())
}

/// A key-only commitment `blinding·G`, i.e. a public excess.
pub fn commit_blind_only(blinding: &BlindingFactor) -> Commitment {
    commit(0, blinding)
}

/// Sum commitments: `Σ positive − Σ negative`.
///
/// Fails with `InvalidPoint` if any commitment fails to decompress.
pub fn commit_sum(
    positive: &[Commitment],
    negative: &[Commitment],
) -> Result<Commitment, CryptoError> {
    let mut sum = RistrettoPoint::identity();
    for c in positive {
        sum += c.decompress()?;
    }
    for c in negative {
        sum -= c.decompress()?;
    }
    Ok(Commitment::from_point(sum))
}

/// Sum blinding factors: `Σ positive − Σ negative`, mod the group order.
pub fn add_blinding_factors(
    positive: &[BlindingFactor],
    negative: &[BlindingFactor],
) -> BlindingFactor {
    let mut sum = Scalar::ZERO;
    for b in positive {
        sum += b.0;
    }
    for b in negative {
        sum -= b.0;
    }
    BlindingFactor(sum)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commitment_deterministic() {
        let b = BlindingFactor::from_bytes([42u8; 32]);
        assert_eq!(commit(1000, &b), commit(1000, &b));
    }

    #[test]
    fn different_blindings_produce_different_commitments() {
        let b1 = BlindingFactor::random();
        let b2 = BlindingFactor::random();
        assert_ne!(commit(100, &b1), commit(100, &b2));
    }

    #[test]
    fn different_values_produce_different_commitments() {
        let b = BlindingFactor::from_bytes([7u8; 32]);
        assert_ne!(commit(100, &b), commit(200, &b));
    }

    #[test]
    fn commitments_are_homomorphic() {
        // commit(a, r1) + commit(b, r2) == commit(a + b, r1 + r2)
        let r1 = BlindingFactor::random();
        let r2 = BlindingFactor::random();
        let lhs = commit_sum(&[commit(30, &r1), commit(12, &r2)], &[]).unwrap();
        let r_sum = add_blinding_factors(&[r1, r2], &[]);
        assert_eq!(lhs, commit(42, &r_sum));
    }

    #[test]
    fn sum_to_zero_balances() {
        // An input spent back to an output of equal value and blinding
        // cancels to the identity.
        let r = BlindingFactor::random();
        let c = commit(500, &r);
        let zero = commit_sum(&[c], &[c]).unwrap();
        assert_eq!(zero, commit(0, &BlindingFactor::zero()));
    }

    #[test]
    fn excess_identity() {
        // outputs + fee·H − inputs == excess·G for excess = r_out − r_in.
        let r_in = BlindingFactor::random();
        let r_out = BlindingFactor::random();
        let fee = 8_000u64;
        let input = commit(100_000, &r_in);
        let output = commit(100_000 - fee, &r_out);

        let lhs = commit_sum(&[output, commit_value_only(fee)], &[input]).unwrap();
        let excess = add_blinding_factors(&[r_out], &[r_in]);
        assert_eq!(lhs, commit_blind_only(&excess));
    }

    #[test]
    fn invalid_point_rejected() {
        // Not every 32-byte string is a valid Ristretto encoding.
        let bogus = Commitment::from_bytes([0xFF; 32]);
        assert_eq!(
            commit_sum(&[bogus], &[]),
            Err(CryptoError::InvalidPoint)
        );
    }

    #[test]
    fn hex_roundtrip() {
        let c = commit(1, &BlindingFactor::from_bytes([9u8; 32]));
        assert_eq!(Commitment::from_hex(&c.to_hex()), Some(c));
    }

    #[test]
    fn blinding_debug_redacted() {
        let b = BlindingFactor::from_bytes([42u8; 32]);
        let s = format!("{b:?}");
        assert!(s.contains("REDACTED"));
        assert!(!s.contains("42"));
    }
}

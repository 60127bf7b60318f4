//! Aggregate Schnorr signatures for transaction kernels.
//!
//! Multi-party signing follows the slate protocol: every participant knows
//! the sums `R_sum = Σ R_i` and `P_sum = Σ P_i`, computes the shared
//! challenge `e = H(R_sum || P_sum || m)`, and contributes a partial
//! `s_i = k_i + e·x_i`. The aggregate `(R_sum, Σ s_i)` verifies as a plain
//! Schnorr signature under `P_sum`.

use blake2::digest::consts::U64;
use blake2::{Blake2b, Digest};
use curve25519_dalek::ristretto::CompressedRistretto;
use curve25519_dalek::scalar::Scalar;

use super::commitment::pedersen_gens;
use super::keys::{PublicKey, SecretKey};
use super::CryptoError;
use crate::core::hash::Hash;
use crate::ser::{Readable, Reader, SerError, Writeable, Writer};

type Blake2b512 = Blake2b<U64>;

/// A 64-byte Schnorr signature `(R, s)`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Signature {
    r: [u8; 32],
    s: [u8; 32],
}

impl Signature {
    pub fn from_parts(r: [u8; 32], s: [u8; 32]) -> Self {
        Signature { r, s }
    }

    pub fn to_bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&self.r);
        out[32..].copy_from_slice(&self.s);
        out
    }

    pub fn from_bytes(bytes: &[u8; 64]) -> Self {
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..]);
        Signature { r, s }
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 64] = bytes.try_into().ok()?;
        Some(Self::from_bytes(&arr))
    }

    /// The public nonce this signature commits to.
    pub fn nonce(&self) -> PublicKey {
        PublicKey::from_bytes(self.r)
    }
}

impl Writeable for Signature {
    fn write(&self, writer: &mut Writer) {
        writer.write_fixed(&self.r);
        writer.write_fixed(&self.s);
    }
}

impl Readable for Signature {
    fn read(reader: &mut Reader<'_>) -> Result<Self, SerError> {
        let r = reader.read_fixed_32()?;
        let s = reader.read_fixed_32()?;
        Ok(Signature { r, s })
    }
}

impl serde::Serialize for Signature {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            serializer.serialize_bytes(&self.to_bytes())
        }
    }
}

impl<'de> serde::Deserialize<'de> for Signature {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            Signature::from_hex(&s).ok_or_else(|| D::Error::custom("invalid signature hex"))
        } else {
            let bytes = Vec::<u8>::deserialize(deserializer)?;
            let arr: [u8; 64] = bytes
                .try_into()
                .map_err(|_| D::Error::custom("invalid signature length"))?;
            Ok(Signature::from_bytes(&arr))
        }
    }
}

/// A single participant's partial signature scalar.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PartialSignature(pub [u8; 32]);

impl PartialSignature {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Some(PartialSignature(bytes.try_into().ok()?))
    }
}

/// The shared challenge `e = H(R_sum || P_sum || m)`, wide-reduced.
fn challenge(nonce_sum: &PublicKey, pubkey_sum: &PublicKey, msg: &Hash) -> Scalar {
    let mut hasher = Blake2b512::new();
    hasher.update(nonce_sum.as_bytes());
    hasher.update(pubkey_sum.as_bytes());
    hasher.update(msg.as_bytes());
    let out = hasher.finalize();
    let mut wide = [0u8; 64];
    wide.copy_from_slice(&out);
    Scalar::from_bytes_mod_order_wide(&wide)
}

/// Produce a partial signature `s_i = k_i + e·x_i` against the shared sums.
pub fn sign_partial(
    secret: &SecretKey,
    secret_nonce: &SecretKey,
    nonce_sum: &PublicKey,
    pubkey_sum: &PublicKey,
    msg: &Hash,
) -> PartialSignature {
    let e = challenge(nonce_sum, pubkey_sum, msg);
    let s = secret_nonce.scalar() + e * secret.scalar();
    PartialSignature(s.to_bytes())
}

/// Verify one participant's partial against their own `R_i` and `P_i` under
/// the shared challenge: `s_i·G == R_i + e·P_i`.
pub fn verify_partial(
    partial: &PartialSignature,
    public_nonce: &PublicKey,
    public_key: &PublicKey,
    nonce_sum: &PublicKey,
    pubkey_sum: &PublicKey,
    msg: &Hash,
) -> Result<(), CryptoError> {
    let e = challenge(nonce_sum, pubkey_sum, msg);
    let s = Option::<Scalar>::from(Scalar::from_canonical_bytes(partial.0))
        .ok_or(CryptoError::InvalidSignature)?;
    let lhs = s * pedersen_gens().B_blinding;
    let rhs = public_nonce.decompress()? + e * public_key.decompress()?;
    if lhs == rhs {
        Ok(())
    } else {
        Err(CryptoError::InvalidSignature)
    }
}

/// Aggregate partials into the final signature `(R_sum, Σ s_i)`.
pub fn aggregate(
    partials: &[PartialSignature],
    nonce_sum: &PublicKey,
) -> Result<Signature, CryptoError> {
    let mut s = Scalar::ZERO;
    for partial in partials {
        s += Option::<Scalar>::from(Scalar::from_canonical_bytes(partial.0))
            .ok_or(CryptoError::InvalidSignature)?;
    }
    Ok(Signature {
        r: *nonce_sum.as_bytes(),
        s: s.to_bytes(),
    })
}

/// Verify a full signature against the aggregate public key:
/// `s·G == R + H(R || P || m)·P`.
pub fn verify(sig: &Signature, pubkey: &PublicKey, msg: &Hash) -> Result<(), CryptoError> {
    let r_pub = PublicKey::from_bytes(sig.r);
    let e = challenge(&r_pub, pubkey, msg);
    let s = Option::<Scalar>::from(Scalar::from_canonical_bytes(sig.s))
        .ok_or(CryptoError::InvalidSignature)?;
    let r_point = CompressedRistretto(sig.r)
        .decompress()
        .ok_or(CryptoError::InvalidPoint)?;
    let lhs = s * pedersen_gens().B_blinding;
    let rhs = r_point + e * pubkey.decompress()?;
    if lhs == rhs {
        Ok(())
    } else {
        Err(CryptoError::InvalidSignature)
    }
}

/// Single-signer convenience: sign with a fresh random nonce (coinbase
/// kernels, tests).
pub fn sign_single(secret: &SecretKey, msg: &Hash) -> Signature {
    let nonce = SecretKey::random();
    let nonce_pub = PublicKey::from_secret(&nonce);
    let pubkey = PublicKey::from_secret(secret);
    let partial = sign_partial(secret, &nonce, &nonce_pub, &pubkey, msg);
    Signature {
        r: *nonce_pub.as_bytes(),
        s: partial.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hash::hash_bytes;
    use crate::crypto::keys::sum_public_keys;

    #[test]
    fn single_signer_roundtrip() {
        let sk = SecretKey::from_bytes([1u8; 32]);
        let pk = PublicKey::from_secret(&sk);
        let msg = hash_bytes(b"kernel");
        let sig = sign_single(&sk, &msg);
        assert!(verify(&sig, &pk, &msg).is_ok());
    }

    #[test]
    fn wrong_message_rejected() {
        let sk = SecretKey::from_bytes([1u8; 32]);
        let pk = PublicKey::from_secret(&sk);
        let sig = sign_single(&sk, &hash_bytes(b"kernel"));
        assert_eq!(
            verify(&sig, &pk, &hash_bytes(b"other")),
            Err(CryptoError::InvalidSignature)
        );
    }

    #[test]
    fn wrong_key_rejected() {
        let sk = SecretKey::from_bytes([1u8; 32]);
        let other = PublicKey::from_secret(&SecretKey::from_bytes([2u8; 32]));
        let msg = hash_bytes(b"kernel");
        let sig = sign_single(&sk, &msg);
        assert_eq!(verify(&sig, &other, &msg), Err(CryptoError::InvalidSignature));
    }

    #[test]
    fn two_party_aggregate_verifies() {
        // The slate flow: both parties sign against shared sums, the
        // aggregate verifies under the summed public key.
        let (x1, x2) = (SecretKey::from_bytes([1u8; 32]), SecretKey::from_bytes([2u8; 32]));
        let (k1, k2) = (SecretKey::from_bytes([3u8; 32]), SecretKey::from_bytes([4u8; 32]));
        let p_sum =
            sum_public_keys(&[PublicKey::from_secret(&x1), PublicKey::from_secret(&x2)]).unwrap();
        let r_sum =
            sum_public_keys(&[PublicKey::from_secret(&k1), PublicKey::from_secret(&k2)]).unwrap();
        let msg = hash_bytes(b"fee|lock_height");

        let s1 = sign_partial(&x1, &k1, &r_sum, &p_sum, &msg);
        let s2 = sign_partial(&x2, &k2, &r_sum, &p_sum, &msg);

        verify_partial(&s1, &PublicKey::from_secret(&k1), &PublicKey::from_secret(&x1), &r_sum, &p_sum, &msg)
            .unwrap();
        verify_partial(&s2, &PublicKey::from_secret(&k2), &PublicKey::from_secret(&x2), &r_sum, &p_sum, &msg)
            .unwrap();

        let sig = aggregate(&[s1, s2], &r_sum).unwrap();
        assert!(verify(&sig, &p_sum, &msg).is_ok());
    }

    #[test]
    fn tampered_partial_rejected() {
        let (x1, k1) = (SecretKey::from_bytes([1u8; 32]), SecretKey::from_bytes([3u8; 32]));
        let p = PublicKey::from_secret(&x1);
        let r = PublicKey::from_secret(&k1);
        let msg = hash_bytes(b"m");
        let mut s1 = sign_partial(&x1, &k1, &r, &p, &msg);
        s1.0[0] ^= 1;
        assert!(verify_partial(&s1, &r, &p, &r, &p, &msg).is_err());
    }

    #[test]
    fn signature_bytes_roundtrip() {
        let sk = SecretKey::from_bytes([5u8; 32]);
        let sig = sign_single(&sk, &hash_bytes(b"x"));
        assert_eq!(Signature::from_bytes(&sig.to_bytes()), sig);
        assert_eq!(Signature::from_hex(&sig.to_hex()), Some(sig));
    }
}

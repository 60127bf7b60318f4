//! Secret/public keys on the blinding generator, and the wallet keychain.
//!
//! Public keys here are points on `G` (the Pedersen blinding generator), the
//! same generator kernel excesses live on, so a participant's
//! `public_blind_excess` in a slate and a kernel excess commitment are
//! directly comparable.

use std::fmt;

use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::Identity;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::commitment::{pedersen_gens, BlindingFactor};
use super::CryptoError;
use crate::core::hash::{hash_bytes, Hash};
use crate::ser::{Readable, Reader, SerError, Writeable, Writer};

/// A secret scalar.
///
/// Debug output is redacted to prevent accidental logging of secret values.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey(Scalar);

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey([REDACTED])")
    }
}

impl SecretKey {
    pub fn random() -> Self {
        SecretKey(Scalar::random(&mut OsRng))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        SecretKey(Scalar::from_bytes_mod_order(bytes))
    }

    /// Reduce 64 uniform bytes onto the scalar field, for key derivation.
    pub fn from_wide_bytes(bytes: [u8; 64]) -> Self {
        SecretKey(Scalar::from_bytes_mod_order_wide(&bytes))
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub(crate) fn scalar(&self) -> Scalar {
        self.0
    }

    pub fn to_blinding(&self) -> BlindingFactor {
        BlindingFactor::from_bytes(self.0.to_bytes())
    }
}

impl From<&BlindingFactor> for SecretKey {
    fn from(blinding: &BlindingFactor) -> Self {
        SecretKey(blinding.scalar())
    }
}

/// A compressed public point on the blinding generator.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    /// `secret · G`.
    pub fn from_secret(secret: &SecretKey) -> Self {
        let point = secret.0 * pedersen_gens().B_blinding;
        PublicKey(point.compress().to_bytes())
    }

    pub fn from_blinding(blinding: &BlindingFactor) -> Self {
        Self::from_secret(&SecretKey::from(blinding))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Some(PublicKey(bytes.try_into().ok()?))
    }

    pub(crate) fn decompress(&self) -> Result<RistrettoPoint, CryptoError> {
        CompressedRistretto(self.0)
            .decompress()
            .ok_or(CryptoError::InvalidPoint)
    }

    pub(crate) fn from_point(point: RistrettoPoint) -> Self {
        PublicKey(point.compress().to_bytes())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.0[..4]))
    }
}

impl Writeable for PublicKey {
    fn write(&self, writer: &mut Writer) {
        writer.write_fixed(&self.0);
    }
}

impl Readable for PublicKey {
    fn read(reader: &mut Reader<'_>) -> Result<Self, SerError> {
        Ok(PublicKey(reader.read_fixed_32()?))
    }
}

impl serde::Serialize for PublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> serde::Deserialize<'de> for PublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            PublicKey::from_hex(&s).ok_or_else(|| D::Error::custom("invalid public key hex"))
        } else {
            let bytes = Vec::<u8>::deserialize(deserializer)?;
            let arr: [u8; 32] = bytes
                .try_into()
                .map_err(|_| D::Error::custom("invalid public key length"))?;
            Ok(PublicKey(arr))
        }
    }
}

/// Sum public keys (e.g. `R_s + R_r`, `P_s + P_r` during slate exchange).
pub fn sum_public_keys(keys: &[PublicKey]) -> Result<PublicKey, CryptoError> {
    let mut sum = RistrettoPoint::identity();
    for key in keys {
        sum += key.decompress()?;
    }
    Ok(PublicKey::from_point(sum))
}

/// The wallet keychain: deterministic child keys from a 32-byte master seed.
///
/// Child secrets come from HKDF-SHA256 keyed on the seed and expanded per
/// derivation index; the rewind root is a separate HKDF domain so range-proof
/// rewind nonces never collide with spending keys.
pub struct Keychain {
    seed: [u8; 32],
}

impl Drop for Keychain {
    fn drop(&mut self) {
        self.seed.zeroize();
    }
}

impl fmt::Debug for Keychain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Keychain([REDACTED])")
    }
}

impl Keychain {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Keychain { seed }
    }

    /// Derive the child secret key at `index`.
    pub fn derive_key(&self, index: u32) -> SecretKey {
        let hk = Hkdf::<Sha256>::new(Some(b"mimble.keychain"), &self.seed);
        let mut okm = [0u8; 64];
        hk.expand(&index.to_be_bytes(), &mut okm)
            .expect("64 bytes is a valid HKDF output length");
        let key = SecretKey::from_wide_bytes(okm);
        okm.zeroize();
        key
    }

    /// Derive the blinding factor at `index`.
    pub fn derive_blinding(&self, index: u32) -> BlindingFactor {
        self.derive_key(index).to_blinding()
    }

    /// The wallet-wide rewind root nonce.
    fn rewind_root(&self) -> [u8; 32] {
        let hk = Hkdf::<Sha256>::new(Some(b"mimble.rewind"), &self.seed);
        let mut okm = [0u8; 32];
        hk.expand(b"root", &mut okm)
            .expect("32 bytes is a valid HKDF output length");
        okm
    }

    /// The per-output rewind nonce: bound to the commitment so proofs from
    /// other wallets never rewind under our root.
    pub fn rewind_nonce(&self, commitment_bytes: &[u8]) -> Hash {
        let root = self.rewind_root();
        let mut data = Vec::with_capacity(32 + commitment_bytes.len());
        data.extend_from_slice(&root);
        data.extend_from_slice(commitment_bytes);
        hash_bytes(&data)
    }
}

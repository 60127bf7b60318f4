//! The chain hash: 32-byte Blake2b over canonical serialization.

use std::fmt;

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};

use crate::ser::{self, Readable, Reader, SerError, Writeable, Writer};

type Blake2b256 = Blake2b<U32>;

/// A 32-byte Blake2b digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Hash([u8; 32]);

/// The all-zero hash.
pub const ZERO_HASH: Hash = Hash([0u8; 32]);

impl Hash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Hash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Hash(arr))
    }

    /// Short form for logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.short())
    }
}

impl Writeable for Hash {
    fn write(&self, writer: &mut Writer) {
        writer.write_fixed(&self.0);
    }
}

impl Readable for Hash {
    fn read(reader: &mut Reader<'_>) -> Result<Self, SerError> {
        Ok(Hash(reader.read_fixed_32()?))
    }
}

impl serde::Serialize for Hash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> serde::Deserialize<'de> for Hash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            Hash::from_hex(&s).ok_or_else(|| D::Error::custom("invalid hash hex"))
        } else {
            let bytes = Vec::<u8>::deserialize(deserializer)?;
            let arr: [u8; 32] = bytes
                .try_into()
                .map_err(|_| D::Error::custom("invalid hash length"))?;
            Ok(Hash(arr))
        }
    }
}

/// Blake2b-256 of raw bytes.
pub fn hash_bytes(data: &[u8]) -> Hash {
    let mut hasher = Blake2b256::new();
    hasher.update(data);
    let out = hasher.finalize();
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&out);
    Hash(bytes)
}

/// Blake2b-256 of a one-byte type tag followed by raw bytes.
///
/// Body elements hash under a type tag so an input and an output with equal
/// byte encodings can never collide in sort order.
pub fn hash_tagged(tag: u8, data: &[u8]) -> Hash {
    let mut hasher = Blake2b256::new();
    hasher.update([tag]);
    hasher.update(data);
    let out = hasher.finalize();
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&out);
    Hash(bytes)
}

/// Objects with a canonical chain hash.
pub trait Hashed {
    fn hash(&self) -> Hash;
}

/// Marker for objects whose hash is the plain Blake2b of their canonical
/// serialization. Body elements opt out and hash under a type tag instead.
pub trait DefaultHashable: Writeable {}

impl<T: DefaultHashable> Hashed for T {
    fn hash(&self) -> Hash {
        hash_bytes(&ser::ser_vec(self))
    }
}

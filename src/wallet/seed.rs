//! The encrypted wallet seed file.
//!
//! The 32-byte master seed is wrapped with a scrypt-derived AES-256-GCM key
//! and stored as JSON (`salt`, `nonce`, `ciphertext`, all hex) in the wallet
//! directory. Opening with the wrong password fails AEAD authentication and
//! never yields garbage key material.

use std::fs;
use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use scrypt::Params;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::WalletError;

const SEED_FILE: &str = "wallet.seed";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// scrypt cost parameters: interactive-login strength.
const SCRYPT_LOG_N: u8 = 15;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

/// The master seed. Debug output is redacted.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct WalletSeed([u8; 32]);

impl std::fmt::Debug for WalletSeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WalletSeed([REDACTED])")
    }
}

impl WalletSeed {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        WalletSeed(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The keychain rooted at this seed.
    pub fn keychain(&self) -> crate::crypto::keys::Keychain {
        crate::crypto::keys::Keychain::from_seed(self.0)
    }
}

#[derive(Serialize, Deserialize)]
struct SeedFile {
    salt: String,
    nonce: String,
    ciphertext: String,
}

fn derive_key(password: &str, salt: &[u8]) -> Result<[u8; 32], WalletError> {
    let params = Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, 32)
        .map_err(|e| WalletError::Seed(e.to_string()))?;
    let mut key = [0u8; 32];
    scrypt::scrypt(password.as_bytes(), salt, &params, &mut key)
        .map_err(|e| WalletError::Seed(e.to_string()))?;
    Ok(key)
}

/// Generate a fresh random seed and write it encrypted under `password`.
pub fn init(wallet_dir: &Path, password: &str) -> Result<WalletSeed, WalletError> {
    fs::create_dir_all(wallet_dir).map_err(|e| WalletError::Seed(e.to_string()))?;
    let path = wallet_dir.join(SEED_FILE);
    if path.exists() {
        return Err(WalletError::Seed("seed file already exists".into()));
    }

    let mut seed_bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut seed_bytes);
    let seed = WalletSeed(seed_bytes);
    write_seed(&path, &seed, password)?;
    Ok(seed)
}

fn write_seed(path: &Path, seed: &WalletSeed, password: &str) -> Result<(), WalletError> {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let mut key = derive_key(password, &salt)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), seed.0.as_slice())
        .map_err(|_| WalletError::Seed("encryption failed".into()))?;
    key.zeroize();

    let record = SeedFile {
        salt: hex::encode(salt),
        nonce: hex::encode(nonce),
        ciphertext: hex::encode(ciphertext),
    };
    let json =
        serde_json::to_string_pretty(&record).map_err(|e| WalletError::Seed(e.to_string()))?;
    fs::write(path, json).map_err(|e| WalletError::Seed(e.to_string()))?;
    Ok(())
}

/// Open and decrypt the seed file.
pub fn open(wallet_dir: &Path, password: &str) -> Result<WalletSeed, WalletError> {
    let path = wallet_dir.join(SEED_FILE);
    let json = fs::read_to_string(&path).map_err(|e| WalletError::Seed(e.to_string()))?;
    let record: SeedFile =
        serde_json::from_str(&json).map_err(|e| WalletError::Seed(e.to_string()))?;

    let salt = hex::decode(&record.salt).map_err(|_| WalletError::Seed("bad salt".into()))?;
    let nonce = hex::decode(&record.nonce).map_err(|_| WalletError::Seed("bad nonce".into()))?;
    let ciphertext = hex::decode(&record.ciphertext)
        .map_err(|_| WalletError::Seed("bad ciphertext".into()))?;
    if nonce.len() != NONCE_LEN {
        return Err(WalletError::Seed("bad nonce length".into()));
    }

    let mut key = derive_key(password, &salt)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
        .map_err(|_| WalletError::Seed("wrong password or corrupted seed".into()))?;
    key.zeroize();

    let bytes: [u8; 32] = plaintext
        .try_into()
        .map_err(|_| WalletError::Seed("bad seed length".into()))?;
    Ok(WalletSeed(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let seed = init(dir.path(), "hunter2").unwrap();
        let reopened = open(dir.path(), "hunter2").unwrap();
        assert_eq!(seed.as_bytes(), reopened.as_bytes());
    }

    #[test]
    fn wrong_password_rejected() {
        let dir = tempfile::tempdir().unwrap();
        init(dir.path(), "hunter2").unwrap();
        assert!(open(dir.path(), "hunter3").is_err());
    }

    #[test]
    fn double_init_rejected() {
        let dir = tempfile::tempdir().unwrap();
        init(dir.path(), "pw").unwrap();
        assert!(init(dir.path(), "pw").is_err());
    }

    #[test]
    fn corrupted_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        init(dir.path(), "pw").unwrap();
        let path = dir.path().join(SEED_FILE);
        let mut record: SeedFile =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        let mut ct = hex::decode(&record.ciphertext).unwrap();
        ct[0] ^= 1;
        record.ciphertext = hex::encode(ct);
        fs::write(&path, serde_json::to_string(&record).unwrap()).unwrap();
        assert!(open(dir.path(), "pw").is_err());
    }

    #[test]
    fn seeds_are_unique() {
        let dir1 = tempfile::tempdir().unwrap();
        let dir2 = tempfile::tempdir().unwrap();
        let s1 = init(dir1.path(), "pw").unwrap();
        let s2 = init(dir2.path(), "pw").unwrap();
        assert_ne!(s1.as_bytes(), s2.as_bytes());
    }

    #[test]
    fn keychain_derives_from_seed() {
        let seed = WalletSeed::from_bytes([7u8; 32]);
        let k1 = seed.keychain().derive_key(0);
        let k2 = crate::crypto::keys::Keychain::from_seed([7u8; 32]).derive_key(0);
        assert_eq!(k1.to_bytes(), k2.to_bytes());
    }
}

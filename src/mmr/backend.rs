//! MMR storage backends.
//!
//! A backend stores node hashes densely by position, leaf data for unpruned
//! leaves, and the pruned-leaf set. Mutations are staged in memory; `flush`
//! makes them durable, `discard` drops them back to the last flushed state,
//! which is what lets a failed block application roll the MMR files back.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::MmrError;
use crate::core::hash::Hash;

/// Storage contract for a PMMR.
pub trait Backend {
    fn append(&mut self, hash: Hash, leaf_data: Option<Vec<u8>>) -> Result<(), MmrError>;
    fn get_hash(&self, pos: u64) -> Option<Hash>;
    fn get_leaf_data(&self, pos: u64) -> Option<Vec<u8>>;
    fn is_pruned(&self, pos: u64) -> bool;
    fn size(&self) -> u64;
    fn rewind(&mut self, size: u64) -> Result<(), MmrError>;
    fn prune(&mut self, pos: u64) -> Result<(), MmrError>;
    fn compact(&mut self) -> Result<(), MmrError>;
    fn flush(&mut self) -> Result<(), MmrError>;
    fn discard(&mut self);

    /// Export the full state image (archive building, snapshots).
    fn export_state(&self) -> MmrState {
        let size = self.size();
        let mut state = MmrState::default();
        for pos in 0..size {
            state
                .hashes
                .push(self.get_hash(pos).unwrap_or(crate::core::hash::ZERO_HASH));
            if let Some(data) = self.get_leaf_data(pos) {
                state.leaf_data.insert(pos, data);
            }
            if self.is_pruned(pos) {
                state.pruned.insert(pos);
            }
        }
        state
    }
}

impl Backend for Box<dyn Backend + Send + Sync> {
    fn append(&mut self, hash: Hash, leaf_data: Option<Vec<u8>>) -> Result<(), MmrError> {
        (**self).append(hash, leaf_data)
    }
    fn get_hash(&self, pos: u64) -> Option<Hash> {
        (**self).get_hash(pos)
    }
    fn get_leaf_data(&self, pos: u64) -> Option<Vec<u8>> {
        (**self).get_leaf_data(pos)
    }
    fn is_pruned(&self, pos: u64) -> bool {
        (**self).is_pruned(pos)
    }
    fn size(&self) -> u64 {
        (**self).size()
    }
    fn rewind(&mut self, size: u64) -> Result<(), MmrError> {
        (**self).rewind(size)
    }
    fn prune(&mut self, pos: u64) -> Result<(), MmrError> {
        (**self).prune(pos)
    }
    fn compact(&mut self) -> Result<(), MmrError> {
        (**self).compact()
    }
    fn flush(&mut self) -> Result<(), MmrError> {
        (**self).flush()
    }
    fn discard(&mut self) {
        (**self).discard()
    }
    fn export_state(&self) -> MmrState {
        (**self).export_state()
    }
}

/// The complete in-memory image of one MMR.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MmrState {
    pub hashes: Vec<Hash>,
    pub leaf_data: BTreeMap<u64, Vec<u8>>,
    pub pruned: BTreeSet<u64>,
}

impl MmrState {
    fn append(&mut self, hash: Hash, leaf_data: Option<Vec<u8>>) {
        let pos = self.hashes.len() as u64;
        self.hashes.push(hash);
        if let Some(data) = leaf_data {
            self.leaf_data.insert(pos, data);
        }
    }

    fn rewind(&mut self, size: u64) {
        self.hashes.truncate(size as usize);
        self.leaf_data.retain(|pos, _| *pos < size);
        self.pruned.retain(|pos| *pos < size);
    }

    fn prune(&mut self, pos: u64) -> Result<(), MmrError> {
        if !self.pruned.insert(pos) {
            return Err(MmrError::AlreadyPruned(pos));
        }
        Ok(())
    }

    fn compact(&mut self) {
        let pruned = self.pruned.clone();
        self.leaf_data.retain(|pos, _| !pruned.contains(pos));
    }
}

/// An in-memory backend with flush/discard staging.
#[derive(Default)]
pub struct MemBackend {
    staged: MmrState,
    committed: MmrState,
}

impl MemBackend {
    pub fn new() -> Self {
        MemBackend::default()
    }

    /// Seed a backend directly from a state image (archive import).
    pub fn from_state(state: MmrState) -> Self {
        MemBackend {
            staged: state.clone(),
            committed: state,
        }
    }

    pub fn state(&self) -> &MmrState {
        &self.staged
    }
}

impl Backend for MemBackend {
    fn append(&mut self, hash: Hash, leaf_data: Option<Vec<u8>>) -> Result<(), MmrError> {
        self.staged.append(hash, leaf_data);
        Ok(())
    }

    fn get_hash(&self, pos: u64) -> Option<Hash> {
        self.staged.hashes.get(pos as usize).copied()
    }

    fn get_leaf_data(&self, pos: u64) -> Option<Vec<u8>> {
        self.staged.leaf_data.get(&pos).cloned()
    }

    fn is_pruned(&self, pos: u64) -> bool {
        self.staged.pruned.contains(&pos)
    }

    fn size(&self) -> u64 {
        self.staged.hashes.len() as u64
    }

    fn rewind(&mut self, size: u64) -> Result<(), MmrError> {
        self.staged.rewind(size);
        Ok(())
    }

    fn prune(&mut self, pos: u64) -> Result<(), MmrError> {
        self.staged.prune(pos)
    }

    fn compact(&mut self) -> Result<(), MmrError> {
        self.staged.compact();
        Ok(())
    }

    fn flush(&mut self) -> Result<(), MmrError> {
        self.committed = self.staged.clone();
        Ok(())
    }

    fn discard(&mut self) {
        self.staged = self.committed.clone();
    }
}

/// A file-backed backend.
///
/// Layout inside the directory, one MMR per directory:
/// - `pmmr_hash.bin` — concatenated 32-byte node hashes
/// - `pmmr_data.bin` — `pos:u64 || len:u64 || bytes` records for leaf data
/// - `pmmr_leaf.bin` — `u64` positions of leaves carrying data
/// - `pmmr_prun.bin` — `u64` positions of pruned leaves
///
/// Files are rewritten whole on flush via a temp-and-rename; the chain holds
/// one writer at a time, so this is the simple end of crash consistency.
pub struct FileBackend {
    dir: PathBuf,
    staged: MmrState,
    committed: MmrState,
}

const HASH_FILE: &str = "pmmr_hash.bin";
const DATA_FILE: &str = "pmmr_data.bin";
const LEAF_FILE: &str = "pmmr_leaf.bin";
const PRUN_FILE: &str = "pmmr_prun.bin";

fn io_err(e: std::io::Error) -> MmrError {
    MmrError::Io(e.to_string())
}

impl FileBackend {
    /// Open (or create) the MMR files in `dir`.
    pub fn open(dir: &Path) -> Result<Self, MmrError> {
        fs::create_dir_all(dir).map_err(io_err)?;
        let state = Self::load(dir)?;
        Ok(FileBackend {
            dir: dir.to_path_buf(),
            staged: state.clone(),
            committed: state,
        })
    }

    fn load(dir: &Path) -> Result<MmrState, MmrError> {
        let mut state = MmrState::default();

        let hash_path = dir.join(HASH_FILE);
        if hash_path.exists() {
            let bytes = fs::read(&hash_path).map_err(io_err)?;
            if bytes.len() % 32 != 0 {
                return Err(MmrError::Corrupted("hash file length not a multiple of 32"));
            }
            for chunk in bytes.chunks_exact(32) {
                state.hashes.push(Hash::from_bytes(chunk.try_into().unwrap()));
            }
        }

        let data_path = dir.join(DATA_FILE);
        if data_path.exists() {
            let bytes = fs::read(&data_path).map_err(io_err)?;
            let mut at = 0usize;
            while at < bytes.len() {
                if at + 16 > bytes.len() {
                    return Err(MmrError::Corrupted("truncated data record header"));
                }
                let pos = u64::from_be_bytes(bytes[at..at + 8].try_into().unwrap());
                let len = u64::from_be_bytes(bytes[at + 8..at + 16].try_into().unwrap()) as usize;
                at += 16;
                if at + len > bytes.len() {
                    return Err(MmrError::Corrupted("truncated data record"));
                }
                state.leaf_data.insert(pos, bytes[at..at + len].to_vec());
                at += len;
            }
        }

        let prun_path = dir.join(PRUN_FILE);
        if prun_path.exists() {
            let bytes = fs::read(&prun_path).map_err(io_err)?;
            if bytes.len() % 8 != 0 {
                return Err(MmrError::Corrupted("prune file length not a multiple of 8"));
            }
            for chunk in bytes.chunks_exact(8) {
                state.pruned.insert(u64::from_be_bytes(chunk.try_into().unwrap()));
            }
        }

        Ok(state)
    }

    fn write_file(&self, name: &str, bytes: &[u8]) -> Result<(), MmrError> {
        let tmp = self.dir.join(format!("{name}.tmp"));
        let target = self.dir.join(name);
        {
            let mut file = fs::File::create(&tmp).map_err(io_err)?;
            file.write_all(bytes).map_err(io_err)?;
            file.sync_all().map_err(io_err)?;
        }
        fs::rename(&tmp, &target).map_err(io_err)?;
        Ok(())
    }

    pub fn state(&self) -> &MmrState {
        &self.staged
    }
}

impl Backend for FileBackend {
    fn append(&mut self, hash: Hash, leaf_data: Option<Vec<u8>>) -> Result<(), MmrError> {
        self.staged.append(hash, leaf_data);
        Ok(())
    }

    fn get_hash(&self, pos: u64) -> Option<Hash> {
        self.staged.hashes.get(pos as usize).copied()
    }

    fn get_leaf_data(&self, pos: u64) -> Option<Vec<u8>> {
        self.staged.leaf_data.get(&pos).cloned()
    }

    fn is_pruned(&self, pos: u64) -> bool {
        self.staged.pruned.contains(&pos)
    }

    fn size(&self) -> u64 {
        self.staged.hashes.len() as u64
    }

    fn rewind(&mut self, size: u64) -> Result<(), MmrError> {
        self.staged.rewind(size);
        Ok(())
    }

    fn prune(&mut self, pos: u64) -> Result<(), MmrError> {
        self.staged.prune(pos)
    }

    fn compact(&mut self) -> Result<(), MmrError> {
        self.staged.compact();
        Ok(())
    }

    fn flush(&mut self) -> Result<(), MmrError> {
        let mut hash_bytes = Vec::with_capacity(self.staged.hashes.len() * 32);
        for hash in &self.staged.hashes {
            hash_bytes.extend_from_slice(hash.as_bytes());
        }
        self.write_file(HASH_FILE, &hash_bytes)?;

        let mut data_bytes = Vec::new();
        let mut leaf_bytes = Vec::new();
        for (pos, data) in &self.staged.leaf_data {
            data_bytes.extend_from_slice(&pos.to_be_bytes());
            data_bytes.extend_from_slice(&(data.len() as u64).to_be_bytes());
            data_bytes.extend_from_slice(data);
            leaf_bytes.extend_from_slice(&pos.to_be_bytes());
        }
        self.write_file(DATA_FILE, &data_bytes)?;
        self.write_file(LEAF_FILE, &leaf_bytes)?;

        let mut prun_bytes = Vec::with_capacity(self.staged.pruned.len() * 8);
        for pos in &self.staged.pruned {
            prun_bytes.extend_from_slice(&pos.to_be_bytes());
        }
        self.write_file(PRUN_FILE, &prun_bytes)?;

        self.committed = self.staged.clone();
        Ok(())
    }

    fn discard(&mut self) {
        self.staged = self.committed.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmr::Pmmr;

    #[test]
    fn file_backend_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let root = {
            let backend = FileBackend::open(dir.path()).unwrap();
            let mut pmmr: Pmmr<u64, FileBackend> = Pmmr::new(backend).unwrap();
            for i in 0u64..6 {
                pmmr.push(&i).unwrap();
            }
            pmmr.flush().unwrap();
            pmmr.root().unwrap()
        };

        let backend = FileBackend::open(dir.path()).unwrap();
        let pmmr: Pmmr<u64, FileBackend> = Pmmr::new(backend).unwrap();
        assert_eq!(pmmr.root().unwrap(), root);
        assert_eq!(pmmr.n_leaves(), 6);
        assert_eq!(pmmr.get_leaf(crate::mmr::leaf_index_to_pos(3)), Some(3));
    }

    #[test]
    fn discard_drops_unflushed_appends() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        let mut pmmr: Pmmr<u64, FileBackend> = Pmmr::new(backend).unwrap();
        for i in 0u64..4 {
            pmmr.push(&i).unwrap();
        }
        pmmr.flush().unwrap();
        let flushed_root = pmmr.root().unwrap();
        let flushed_size = pmmr.size();

        for i in 4u64..8 {
            pmmr.push(&i).unwrap();
        }
        assert_ne!(pmmr.root().unwrap(), flushed_root);
        pmmr.discard();
        assert_eq!(pmmr.size(), flushed_size);
        assert_eq!(pmmr.root().unwrap(), flushed_root);
    }

    #[test]
    fn pruned_set_survives_flush_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let backend = FileBackend::open(dir.path()).unwrap();
            let mut pmmr: Pmmr<u64, FileBackend> = Pmmr::new(backend).unwrap();
            for i in 0u64..4 {
                pmmr.push(&i).unwrap();
            }
            pmmr.prune(0).unwrap();
            pmmr.compact().unwrap();
            pmmr.flush().unwrap();
        }
        let backend = FileBackend::open(dir.path()).unwrap();
        let pmmr: Pmmr<u64, FileBackend> = Pmmr::new(backend).unwrap();
        assert!(pmmr.backend().is_pruned(0));
        assert!(pmmr.get_leaf(0).is_none());
        assert_eq!(pmmr.get_leaf(1), Some(1));
    }

    #[test]
    fn mem_backend_from_state_roundtrip() {
        let mut state = MmrState::default();
        state.append(crate::core::hash::hash_bytes(b"leaf"), Some(vec![1, 2]));
        let backend = MemBackend::from_state(state.clone());
        assert_eq!(backend.state(), &state);
    }
}

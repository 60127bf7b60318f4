//! The block database: a columnar store over sled.
//!
//! Column families live behind one-byte key prefixes in a single sled tree so
//! a write batch commits atomically across all of them. The store holds
//! blocks, headers, per-block sums, the output-position index, per-block
//! spent-output undo sets (the sole source of truth for rewind), the chain
//! tips, and the best-chain height index.
//!
//! All mutation goes through a [`Batch`]: stage writes, then `commit`, or
//! drop the batch and nothing happened. The in-memory header cache is
//! write-through on commit only, so rolled-back headers are never visible.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::block::{BlockHeader, FullBlock};
use crate::core::hash::{Hash, Hashed};
use crate::crypto::commitment::Commitment;
use crate::ser;

/// Errors from the block database.
#[derive(Clone, Debug, Error)]
pub enum StoreError {
    #[error("database I/O error: {0}")]
    Io(String),
    #[error("database corrupt: {0}")]
    Corrupt(String),
    #[error("database transaction conflict")]
    TxnConflict,
    #[error("{0} not found")]
    NotFound(&'static str),
}

fn io_err(e: sled::Error) -> StoreError {
    StoreError::Io(e.to_string())
}

const PREFIX_BLOCK: u8 = b'b';
const PREFIX_HEADER: u8 = b'h';
const PREFIX_BLOCK_SUMS: u8 = b's';
const PREFIX_OUTPUT_POS: u8 = b'o';
const PREFIX_SPENT: u8 = b'u';
const PREFIX_META: u8 = b'm';
const PREFIX_HEIGHT: u8 = b'i';

const KEY_HEAD: &[u8] = b"head";
const KEY_HEADER_HEAD: &[u8] = b"header_head";
const KEY_SYNC_HEAD: &[u8] = b"sync_head";

fn key(prefix: u8, rest: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + rest.len());
    out.push(prefix);
    out.extend_from_slice(rest);
    out
}

/// A chain tip: a block hash with its height and cumulative difficulty.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tip {
    pub height: u64,
    pub hash: Hash,
    pub prev_hash: Hash,
    pub total_difficulty: u64,
}

impl Tip {
    pub fn from_header(header: &BlockHeader) -> Self {
        Tip {
            height: header.height,
            hash: header.hash(),
            prev_hash: header.prev_hash,
            total_difficulty: header.total_difficulty,
        }
    }
}

/// Cumulative commitment sums up to and including a block, letting the whole-
/// chain identity be checked incrementally.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockSums {
    pub utxo_sum: Commitment,
    pub kernel_sum: Commitment,
}

/// Where an unspent output lives in the output MMR.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputPos {
    pub pos: u64,
    pub height: u64,
    pub coinbase: bool,
}

/// One entry of a block's undo set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpentOutput {
    pub commitment: Commitment,
    pub pos: OutputPos,
}

/// The block database handle. One per process.
pub struct ChainStore {
    db: sled::Db,
    header_cache: RwLock<HashMap<Hash, BlockHeader>>,
}

impl ChainStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(io_err)?;
        Ok(ChainStore {
            db,
            header_cache: RwLock::new(HashMap::new()),
        })
    }

    /// An in-memory store for tests.
    pub fn open_temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(io_err)?;
        Ok(ChainStore {
            db,
            header_cache: RwLock::new(HashMap::new()),
        })
    }

    fn get_raw(&self, key_bytes: &[u8]) -> Result<Option<sled::IVec>, StoreError> {
        self.db.get(key_bytes).map_err(io_err)
    }

    pub fn get_block(&self, hash: &Hash) -> Result<Option<FullBlock>, StoreError> {
        match self.get_raw(&key(PREFIX_BLOCK, hash.as_bytes()))? {
            Some(bytes) => {
                let block =
                    ser::deser(&bytes).map_err(|e| StoreError::Corrupt(e.to_string()))?;
                Ok(Some(block))
            }
            None => Ok(None),
        }
    }

    pub fn block_exists(&self, hash: &Hash) -> Result<bool, StoreError> {
        self.db
            .contains_key(key(PREFIX_BLOCK, hash.as_bytes()))
            .map_err(io_err)
    }

    pub fn get_header(&self, hash: &Hash) -> Result<Option<BlockHeader>, StoreError> {
        if let Some(header) = self
            .header_cache
            .read()
            .expect("header cache lock")
            .get(hash)
        {
            return Ok(Some(header.clone()));
        }
        match self.get_raw(&key(PREFIX_HEADER, hash.as_bytes()))? {
            Some(bytes) => {
                let header: BlockHeader =
                    ser::deser(&bytes).map_err(|e| StoreError::Corrupt(e.to_string()))?;
                self.header_cache
                    .write()
                    .expect("header cache lock")
                    .insert(*hash, header.clone());
                Ok(Some(header))
            }
            None => Ok(None),
        }
    }

    pub fn header_exists(&self, hash: &Hash) -> Result<bool, StoreError> {
        if self
            .header_cache
            .read()
            .expect("header cache lock")
            .contains_key(hash)
        {
            return Ok(true);
        }
        self.db
            .contains_key(key(PREFIX_HEADER, hash.as_bytes()))
            .map_err(io_err)
    }

    pub fn get_block_sums(&self, hash: &Hash) -> Result<Option<BlockSums>, StoreError> {
        match self.get_raw(&key(PREFIX_BLOCK_SUMS, hash.as_bytes()))? {
            Some(bytes) => bincode::deserialize(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Corrupt(e.to_string())),
            None => Ok(None),
        }
    }

    pub fn get_output_pos(&self, commitment: &Commitment) -> Result<Option<OutputPos>, StoreError> {
        match self.get_raw(&key(PREFIX_OUTPUT_POS, commitment.as_bytes()))? {
            Some(bytes) => bincode::deserialize(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Corrupt(e.to_string())),
            None => Ok(None),
        }
    }

    pub fn get_spent_outputs(&self, block_hash: &Hash) -> Result<Vec<SpentOutput>, StoreError> {
        match self.get_raw(&key(PREFIX_SPENT, block_hash.as_bytes()))? {
            Some(bytes) => {
                bincode::deserialize(&bytes).map_err(|e| StoreError::Corrupt(e.to_string()))
            }
            None => Ok(vec![]),
        }
    }

    fn get_tip(&self, name: &[u8]) -> Result<Option<Tip>, StoreError> {
        match self.get_raw(&key(PREFIX_META, name))? {
            Some(bytes) => bincode::deserialize(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Corrupt(e.to_string())),
            None => Ok(None),
        }
    }

    pub fn head(&self) -> Result<Option<Tip>, StoreError> {
        self.get_tip(KEY_HEAD)
    }

    pub fn header_head(&self) -> Result<Option<Tip>, StoreError> {
        self.get_tip(KEY_HEADER_HEAD)
    }

    pub fn sync_head(&self) -> Result<Option<Tip>, StoreError> {
        self.get_tip(KEY_SYNC_HEAD)
    }

    /// Best-chain header hash at a height.
    pub fn header_hash_by_height(&self, height: u64) -> Result<Option<Hash>, StoreError> {
        match self.get_raw(&key(PREFIX_HEIGHT, &height.to_be_bytes()))? {
            Some(bytes) => {
                let arr: [u8; 32] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| StoreError::Corrupt("height index entry".into()))?;
                Ok(Some(Hash::from_bytes(arr)))
            }
            None => Ok(None),
        }
    }

    /// Iterate all unspent output positions (archive export).
    pub fn output_pos_iter(&self) -> impl Iterator<Item = (Commitment, OutputPos)> + '_ {
        self.db
            .scan_prefix([PREFIX_OUTPUT_POS])
            .filter_map(|entry| entry.ok())
            .filter_map(|(k, v)| {
                let commitment = Commitment::from_bytes(k[1..].try_into().ok()?);
                let pos: OutputPos = bincode::deserialize(&v).ok()?;
                Some((commitment, pos))
            })
    }

    /// Start a write batch.
    pub fn batch(&self) -> Batch {
        Batch {
            batch: sled::Batch::default(),
            staged_headers: Vec::new(),
        }
    }

    /// Commit a batch atomically and write staged headers through to the
    /// cache. Dropping an uncommitted batch is the rollback path; the cache
    /// never sees its headers.
    pub fn commit(&self, batch: Batch) -> Result<(), StoreError> {
        self.db.apply_batch(batch.batch).map_err(io_err)?;
        if !batch.staged_headers.is_empty() {
            let mut cache = self.header_cache.write().expect("header cache lock");
            for (hash, header) in batch.staged_headers {
                cache.insert(hash, header);
            }
        }
        Ok(())
    }

    /// Force durability of everything committed so far.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(io_err)?;
        Ok(())
    }
}

/// A staged set of writes committed atomically across all column families.
pub struct Batch {
    batch: sled::Batch,
    staged_headers: Vec<(Hash, BlockHeader)>,
}

impl Batch {
    pub fn save_block(&mut self, block: &FullBlock) {
        self.batch.insert(
            key(PREFIX_BLOCK, block.hash().as_bytes()),
            ser::ser_vec(block),
        );
        self.save_header(&block.header);
    }

    pub fn delete_block(&mut self, hash: &Hash) {
        self.batch.remove(key(PREFIX_BLOCK, hash.as_bytes()));
    }

    pub fn save_header(&mut self, header: &BlockHeader) {
        let hash = header.hash();
        self.batch
            .insert(key(PREFIX_HEADER, hash.as_bytes()), ser::ser_vec(header));
        self.staged_headers.push((hash, header.clone()));
    }

    pub fn save_block_sums(&mut self, hash: &Hash, sums: &BlockSums) {
        self.batch.insert(
            key(PREFIX_BLOCK_SUMS, hash.as_bytes()),
            bincode::serialize(sums).expect("block sums serialize"),
        );
    }

    pub fn save_output_pos(&mut self, commitment: &Commitment, pos: &OutputPos) {
        self.batch.insert(
            key(PREFIX_OUTPUT_POS, commitment.as_bytes()),
            bincode::serialize(pos).expect("output pos serialize"),
        );
    }

    pub fn delete_output_pos(&mut self, commitment: &Commitment) {
        self.batch
            .remove(key(PREFIX_OUTPUT_POS, commitment.as_bytes()));
    }

    pub fn save_spent_outputs(&mut self, block_hash: &Hash, spent: &[SpentOutput]) {
        self.batch.insert(
            key(PREFIX_SPENT, block_hash.as_bytes()),
            bincode::serialize(spent).expect("spent set serialize"),
        );
    }

    pub fn delete_spent_outputs(&mut self, block_hash: &Hash) {
        self.batch.remove(key(PREFIX_SPENT, block_hash.as_bytes()));
    }

    pub fn save_head(&mut self, tip: &Tip) {
        self.batch.insert(
            key(PREFIX_META, KEY_HEAD),
            bincode::serialize(tip).expect("tip serialize"),
        );
    }

    pub fn save_header_head(&mut self, tip: &Tip) {
        self.batch.insert(
            key(PREFIX_META, KEY_HEADER_HEAD),
            bincode::serialize(tip).expect("tip serialize"),
        );
    }

    pub fn save_sync_head(&mut self, tip: &Tip) {
        self.batch.insert(
            key(PREFIX_META, KEY_SYNC_HEAD),
            bincode::serialize(tip).expect("tip serialize"),
        );
    }

    pub fn save_height_index(&mut self, height: u64, hash: &Hash) {
        self.batch.insert(
            key(PREFIX_HEIGHT, &height.to_be_bytes()),
            hash.as_bytes().as_slice(),
        );
    }

    pub fn delete_height_index(&mut self, height: u64) {
        self.batch.remove(key(PREFIX_HEIGHT, &height.to_be_bytes()));
    }
}

/// A write batch with read-through on the output-position index.
///
/// A reorg unwinds and reapplies several blocks as one atomic unit; later
/// blocks in the unit must see the index effects of earlier ones before
/// anything is committed. The overlay serves staged reads, the inner batch
/// carries the writes.
pub struct IndexedBatch<'a> {
    store: &'a ChainStore,
    batch: Batch,
    overlay: HashMap<Commitment, Option<OutputPos>>,
    sums_overlay: HashMap<Hash, BlockSums>,
}

impl<'a> IndexedBatch<'a> {
    pub fn new(store: &'a ChainStore) -> Self {
        IndexedBatch {
            store,
            batch: store.batch(),
            overlay: HashMap::new(),
            sums_overlay: HashMap::new(),
        }
    }

    pub fn get_output_pos(&self, commitment: &Commitment) -> Result<Option<OutputPos>, StoreError> {
        if let Some(staged) = self.overlay.get(commitment) {
            return Ok(*staged);
        }
        self.store.get_output_pos(commitment)
    }

    pub fn save_output_pos(&mut self, commitment: &Commitment, pos: &OutputPos) {
        self.overlay.insert(*commitment, Some(*pos));
        self.batch.save_output_pos(commitment, pos);
    }

    pub fn delete_output_pos(&mut self, commitment: &Commitment) {
        self.overlay.insert(*commitment, None);
        self.batch.delete_output_pos(commitment);
    }

    /// Block sums with read-through, so later blocks of a reorg unit see
    /// the sums staged by earlier ones.
    pub fn get_block_sums(&self, hash: &Hash) -> Result<Option<BlockSums>, StoreError> {
        if let Some(staged) = self.sums_overlay.get(hash) {
            return Ok(Some(staged.clone()));
        }
        self.store.get_block_sums(hash)
    }

    pub fn save_block_sums(&mut self, hash: &Hash, sums: &BlockSums) {
        self.sums_overlay.insert(*hash, sums.clone());
        self.batch.save_block_sums(hash, sums);
    }

    /// The underlying batch, for writes with no read-through needs.
    pub fn inner(&mut self) -> &mut Batch {
        &mut self.batch
    }

    /// Commit everything staged in this unit atomically.
    pub fn commit(self) -> Result<(), StoreError> {
        self.store.commit(self.batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::genesis;

    #[test]
    fn block_and_header_roundtrip() {
        let store = ChainStore::open_temporary().unwrap();
        let block = genesis();
        let hash = block.hash();

        assert!(store.get_block(&hash).unwrap().is_none());
        let mut batch = store.batch();
        batch.save_block(&block);
        store.commit(batch).unwrap();

        assert_eq!(store.get_block(&hash).unwrap().unwrap(), block);
        assert_eq!(store.get_header(&hash).unwrap().unwrap(), block.header);
        assert!(store.block_exists(&hash).unwrap());
    }

    #[test]
    fn dropped_batch_leaves_no_trace() {
        let store = ChainStore::open_temporary().unwrap();
        let block = genesis();
        {
            let mut batch = store.batch();
            batch.save_block(&block);
            // Dropped without commit.
        }
        assert!(store.get_block(&block.hash()).unwrap().is_none());
        assert!(store.get_header(&block.hash()).unwrap().is_none());
    }

    #[test]
    fn tips_roundtrip() {
        let store = ChainStore::open_temporary().unwrap();
        assert!(store.head().unwrap().is_none());

        let tip = Tip::from_header(&genesis().header);
        let mut batch = store.batch();
        batch.save_head(&tip);
        batch.save_header_head(&tip);
        store.commit(batch).unwrap();

        assert_eq!(store.head().unwrap().unwrap(), tip);
        assert_eq!(store.header_head().unwrap().unwrap(), tip);
        assert!(store.sync_head().unwrap().is_none());
    }

    #[test]
    fn output_pos_lifecycle() {
        let store = ChainStore::open_temporary().unwrap();
        let commitment = Commitment::from_bytes([5u8; 32]);
        let pos = OutputPos {
            pos: 7,
            height: 3,
            coinbase: false,
        };

        let mut batch = store.batch();
        batch.save_output_pos(&commitment, &pos);
        store.commit(batch).unwrap();
        assert_eq!(store.get_output_pos(&commitment).unwrap(), Some(pos));

        let mut batch = store.batch();
        batch.delete_output_pos(&commitment);
        store.commit(batch).unwrap();
        assert!(store.get_output_pos(&commitment).unwrap().is_none());
    }

    #[test]
    fn spent_outputs_undo_set() {
        let store = ChainStore::open_temporary().unwrap();
        let block_hash = Hash::from_bytes([9u8; 32]);
        let spent = vec![SpentOutput {
            commitment: Commitment::from_bytes([1u8; 32]),
            pos: OutputPos {
                pos: 0,
                height: 1,
                coinbase: true,
            },
        }];

        assert!(store.get_spent_outputs(&block_hash).unwrap().is_empty());
        let mut batch = store.batch();
        batch.save_spent_outputs(&block_hash, &spent);
        store.commit(batch).unwrap();
        assert_eq!(store.get_spent_outputs(&block_hash).unwrap(), spent);
    }

    #[test]
    fn height_index_roundtrip() {
        let store = ChainStore::open_temporary().unwrap();
        let hash = Hash::from_bytes([3u8; 32]);
        let mut batch = store.batch();
        batch.save_height_index(42, &hash);
        store.commit(batch).unwrap();
        assert_eq!(store.header_hash_by_height(42).unwrap(), Some(hash));
        assert!(store.header_hash_by_height(41).unwrap().is_none());

        let mut batch = store.batch();
        batch.delete_height_index(42);
        store.commit(batch).unwrap();
        assert!(store.header_hash_by_height(42).unwrap().is_none());
    }
}

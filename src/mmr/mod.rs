//! Merkle Mountain Ranges.
//!
//! An MMR is an append-only forest of perfect binary trees ("peaks") over a
//! flat, 0-based postorder position space. Appending a leaf appends its hash
//! and then every parent that completes, so the structure only ever grows on
//! the right; the root bags the peaks right-to-left under the current size.
//!
//! Node hashes commit to their position (`H(pos || child hashes)`), which
//! pins every leaf to its insertion point and makes roots prefix-unique.

pub mod backend;

use std::marker::PhantomData;

use thiserror::Error;

pub use backend::{Backend, FileBackend, MemBackend};

use crate::core::hash::{hash_bytes, Hash, ZERO_HASH};
use crate::ser::{self, Readable, Writeable};

/// Errors from MMR operations.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum MmrError {
    #[error("{0} is not a valid MMR size")]
    InvalidSize(u64),
    #[error("no node at position {0}")]
    PositionNotFound(u64),
    #[error("position {0} is not a leaf")]
    NotALeaf(u64),
    #[error("leaf {0} already pruned")]
    AlreadyPruned(u64),
    #[error("mmr storage error: {0}")]
    Io(String),
    #[error("mmr data corrupted: {0}")]
    Corrupted(&'static str),
}

/// Peak map and node height for the node at 0-based position `pos`.
///
/// The peak map is a bitmask of the perfect trees making up the MMR of size
/// `pos`; the height is 0 for leaves.
pub fn peak_map_height(pos: u64) -> (u64, u64) {
    if pos == 0 {
        return (0, 0);
    }
    let mut peak_size = u64::MAX >> pos.leading_zeros();
    let mut bitmap = 0;
    let mut num_left = pos;
    while peak_size != 0 {
        bitmap <<= 1;
        if num_left >= peak_size {
            num_left -= peak_size;
            bitmap |= 1;
        }
        peak_size >>= 1;
    }
    (bitmap, num_left)
}

/// Height of the node at `pos`.
pub fn height_at(pos: u64) -> u64 {
    peak_map_height(pos).1
}

/// Whether `pos` holds a leaf.
pub fn is_leaf(pos: u64) -> bool {
    height_at(pos) == 0
}

/// Peak positions for an MMR of `size` nodes, left to right. Empty when the
/// size does not describe a complete MMR.
pub fn peaks(size: u64) -> Vec<u64> {
    if size == 0 {
        return vec![];
    }
    let mut peak_size = u64::MAX >> size.leading_zeros();
    let mut num_left = size;
    let mut sum_prev = 0;
    let mut out = vec![];
    while peak_size != 0 {
        if num_left >= peak_size {
            out.push(sum_prev + peak_size - 1);
            sum_prev += peak_size;
            num_left -= peak_size;
        }
        peak_size >>= 1;
    }
    if num_left > 0 {
        return vec![];
    }
    out
}

/// Whether `size` describes a complete MMR (every tree fully merged).
pub fn is_valid_size(size: u64) -> bool {
    size == 0 || !peaks(size).is_empty()
}

/// Number of leaves in an MMR of `size` nodes.
pub fn n_leaves(size: u64) -> u64 {
    let (peak_map, height) = peak_map_height(size);
    if height == 0 {
        peak_map
    } else {
        peak_map + 1
    }
}

/// MMR position of the `n`th appended leaf (0-based).
pub fn leaf_index_to_pos(n: u64) -> u64 {
    2 * n - n.count_ones() as u64
}

/// Parent and sibling positions of `pos`.
pub fn family(pos: u64) -> (u64, u64) {
    let (peak_map, height) = peak_map_height(pos);
    let peak = 1 << height;
    if (peak_map & peak) != 0 {
        // `pos` is a right child.
        (pos + 1, pos + 1 - 2 * peak)
    } else {
        (pos + 2 * peak, pos + 2 * peak - 1)
    }
}

/// The (parent, sibling) climb from `pos` up to its peak in an MMR of
/// `size` nodes.
pub fn family_branch(pos: u64, size: u64) -> Vec<(u64, u64)> {
    let mut branch = vec![];
    let mut current = pos;
    loop {
        let (parent, sibling) = family(current);
        if parent >= size {
            break;
        }
        branch.push((parent, sibling));
        current = parent;
    }
    branch
}

/// Leaf hash: `H(pos || leaf bytes)`.
pub fn hash_leaf(pos: u64, data: &[u8]) -> Hash {
    let mut buf = Vec::with_capacity(8 + data.len());
    buf.extend_from_slice(&pos.to_be_bytes());
    buf.extend_from_slice(data);
    hash_bytes(&buf)
}

/// Parent hash: `H(pos || left || right)`.
pub fn hash_children(pos: u64, left: &Hash, right: &Hash) -> Hash {
    let mut buf = Vec::with_capacity(72);
    buf.extend_from_slice(&pos.to_be_bytes());
    buf.extend_from_slice(left.as_bytes());
    buf.extend_from_slice(right.as_bytes());
    hash_bytes(&buf)
}

/// A Merkle proof for one leaf: the sibling climb to its peak plus the other
/// peaks, verifiable against a bagged root.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MerkleProof {
    pub mmr_size: u64,
    /// Sibling hashes, bottom-up.
    pub path: Vec<Hash>,
    /// All peak hashes left to right, with the leaf's own peak included.
    pub peaks: Vec<(u64, Hash)>,
}

impl MerkleProof {
    /// Verify that `leaf_hash` sits at `pos` under `root`.
    pub fn verify(&self, root: &Hash, leaf_hash: &Hash, pos: u64) -> bool {
        // Climb to this leaf's peak using the sibling path.
        let branch = family_branch(pos, self.mmr_size);
        if branch.len() != self.path.len() {
            return false;
        }
        let mut current_pos = pos;
        let mut current = *leaf_hash;
        for ((parent, sibling), sibling_hash) in branch.iter().zip(self.path.iter()) {
            current = if *sibling < current_pos {
                hash_children(*parent, sibling_hash, &current)
            } else {
                hash_children(*parent, &current, sibling_hash)
            };
            current_pos = *parent;
        }

        // Substitute the recomputed peak, then bag right-to-left.
        let mut peaks = self.peaks.clone();
        match peaks.iter_mut().find(|(p, _)| *p == current_pos) {
            Some(entry) => entry.1 = current,
            None => return false,
        }
        let mut bagged: Option<Hash> = None;
        for (_, peak_hash) in peaks.iter().rev() {
            bagged = Some(match bagged {
                None => *peak_hash,
                Some(rhs) => hash_children(self.mmr_size, peak_hash, &rhs),
            });
        }
        bagged.as_ref() == Some(root)
    }
}

/// A prunable MMR over typed leaves stored in a backend.
pub struct Pmmr<T, B> {
    backend: B,
    size: u64,
    _leaf: PhantomData<T>,
}

impl<T, B> Pmmr<T, B>
where
    T: Writeable + Readable,
    B: Backend,
{
    /// Wrap a backend, trusting its recorded size.
    pub fn new(backend: B) -> Result<Self, MmrError> {
        let size = backend.size();
        if !is_valid_size(size) {
            return Err(MmrError::InvalidSize(size));
        }
        Ok(Pmmr {
            backend,
            size,
            _leaf: PhantomData,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn n_leaves(&self) -> u64 {
        n_leaves(self.size)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Append a leaf, merging completed peaks. Returns the leaf position.
    pub fn push(&mut self, leaf: &T) -> Result<u64, MmrError> {
        let leaf_pos = self.size;
        let data = ser::ser_vec(leaf);
        let mut current = hash_leaf(leaf_pos, &data);
        self.backend.append(current, Some(data))?;

        let (peak_map, _) = peak_map_height(leaf_pos);
        let mut pos = leaf_pos;
        let mut peak = 1;
        while (peak_map & peak) != 0 {
            let left_pos = pos + 1 - 2 * peak;
            let left = self
                .backend
                .get_hash(left_pos)
                .ok_or(MmrError::PositionNotFound(left_pos))?;
            pos += 1;
            peak *= 2;
            current = hash_children(pos, &left, &current);
            self.backend.append(current, None)?;
        }
        self.size = pos + 1;
        Ok(leaf_pos)
    }

    /// The bagged root over the peaks: `H(size || peak || rhs)` folded
    /// right-to-left. The empty MMR roots to the zero hash.
    pub fn root(&self) -> Result<Hash, MmrError> {
        if self.size == 0 {
            return Ok(ZERO_HASH);
        }
        let mut bagged: Option<Hash> = None;
        for peak_pos in peaks(self.size).iter().rev() {
            let peak = self
                .backend
                .get_hash(*peak_pos)
                .ok_or(MmrError::PositionNotFound(*peak_pos))?;
            bagged = Some(match bagged {
                None => peak,
                Some(rhs) => hash_children(self.size, &peak, &rhs),
            });
        }
        Ok(bagged.expect("non-empty MMR has peaks"))
    }

    pub fn get_hash(&self, pos: u64) -> Option<Hash> {
        if pos >= self.size {
            return None;
        }
        self.backend.get_hash(pos)
    }

    /// Read back a leaf, if present and unpruned.
    pub fn get_leaf(&self, pos: u64) -> Option<T> {
        if !is_leaf(pos) {
            return None;
        }
        let data = self.backend.get_leaf_data(pos)?;
        ser::deser(&data).ok()
    }

    /// Truncate to `new_size` nodes, restoring the pre-append state.
    pub fn rewind(&mut self, new_size: u64) -> Result<(), MmrError> {
        if !is_valid_size(new_size) {
            return Err(MmrError::InvalidSize(new_size));
        }
        if new_size > self.size {
            return Err(MmrError::InvalidSize(new_size));
        }
        self.backend.rewind(new_size)?;
        self.size = new_size;
        Ok(())
    }

    /// Mark a leaf pruned. Its hash stays in place so roots and sibling
    /// proofs are unaffected; compaction may drop its data.
    pub fn prune(&mut self, pos: u64) -> Result<(), MmrError> {
        if pos >= self.size {
            return Err(MmrError::PositionNotFound(pos));
        }
        if !is_leaf(pos) {
            return Err(MmrError::NotALeaf(pos));
        }
        self.backend.prune(pos)
    }

    /// Drop the stored data of pruned leaves. Hashes are retained, so every
    /// root computed after compaction equals the root before it.
    pub fn compact(&mut self) -> Result<(), MmrError> {
        self.backend.compact()
    }

    /// Build a Merkle proof for the leaf at `pos`.
    pub fn merkle_proof(&self, pos: u64) -> Result<MerkleProof, MmrError> {
        if pos >= self.size || !is_leaf(pos) {
            return Err(MmrError::NotALeaf(pos));
        }
        let branch = family_branch(pos, self.size);
        let mut path = Vec::with_capacity(branch.len());
        for (_, sibling) in &branch {
            path.push(
                self.backend
                    .get_hash(*sibling)
                    .ok_or(MmrError::PositionNotFound(*sibling))?,
            );
        }
        let mut peak_hashes = vec![];
        for peak_pos in peaks(self.size) {
            peak_hashes.push((
                peak_pos,
                self.backend
                    .get_hash(peak_pos)
                    .ok_or(MmrError::PositionNotFound(peak_pos))?,
            ));
        }
        Ok(MerkleProof {
            mmr_size: self.size,
            path,
            peaks: peak_hashes,
        })
    }

    /// Positions of all unpruned leaves.
    pub fn leaf_positions(&self) -> Vec<u64> {
        (0..n_leaves(self.size))
            .map(leaf_index_to_pos)
            .filter(|pos| !self.backend.is_pruned(*pos))
            .collect()
    }

    /// Persist staged mutations.
    pub fn flush(&mut self) -> Result<(), MmrError> {
        self.backend.flush()
    }

    /// Drop staged mutations, restoring the last flushed state.
    pub fn discard(&mut self) {
        self.backend.discard();
        self.size = self.backend.size();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_pmmr() -> Pmmr<u64, MemBackend> {
        Pmmr::new(MemBackend::new()).unwrap()
    }

    #[test]
    fn position_math() {
        // The first few positions of any MMR:
        //        6
        //      /   \
        //     2     5
        //    / \   / \
        //   0   1 3   4
        assert!(is_leaf(0));
        assert!(is_leaf(1));
        assert!(!is_leaf(2));
        assert!(is_leaf(3));
        assert!(is_leaf(4));
        assert!(!is_leaf(5));
        assert!(!is_leaf(6));
        assert_eq!(height_at(2), 1);
        assert_eq!(height_at(6), 2);

        assert_eq!(peaks(1), vec![0]);
        assert_eq!(peaks(3), vec![2]);
        assert_eq!(peaks(4), vec![2, 3]);
        assert_eq!(peaks(7), vec![6]);
        assert_eq!(peaks(10), vec![6, 9]);
        assert!(peaks(5).is_empty());
        assert!(!is_valid_size(2));
        assert!(is_valid_size(4));

        assert_eq!(n_leaves(7), 4);
        assert_eq!(n_leaves(10), 6);
        assert_eq!(leaf_index_to_pos(0), 0);
        assert_eq!(leaf_index_to_pos(1), 1);
        assert_eq!(leaf_index_to_pos(2), 3);
        assert_eq!(leaf_index_to_pos(3), 4);
        assert_eq!(leaf_index_to_pos(4), 7);
    }

    #[test]
    fn family_relations() {
        assert_eq!(family(0), (2, 1));
        assert_eq!(family(1), (2, 0));
        assert_eq!(family(2), (6, 5));
        assert_eq!(family(3), (5, 4));
        assert_eq!(family(5), (6, 2));
    }

    #[test]
    fn push_and_root_progression() {
        let mut pmmr = mem_pmmr();
        let mut roots = vec![];
        for i in 0u64..8 {
            pmmr.push(&i).unwrap();
            roots.push(pmmr.root().unwrap());
        }
        // Sizes after each push: 1, 3, 4, 7, 8, 10, 11, 15.
        assert_eq!(pmmr.size(), 15);
        assert_eq!(pmmr.n_leaves(), 8);
        // Every intermediate root is distinct.
        let unique: std::collections::HashSet<_> = roots.iter().collect();
        assert_eq!(unique.len(), roots.len());
    }

    #[test]
    fn empty_root_is_zero() {
        let pmmr = mem_pmmr();
        assert_eq!(pmmr.root().unwrap(), ZERO_HASH);
    }

    #[test]
    fn rewind_restores_prior_root() {
        let mut pmmr = mem_pmmr();
        for i in 0u64..4 {
            pmmr.push(&i).unwrap();
        }
        let size_4 = pmmr.size();
        let root_4 = pmmr.root().unwrap();

        for i in 4u64..9 {
            pmmr.push(&i).unwrap();
        }
        assert_ne!(pmmr.root().unwrap(), root_4);

        pmmr.rewind(size_4).unwrap();
        assert_eq!(pmmr.root().unwrap(), root_4);
        assert_eq!(pmmr.n_leaves(), 4);

        // Appending the same leaves again reproduces the same root.
        for i in 4u64..9 {
            pmmr.push(&i).unwrap();
        }
        let root_9 = pmmr.root().unwrap();
        pmmr.rewind(size_4).unwrap();
        for i in 4u64..9 {
            pmmr.push(&i).unwrap();
        }
        assert_eq!(pmmr.root().unwrap(), root_9);
    }

    #[test]
    fn rewind_rejects_invalid_sizes() {
        let mut pmmr = mem_pmmr();
        for i in 0u64..4 {
            pmmr.push(&i).unwrap();
        }
        assert!(matches!(pmmr.rewind(2), Err(MmrError::InvalidSize(2))));
        assert!(matches!(pmmr.rewind(100), Err(MmrError::InvalidSize(100))));
    }

    #[test]
    fn prune_preserves_root() {
        let mut pmmr = mem_pmmr();
        for i in 0u64..10 {
            pmmr.push(&i).unwrap();
        }
        let root = pmmr.root().unwrap();
        pmmr.prune(0).unwrap();
        pmmr.prune(4).unwrap();
        assert_eq!(pmmr.root().unwrap(), root);
        pmmr.compact().unwrap();
        assert_eq!(pmmr.root().unwrap(), root);
        // Data gone, hash retained.
        assert!(pmmr.get_leaf(0).is_none());
        assert!(pmmr.get_hash(0).is_some());
        assert_eq!(pmmr.get_leaf(1), Some(1));
    }

    #[test]
    fn prune_rejects_non_leaves_and_duplicates() {
        let mut pmmr = mem_pmmr();
        for i in 0u64..4 {
            pmmr.push(&i).unwrap();
        }
        assert!(matches!(pmmr.prune(2), Err(MmrError::NotALeaf(2))));
        pmmr.prune(0).unwrap();
        assert!(matches!(pmmr.prune(0), Err(MmrError::AlreadyPruned(0))));
    }

    #[test]
    fn merkle_proof_verifies() {
        let mut pmmr = mem_pmmr();
        for i in 0u64..11 {
            pmmr.push(&i).unwrap();
        }
        let root = pmmr.root().unwrap();
        for leaf_idx in 0..11u64 {
            let pos = leaf_index_to_pos(leaf_idx);
            let proof = pmmr.merkle_proof(pos).unwrap();
            let leaf_hash = pmmr.get_hash(pos).unwrap();
            assert!(proof.verify(&root, &leaf_hash, pos), "leaf {leaf_idx}");
        }
    }

    #[test]
    fn merkle_proof_rejects_wrong_leaf() {
        let mut pmmr = mem_pmmr();
        for i in 0u64..8 {
            pmmr.push(&i).unwrap();
        }
        let root = pmmr.root().unwrap();
        let proof = pmmr.merkle_proof(0).unwrap();
        let wrong = hash_leaf(0, b"not the leaf");
        assert!(!proof.verify(&root, &wrong, 0));
    }

    #[test]
    fn merkle_proof_survives_pruning_of_others() {
        let mut pmmr = mem_pmmr();
        for i in 0u64..8 {
            pmmr.push(&i).unwrap();
        }
        let root = pmmr.root().unwrap();
        pmmr.prune(0).unwrap();
        pmmr.compact().unwrap();
        let pos = leaf_index_to_pos(3);
        let proof = pmmr.merkle_proof(pos).unwrap();
        let leaf_hash = pmmr.get_hash(pos).unwrap();
        assert!(proof.verify(&root, &leaf_hash, pos));
    }

    #[test]
    fn leaf_positions_skip_pruned() {
        let mut pmmr = mem_pmmr();
        for i in 0u64..5 {
            pmmr.push(&i).unwrap();
        }
        pmmr.prune(leaf_index_to_pos(2)).unwrap();
        let positions = pmmr.leaf_positions();
        assert_eq!(positions.len(), 4);
        assert!(!positions.contains(&leaf_index_to_pos(2)));
    }
}

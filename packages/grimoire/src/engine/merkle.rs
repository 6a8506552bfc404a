//! Order-preserving merkle tree over a view's result set.
//!
//! Leaves are the total hashes of the matching records in result order.
//! Interior nodes hash `left || right`; a lone node at the end of a level
//! pairs with itself. The root is the identity of the result set: clients
//! compare roots to decide whether anything changed.

use crate::hash::Hash;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MerkleTree {
    leaves: Vec<Hash>,
    root: Hash,
    /// levels[0] is the leaf row, the last level is [root]. Rebuilt on
    /// demand after deserialization.
    #[serde(skip)]
    levels: Vec<Vec<Hash>>,
}

impl MerkleTree {
    pub fn root(&self) -> Hash {
        self.root
    }

    pub fn leaves(&self) -> &[Hash] {
        &self.leaves
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Replace the leaf row. Same-length replacements rehash only the
    /// paths above changed leaves; length changes rebuild from scratch.
    pub fn set_leaves(&mut self, leaves: Vec<Hash>) {
        if leaves.len() == self.leaves.len() && !leaves.is_empty() {
            self.ensure_levels();
            let changed: Vec<usize> = (0..leaves.len())
                .filter(|&i| self.leaves[i] != leaves[i])
                .collect();
            if changed.is_empty() {
                return;
            }
            self.leaves = leaves;
            for index in changed {
                self.update_leaf(index);
            }
            self.root = self
                .levels
                .last()
                .and_then(|level| level.first())
                .copied()
                .unwrap_or(Hash::ZERO);
        } else {
            self.leaves = leaves;
            self.rebuild();
        }
    }

    fn ensure_levels(&mut self) {
        if self.levels.is_empty() && !self.leaves.is_empty() {
            self.rebuild();
        }
    }

    fn rebuild(&mut self) {
        self.levels.clear();
        if self.leaves.is_empty() {
            self.root = Hash::ZERO;
            return;
        }

        let mut level = self.leaves.clone();
        self.levels.push(level.clone());
        while level.len() > 1 {
            let mut next = Vec::with_capacity(level.len().div_ceil(2));
            for pair in level.chunks(2) {
                let left = pair[0];
                let right = pair.get(1).copied().unwrap_or(left);
                next.push(left.combine(&right));
            }
            self.levels.push(next.clone());
            level = next;
        }
        self.root = level[0];
    }

    /// Rehash the path from a changed leaf up to the root.
    fn update_leaf(&mut self, index: usize) {
        self.levels[0][index] = self.leaves[index];
        let mut index = index;
        for depth in 0..self.levels.len() - 1 {
            index /= 2;
            let below = &self.levels[depth];
            let left = below[index * 2];
            let right = below.get(index * 2 + 1).copied().unwrap_or(left);
            self.levels[depth + 1][index] = left.combine(&right);
        }
    }
}

//! Merkle tree operations for commitment roots and membership proofs.
//!
//! Used in three places: the roots tree inside a slot commitment (six
//! fixed leaves), the tangle root over a slot's accepted block ids, and
//! the attestation map root. Warp-sync verifies that a peer-supplied
//! accepted-block set matches a commitment by recomputing the tangle root
//! and checking its inclusion proof against the commitment's roots id.

use serde::{Deserialize, Serialize};

use crate::{hash_parts, Hash};

/// A node in a Merkle authentication path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleNode {
    pub hash: Hash,
    /// True if this sibling is on the left (current node is right child).
    pub is_left: bool,
}

/// An authentication path proving a leaf is part of a root.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub path: Vec<MerkleNode>,
}

fn merge(left: &Hash, right: &Hash) -> Hash {
    hash_parts(b"meridian.merkle.node", &[left, right])
}

/// Compute a Merkle root from a leaf and its authentication path.
pub fn compute_merkle_root(leaf: &Hash, proof: &MerkleProof) -> Hash {
    let mut current = *leaf;
    for node in &proof.path {
        current = if node.is_left {
            merge(&node.hash, &current)
        } else {
            merge(&current, &node.hash)
        };
    }
    current
}

/// Verify that `leaf` is a member of the tree with the given `root`.
pub fn verify_proof(leaf: &Hash, proof: &MerkleProof, root: &Hash) -> bool {
    compute_merkle_root(leaf, proof) == *root
}

/// Compute the Merkle root over the given leaves.
///
/// The tree is padded to the next power of 2 with zero leaves; an empty
/// leaf set yields the zero hash.
pub fn merkle_root(leaves: &[Hash]) -> Hash {
    build_merkle_tree(leaves).0
}

/// Build a Merkle tree from leaf hashes and return (root, paths).
///
/// `paths[i]` authenticates `leaves[i]` against the root.
pub fn build_merkle_tree(leaves: &[Hash]) -> (Hash, Vec<MerkleProof>) {
    if leaves.is_empty() {
        return ([0u8; 32], vec![]);
    }
    if leaves.len() == 1 {
        return (leaves[0], vec![MerkleProof::default()]);
    }

    // Pad to next power of 2
    let n = leaves.len().next_power_of_two();
    let mut layer: Vec<Hash> = leaves.to_vec();
    layer.resize(n, [0u8; 32]);

    let mut all_layers = vec![layer.clone()];

    while layer.len() > 1 {
        let mut next = Vec::with_capacity(layer.len() / 2);
        for chunk in layer.chunks(2) {
            next.push(merge(&chunk[0], &chunk[1]));
        }
        all_layers.push(next.clone());
        layer = next;
    }

    let root = layer[0];

    // Build authentication paths for each original leaf
    let mut paths = Vec::with_capacity(leaves.len());
    for i in 0..leaves.len() {
        let mut path = Vec::new();
        let mut idx = i;
        for layer in &all_layers[..all_layers.len() - 1] {
            let sibling_idx = idx ^ 1;
            if sibling_idx < layer.len() {
                path.push(MerkleNode {
                    hash: layer[sibling_idx],
                    is_left: idx % 2 == 1,
                });
            }
            idx /= 2;
        }
        paths.push(MerkleProof { path });
    }

    (root, paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash_domain;

    fn leaf(n: u8) -> Hash {
        hash_domain(b"test.leaf", &[n])
    }

    #[test]
    fn empty_tree_is_zero() {
        assert_eq!(merkle_root(&[]), [0u8; 32]);
    }

    #[test]
    fn single_leaf_is_root() {
        let l = leaf(1);
        let (root, paths) = build_merkle_tree(&[l]);
        assert_eq!(root, l);
        assert!(verify_proof(&l, &paths[0], &root));
    }

    #[test]
    fn all_proofs_verify() {
        for count in 2..=9u8 {
            let leaves: Vec<Hash> = (0..count).map(leaf).collect();
            let (root, paths) = build_merkle_tree(&leaves);
            for (l, p) in leaves.iter().zip(&paths) {
                assert!(verify_proof(l, p, &root), "count={count}");
            }
        }
    }

    #[test]
    fn wrong_leaf_fails() {
        let leaves: Vec<Hash> = (0..4).map(leaf).collect();
        let (root, paths) = build_merkle_tree(&leaves);
        assert!(!verify_proof(&leaf(99), &paths[0], &root));
    }

    #[test]
    fn root_depends_on_order() {
        let a = merkle_root(&[leaf(1), leaf(2)]);
        let b = merkle_root(&[leaf(2), leaf(1)]);
        assert_ne!(a, b);
    }

    #[test]
    fn root_is_deterministic() {
        let leaves: Vec<Hash> = (0..7).map(leaf).collect();
        assert_eq!(merkle_root(&leaves), merkle_root(&leaves));
    }
}

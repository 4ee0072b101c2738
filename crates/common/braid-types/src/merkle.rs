//! Merkle tree over a conversation's node-id set.
//!
//! Leaves are the multihash digests of the node ids, sorted lexicographically
//! before construction, so any two replicas holding the same node set compute
//! the same root no matter what order the nodes arrived in. An odd trailing
//! leaf is paired with itself (duplicate-last padding).

use braid_core_types::NodeId;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

const DIGEST_LENGTH: usize = 32;

/// Root hash of a Merkle tree, committed to by an anchor record.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MerkleRoot([u8; DIGEST_LENGTH]);

impl MerkleRoot {
    pub fn as_bytes(&self) -> &[u8; DIGEST_LENGTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for MerkleRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MerkleRoot({})", self.to_hex())
    }
}

impl fmt::Display for MerkleRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for MerkleRoot {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for MerkleRoot {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        let array: [u8; DIGEST_LENGTH] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("merkle root must be 32 bytes"))?;
        Ok(MerkleRoot(array))
    }
}

/// Which side a proof step's sibling sits on.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ProofStep {
    #[serde(with = "serde_bytes")]
    pub sibling: Vec<u8>,
    pub side: Side,
}

/// Sibling-hash path from a leaf to the root.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MerkleProof {
    pub steps: Vec<ProofStep>,
}

impl MerkleProof {
    /// Recompute the path for `id` and compare against `root`.
    pub fn verify(&self, root: &MerkleRoot, id: &NodeId) -> bool {
        let mut current = leaf_digest(id);
        for step in &self.steps {
            let sibling: [u8; DIGEST_LENGTH] = match step.sibling.as_slice().try_into() {
                Ok(array) => array,
                Err(_) => return false,
            };
            current = match step.side {
                Side::Right => pair_digest(&current, &sibling),
                Side::Left => pair_digest(&sibling, &current),
            };
        }
        current == root.0
    }
}

/// A fully materialized tree, retained when inclusion proofs are needed.
#[derive(Clone, Debug)]
pub struct MerkleTree {
    /// levels[0] is the sorted leaf row; the last level is the root alone.
    levels: Vec<Vec<[u8; DIGEST_LENGTH]>>,
}

impl MerkleTree {
    /// Build a tree over the given node ids. Returns `None` for an empty
    /// set: there is nothing to commit to.
    pub fn build(ids: &[NodeId]) -> Option<Self> {
        if ids.is_empty() {
            return None;
        }

        let mut leaves: Vec<[u8; DIGEST_LENGTH]> = ids.iter().map(leaf_digest).collect();
        leaves.sort_unstable();
        leaves.dedup();

        let mut levels = vec![leaves];
        while levels.last().map(Vec::len).unwrap_or(0) > 1 {
            let current = levels.last().expect("levels is non-empty");
            let mut next = Vec::with_capacity(current.len().div_ceil(2));
            for chunk in current.chunks(2) {
                // Odd trailing leaf pairs with itself.
                let right = chunk.get(1).unwrap_or(&chunk[0]);
                next.push(pair_digest(&chunk[0], right));
            }
            levels.push(next);
        }

        Some(MerkleTree { levels })
    }

    pub fn root(&self) -> MerkleRoot {
        MerkleRoot(self.levels[self.levels.len() - 1][0])
    }

    pub fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    /// Sibling path for `id`, or `None` if the id is not a leaf of this tree.
    pub fn proof(&self, id: &NodeId) -> Option<MerkleProof> {
        let target = leaf_digest(id);
        let mut index = self.levels[0].iter().position(|leaf| *leaf == target)?;

        let mut steps = Vec::with_capacity(self.levels.len().saturating_sub(1));
        for level in &self.levels[..self.levels.len() - 1] {
            let (sibling_index, side) = if index % 2 == 0 {
                (index + 1, Side::Right)
            } else {
                (index - 1, Side::Left)
            };
            // When the sibling falls off the row the padding rule applies:
            // the node was paired with itself.
            let sibling = level.get(sibling_index).unwrap_or(&level[index]);
            steps.push(ProofStep {
                sibling: sibling.to_vec(),
                side,
            });
            index /= 2;
        }

        Some(MerkleProof { steps })
    }
}

/// Convenience for callers that only need the root.
pub fn merkle_root(ids: &[NodeId]) -> Option<MerkleRoot> {
    MerkleTree::build(ids).map(|tree| tree.root())
}

fn leaf_digest(id: &NodeId) -> [u8; DIGEST_LENGTH] {
    // Node ids may come from either hash family; normalize every leaf
    // through one function so the tree shape is family-independent.
    let mut hasher = Sha256::new();
    hasher.update(id.digest_bytes());
    hasher.finalize().into()
}

fn pair_digest(
    left: &[u8; DIGEST_LENGTH],
    right: &[u8; DIGEST_LENGTH],
) -> [u8; DIGEST_LENGTH] {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

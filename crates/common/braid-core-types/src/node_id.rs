use cid::Cid as ExternalCid;
use multihash::Multihash;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Multicodec code for DAG-CBOR, the canonical encoding every node id is
/// computed over.
const DAG_CBOR_CODEC: u64 = 0x71;

/// Errors that can occur when working with node ids
#[derive(Error, Debug)]
pub enum IdError {
    #[error("Failed to parse node id from bytes: {0}")]
    ParseError(String),
    #[error("Failed to parse node id from string: {0}")]
    FromStrError(String),
    #[error("Unsupported multihash code: {0:#x}")]
    UnsupportedAlgorithm(u64),
}

/// The hash families a node id can be computed with. The chosen family is
/// carried in the id's multihash code, so verification never needs an
/// out-of-band version flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    /// SHA2-256, the original id family.
    Sha256,
    /// BLAKE3-256, the successor family.
    Blake3,
}

impl HashAlgorithm {
    pub const fn multihash_code(self) -> u64 {
        match self {
            HashAlgorithm::Sha256 => 0x12,
            HashAlgorithm::Blake3 => 0x1e,
        }
    }

    pub fn from_multihash_code(code: u64) -> Result<Self, IdError> {
        match code {
            0x12 => Ok(HashAlgorithm::Sha256),
            0x1e => Ok(HashAlgorithm::Blake3),
            other => Err(IdError::UnsupportedAlgorithm(other)),
        }
    }

    fn digest(self, data: &[u8]) -> [u8; 32] {
        match self {
            HashAlgorithm::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(data);
                hasher.finalize().into()
            }
            HashAlgorithm::Blake3 => *blake3::hash(data).as_bytes(),
        }
    }
}

impl Default for HashAlgorithm {
    fn default() -> Self {
        HashAlgorithm::Sha256
    }
}

/// Content address of a DAG node: a CIDv1 over the node's canonical bytes.
///
/// Wraps `cid::Cid` to provide byte-oriented Serialize/Deserialize
/// implementations and the dual-family digest seam.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(ExternalCid);

impl NodeId {
    /// Compute the id of a canonical byte encoding under the given hash
    /// family.
    pub fn digest(data: &[u8], algorithm: HashAlgorithm) -> Result<Self, IdError> {
        let digest = algorithm.digest(data);
        let mh = Multihash::wrap(algorithm.multihash_code(), &digest)
            .map_err(|e| IdError::ParseError(format!("Multihash wrap error: {}", e)))?;
        Ok(NodeId(ExternalCid::new_v1(DAG_CBOR_CODEC, mh)))
    }

    /// The hash family this id was computed with, recovered from the
    /// multihash code embedded in the id.
    pub fn algorithm(&self) -> Result<HashAlgorithm, IdError> {
        HashAlgorithm::from_multihash_code(self.0.hash().code())
    }

    /// Recompute the digest of `data` under this id's own hash family and
    /// compare. A `false` result means the bytes do not match the address.
    pub fn matches(&self, data: &[u8]) -> Result<bool, IdError> {
        let algorithm = self.algorithm()?;
        Ok(algorithm.digest(data).as_slice() == self.0.hash().digest())
    }

    /// Raw multihash digest bytes (Merkle tree leaves are built from these).
    pub fn digest_bytes(&self) -> &[u8] {
        self.0.hash().digest()
    }

    /// Get the raw bytes of this id
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes()
    }
}

impl FromStr for NodeId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExternalCid::from_str(s)
            .map(NodeId)
            .map_err(|e| IdError::FromStrError(e.to_string()))
    }
}

// Total order over the encoded bytes, used for deterministic leaf ordering
// and timestamp tie-breaks.
impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.to_bytes().cmp(&other.0.to_bytes())
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// --- Conversions ---
impl From<ExternalCid> for NodeId {
    fn from(cid: ExternalCid) -> Self {
        NodeId(cid)
    }
}

impl From<NodeId> for ExternalCid {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl TryFrom<&[u8]> for NodeId {
    type Error = IdError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        ExternalCid::try_from(bytes)
            .map(NodeId)
            .map_err(|e| IdError::ParseError(e.to_string()))
    }
}

// --- Serde Implementations ---
impl Serialize for NodeId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&self.0.to_bytes())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        ExternalCid::try_from(bytes)
            .map(NodeId)
            .map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_per_family() {
        let a = NodeId::digest(b"hello", HashAlgorithm::Sha256).unwrap();
        let b = NodeId::digest(b"hello", HashAlgorithm::Sha256).unwrap();
        assert_eq!(a, b);

        let c = NodeId::digest(b"hello", HashAlgorithm::Blake3).unwrap();
        assert_ne!(a, c);
        assert_eq!(c.algorithm().unwrap(), HashAlgorithm::Blake3);
    }

    #[test]
    fn matches_uses_embedded_family() {
        for algorithm in [HashAlgorithm::Sha256, HashAlgorithm::Blake3] {
            let id = NodeId::digest(b"payload", algorithm).unwrap();
            assert!(id.matches(b"payload").unwrap());
            assert!(!id.matches(b"tampered").unwrap());
        }
    }

    #[test]
    fn string_round_trip() {
        let id = NodeId::digest(b"round trip", HashAlgorithm::Sha256).unwrap();
        let parsed: NodeId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn byte_round_trip() {
        let id = NodeId::digest(b"bytes", HashAlgorithm::Blake3).unwrap();
        let parsed = NodeId::try_from(id.to_bytes().as_slice()).unwrap();
        assert_eq!(id, parsed);
    }
}

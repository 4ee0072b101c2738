//! Canonical byte encoding for hashing and signing.
//!
//! Every content address and signature in the system is computed over the
//! DAG-CBOR encoding produced here. DAG-CBOR gives a deterministic map key
//! order, so semantically identical values always encode to identical bytes
//! regardless of which replica produced them. Values the codec cannot
//! represent canonically (NaN floats, non-string map keys) fail with an
//! error instead of being coerced.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CanonicalError {
    #[error("value cannot be canonically encoded: {0}")]
    Encode(String),
    #[error("canonical bytes cannot be decoded: {0}")]
    Decode(String),
}

pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CanonicalError> {
    serde_ipld_dagcbor::to_vec(value).map_err(|e| CanonicalError::Encode(e.to_string()))
}

pub fn from_canonical_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CanonicalError> {
    serde_ipld_dagcbor::from_slice(bytes).map_err(|e| CanonicalError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::collections::BTreeMap;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Sample {
        name: String,
        value: u64,
        tags: Vec<String>,
    }

    #[test]
    fn round_trip() {
        let sample = Sample {
            name: "braid".into(),
            value: 42,
            tags: vec!["a".into(), "b".into()],
        };
        let bytes = to_canonical_bytes(&sample).unwrap();
        let back: Sample = from_canonical_bytes(&bytes).unwrap();
        assert_eq!(sample, back);
    }

    #[test]
    fn map_encoding_is_key_order_independent() {
        let mut a = BTreeMap::new();
        a.insert("x".to_string(), 1u32);
        a.insert("y".to_string(), 2u32);
        let mut b = BTreeMap::new();
        b.insert("y".to_string(), 2u32);
        b.insert("x".to_string(), 1u32);
        assert_eq!(
            to_canonical_bytes(&a).unwrap(),
            to_canonical_bytes(&b).unwrap()
        );
    }

    #[test]
    fn nan_fails_closed() {
        assert!(to_canonical_bytes(&f64::NAN).is_err());
    }
}

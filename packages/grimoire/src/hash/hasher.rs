//! Hash primitive and canonical value serialization.
//!
//! Every hash in the system is a fixed 32-byte blake3 output. `Hash::ZERO`
//! is the distinguished empty hash: it is the XOR identity, the composition
//! seed, and the root of an empty result set.

use crate::engine::types::Value;
use crate::error::{EngineError, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::fmt;
use std::str::FromStr;

pub const HASH_SIZE: usize = 32;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash([u8; HASH_SIZE]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; HASH_SIZE]);

    pub fn of(bytes: &[u8]) -> Hash {
        Hash(*blake3::hash(bytes).as_bytes())
    }

    pub fn from_bytes(bytes: [u8; HASH_SIZE]) -> Hash {
        Hash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        *self == Hash::ZERO
    }

    /// Commutative, associative combine. `xor(h, h) == ZERO` and
    /// `xor(h, ZERO) == h`, which is what makes the cascade revertible.
    pub fn xor(&self, other: &Hash) -> Hash {
        let mut out = [0u8; HASH_SIZE];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Hash(out)
    }

    /// Order-dependent combine for merkle interior nodes:
    /// `hash(left || right)`.
    pub fn combine(&self, other: &Hash) -> Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.0);
        hasher.update(&other.0);
        Hash(*hasher.finalize().as_bytes())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl FromStr for Hash {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut bytes = [0u8; HASH_SIZE];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Hash(bytes))
    }
}

impl Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        Hash::from_str(&s).map_err(|e| serde::de::Error::custom(format!("invalid hash: {}", e)))
    }
}

/// Lookup of a record's current total hash, used by the sink when it builds
/// merkle leaves. Implemented by the hash store and its write-batch overlay.
pub trait TotalHashes {
    fn total_hash(&self, key: &str) -> Option<Hash>;
}

// --- Canonical value hashing ---

// Domain separation tags. Changing any of these invalidates every persisted
// hash, so they are append-only.
const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_STR: u8 = 4;
const TAG_TIMESTAMP: u8 = 5;
const TAG_RECORD: u8 = 6;
const TAG_LIST: u8 = 7;
const TAG_MAP: u8 = 8;

fn feed_value(v: &Value, hasher: &mut blake3::Hasher) -> Result<()> {
    match v {
        Value::Null => {
            hasher.update(&[TAG_NULL]);
        }
        Value::Bool(b) => {
            hasher.update(&[TAG_BOOL, *b as u8]);
        }
        Value::Int(n) => {
            hasher.update(&[TAG_INT]);
            hasher.update(&n.to_be_bytes());
        }
        Value::Float(n) => {
            if n.is_nan() {
                return Err(EngineError::TypeMismatch {
                    context: "NaN is not hashable".to_string(),
                });
            }
            hasher.update(&[TAG_FLOAT]);
            hasher.update(&n.to_be_bytes());
        }
        Value::Str(s) => {
            hasher.update(&[TAG_STR]);
            hasher.update(&(s.len() as u64).to_be_bytes());
            hasher.update(s.as_bytes());
        }
        Value::Timestamp(ms) => {
            hasher.update(&[TAG_TIMESTAMP]);
            hasher.update(&ms.to_be_bytes());
        }
        Value::Record(id) => {
            hasher.update(&[TAG_RECORD]);
            hasher.update(&(id.as_str().len() as u64).to_be_bytes());
            hasher.update(id.as_str().as_bytes());
        }
        Value::List(list) => {
            hasher.update(&[TAG_LIST]);
            hasher.update(&(list.len() as u64).to_be_bytes());
            for item in list {
                feed_value(item, hasher)?;
            }
        }
        Value::Map(map) => {
            // Maps hash as the sorted (key, value_hash) list so that the
            // result is independent of insertion order.
            hasher.update(&[TAG_MAP]);
            hasher.update(&(map.len() as u64).to_be_bytes());
            let mut keys: Vec<&SmolStr> = map.keys().collect();
            keys.sort_unstable();
            for key in keys {
                hasher.update(&(key.len() as u64).to_be_bytes());
                hasher.update(key.as_bytes());
                let child = hash_value(&map[key])?;
                hasher.update(child.as_bytes());
            }
        }
    }
    Ok(())
}

/// Canonical hash of a single value.
pub fn hash_value(v: &Value) -> Result<Hash> {
    let mut hasher = blake3::Hasher::new();
    feed_value(v, &mut hasher)?;
    Ok(Hash(*hasher.finalize().as_bytes()))
}

/// Intrinsic hash: the named content fields of a record, sorted by field
/// name. Fields absent from the value contribute nothing, so re-adding a
/// previously removed field restores the prior hash exactly.
pub fn hash_intrinsic(value: &Value, fields: &[SmolStr]) -> Result<Hash> {
    let mut sorted: Vec<&SmolStr> = fields.iter().collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut hasher = blake3::Hasher::new();
    for field in sorted {
        if let Some(field_value) = value.get(field.as_str()) {
            hasher.update(&(field.len() as u64).to_be_bytes());
            hasher.update(field.as_bytes());
            let child = hash_value(field_value)?;
            hasher.update(child.as_bytes());
        }
    }
    Ok(Hash(*hasher.finalize().as_bytes()))
}

/// Total hash: a pure function of (intrinsic, composition). The composition
/// entries are folded in sorted key order so the map's insertion history is
/// irrelevant.
pub fn hash_total(intrinsic: &Hash, composition: &IndexMap<SmolStr, Hash>) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(intrinsic.as_bytes());

    let mut keys: Vec<&SmolStr> = composition.keys().collect();
    keys.sort_unstable();
    for key in keys {
        hasher.update(&(key.len() as u64).to_be_bytes());
        hasher.update(key.as_bytes());
        hasher.update(composition[key].as_bytes());
    }
    Hash(*hasher.finalize().as_bytes())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::types::FastMap;

    #[test]
    fn test_xor_identity_and_involution() {
        let h = Hash::of(b"payload");
        assert_eq!(h.xor(&Hash::ZERO), h);
        assert_eq!(h.xor(&h), Hash::ZERO);
    }

    #[test]
    fn test_xor_commutative_associative() {
        let a = Hash::of(b"a");
        let b = Hash::of(b"b");
        let c = Hash::of(b"c");
        assert_eq!(a.xor(&b), b.xor(&a));
        assert_eq!(a.xor(&b).xor(&c), a.xor(&b.xor(&c)));
    }

    #[test]
    fn test_hex_roundtrip() {
        let h = Hash::of(b"roundtrip");
        let parsed: Hash = h.to_hex().parse().unwrap();
        assert_eq!(parsed, h);
    }

    #[test]
    fn test_map_hash_is_order_independent() {
        let mut forward: FastMap<SmolStr, Value> = FastMap::default();
        forward.insert(SmolStr::new("a"), Value::Int(1));
        forward.insert(SmolStr::new("b"), Value::Int(2));

        let mut reversed: FastMap<SmolStr, Value> = FastMap::default();
        reversed.insert(SmolStr::new("b"), Value::Int(2));
        reversed.insert(SmolStr::new("a"), Value::Int(1));

        assert_eq!(
            hash_value(&Value::Map(forward)).unwrap(),
            hash_value(&Value::Map(reversed)).unwrap()
        );
    }

    #[test]
    fn test_int_and_float_hash_differently() {
        // 2 and 2.0 are distinct wire values and must not collide.
        let int = hash_value(&Value::Int(2)).unwrap();
        let float = hash_value(&Value::Float(2.0)).unwrap();
        assert_ne!(int, float);
    }

    #[test]
    fn test_nan_is_rejected() {
        assert!(hash_value(&Value::Float(f64::NAN)).is_err());
    }

    #[test]
    fn test_intrinsic_ignores_undeclared_fields() {
        let value: Value = serde_json::json!({
            "title": "A",
            "content": "body",
            "author": "author:1"
        })
        .into();

        let fields = vec![SmolStr::new("title"), SmolStr::new("content")];
        let h1 = hash_intrinsic(&value, &fields).unwrap();

        let changed_ref: Value = serde_json::json!({
            "title": "A",
            "content": "body",
            "author": "author:2"
        })
        .into();
        let h2 = hash_intrinsic(&changed_ref, &fields).unwrap();
        assert_eq!(h1, h2);

        let changed_content: Value = serde_json::json!({
            "title": "A",
            "content": "other",
            "author": "author:1"
        })
        .into();
        let h3 = hash_intrinsic(&changed_content, &fields).unwrap();
        assert_ne!(h1, h3);
    }

    #[test]
    fn test_total_hash_ignores_composition_order() {
        let intrinsic = Hash::of(b"intrinsic");
        let mut forward: IndexMap<SmolStr, Hash> = IndexMap::new();
        forward.insert(SmolStr::new("comment"), Hash::of(b"c"));
        forward.insert(SmolStr::new("_xor"), Hash::of(b"c"));

        let mut reversed: IndexMap<SmolStr, Hash> = IndexMap::new();
        reversed.insert(SmolStr::new("_xor"), Hash::of(b"c"));
        reversed.insert(SmolStr::new("comment"), Hash::of(b"c"));

        assert_eq!(
            hash_total(&intrinsic, &forward),
            hash_total(&intrinsic, &reversed)
        );
    }
}

use rustc_hash::FxHasher;
use smol_str::SmolStr;
use std::hash::BuildHasherDefault;

pub type Weight = i64;
pub type RowKey = SmolStr;
pub type FastMap<K, V> = std::collections::HashMap<K, V, BuildHasherDefault<FxHasher>>;
pub type FastSet<K> = std::collections::HashSet<K, BuildHasherDefault<FxHasher>>;
pub type ZSet = FastMap<RowKey, Weight>;

/// Fold a weight into a z-set, dropping the entry when it cancels to zero.
pub fn fold_weight(zset: &mut ZSet, key: RowKey, weight: Weight) {
    let entry = zset.entry(key.clone()).or_insert(0);
    *entry += weight;
    if *entry == 0 {
        zset.remove(&key);
    }
}

/// Merge a delta z-set into an accumulator z-set.
pub fn merge_delta(target: &mut ZSet, delta: &ZSet) {
    for (key, weight) in delta {
        fold_weight(target, key.clone(), *weight);
    }
}

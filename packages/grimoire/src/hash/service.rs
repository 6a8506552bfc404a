//! Record hash maintenance and cascade propagation.
//!
//! Every live record carries an intrinsic hash (its own content fields), a
//! composition hash (XOR-fold of dependent records' total hashes, one slot
//! per dependency table plus the combined `_xor` slot) and a total hash over
//! both. A change in a leaf bubbles to its ancestors as an XOR diff, so
//! applying the inverse mutation restores every hash bit-for-bit.
//!
//! All writes go through a [`WriteBatch`] and are only applied by the caller
//! once the whole cascade has succeeded; an aborted cascade leaves no
//! partial state.

use super::graph::RecordGraph;
use super::hasher::{hash_intrinsic, hash_total, Hash, TotalHashes};
use crate::engine::types::{FastMap, RecordId, RowKey, Value};
use crate::error::{EngineError, Result};
use crate::schema::SchemaSet;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::sync::Arc;
use tracing::debug;

/// Synthetic composition key holding the XOR of all per-table folds.
pub const XOR_KEY: &str = "_xor";

/// Backstop against schema-acyclicity violations. The schema validator
/// rejects cyclic metadata at init, so hitting this means the metadata lied.
const MAX_CASCADE_DEPTH: usize = 64;

/// One row of the `record_hash` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordHashRow {
    pub intrinsic: Hash,
    pub composition: IndexMap<SmolStr, Hash>,
    pub total: Hash,
    pub is_dirty: bool,
    pub pending_delete: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HashStore {
    rows: FastMap<RowKey, RecordHashRow>,
}

impl HashStore {
    pub fn get(&self, key: &str) -> Option<&RecordHashRow> {
        self.rows.get(key)
    }

    pub fn insert(&mut self, key: RowKey, row: RecordHashRow) {
        self.rows.insert(key, row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RowKey, &RecordHashRow)> {
        self.rows.iter()
    }

    pub fn apply(&mut self, batch: WriteBatch) {
        for (key, row) in batch.rows {
            self.rows.insert(key, row);
        }
    }
}

impl TotalHashes for HashStore {
    fn total_hash(&self, key: &str) -> Option<Hash> {
        self.rows.get(key).map(|r| r.total)
    }
}

/// Buffered hash writes for one mutation. Applied to the store only after
/// the cascade and the persistence flush both succeed.
#[derive(Debug, Default)]
pub struct WriteBatch {
    rows: FastMap<RowKey, RecordHashRow>,
    touched: Vec<RowKey>,
}

impl WriteBatch {
    pub fn stage(&mut self, key: RowKey, row: RecordHashRow) {
        if !self.rows.contains_key(&key) {
            self.touched.push(key.clone());
        }
        self.rows.insert(key, row);
    }

    pub fn get(&self, key: &str) -> Option<&RecordHashRow> {
        self.rows.get(key)
    }

    /// Keys staged by this batch, in first-touch order.
    pub fn touched(&self) -> &[RowKey] {
        &self.touched
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RowKey, &RecordHashRow)> {
        self.rows.iter()
    }
}

/// Batch-first read view over the store, also the hash lookup the circuit
/// uses while a mutation is in flight.
pub struct Overlay<'a> {
    pub batch: &'a WriteBatch,
    pub store: &'a HashStore,
}

impl TotalHashes for Overlay<'_> {
    fn total_hash(&self, key: &str) -> Option<Hash> {
        self.batch
            .get(key)
            .or_else(|| self.store.get(key))
            .map(|r| r.total)
    }
}

pub struct HashService {
    schema: Arc<SchemaSet>,
}

impl HashService {
    pub fn new(schema: Arc<SchemaSet>) -> Self {
        Self { schema }
    }

    fn read_row(
        &self,
        store: &HashStore,
        batch: &WriteBatch,
        key: &str,
    ) -> Option<RecordHashRow> {
        batch.get(key).or_else(|| store.get(key)).cloned()
    }

    /// Initialize composition: one `Hash::ZERO` slot per schema-declared
    /// dependency table, then fold in any dependents that already exist
    /// (sync delivery is not ordered, children may precede their owner).
    fn seed_composition(
        &self,
        graph: &RecordGraph,
        store: &HashStore,
        batch: &WriteBatch,
        id: &RecordId,
    ) -> IndexMap<SmolStr, Hash> {
        let mut composition: IndexMap<SmolStr, Hash> = IndexMap::new();
        for dep_table in self.schema.dependency_tables(id.table()) {
            composition.insert(dep_table.clone(), Hash::ZERO);
        }

        if let Some(dependents) = graph.dependents(id.as_str()) {
            for (table, children) in dependents {
                for child in children {
                    if let Some(row) = self.read_row(store, batch, child.as_str()) {
                        let slot = composition.entry(table.clone()).or_insert(Hash::ZERO);
                        *slot = slot.xor(&row.total);
                    }
                }
            }
        }

        refold(&mut composition);
        composition
    }

    pub fn on_create(
        &self,
        graph: &RecordGraph,
        store: &HashStore,
        batch: &mut WriteBatch,
        id: &RecordId,
        value: &Value,
    ) -> Result<Hash> {
        let intrinsic = hash_intrinsic(value, self.schema.intrinsic_fields(id.table()))?;
        let composition = self.seed_composition(graph, store, batch, id);
        let total = hash_total(&intrinsic, &composition);

        batch.stage(
            id.as_smol(),
            RecordHashRow {
                intrinsic,
                composition,
                total,
                is_dirty: true,
                pending_delete: false,
            },
        );

        for parent in graph.parent_refs(id.table(), value) {
            self.propagate(graph, store, batch, &parent, id.table(), total, 0)?;
        }
        Ok(total)
    }

    pub fn on_update(
        &self,
        graph: &RecordGraph,
        store: &HashStore,
        batch: &mut WriteBatch,
        id: &RecordId,
        prior: &Value,
        value: &Value,
    ) -> Result<Hash> {
        let old = self
            .read_row(store, batch, id.as_str())
            .ok_or_else(|| EngineError::MissingPrior {
                record_id: id.as_str().to_string(),
            })?;

        let intrinsic = hash_intrinsic(value, self.schema.intrinsic_fields(id.table()))?;
        let new_total = hash_total(&intrinsic, &old.composition);

        let old_parents = graph.parent_refs(id.table(), prior);
        let new_parents = graph.parent_refs(id.table(), value);

        if intrinsic == old.intrinsic && old_parents == new_parents {
            // Content-equal no-op: nothing to stage, nothing to cascade.
            return Ok(old.total);
        }

        batch.stage(
            id.as_smol(),
            RecordHashRow {
                intrinsic,
                composition: old.composition.clone(),
                total: new_total,
                is_dirty: true,
                pending_delete: old.pending_delete,
            },
        );

        // One propagation op per affected parent: removed parents unfold the
        // old total, added parents fold the new one, retained parents get
        // the diff. Applied in sorted parent order; XOR makes any order land
        // on the same hashes, the sort just keeps the walk deterministic.
        let mut ops: Vec<(RecordId, Hash)> = Vec::new();
        for parent in &old_parents {
            if !new_parents.contains(parent) {
                ops.push((parent.clone(), old.total));
            }
        }
        for parent in &new_parents {
            if !old_parents.contains(parent) {
                ops.push((parent.clone(), new_total));
            }
        }
        if new_total != old.total {
            for parent in &old_parents {
                if new_parents.contains(parent) {
                    ops.push((parent.clone(), old.total.xor(&new_total)));
                }
            }
        }
        ops.sort_unstable_by(|a, b| a.0.cmp(&b.0));

        for (parent, delta) in ops {
            self.propagate(graph, store, batch, &parent, id.table(), delta, 0)?;
        }
        Ok(new_total)
    }

    pub fn on_delete(
        &self,
        graph: &RecordGraph,
        store: &HashStore,
        batch: &mut WriteBatch,
        id: &RecordId,
        prior: &Value,
    ) -> Result<Hash> {
        let old = self
            .read_row(store, batch, id.as_str())
            .ok_or_else(|| EngineError::MissingPrior {
                record_id: id.as_str().to_string(),
            })?;

        batch.stage(
            id.as_smol(),
            RecordHashRow {
                pending_delete: true,
                is_dirty: true,
                ..old.clone()
            },
        );

        for parent in graph.parent_refs(id.table(), prior) {
            self.propagate(graph, store, batch, &parent, id.table(), old.total, 0)?;
        }
        Ok(old.total)
    }

    /// Fold `delta` into `parent.composition[dep_table]` and recurse upward
    /// while the parent's total keeps changing.
    fn propagate(
        &self,
        graph: &RecordGraph,
        store: &HashStore,
        batch: &mut WriteBatch,
        parent: &RecordId,
        dep_table: &str,
        delta: Hash,
        depth: usize,
    ) -> Result<()> {
        if depth >= MAX_CASCADE_DEPTH {
            return Err(EngineError::CycleDetected {
                record_id: parent.as_str().to_string(),
            });
        }

        let Some(mut row) = self.read_row(store, batch, parent.as_str()) else {
            // Owner not synced yet; its composition is seeded from the
            // dependents index when it arrives.
            debug!(parent = parent.as_str(), "cascade target has no hash row yet");
            return Ok(());
        };

        let slot = row
            .composition
            .entry(SmolStr::new(dep_table))
            .or_insert(Hash::ZERO);
        *slot = slot.xor(&delta);
        refold(&mut row.composition);

        let old_total = row.total;
        row.total = hash_total(&row.intrinsic, &row.composition);
        row.is_dirty = true;
        let new_total = row.total;
        batch.stage(parent.as_smol(), row);

        if new_total != old_total {
            if let Some(parent_value) = graph.get(parent.as_str()) {
                let up = old_total.xor(&new_total);
                for grandparent in graph.parent_refs(parent.table(), parent_value) {
                    self.propagate(
                        graph,
                        store,
                        batch,
                        &grandparent,
                        parent.table(),
                        up,
                        depth + 1,
                    )?;
                }
            }
        }
        Ok(())
    }
}

/// Recompute the `_xor` slot as the XOR over all per-table folds.
fn refold(composition: &mut IndexMap<SmolStr, Hash>) {
    let mut folded = Hash::ZERO;
    for (key, hash) in composition.iter() {
        if key != XOR_KEY {
            folded = folded.xor(hash);
        }
    }
    composition.insert(SmolStr::new(XOR_KEY), folded);
}

//! In-memory record index with parent/dependency edges.
//!
//! The graph owns no hashes; it answers "who owns this record" and "who
//! depends on it", both derived from schema parent_refs. The reverse
//! dependency index is keyed by the parent id even before the parent record
//! itself exists, so out-of-order sync delivery still folds correctly once
//! the parent shows up.

use crate::engine::types::{FastMap, FastSet, RecordId, RowKey, Value};
use crate::schema::SchemaSet;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use smol_str::SmolStr;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord {
    pub value: Value,
    pub pending_delete: bool,
}

#[derive(Debug, Clone)]
pub struct RecordGraph {
    schema: Arc<SchemaSet>,
    records: FastMap<RowKey, StoredRecord>,
    /// parent id -> dependent table -> dependent record ids
    dependents: FastMap<RowKey, FastMap<SmolStr, FastSet<RowKey>>>,
}

impl RecordGraph {
    pub fn new(schema: Arc<SchemaSet>) -> Self {
        Self {
            schema,
            records: FastMap::default(),
            dependents: FastMap::default(),
        }
    }

    /// Current value of a live record. Never returns a record that is
    /// pending delete.
    pub fn get(&self, id: &str) -> Option<&Value> {
        let record = self.records.get(id)?;
        if record.pending_delete {
            return None;
        }
        Some(&record.value)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Parent record ids referenced by `value`, read from the
    /// schema-declared parent fields of `table`, sorted and deduplicated.
    pub fn parent_refs(&self, table: &str, value: &Value) -> SmallVec<[RecordId; 2]> {
        let mut parents: SmallVec<[RecordId; 2]> = SmallVec::new();
        for field in self.schema.parent_ref_fields(table) {
            if let Some(parent) = value.get(field.as_str()).and_then(|v| v.as_record_id()) {
                parents.push(parent);
            }
        }
        parents.sort_unstable();
        parents.dedup();
        parents
    }

    /// Dependent record ids of `parent_id`, grouped by their table.
    pub fn dependents(&self, parent_id: &str) -> Option<&FastMap<SmolStr, FastSet<RowKey>>> {
        self.dependents.get(parent_id)
    }

    pub fn insert(&mut self, id: &RecordId, value: Value) {
        self.index_refs(id, &value);
        self.records.insert(
            id.as_smol(),
            StoredRecord {
                value,
                pending_delete: false,
            },
        );
    }

    pub fn replace(&mut self, id: &RecordId, prior: &Value, value: Value) {
        self.unindex_refs(id, prior);
        self.insert(id, value);
    }

    /// Keep the row but hide it; the out-of-core syncer removes it later.
    pub fn mark_deleted(&mut self, id: &RecordId, prior: &Value) {
        self.unindex_refs(id, prior);
        if let Some(record) = self.records.get_mut(id.as_str()) {
            record.pending_delete = true;
        }
    }

    fn index_refs(&mut self, id: &RecordId, value: &Value) {
        let table = SmolStr::new(id.table());
        for parent in self.parent_refs(id.table(), value) {
            self.dependents
                .entry(parent.as_smol())
                .or_default()
                .entry(table.clone())
                .or_default()
                .insert(id.as_smol());
        }
    }

    fn unindex_refs(&mut self, id: &RecordId, value: &Value) {
        for parent in self.parent_refs(id.table(), value) {
            if let Some(by_table) = self.dependents.get_mut(parent.as_str()) {
                if let Some(set) = by_table.get_mut(id.table()) {
                    set.remove(id.as_str());
                    if set.is_empty() {
                        by_table.remove(id.table());
                    }
                }
                if by_table.is_empty() {
                    self.dependents.remove(parent.as_str());
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::types::FastMap as Map;
    use crate::schema::TableSchema;
    use serde_json::json;

    fn schema() -> Arc<SchemaSet> {
        let mut tables: Map<SmolStr, TableSchema> = Map::default();
        tables.insert(
            SmolStr::new("thread"),
            TableSchema {
                intrinsic_fields: vec![SmolStr::new("title")],
                parent_refs: vec![],
                dependencies: vec![SmolStr::new("comment")],
            },
        );
        tables.insert(
            SmolStr::new("comment"),
            TableSchema {
                intrinsic_fields: vec![SmolStr::new("content")],
                parent_refs: vec![SmolStr::new("thread")],
                dependencies: vec![],
            },
        );
        Arc::new(SchemaSet::new(tables).unwrap())
    }

    #[test]
    fn test_dependents_indexed_by_parent_field() {
        let mut graph = RecordGraph::new(schema());
        let thread = RecordId::new("thread", "1");
        let comment = RecordId::new("comment", "1");

        graph.insert(&thread, json!({ "title": "A" }).into());
        graph.insert(&comment, json!({ "content": "hi", "thread": "thread:1" }).into());

        let deps = graph.dependents("thread:1").unwrap();
        assert!(deps["comment"].contains("comment:1"));
    }

    #[test]
    fn test_dependents_survive_missing_parent() {
        // The comment arrives before its thread; the edge must exist anyway.
        let mut graph = RecordGraph::new(schema());
        let comment = RecordId::new("comment", "1");
        graph.insert(&comment, json!({ "content": "hi", "thread": "thread:9" }).into());

        assert!(graph.get("thread:9").is_none());
        assert!(graph.dependents("thread:9").unwrap()["comment"].contains("comment:1"));
    }

    #[test]
    fn test_pending_delete_is_hidden() {
        let mut graph = RecordGraph::new(schema());
        let comment = RecordId::new("comment", "1");
        let value: Value = json!({ "content": "hi", "thread": "thread:1" }).into();
        graph.insert(&comment, value.clone());

        graph.mark_deleted(&comment, &value);
        assert!(graph.get("comment:1").is_none());
        assert!(graph.dependents("thread:1").is_none());
    }

    #[test]
    fn test_replace_moves_edges() {
        let mut graph = RecordGraph::new(schema());
        let comment = RecordId::new("comment", "1");
        let prior: Value = json!({ "content": "hi", "thread": "thread:1" }).into();
        graph.insert(&comment, prior.clone());

        graph.replace(&comment, &prior, json!({ "content": "hi", "thread": "thread:2" }).into());
        assert!(graph.dependents("thread:1").is_none());
        assert!(graph.dependents("thread:2").unwrap()["comment"].contains("comment:1"));
    }
}

//! Tables, the database of z-sets, and the circuit that routes deltas to
//! views.

use super::types::{FastMap, FastSet, RowKey, Value, ZSet};
use super::update::ViewUpdate;
use super::view::{QueryPlan, View};
use crate::error::{EngineError, Result};
use crate::hash::TotalHashes;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use tracing::debug;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub zset: ZSet,
    pub rows: FastMap<RowKey, Value>,
}

impl Table {
    pub fn new(name: String) -> Self {
        Self {
            name,
            zset: FastMap::default(),
            rows: FastMap::default(),
        }
    }

    pub fn upsert_row(&mut self, key: SmolStr, value: Value) {
        self.rows.insert(key, value);
    }

    pub fn remove_row(&mut self, key: &SmolStr) {
        self.rows.remove(key);
    }

    pub fn apply_delta(&mut self, delta: &ZSet) {
        for (key, weight) in delta {
            let entry = self.zset.entry(key.clone()).or_insert(0);
            *entry += weight;
            if *entry == 0 {
                self.zset.remove(key);
            }
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Database {
    pub tables: FastMap<String, Table>,
}

impl Database {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ensure_table(&mut self, name: &str) -> &mut Table {
        self.tables
            .entry(name.to_string())
            .or_insert_with(|| Table::new(name.to_string()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "CREATE" => Some(Operation::Create),
            "UPDATE" => Some(Operation::Update),
            "DELETE" => Some(Operation::Delete),
            _ => None,
        }
    }
}

/// The sole input of the dataflow: one tagged record change.
/// `prior` is mandatory for Update and Delete.
#[derive(Clone, Debug)]
pub struct Delta {
    pub table: SmolStr,
    pub op: Operation,
    pub id: RowKey,
    pub value: Option<Value>,
    pub prior: Option<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Circuit {
    pub db: Database,
    pub views: Vec<View>,
    // table -> indices of views reading it; rebuilt lazily after
    // deserialization
    #[serde(skip, default)]
    dependency_graph: FastMap<String, Vec<usize>>,
}

impl Circuit {
    pub fn new() -> Self {
        Self {
            db: Database::new(),
            views: Vec::new(),
            dependency_graph: FastMap::default(),
        }
    }

    pub fn rebuild_dependency_graph(&mut self) {
        self.dependency_graph.clear();
        for (i, view) in self.views.iter().enumerate() {
            for table in view.plan.root.referenced_tables() {
                self.dependency_graph.entry(table).or_default().push(i);
            }
        }
    }

    pub fn view(&self, id: &str) -> Option<&View> {
        self.views.iter().find(|v| v.plan.id == id)
    }

    /// Register (or re-register) a view and run its initial full scan.
    pub fn register_view<H: TotalHashes>(
        &mut self,
        plan: QueryPlan,
        params: Option<Value>,
        hashes: &H,
    ) -> ViewUpdate {
        if let Some(pos) = self.views.iter().position(|v| v.plan.id == plan.id) {
            self.views.remove(pos);
            self.rebuild_dependency_graph();
        }
        // The graph may still be lazily unbuilt after a restart; the new
        // entry must not shadow the existing views.
        if self.dependency_graph.is_empty() && !self.views.is_empty() {
            self.rebuild_dependency_graph();
        }

        let mut view = View::new(plan, params);
        let initial = view.hydrate(&self.db, hashes);

        let index = self.views.len();
        for table in view.plan.root.referenced_tables() {
            self.dependency_graph.entry(table).or_default().push(index);
        }
        self.views.push(view);
        initial
    }

    pub fn unregister_view(&mut self, id: &str) {
        self.views.retain(|v| v.plan.id != id);
        self.rebuild_dependency_graph();
    }

    /// Re-run a view's initial full scan, clearing its incoherent flag.
    pub fn rehydrate_view<H: TotalHashes>(&mut self, id: &str, hashes: &H) -> Option<ViewUpdate> {
        let db = &self.db;
        self.views.iter_mut().find(|v| v.plan.id == id).map(|view| {
            view.incoherent = false;
            view.hydrate(db, hashes)
        })
    }

    /// Process one record delta. An UPDATE runs as `-prior` followed by
    /// `+new`, each half pushed through the impacted views while the table
    /// holds the value that half refers to.
    pub fn ingest<H: TotalHashes + Sync>(
        &mut self,
        delta: Delta,
        hashes: &H,
    ) -> Result<Vec<ViewUpdate>> {
        if matches!(delta.op, Operation::Update | Operation::Delete) && delta.prior.is_none() {
            return Err(EngineError::MissingPrior {
                record_id: delta.id.to_string(),
            });
        }

        let impacted = self.impacted_views(delta.table.as_str());
        debug!(
            table = %delta.table,
            op = ?delta.op,
            id = %delta.id,
            views = impacted.len(),
            "ingesting delta"
        );

        match delta.op {
            Operation::Create => {
                let value = delta.value.unwrap_or_default();
                self.push_phase(&impacted, &delta.table, &delta.id, Some(value), 1);
            }
            Operation::Update => {
                let prior = delta.prior.unwrap_or_default();
                let value = delta.value.unwrap_or_default();
                self.push_phase(&impacted, &delta.table, &delta.id, Some(prior), -1);
                self.push_phase(&impacted, &delta.table, &delta.id, Some(value), 1);
            }
            Operation::Delete => {
                self.push_phase(&impacted, &delta.table, &delta.id, None, -1);
                let tb = self.db.ensure_table(delta.table.as_str());
                tb.remove_row(&delta.id);
            }
        }

        Ok(self.finalize_views(&impacted, hashes))
    }

    /// Re-derive merkle leaves for views whose current results include a
    /// record whose total hash just moved (a cascade without a membership
    /// change). No-op roots stay silent.
    pub fn refresh_hashes<H: TotalHashes + Sync>(
        &mut self,
        touched: &[RowKey],
        hashes: &H,
    ) -> Vec<ViewUpdate> {
        if touched.is_empty() {
            return Vec::new();
        }
        let touched_set: FastSet<RowKey> = touched.iter().cloned().collect();
        let mut updates = Vec::new();
        for view in &mut self.views {
            if let Some(update) = view.refresh(&touched_set, hashes) {
                updates.push(update);
            }
        }
        updates
    }

    fn impacted_views(&mut self, table: &str) -> Vec<usize> {
        if self.dependency_graph.is_empty() && !self.views.is_empty() {
            self.rebuild_dependency_graph();
        }
        let mut indices = self
            .dependency_graph
            .get(table)
            .cloned()
            .unwrap_or_default();
        indices.sort_unstable();
        indices.dedup();
        indices
    }

    /// Apply one half of a mutation to the table, then push it through the
    /// impacted views. The row mutation happens first so predicates and
    /// join keys evaluate against the value this half describes.
    fn push_phase(
        &mut self,
        impacted: &[usize],
        table: &SmolStr,
        id: &RowKey,
        value: Option<Value>,
        weight: i64,
    ) {
        {
            let tb = self.db.ensure_table(table.as_str());
            if let Some(value) = value {
                tb.upsert_row(id.clone(), value);
            }
            let mut delta: ZSet = FastMap::default();
            delta.insert(id.clone(), weight);
            tb.apply_delta(&delta);
        }

        let mut deltas: FastMap<String, ZSet> = FastMap::default();
        let mut table_delta: ZSet = FastMap::default();
        table_delta.insert(id.clone(), weight);
        deltas.insert(table.to_string(), table_delta);

        let db = &self.db;
        for &index in impacted {
            if let Some(view) = self.views.get_mut(index) {
                view.apply_delta(&deltas, db);
            }
        }
    }

    fn finalize_views<H: TotalHashes + Sync>(
        &mut self,
        impacted: &[usize],
        hashes: &H,
    ) -> Vec<ViewUpdate> {
        const PARALLEL_VIEW_THRESHOLD: usize = 10;
        let db = &self.db;

        #[cfg(all(feature = "parallel", not(target_arch = "wasm32")))]
        {
            if impacted.len() >= PARALLEL_VIEW_THRESHOLD {
                use rayon::prelude::*;
                return self
                    .views
                    .par_iter_mut()
                    .enumerate()
                    .filter_map(|(i, view)| {
                        if impacted.binary_search(&i).is_ok() {
                            view.finalize(db, hashes)
                        } else {
                            None
                        }
                    })
                    .collect();
            }
        }

        let mut updates = Vec::with_capacity(impacted.len());
        for &index in impacted {
            if let Some(view) = self.views.get_mut(index) {
                if let Some(update) = view.finalize(db, hashes) {
                    updates.push(update);
                }
            }
        }
        updates
    }
}

impl Default for Circuit {
    fn default() -> Self {
        Self::new()
    }
}

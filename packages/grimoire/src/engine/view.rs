//! A registered view: compiled plan, per-operator state, and the sink.
//!
//! The operator tree is stateful where it has to be (Join keeps symmetric
//! key indexes, OrderLimit keeps its admitted order) and stateless
//! everywhere else. Operator state is not serialized; it is rebuilt from
//! the persisted table z-sets on first use after a restart, the same lazy
//! discipline the circuit uses for its dependency graph.

use super::circuit::Database;
use super::eval::{
    eval_predicate, hash_join_key, order_compare, resolve_path, row_value, EvalContext,
};
use super::merkle::MerkleTree;
use super::operators::{Operator, OrderSpec};
use super::types::{fold_weight, merge_delta, FastMap, FastSet, RowKey, Value, ZSet};
use super::update::ViewUpdate;
use crate::hash::{Hash, TotalHashes};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use tracing::{debug, warn};

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct QueryPlan {
    pub id: String,
    pub root: Operator,
}

/// Runtime state per operator node, shaped like the plan tree.
#[derive(Debug, Clone)]
pub enum OpState {
    Leaf,
    Unary {
        input: Box<OpState>,
    },
    Join {
        left: Box<OpState>,
        right: Box<OpState>,
        left_index: FastMap<u64, ZSet>,
        right_index: FastMap<u64, ZSet>,
    },
    Limit {
        input: Box<OpState>,
        upstream: ZSet,
        admitted: Vec<RowKey>,
    },
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct View {
    pub plan: QueryPlan,
    #[serde(default)]
    pub params: Option<Value>,
    /// Sink membership weights.
    pub cache: ZSet,
    /// Last published ordered id list, subquery expansion included.
    pub current: Vec<RowKey>,
    pub merkle: MerkleTree,
    /// Set when the merkle tree saw a record with no known total hash.
    #[serde(default)]
    pub incoherent: bool,
    #[serde(skip)]
    state: Option<OpState>,
    #[serde(skip)]
    pending: ZSet,
    #[serde(skip)]
    dropped: bool,
}

impl View {
    pub fn new(plan: QueryPlan, params: Option<Value>) -> Self {
        Self {
            plan,
            params,
            cache: FastMap::default(),
            current: Vec::new(),
            merkle: MerkleTree::default(),
            incoherent: false,
            state: None,
            pending: FastMap::default(),
            dropped: false,
        }
    }

    /// Full initial evaluation at registration time. Always emits, even for
    /// an empty result set (the caller needs the root).
    pub fn hydrate<H: TotalHashes>(&mut self, db: &Database, hashes: &H) -> ViewUpdate {
        let ctx = EvalContext {
            params: self.params.as_ref(),
            parent: None,
        };
        let (state, output) = build_state(&self.plan.root, db, &ctx);
        self.state = Some(state);
        self.cache = output;
        self.pending.clear();
        self.publish(db, hashes).0
    }

    /// Push one half-delta (the `-prior` or `+new` side of a mutation)
    /// through the operator tree. Failures isolate to this view: the delta
    /// is dropped, state is discarded for lazy rebuild, and the sink stays
    /// silent for this mutation.
    pub fn apply_delta(&mut self, deltas: &FastMap<String, ZSet>, db: &Database) {
        if self.dropped {
            return;
        }
        if self.state.is_none() {
            let ctx = EvalContext {
                params: self.params.as_ref(),
                parent: None,
            };
            let (state, _) = build_state(&self.plan.root, db, &ctx);
            self.state = Some(state);
        }

        let ctx = EvalContext {
            params: self.params.as_ref(),
            parent: None,
        };
        let result = match self.state.as_mut() {
            Some(state) => eval_delta(&self.plan.root, state, deltas, db, &ctx),
            None => return,
        };
        match result {
            Ok(delta) => merge_delta(&mut self.pending, &delta),
            Err(err) => {
                warn!(view = %self.plan.id, error = %err, "dropping delta for view");
                self.state = None;
                self.pending.clear();
                self.dropped = true;
            }
        }
    }

    /// Fold the accumulated delta into the sink and emit if anything
    /// observable changed.
    pub fn finalize<H: TotalHashes>(&mut self, db: &Database, hashes: &H) -> Option<ViewUpdate> {
        if self.dropped {
            self.dropped = false;
            self.pending.clear();
            return None;
        }
        let pending = std::mem::take(&mut self.pending);
        merge_delta(&mut self.cache, &pending);
        let (update, changed) = self.publish(db, hashes);
        changed.then_some(update)
    }

    /// Re-derive leaves from the current id list after a hash cascade that
    /// did not move membership. Emits only when the root actually moved.
    pub fn refresh<H: TotalHashes>(
        &mut self,
        touched: &FastSet<RowKey>,
        hashes: &H,
    ) -> Option<ViewUpdate> {
        if !self.current.iter().any(|id| touched.contains(id)) {
            return None;
        }
        let old_root = self.merkle.root();
        let ids = self.current.clone();
        let leaves = self.collect_leaves(&ids, hashes);
        self.merkle.set_leaves(leaves);
        if self.merkle.root() == old_root {
            return None;
        }
        debug!(view = %self.plan.id, root = %self.merkle.root(), "merkle root refreshed");
        Some(ViewUpdate {
            view_id: self.plan.id.clone(),
            added_ids: Vec::new(),
            removed_ids: Vec::new(),
            current_ids: ids,
            root_hash: self.merkle.root(),
            leaf_hashes: self.merkle.leaves().to_vec(),
        })
    }

    /// Recompute the published result from the sink state. Returns the
    /// update plus whether anything observable moved since the last one.
    fn publish<H: TotalHashes>(&mut self, db: &Database, hashes: &H) -> (ViewUpdate, bool) {
        let base = self.ordered_base_ids();
        let ids = self.expand_ids(&base, db);

        let old_root = self.merkle.root();
        let leaves = self.collect_leaves(&ids, hashes);
        self.merkle.set_leaves(leaves);
        let root = self.merkle.root();

        let previous: FastSet<RowKey> = self.current.iter().cloned().collect();
        let next: FastSet<RowKey> = ids.iter().cloned().collect();
        let added: Vec<RowKey> = ids
            .iter()
            .filter(|id| !previous.contains(*id))
            .cloned()
            .collect();
        let removed: Vec<RowKey> = self
            .current
            .iter()
            .filter(|id| !next.contains(*id))
            .cloned()
            .collect();

        let changed = !added.is_empty() || !removed.is_empty() || root != old_root;
        self.current = ids.clone();

        (
            ViewUpdate {
                view_id: self.plan.id.clone(),
                added_ids: added,
                removed_ids: removed,
                current_ids: ids,
                root_hash: root,
                leaf_hashes: self.merkle.leaves().to_vec(),
            },
            changed,
        )
    }

    /// Base result order: the OrderLimit order when the plan has one at the
    /// root, record id ascending otherwise.
    fn ordered_base_ids(&self) -> Vec<RowKey> {
        if let (Operator::Limit { .. }, Some(OpState::Limit { admitted, .. })) =
            (&self.plan.root, self.state.as_ref())
        {
            return admitted.clone();
        }
        let mut ids: Vec<RowKey> = self
            .cache
            .iter()
            .filter(|(_, w)| **w > 0)
            .map(|(k, _)| k.clone())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Expand related subqueries: each base row is followed by its subquery
    /// children, recursively, deduplicated by first occurrence so the base
    /// order survives.
    fn expand_ids(&self, base: &[RowKey], db: &Database) -> Vec<RowKey> {
        let mut out: Vec<RowKey> = Vec::with_capacity(base.len());
        let mut seen: FastSet<RowKey> = FastSet::default();
        for id in base {
            if seen.insert(id.clone()) {
                out.push(id.clone());
            }
            if let Some(row) = row_value(db, id) {
                self.expand_node(&self.plan.root, id, row, db, &mut out, &mut seen);
            }
        }
        out
    }

    fn expand_node(
        &self,
        op: &Operator,
        parent_key: &str,
        parent_row: &Value,
        db: &Database,
        out: &mut Vec<RowKey>,
        seen: &mut FastSet<RowKey>,
    ) {
        for (_alias, plan) in op.subqueries() {
            let children = self.eval_subquery(plan, db, parent_key, parent_row);
            for child in children {
                // Recurse only on first sight; reference cycles in the data
                // must not loop the expansion.
                if !seen.insert(child.clone()) {
                    continue;
                }
                out.push(child.clone());
                if let Some(child_row) = row_value(db, &child) {
                    self.expand_node(plan, &child, child_row, db, out, seen);
                }
            }
        }
    }

    /// Snapshot-evaluate a related subquery with the parent row as context,
    /// returning ordered ids.
    fn eval_subquery(
        &self,
        plan: &Operator,
        db: &Database,
        parent_key: &str,
        parent_row: &Value,
    ) -> Vec<RowKey> {
        let ctx = EvalContext {
            params: self.params.as_ref(),
            parent: Some((parent_key, parent_row)),
        };
        ordered_snapshot(plan, db, &ctx)
    }

    fn collect_leaves<H: TotalHashes>(&mut self, ids: &[RowKey], hashes: &H) -> Vec<Hash> {
        let mut missing = false;
        let leaves = ids
            .iter()
            .map(|id| match hashes.total_hash(id) {
                Some(hash) => hash,
                None => {
                    missing = true;
                    Hash::ZERO
                }
            })
            .collect();
        if missing && !self.incoherent {
            warn!(view = %self.plan.id, "result row without total hash, view marked incoherent");
        }
        self.incoherent = self.incoherent || missing;
        leaves
    }
}

/// Ordered snapshot of an operator tree: OrderLimit order at the root when
/// present, record id ascending otherwise.
pub fn ordered_snapshot(op: &Operator, db: &Database, ctx: &EvalContext<'_>) -> Vec<RowKey> {
    if let Operator::Limit {
        input,
        limit,
        order_by,
    } = op
    {
        let upstream = eval_snapshot(input, db, ctx);
        return admit(upstream.as_ref(), db, order_by.as_deref(), *limit);
    }
    let snapshot = eval_snapshot(op, db, ctx);
    let mut ids: Vec<RowKey> = snapshot
        .iter()
        .filter(|(_, w)| **w > 0)
        .map(|(k, _)| k.clone())
        .collect();
    ids.sort_unstable();
    ids
}

/// Sort candidates under the order spec and keep the first `limit`.
fn admit(
    upstream: &ZSet,
    db: &Database,
    order_by: Option<&[OrderSpec]>,
    limit: usize,
) -> Vec<RowKey> {
    let mut candidates: Vec<RowKey> = upstream
        .iter()
        .filter(|(_, w)| **w > 0)
        .map(|(k, _)| k.clone())
        .collect();
    candidates.sort_unstable_by(|a, b| order_compare(db, order_by, a, b));
    candidates.truncate(limit);
    candidates
}

/// Full evaluation of an operator tree against the table z-sets. Rows that
/// fail predicate evaluation with a type mismatch are skipped with a
/// warning; a snapshot has no delta to drop.
pub fn eval_snapshot<'a>(op: &Operator, db: &'a Database, ctx: &EvalContext<'_>) -> Cow<'a, ZSet> {
    match op {
        Operator::Scan { table } => match db.tables.get(table) {
            Some(tb) => Cow::Borrowed(&tb.zset),
            None => Cow::Owned(FastMap::default()),
        },
        Operator::Filter { input, predicate } => {
            let upstream = eval_snapshot(input, db, ctx);
            let mut out = FastMap::default();
            for (key, weight) in upstream.as_ref() {
                match eval_predicate(predicate, key, db, ctx) {
                    Ok(true) => {
                        out.insert(key.clone(), *weight);
                    }
                    Ok(false) => {}
                    Err(err) => {
                        warn!(key = %key, error = %err, "skipping row in snapshot filter");
                    }
                }
            }
            Cow::Owned(out)
        }
        Operator::Project { input, .. } => eval_snapshot(input, db, ctx),
        Operator::Limit {
            input,
            limit,
            order_by,
        } => {
            let upstream = eval_snapshot(input, db, ctx);
            let admitted = admit(upstream.as_ref(), db, order_by.as_deref(), *limit);
            let mut out = FastMap::default();
            for key in admitted {
                out.insert(key, 1);
            }
            Cow::Owned(out)
        }
        Operator::Join { left, right, on } => {
            let s_left = eval_snapshot(left, db, ctx);
            let s_right = eval_snapshot(right, db, ctx);

            // Build on the right, probe from the left; output keys are the
            // left rows, weighted by match multiplicity.
            let mut right_index: FastMap<u64, i64> = FastMap::default();
            for (r_key, r_weight) in s_right.as_ref() {
                if let Some(r_field) = resolve_path(row_value(db, r_key), &on.right_field) {
                    *right_index.entry(hash_join_key(r_field)).or_insert(0) += r_weight;
                }
            }

            let mut out = FastMap::default();
            for (l_key, l_weight) in s_left.as_ref() {
                if let Some(l_field) = resolve_path(row_value(db, l_key), &on.left_field) {
                    if let Some(r_total) = right_index.get(&hash_join_key(l_field)) {
                        let w = l_weight * r_total;
                        if w != 0 {
                            out.insert(l_key.clone(), w);
                        }
                    }
                }
            }
            Cow::Owned(out)
        }
    }
}

/// Build operator state bottom-up, returning the node's full output.
pub fn build_state(op: &Operator, db: &Database, ctx: &EvalContext<'_>) -> (OpState, ZSet) {
    match op {
        Operator::Scan { .. } => {
            let output = eval_snapshot(op, db, ctx).into_owned();
            (OpState::Leaf, output)
        }
        Operator::Filter { input, .. } | Operator::Project { input, .. } => {
            let (child, _) = build_state(input, db, ctx);
            let output = eval_snapshot(op, db, ctx).into_owned();
            (
                OpState::Unary {
                    input: Box::new(child),
                },
                output,
            )
        }
        Operator::Join { left, right, on } => {
            let (l_state, l_out) = build_state(left, db, ctx);
            let (r_state, r_out) = build_state(right, db, ctx);

            let mut left_index: FastMap<u64, ZSet> = FastMap::default();
            for (key, weight) in &l_out {
                if let Some(field) = resolve_path(row_value(db, key), &on.left_field) {
                    fold_weight(
                        left_index.entry(hash_join_key(field)).or_default(),
                        key.clone(),
                        *weight,
                    );
                }
            }
            let mut right_index: FastMap<u64, ZSet> = FastMap::default();
            for (key, weight) in &r_out {
                if let Some(field) = resolve_path(row_value(db, key), &on.right_field) {
                    fold_weight(
                        right_index.entry(hash_join_key(field)).or_default(),
                        key.clone(),
                        *weight,
                    );
                }
            }

            let mut output = FastMap::default();
            for (hash, lside) in &left_index {
                if let Some(rside) = right_index.get(hash) {
                    let r_total: i64 = rside.values().sum();
                    for (l_key, l_weight) in lside {
                        let w = l_weight * r_total;
                        if w != 0 {
                            output.insert(l_key.clone(), w);
                        }
                    }
                }
            }

            (
                OpState::Join {
                    left: Box::new(l_state),
                    right: Box::new(r_state),
                    left_index,
                    right_index,
                },
                output,
            )
        }
        Operator::Limit {
            input,
            limit,
            order_by,
        } => {
            let (child, upstream) = build_state(input, db, ctx);
            let admitted = admit(&upstream, db, order_by.as_deref(), *limit);
            let mut output = FastMap::default();
            for key in &admitted {
                output.insert(key.clone(), 1);
            }
            (
                OpState::Limit {
                    input: Box::new(child),
                    upstream,
                    admitted,
                },
                output,
            )
        }
    }
}

/// Push a table delta through the operator tree, updating state and
/// returning the node's output delta.
pub fn eval_delta(
    op: &Operator,
    state: &mut OpState,
    deltas: &FastMap<String, ZSet>,
    db: &Database,
    ctx: &EvalContext<'_>,
) -> crate::error::Result<ZSet> {
    match (op, state) {
        (Operator::Scan { table }, OpState::Leaf) => {
            Ok(deltas.get(table).cloned().unwrap_or_default())
        }
        (Operator::Filter { input, predicate }, OpState::Unary { input: child }) => {
            let upstream = eval_delta(input, child, deltas, db, ctx)?;
            let mut out = FastMap::default();
            for (key, weight) in upstream {
                if eval_predicate(predicate, &key, db, ctx)? {
                    out.insert(key, weight);
                }
            }
            Ok(out)
        }
        (Operator::Project { input, .. }, OpState::Unary { input: child }) => {
            eval_delta(input, child, deltas, db, ctx)
        }
        (
            Operator::Join { left, right, on },
            OpState::Join {
                left: l_state,
                right: r_state,
                left_index,
                right_index,
            },
        ) => {
            let dl = eval_delta(left, l_state, deltas, db, ctx)?;
            let dr = eval_delta(right, r_state, deltas, db, ctx)?;
            let mut out: ZSet = FastMap::default();

            // dL joined against the old right side.
            for (key, weight) in &dl {
                if let Some(field) = resolve_path(row_value(db, key), &on.left_field) {
                    if let Some(rside) = right_index.get(&hash_join_key(field)) {
                        let r_total: i64 = rside.values().sum();
                        if r_total != 0 {
                            fold_weight(&mut out, key.clone(), weight * r_total);
                        }
                    }
                }
            }
            for (key, weight) in &dl {
                if let Some(field) = resolve_path(row_value(db, key), &on.left_field) {
                    fold_weight(
                        left_index.entry(hash_join_key(field)).or_default(),
                        key.clone(),
                        *weight,
                    );
                }
            }

            // The updated left side joined against dR.
            for (r_key, r_weight) in &dr {
                if let Some(field) = resolve_path(row_value(db, r_key), &on.right_field) {
                    if let Some(lside) = left_index.get(&hash_join_key(field)) {
                        for (l_key, l_weight) in lside {
                            fold_weight(&mut out, l_key.clone(), l_weight * r_weight);
                        }
                    }
                }
            }
            for (r_key, r_weight) in &dr {
                if let Some(field) = resolve_path(row_value(db, r_key), &on.right_field) {
                    fold_weight(
                        right_index.entry(hash_join_key(field)).or_default(),
                        r_key.clone(),
                        *r_weight,
                    );
                }
            }

            left_index.retain(|_, side| !side.is_empty());
            right_index.retain(|_, side| !side.is_empty());
            Ok(out)
        }
        (
            Operator::Limit {
                input,
                limit,
                order_by,
            },
            OpState::Limit {
                input: child,
                upstream,
                admitted,
            },
        ) => {
            let delta = eval_delta(input, child, deltas, db, ctx)?;
            if delta.is_empty() {
                // Content-only changes upstream can still reorder rows; the
                // admitted list is rebuilt so the sink sees fresh order.
                *admitted = admit(upstream, db, order_by.as_deref(), *limit);
                return Ok(FastMap::default());
            }
            merge_delta(upstream, &delta);

            let new_admitted = admit(upstream, db, order_by.as_deref(), *limit);
            let old_set: FastSet<RowKey> = admitted.iter().cloned().collect();
            let new_set: FastSet<RowKey> = new_admitted.iter().cloned().collect();

            let mut out: ZSet = FastMap::default();
            for key in &new_admitted {
                if !old_set.contains(key) {
                    out.insert(key.clone(), 1);
                }
            }
            for key in admitted.iter() {
                if !new_set.contains(key) {
                    out.insert(key.clone(), -1);
                }
            }
            *admitted = new_admitted;
            Ok(out)
        }
        _ => Err(crate::error::EngineError::TypeMismatch {
            context: "operator state out of sync with plan".to_string(),
        }),
    }
}

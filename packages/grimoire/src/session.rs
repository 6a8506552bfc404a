//! Session router: the single-threaded pipeline every mutation and view
//! command runs through.
//!
//! Per-mutation order: load prior, run the hash cascade (buffered), run the
//! circuit ingest, flush the snapshot, then deliver `ViewUpdate`s. The
//! store's exclusive lock spans the first four steps and is released before
//! delivery. A failed flush reloads circuit and registry from the last good
//! snapshot and discards the hash buffer, so a rejected mutation leaves no
//! trace.
//!
//! Subscriber delivery is best-effort at-least-once within a session;
//! subscribers deduplicate on the merkle root. Cancelling a subscription is
//! dropping its receiver; the shared circuit stays alive until the last
//! registration detaches or its TTL is reaped.

use crate::clock::Clock;
use crate::engine::circuit::{Circuit, Delta, Operation};
use crate::engine::types::{FastMap, RecordId, Value};
use crate::engine::update::{ViewRegistered, ViewUpdate};
use crate::engine::view::QueryPlan;
use crate::error::{EngineError, Result};
use crate::hash::{Hash, HashService, HashStore, Overlay, RecordGraph, WriteBatch};
use crate::registry::{encode_snapshot, Registry, Store, ViewEntry, ViewState};
use crate::parser;
use crate::sanitizer;
use crate::schema::SchemaSet;
use crossbeam_channel::{unbounded, Receiver, Sender};
use smol_str::SmolStr;
use std::sync::Arc;
use tracing::{debug, info, warn};
use ulid::Ulid;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Per-operation snapshot flush deadline in milliseconds; 0 disables
    /// the check.
    pub flush_deadline_ms: i64,
    /// TTL applied to registrations that do not specify one.
    pub default_ttl_ms: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            flush_deadline_ms: 250,
            default_ttl_ms: 5 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    pub ttl_ms: Option<i64>,
    pub client_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MutationReceipt {
    pub record_id: RecordId,
    pub total_hash: Hash,
}

pub struct Session {
    schema: Arc<SchemaSet>,
    graph: RecordGraph,
    hash_service: HashService,
    hash_store: HashStore,
    circuit: Circuit,
    registry: Registry,
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
    subscribers: FastMap<SmolStr, Vec<Sender<ViewUpdate>>>,
}

impl Session {
    /// Open a session against a store, replaying the persisted snapshot if
    /// one exists. Schema problems are fatal here and nowhere else.
    pub fn open(
        schema: SchemaSet,
        store: Arc<Store>,
        clock: Arc<dyn Clock>,
        config: SessionConfig,
    ) -> Result<Self> {
        let schema = Arc::new(schema);
        let (circuit, registry, hash_store) = {
            let _guard = store.read_guard();
            let snapshot = store.load_snapshot()?;
            let hash_store = store.load_record_hashes()?;
            match snapshot {
                Some(snapshot) => (snapshot.circuit, snapshot.registry, hash_store),
                None => (Circuit::new(), Registry::default(), hash_store),
            }
        };

        let mut graph = RecordGraph::new(schema.clone());
        for table in circuit.db.tables.values() {
            for (key, value) in &table.rows {
                if let Some(id) = RecordId::parse(key) {
                    graph.insert(&id, value.clone());
                }
            }
        }

        info!(
            views = circuit.views.len(),
            records = hash_store.len(),
            "session opened"
        );

        Ok(Self {
            hash_service: HashService::new(schema.clone()),
            schema,
            graph,
            hash_store,
            circuit,
            registry,
            store,
            clock,
            config,
            subscribers: FastMap::default(),
        })
    }

    pub fn schema(&self) -> &SchemaSet {
        &self.schema
    }

    /// Current total hash of a live record.
    pub fn total_hash(&self, record_id: &str) -> Option<Hash> {
        self.hash_store.get(record_id).map(|row| row.total)
    }

    /// Full hash row of a record, including composition slots and the
    /// syncer flags.
    pub fn record_hash(&self, record_id: &str) -> Option<&crate::hash::RecordHashRow> {
        self.hash_store.get(record_id)
    }

    /// Number of distinct compiled circuits currently live.
    pub fn compiled_circuits(&self) -> usize {
        self.circuit.views.len()
    }

    /// Number of attached registrations across all circuits.
    pub fn registrations(&self) -> usize {
        self.registry.views().count()
    }

    /// Ordered result ids a view currently publishes.
    pub fn current_ids(&self, view_id: &str) -> Option<Vec<crate::engine::types::RowKey>> {
        let entry = self.registry.view(view_id)?;
        let view = self.circuit.view(&entry.circuit_id)?;
        Some(view.current.clone())
    }

    pub fn record(&self, record_id: &str) -> Option<&Value> {
        self.graph.get(record_id)
    }

    // --- mutation API ---

    pub fn create(&mut self, table: &str, value: serde_json::Value) -> Result<MutationReceipt> {
        let value = sanitizer::normalize_value(value);
        let id = match value.get("id").and_then(|v| v.as_record_id()) {
            Some(id) if id.table() == table && sanitizer::is_record_id(id.as_str()) => id,
            _ => RecordId::new(table, &Ulid::new().to_string()),
        };
        self.apply_mutation(Operation::Create, id, Some(value), None)
    }

    pub fn update(&mut self, record_id: &str, partial: serde_json::Value) -> Result<MutationReceipt> {
        let id = RecordId::parse(record_id).ok_or_else(|| EngineError::MissingPrior {
            record_id: record_id.to_string(),
        })?;
        let prior = self
            .graph
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| EngineError::MissingPrior {
                record_id: record_id.to_string(),
            })?;

        let patch = sanitizer::normalize_value(partial);
        let mut merged = prior.clone();
        match (&mut merged, patch) {
            (Value::Map(target), Value::Map(fields)) => {
                for (key, value) in fields {
                    target.insert(key, value);
                }
            }
            (slot, whole) => *slot = whole,
        }

        self.apply_mutation(Operation::Update, id, Some(merged), Some(prior))
    }

    pub fn delete(&mut self, record_id: &str) -> Result<MutationReceipt> {
        let id = RecordId::parse(record_id).ok_or_else(|| EngineError::MissingPrior {
            record_id: record_id.to_string(),
        })?;
        let prior = self
            .graph
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| EngineError::MissingPrior {
                record_id: record_id.to_string(),
            })?;
        self.apply_mutation(Operation::Delete, id, None, Some(prior))
    }

    fn apply_mutation(
        &mut self,
        op: Operation,
        id: RecordId,
        value: Option<Value>,
        prior: Option<Value>,
    ) -> Result<MutationReceipt> {
        let store = self.store.clone();
        let guard = store.write_guard();

        self.reap_expired(id.table());

        // Hash cascade, fully buffered. Any error here aborts with no
        // state touched anywhere.
        let mut batch = WriteBatch::default();
        let total = match op {
            Operation::Create => {
                let value = value.as_ref().unwrap_or(&Value::Null);
                self.hash_service
                    .on_create(&self.graph, &self.hash_store, &mut batch, &id, value)?
            }
            Operation::Update => {
                let prior_value = prior.as_ref().unwrap_or(&Value::Null);
                let value = value.as_ref().unwrap_or(&Value::Null);
                self.hash_service.on_update(
                    &self.graph,
                    &self.hash_store,
                    &mut batch,
                    &id,
                    prior_value,
                    value,
                )?
            }
            Operation::Delete => {
                let prior_value = prior.as_ref().unwrap_or(&Value::Null);
                self.hash_service
                    .on_delete(&self.graph, &self.hash_store, &mut batch, &id, prior_value)?
            }
        };

        // Circuit ingest sees the in-flight totals through the overlay, so
        // merkle leaves pick up the cascade within the same mutation.
        let overlay = Overlay {
            batch: &batch,
            store: &self.hash_store,
        };
        let delta = Delta {
            table: SmolStr::new(id.table()),
            op,
            id: id.as_smol(),
            value: value.clone(),
            prior: prior.clone(),
        };
        let mut updates = self.circuit.ingest(delta, &overlay)?;
        updates.extend(self.circuit.refresh_hashes(batch.touched(), &overlay));

        // Flush. On failure the in-memory circuit is reloaded from the
        // last good snapshot and the hash buffer is dropped.
        let snapshot = encode_snapshot(&self.circuit, &self.registry)?;
        if let Err(err) = store.commit(
            &snapshot,
            &batch,
            self.clock.as_ref(),
            self.config.flush_deadline_ms,
        ) {
            warn!(record = id.as_str(), error = %err, "flush failed, rolling back");
            self.reload_from_store()?;
            return Err(err);
        }

        // Commit the buffered writes.
        self.hash_store.apply(batch);
        match op {
            Operation::Create => {
                if let Some(value) = value {
                    self.graph.insert(&id, value);
                }
            }
            Operation::Update => {
                if let (Some(prior), Some(value)) = (prior, value) {
                    self.graph.replace(&id, &prior, value);
                }
            }
            Operation::Delete => {
                if let Some(prior) = prior {
                    self.graph.mark_deleted(&id, &prior);
                }
            }
        }

        drop(guard);
        self.deliver(updates);

        Ok(MutationReceipt {
            record_id: id,
            total_hash: total,
        })
    }

    // --- view API ---

    pub fn register_view(
        &mut self,
        view_id: &str,
        plan_text: &str,
        params: serde_json::Value,
    ) -> Result<ViewRegistered> {
        self.register_view_with(view_id, plan_text, params, RegisterOptions::default())
    }

    pub fn register_view_with(
        &mut self,
        view_id: &str,
        plan_text: &str,
        params: serde_json::Value,
        options: RegisterOptions,
    ) -> Result<ViewRegistered> {
        let root = parser::parse_plan(plan_text)?;
        let params = sanitizer::parse_params(params);
        let circuit_id = Registry::circuit_key(&root, params.as_ref());

        let store = self.store.clone();
        let guard = store.write_guard();
        let now = self.clock.now_millis();

        // Re-registering an existing view id replaces the old binding.
        if self.registry.view(view_id).is_some() {
            if let Some((old_circuit, remaining)) = self.registry.detach(view_id) {
                if remaining == 0 && old_circuit != circuit_id {
                    self.circuit.unregister_view(&old_circuit);
                }
            }
        }

        // Dedup: a second registration with the same (plan, params)
        // attaches to the live circuit and returns its current root.
        let root_hash = match self.circuit.view(&circuit_id) {
            Some(view) => view.merkle.root(),
            None => {
                let plan = QueryPlan {
                    id: circuit_id.clone(),
                    root,
                };
                let initial =
                    self.circuit
                        .register_view(plan, params.clone(), &self.hash_store);
                initial.root_hash
            }
        };

        let shared = self.registry.attach(ViewEntry {
            view_id: view_id.to_string(),
            circuit_id: circuit_id.clone(),
            plan_text: plan_text.to_string(),
            params,
            client_id: options.client_id,
            ttl_ms: options.ttl_ms.unwrap_or(self.config.default_ttl_ms),
            last_active_at: now,
            state: ViewState::Registered,
            last_root: root_hash,
        });

        let snapshot = encode_snapshot(&self.circuit, &self.registry)?;
        if let Err(err) = store.commit(
            &snapshot,
            &WriteBatch::default(),
            self.clock.as_ref(),
            self.config.flush_deadline_ms,
        ) {
            self.reload_from_store()?;
            return Err(err);
        }
        drop(guard);

        info!(view_id, circuit = %circuit_id, shared, root = %root_hash, "view registered");
        Ok(ViewRegistered {
            view_id: view_id.to_string(),
            root_hash,
        })
    }

    pub fn unregister_view(&mut self, view_id: &str) -> Result<()> {
        let store = self.store.clone();
        let guard = store.write_guard();

        let Some((circuit_id, remaining)) = self.registry.detach(view_id) else {
            return Err(EngineError::UnknownView {
                view_id: view_id.to_string(),
            });
        };
        self.subscribers.remove(view_id);
        if remaining == 0 {
            self.circuit.unregister_view(&circuit_id);
            debug!(circuit = %circuit_id, "last registration gone, circuit torn down");
        }

        let snapshot = encode_snapshot(&self.circuit, &self.registry)?;
        if let Err(err) = store.commit(
            &snapshot,
            &WriteBatch::default(),
            self.clock.as_ref(),
            self.config.flush_deadline_ms,
        ) {
            self.reload_from_store()?;
            return Err(err);
        }
        drop(guard);
        Ok(())
    }

    /// Attach a subscriber. The receiver is immediately seeded with the
    /// view's current state; dropping it cancels the subscription.
    pub fn subscribe(&mut self, view_id: &str) -> Result<Receiver<ViewUpdate>> {
        let now = self.clock.now_millis();
        let circuit_id = {
            let entry = self
                .registry
                .view_mut(view_id)
                .ok_or_else(|| EngineError::UnknownView {
                    view_id: view_id.to_string(),
                })?;
            entry.state = ViewState::Active;
            entry.last_active_at = now;
            entry.circuit_id.clone()
        };

        // An incoherent view serves stale roots; the caller must rehydrate
        // before subscribing.
        if self
            .circuit
            .view(&circuit_id)
            .map(|view| view.incoherent)
            .unwrap_or(false)
        {
            return Err(EngineError::Incoherent {
                view_id: view_id.to_string(),
            });
        }

        let (tx, rx) = unbounded();
        if let Some(view) = self.circuit.view(&circuit_id) {
            let seed = ViewUpdate {
                view_id: view_id.to_string(),
                added_ids: view.current.clone(),
                removed_ids: Vec::new(),
                current_ids: view.current.clone(),
                root_hash: view.merkle.root(),
                leaf_hashes: view.merkle.leaves().to_vec(),
            };
            let _ = tx.send(seed);
        }
        self.subscribers
            .entry(SmolStr::new(view_id))
            .or_default()
            .push(tx);
        Ok(rx)
    }

    /// Rebuild an incoherent view's circuit from scratch and republish.
    pub fn rehydrate(&mut self, view_id: &str) -> Result<ViewRegistered> {
        let circuit_id = self
            .registry
            .view(view_id)
            .map(|entry| entry.circuit_id.clone())
            .ok_or_else(|| EngineError::UnknownView {
                view_id: view_id.to_string(),
            })?;

        let store = self.store.clone();
        let guard = store.write_guard();
        let update = self
            .circuit
            .rehydrate_view(&circuit_id, &self.hash_store)
            .ok_or_else(|| EngineError::UnknownView {
                view_id: view_id.to_string(),
            })?;

        let snapshot = encode_snapshot(&self.circuit, &self.registry)?;
        if let Err(err) = store.commit(
            &snapshot,
            &WriteBatch::default(),
            self.clock.as_ref(),
            self.config.flush_deadline_ms,
        ) {
            self.reload_from_store()?;
            return Err(err);
        }
        drop(guard);

        let root_hash = update.root_hash;
        self.deliver(vec![update]);
        Ok(ViewRegistered {
            view_id: view_id.to_string(),
            root_hash,
        })
    }

    // --- internals ---

    /// Fan circuit-level updates out to every attached registration.
    /// Dropped receivers are pruned; a view with no subscribers left goes
    /// quiescent and starts its TTL.
    fn deliver(&mut self, updates: Vec<ViewUpdate>) {
        if updates.is_empty() {
            return;
        }
        let now = self.clock.now_millis();
        for update in updates {
            let targets: Vec<String> = self
                .registry
                .views_of_circuit(&update.view_id)
                .map(|entry| entry.view_id.clone())
                .collect();
            for view_id in targets {
                if let Some(entry) = self.registry.view_mut(&view_id) {
                    entry.last_root = update.root_hash;
                    entry.last_active_at = now;
                }
                let mut drained = false;
                if let Some(senders) = self.subscribers.get_mut(view_id.as_str()) {
                    let addressed = update.for_view(&view_id);
                    senders.retain(|tx| tx.send(addressed.clone()).is_ok());
                    drained = senders.is_empty();
                }
                if drained {
                    self.subscribers.remove(view_id.as_str());
                    if let Some(entry) = self.registry.view_mut(&view_id) {
                        entry.state = ViewState::Quiescent;
                    }
                }
            }
        }
    }

    /// Reap views whose TTL elapsed without a subscriber, limited to views
    /// reading the table the current mutation touches.
    fn reap_expired(&mut self, table: &str) {
        let now = self.clock.now_millis();
        for view_id in self.registry.expired(now) {
            let reads_table = self
                .registry
                .view(&view_id)
                .and_then(|entry| self.circuit.view(&entry.circuit_id))
                .map(|view| {
                    view.plan
                        .root
                        .referenced_tables()
                        .iter()
                        .any(|t| t == table)
                })
                .unwrap_or(true);
            if !reads_table {
                continue;
            }
            if let Some((circuit_id, remaining)) = self.registry.detach(&view_id) {
                self.subscribers.remove(view_id.as_str());
                if remaining == 0 {
                    self.circuit.unregister_view(&circuit_id);
                }
                info!(view_id = %view_id, "reaped expired view");
            }
        }
    }

    fn reload_from_store(&mut self) -> Result<()> {
        match self.store.load_snapshot()? {
            Some(snapshot) => {
                self.circuit = snapshot.circuit;
                self.registry = snapshot.registry;
            }
            None => {
                self.circuit = Circuit::new();
                self.registry = Registry::default();
            }
        }
        Ok(())
    }
}

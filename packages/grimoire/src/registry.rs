//! Incantation registry and the persistence store.
//!
//! Views are deduplicated by `(plan, params)`: the canonical serialized plan
//! plus its bound params hash to a circuit id, and every registration with
//! the same pair attaches to the same compiled circuit with a refcount.
//!
//! Persistence is two redb tables: `record_hash` (one row per record) and
//! `module_state`, whose single `dbsp` row holds the cbor-encoded circuit
//! plus registry bookkeeping. After a restart the snapshot reconstructs the
//! whole engine without replaying history.

use crate::clock::Clock;
use crate::engine::circuit::Circuit;
use crate::engine::operators::Operator;
use crate::engine::types::{FastMap, Value};
use crate::error::{EngineError, Result};
use crate::hash::{Hash, HashStore, RecordHashRow, WriteBatch};
use parking_lot::RwLock;
use redb::{ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::path::Path as FsPath;
use tracing::{debug, info};

const MODULE_STATE: TableDefinition<&str, &[u8]> = TableDefinition::new("module_state");
const RECORD_HASH: TableDefinition<&str, &[u8]> = TableDefinition::new("record_hash");

/// Fixed key of the single module-state row.
pub const MODULE_STATE_KEY: &str = "dbsp";

// --- registry bookkeeping ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ViewState {
    Registered,
    Active,
    Quiescent,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ViewEntry {
    pub view_id: String,
    pub circuit_id: String,
    pub plan_text: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub client_id: Option<String>,
    pub ttl_ms: i64,
    pub last_active_at: i64,
    pub state: ViewState,
    pub last_root: Hash,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CircuitEntry {
    pub circuit_id: String,
    pub refcount: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Registry {
    views: FastMap<SmolStr, ViewEntry>,
    circuits: FastMap<SmolStr, CircuitEntry>,
}

impl Registry {
    /// Dedup identity of a compiled circuit.
    pub fn circuit_key(root: &Operator, params: Option<&Value>) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(root.canonical_text().as_bytes());
        if let Some(params) = params {
            hasher.update(
                serde_json::to_string(&serde_json::Value::from(params.clone()))
                    .unwrap_or_default()
                    .as_bytes(),
            );
        }
        format!("q_{}", hasher.finalize().to_hex())
    }

    /// Attach a subscriber view to a circuit, creating or refcounting the
    /// circuit entry. Returns true when the circuit already existed.
    pub fn attach(&mut self, entry: ViewEntry) -> bool {
        let circuit_id = SmolStr::new(&entry.circuit_id);
        let existed = match self.circuits.get_mut(&circuit_id) {
            Some(circuit) => {
                circuit.refcount += 1;
                true
            }
            None => {
                self.circuits.insert(
                    circuit_id.clone(),
                    CircuitEntry {
                        circuit_id: entry.circuit_id.clone(),
                        refcount: 1,
                    },
                );
                false
            }
        };
        self.views.insert(SmolStr::new(&entry.view_id), entry);
        existed
    }

    /// Detach a subscriber view. Returns the circuit id and how many
    /// attachments remain; the circuit itself is torn down only at zero.
    pub fn detach(&mut self, view_id: &str) -> Option<(String, u32)> {
        let entry = self.views.remove(view_id)?;
        let circuit_id = SmolStr::new(&entry.circuit_id);
        let remaining = match self.circuits.get_mut(&circuit_id) {
            Some(circuit) => {
                circuit.refcount = circuit.refcount.saturating_sub(1);
                circuit.refcount
            }
            None => 0,
        };
        if remaining == 0 {
            self.circuits.remove(&circuit_id);
        }
        Some((entry.circuit_id, remaining))
    }

    pub fn view(&self, view_id: &str) -> Option<&ViewEntry> {
        self.views.get(view_id)
    }

    pub fn view_mut(&mut self, view_id: &str) -> Option<&mut ViewEntry> {
        self.views.get_mut(view_id)
    }

    pub fn views(&self) -> impl Iterator<Item = &ViewEntry> {
        self.views.values()
    }

    pub fn views_of_circuit<'a>(&'a self, circuit_id: &'a str) -> impl Iterator<Item = &'a ViewEntry> {
        self.views
            .values()
            .filter(move |entry| entry.circuit_id == circuit_id)
    }

    /// Views whose TTL elapsed with no attached subscriber.
    pub fn expired(&self, now: i64) -> Vec<String> {
        self.views
            .values()
            .filter(|entry| {
                entry.state != ViewState::Active
                    && entry.ttl_ms > 0
                    && now.saturating_sub(entry.last_active_at) >= entry.ttl_ms
            })
            .map(|entry| entry.view_id.clone())
            .collect()
    }
}

// --- persisted snapshot ---

#[derive(Serialize)]
struct SnapshotRef<'a> {
    circuit: &'a Circuit,
    registry: &'a Registry,
}

#[derive(Deserialize)]
pub struct Snapshot {
    pub circuit: Circuit,
    pub registry: Registry,
}

pub fn encode_snapshot(circuit: &Circuit, registry: &Registry) -> Result<Vec<u8>> {
    cbor4ii::serde::to_vec(Vec::new(), &SnapshotRef { circuit, registry })
        .map_err(EngineError::storage)
}

pub fn decode_snapshot(bytes: &[u8]) -> Result<Snapshot> {
    cbor4ii::serde::from_slice(bytes).map_err(EngineError::storage)
}

// --- embedded store ---

/// The one cross-session resource. Writers hold the exclusive lock for the
/// duration of a mutation's cascade + ingest + flush; readers (startup
/// replay) take the shared side.
pub struct Store {
    db: redb::Database,
    lock: RwLock<()>,
}

impl Store {
    pub fn open(path: &FsPath) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(EngineError::storage)?;
            }
        }
        let db = redb::Database::create(path).map_err(EngineError::storage)?;
        info!(path = %path.display(), "opened embedded store");
        Ok(Self {
            db,
            lock: RwLock::new(()),
        })
    }

    pub fn write_guard(&self) -> parking_lot::RwLockWriteGuard<'_, ()> {
        self.lock.write()
    }

    pub fn read_guard(&self) -> parking_lot::RwLockReadGuard<'_, ()> {
        self.lock.read()
    }

    pub fn load_snapshot(&self) -> Result<Option<Snapshot>> {
        let txn = self.db.begin_read().map_err(EngineError::storage)?;
        let table = match txn.open_table(MODULE_STATE) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(EngineError::storage(e)),
        };
        let Some(guard) = table.get(MODULE_STATE_KEY).map_err(EngineError::storage)? else {
            return Ok(None);
        };
        decode_snapshot(guard.value()).map(Some)
    }

    pub fn load_record_hashes(&self) -> Result<HashStore> {
        let mut store = HashStore::default();
        let txn = self.db.begin_read().map_err(EngineError::storage)?;
        let table = match txn.open_table(RECORD_HASH) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(store),
            Err(e) => return Err(EngineError::storage(e)),
        };
        for item in table.iter().map_err(EngineError::storage)? {
            let (key, value) = item.map_err(EngineError::storage)?;
            let row: RecordHashRow =
                cbor4ii::serde::from_slice(value.value()).map_err(EngineError::storage)?;
            store.insert(SmolStr::new(key.value()), row);
        }
        Ok(store)
    }

    /// Flush one mutation: the new module-state blob plus the staged
    /// record-hash rows, in a single transaction. The per-operation
    /// deadline is checked before commit; an overrun aborts the
    /// transaction so the on-disk state never runs ahead of a failure
    /// report.
    pub fn commit(
        &self,
        snapshot: &[u8],
        batch: &WriteBatch,
        clock: &dyn Clock,
        deadline_ms: i64,
    ) -> Result<()> {
        let started = clock.now_millis();
        let txn = self.db.begin_write().map_err(EngineError::storage)?;
        {
            let mut state = txn.open_table(MODULE_STATE).map_err(EngineError::storage)?;
            state
                .insert(MODULE_STATE_KEY, snapshot)
                .map_err(EngineError::storage)?;

            let mut hashes = txn.open_table(RECORD_HASH).map_err(EngineError::storage)?;
            for (key, row) in batch.iter() {
                let bytes =
                    cbor4ii::serde::to_vec(Vec::new(), row).map_err(EngineError::storage)?;
                hashes
                    .insert(key.as_str(), bytes.as_slice())
                    .map_err(EngineError::storage)?;
            }
        }

        if deadline_ms > 0 && clock.now_millis().saturating_sub(started) > deadline_ms {
            txn.abort().map_err(EngineError::storage)?;
            return Err(EngineError::PersistenceTimeout);
        }

        txn.commit().map_err(EngineError::storage)?;
        debug!(rows = batch.touched().len(), "flushed snapshot");
        Ok(())
    }
}

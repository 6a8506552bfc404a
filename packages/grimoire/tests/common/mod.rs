//! Shared helpers for the integration tests: a forum-style schema, a
//! tempdir-backed session, and record builders that mirror how the sync
//! engine feeds the pipeline.
#![allow(dead_code)]

use grimoire::clock::{Clock, ManualClock};
use grimoire::{
    MutationReceipt, SchemaSet, Session, SessionConfig, Store, ViewUpdate,
};
use serde_json::json;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub fn fresh_id(table: &str) -> String {
    format!("{}:{:06}", table, NEXT_ID.fetch_add(1, Ordering::SeqCst))
}

/// Schema used across the suite: a forum (thread/comment/author) plus a
/// flat `items` table for ordering and filter scenarios.
pub fn test_schema() -> SchemaSet {
    SchemaSet::from_json(json!({
        "thread": {
            "intrinsic_fields": ["title", "content"],
            "parent_refs": ["author"],
            "dependencies": ["comment"]
        },
        "comment": {
            "intrinsic_fields": ["content"],
            "parent_refs": ["thread", "author"],
            "dependencies": []
        },
        "author": {
            "intrinsic_fields": ["name"],
            "parent_refs": [],
            "dependencies": ["thread", "comment"]
        },
        "items": {
            "intrinsic_fields": ["val", "name", "due", "flag"],
            "parent_refs": [],
            "dependencies": []
        }
    }))
    .expect("test schema is valid")
}

/// Clock that can jump by a fixed step on every read, for deadline tests.
pub struct TickClock {
    now: AtomicI64,
    step: AtomicI64,
}

impl TickClock {
    pub fn new(start: i64) -> Self {
        Self {
            now: AtomicI64::new(start),
            step: AtomicI64::new(0),
        }
    }

    pub fn set_step(&self, step: i64) {
        self.step.store(step, Ordering::SeqCst);
    }
}

impl Clock for TickClock {
    fn now_millis(&self) -> i64 {
        self.now.fetch_add(self.step.load(Ordering::SeqCst), Ordering::SeqCst)
    }
}

pub struct TestSession {
    pub session: Session,
    pub clock: Arc<ManualClock>,
    pub store: Arc<Store>,
    pub dir: TempDir,
}

pub fn setup() -> TestSession {
    setup_with_config(SessionConfig::default())
}

pub fn setup_with_config(config: SessionConfig) -> TestSession {
    let dir = TempDir::new().expect("tempdir");
    let store = Arc::new(Store::open(&dir.path().join("grimoire.redb")).expect("store opens"));
    let clock = Arc::new(ManualClock::new(1_000_000));
    let session = Session::open(test_schema(), store.clone(), clock.clone(), config)
        .expect("session opens");
    TestSession {
        session,
        clock,
        store,
        dir,
    }
}

/// Reopen a session against an existing store, as after a restart.
pub fn reopen(store: Arc<Store>, clock: Arc<ManualClock>) -> Session {
    Session::open(test_schema(), store, clock, SessionConfig::default()).expect("session reopens")
}

// --- record builders (ids are explicit so scenarios stay deterministic) ---

pub fn create_author(session: &mut Session, id: &str, name: &str) -> MutationReceipt {
    session
        .create("author", json!({ "id": id, "name": name }))
        .expect("create author")
}

pub fn create_thread(session: &mut Session, id: &str, title: &str, author: &str) -> MutationReceipt {
    session
        .create("thread", json!({ "id": id, "title": title, "author": author }))
        .expect("create thread")
}

pub fn create_comment(
    session: &mut Session,
    id: &str,
    content: &str,
    thread: &str,
    author: &str,
) -> MutationReceipt {
    session
        .create(
            "comment",
            json!({ "id": id, "content": content, "thread": thread, "author": author }),
        )
        .expect("create comment")
}

pub fn create_item(session: &mut Session, id: &str, val: serde_json::Value) -> MutationReceipt {
    session
        .create("items", json!({ "id": id, "val": val }))
        .expect("create item")
}

/// Drain every queued update from a subscription.
pub fn drain(rx: &crossbeam_channel::Receiver<ViewUpdate>) -> Vec<ViewUpdate> {
    rx.try_iter().collect()
}

/// Drain and return only the last update, if any.
pub fn last_update(rx: &crossbeam_channel::Receiver<ViewUpdate>) -> Option<ViewUpdate> {
    drain(rx).into_iter().last()
}

pub fn ids(list: &[smol_str::SmolStr]) -> Vec<&str> {
    list.iter().map(|s| s.as_str()).collect()
}

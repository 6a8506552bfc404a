//! The one outbound update shape.
//!
//! Result membership is communicated three ways at once: the id delta
//! (added/removed), the full ordered id list, and the merkle root over the
//! result's total hashes. Subscribers deduplicate on the root, which makes
//! at-least-once delivery idempotent.

use crate::engine::types::RowKey;
use crate::hash::Hash;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewUpdate {
    pub view_id: String,
    pub added_ids: Vec<RowKey>,
    pub removed_ids: Vec<RowKey>,
    pub current_ids: Vec<RowKey>,
    pub root_hash: Hash,
    pub leaf_hashes: Vec<Hash>,
}

impl ViewUpdate {
    /// Re-address an update to another subscriber of the same shared
    /// circuit.
    pub fn for_view(&self, view_id: &str) -> ViewUpdate {
        let mut update = self.clone();
        update.view_id = view_id.to_string();
        update
    }
}

/// Registration acknowledgement: the root identifies the initial result set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewRegistered {
    pub view_id: String,
    pub root_hash: Hash,
}

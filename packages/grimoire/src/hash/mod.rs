pub mod graph;
pub mod hasher;
pub mod service;

pub use graph::RecordGraph;
pub use hasher::{hash_intrinsic, hash_total, hash_value, Hash, TotalHashes, HASH_SIZE};
pub use service::{HashService, HashStore, Overlay, RecordHashRow, WriteBatch, XOR_KEY};

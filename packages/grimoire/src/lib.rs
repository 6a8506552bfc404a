// src/lib.rs

pub mod clock;
pub mod engine;
pub mod error;
pub mod hash;
pub mod parser;
pub mod registry;
pub mod sanitizer;
pub mod schema;
pub mod session;

#[cfg(all(feature = "parallel", not(target_arch = "wasm32")))]
pub use rayon::prelude::*;

// Re-export commonly used types for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::circuit::{Circuit, Database, Delta, Operation};
pub use engine::operators::{
    Direction, JoinCondition, Operand, Operator, OrderSpec, Predicate, Projection,
};
pub use engine::types::{FastMap, Path, RecordId, RowKey, Value, Weight, ZSet};
pub use engine::update::{ViewRegistered, ViewUpdate};
pub use engine::view::QueryPlan;
pub use error::EngineError;
pub use hash::{Hash, HashService, HashStore, RecordGraph, RecordHashRow, TotalHashes};
pub use parser::parse_plan;
pub use registry::{Registry, Store, MODULE_STATE_KEY};
pub use schema::{SchemaSet, TableSchema};
pub use session::{MutationReceipt, RegisterOptions, Session, SessionConfig};

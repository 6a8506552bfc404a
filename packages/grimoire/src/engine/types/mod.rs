mod path;
mod record_id;
mod value;
mod zset;

pub use path::Path;
pub use record_id::RecordId;
pub use value::Value;
pub use zset::{fold_weight, merge_delta, FastMap, FastSet, RowKey, Weight, ZSet};

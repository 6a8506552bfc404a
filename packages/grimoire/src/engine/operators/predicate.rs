use crate::engine::types::{Path, Value};
use serde::{Deserialize, Serialize};

/// Right-hand side of a comparison: either a literal from the plan text or
/// a `$param` reference resolved at evaluation time (bound params, or the
/// parent row for related subqueries).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Operand {
    Literal { value: Value },
    Param { path: Path },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Predicate {
    Prefix { field: Path, prefix: String },
    Eq { field: Path, value: Operand },
    Neq { field: Path, value: Operand },
    Gt { field: Path, value: Operand },
    Gte { field: Path, value: Operand },
    Lt { field: Path, value: Operand },
    Lte { field: Path, value: Operand },
    IsNull { field: Path },
    IsNotNull { field: Path },
    And { predicates: Vec<Predicate> },
    Or { predicates: Vec<Predicate> },
}

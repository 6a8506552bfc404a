use super::Operator;
use crate::engine::types::Path;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OrderSpec {
    pub field: Path,
    #[serde(default)]
    pub direction: Direction,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Projection {
    All,
    Field { name: Path },
    Subquery { alias: String, plan: Box<Operator> },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct JoinCondition {
    pub left_field: Path,
    pub right_field: Path,
}

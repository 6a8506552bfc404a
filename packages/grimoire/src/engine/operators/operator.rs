use super::predicate::Predicate;
use super::projection::{JoinCondition, OrderSpec, Projection};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Operator {
    Scan {
        table: String,
    },
    Filter {
        input: Box<Operator>,
        predicate: Predicate,
    },
    Join {
        left: Box<Operator>,
        right: Box<Operator>,
        on: JoinCondition,
    },
    Project {
        input: Box<Operator>,
        projections: Vec<Projection>,
    },
    Limit {
        input: Box<Operator>,
        limit: usize,
        #[serde(default)]
        order_by: Option<Vec<OrderSpec>>,
    },
}

impl Operator {
    /// All table names this operator tree reads, subquery plans included.
    /// Drives the circuit's table -> view dependency graph.
    pub fn referenced_tables(&self) -> Vec<String> {
        let mut tables = Vec::new();
        self.collect_tables(&mut tables);
        tables.sort_unstable();
        tables.dedup();
        tables
    }

    fn collect_tables(&self, out: &mut Vec<String>) {
        match self {
            Operator::Scan { table } => out.push(table.clone()),
            Operator::Filter { input, .. } | Operator::Limit { input, .. } => {
                input.collect_tables(out)
            }
            Operator::Project { input, projections } => {
                input.collect_tables(out);
                for projection in projections {
                    if let Projection::Subquery { plan, .. } = projection {
                        plan.collect_tables(out);
                    }
                }
            }
            Operator::Join { left, right, .. } => {
                left.collect_tables(out);
                right.collect_tables(out);
            }
        }
    }

    /// Subquery plans anywhere in this tree, paired with their aliases.
    pub fn subqueries(&self) -> Vec<(&str, &Operator)> {
        let mut out = Vec::new();
        self.collect_subqueries(&mut out);
        out
    }

    fn collect_subqueries<'a>(&'a self, out: &mut Vec<(&'a str, &'a Operator)>) {
        match self {
            Operator::Scan { .. } => {}
            Operator::Filter { input, .. } | Operator::Limit { input, .. } => {
                input.collect_subqueries(out)
            }
            Operator::Project { input, projections } => {
                input.collect_subqueries(out);
                for projection in projections {
                    if let Projection::Subquery { alias, plan } = projection {
                        out.push((alias.as_str(), plan));
                    }
                }
            }
            Operator::Join { left, right, .. } => {
                left.collect_subqueries(out);
                right.collect_subqueries(out);
            }
        }
    }

    /// Canonical serialized form, the dedup identity of a plan. serde field
    /// order is fixed per type, so equal plans stringify equally.
    pub fn canonical_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

use crate::engine::circuit::Database;
use crate::engine::operators::{Direction, Operand, OrderSpec, Predicate};
use crate::engine::types::{Path, Value};
use crate::error::{EngineError, Result};
use rustc_hash::FxHasher;
use smol_str::SmolStr;
use std::cmp::Ordering;
use std::hash::Hasher;

/// Evaluation context threaded through predicate checks: the view's bound
/// params plus, inside a related subquery, the parent row.
#[derive(Clone, Copy, Default)]
pub struct EvalContext<'a> {
    pub params: Option<&'a Value>,
    /// (parent row key, parent row value)
    pub parent: Option<(&'a str, &'a Value)>,
}

/// Walk a dot path into a nested value.
#[inline]
pub fn resolve_path<'a>(root: Option<&'a Value>, path: &Path) -> Option<&'a Value> {
    let mut current = root;
    for part in path.segments() {
        match current {
            Some(Value::Map(map)) => current = map.get(part),
            _ => return None,
        }
    }
    current
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Int(_) | Value::Float(_) => 2,
        Value::Timestamp(_) => 3,
        Value::Str(_) | Value::Record(_) => 4,
        Value::List(_) => 5,
        Value::Map(_) => 6,
    }
}

/// Total order over values. Numerics unify (Int promotes to Float),
/// record ids compare as their string form, everything else orders by
/// type rank first. Missing sorts before present.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(va), Some(vb)) => match (va, vb) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(ba), Value::Bool(bb)) => ba.cmp(bb),
            (Value::Int(na), Value::Int(nb)) => na.cmp(nb),
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                let fa = va.as_float().unwrap_or(0.0);
                let fb = vb.as_float().unwrap_or(0.0);
                fa.total_cmp(&fb)
            }
            (Value::Timestamp(ta), Value::Timestamp(tb)) => ta.cmp(tb),
            (Value::Str(_) | Value::Record(_), Value::Str(_) | Value::Record(_)) => {
                va.as_str().unwrap_or("").cmp(vb.as_str().unwrap_or(""))
            }
            (Value::List(la), Value::List(lb)) => {
                let len_cmp = la.len().cmp(&lb.len());
                if len_cmp != Ordering::Equal {
                    return len_cmp;
                }
                for (ia, ib) in la.iter().zip(lb.iter()) {
                    let cmp = compare_values(Some(ia), Some(ib));
                    if cmp != Ordering::Equal {
                        return cmp;
                    }
                }
                Ordering::Equal
            }
            (Value::Map(ma), Value::Map(mb)) => ma.len().cmp(&mb.len()),
            _ => type_rank(va).cmp(&type_rank(vb)),
        },
    }
}

/// Whether a comparison between these two values is meaningful. Null is
/// compatible with everything (it just never matches); disjoint families
/// like string-vs-number are a type mismatch and drop the delta.
pub fn values_compatible(a: &Value, b: &Value) -> bool {
    if a.is_null() || b.is_null() {
        return true;
    }
    type_rank(a) == type_rank(b)
}

/// Key hash for the symmetric join indexes.
#[inline]
pub fn hash_join_key(v: &Value) -> u64 {
    let mut hasher = FxHasher::default();
    feed_join_key(v, &mut hasher);
    hasher.finish()
}

fn feed_join_key(v: &Value, hasher: &mut FxHasher) {
    match v {
        Value::Null => hasher.write_u8(0),
        Value::Bool(b) => {
            hasher.write_u8(1);
            hasher.write_u8(*b as u8);
        }
        Value::Int(n) => {
            hasher.write_u8(2);
            hasher.write_i64(*n);
        }
        Value::Float(n) => {
            hasher.write_u8(3);
            hasher.write_u64(n.to_bits());
        }
        Value::Str(s) => {
            hasher.write_u8(4);
            hasher.write(s.as_bytes());
        }
        Value::Timestamp(ms) => {
            hasher.write_u8(5);
            hasher.write_i64(*ms);
        }
        // Record ids hash like their string form so that a Record value
        // joins against a plain string reference field.
        Value::Record(id) => {
            hasher.write_u8(4);
            hasher.write(id.as_str().as_bytes());
        }
        Value::List(list) => {
            hasher.write_u8(6);
            for item in list {
                feed_join_key(item, hasher);
            }
        }
        Value::Map(map) => {
            hasher.write_u8(7);
            let mut keys: Vec<&SmolStr> = map.keys().collect();
            keys.sort_unstable();
            for key in keys {
                hasher.write(key.as_bytes());
                feed_join_key(&map[key], hasher);
            }
        }
    }
}

/// Resolve an operand to a concrete value. `$parent.*` params resolve
/// against the subquery's parent row, everything else against the view's
/// bound params. An unresolvable param yields None (predicate misses).
pub fn resolve_operand(operand: &Operand, ctx: &EvalContext<'_>) -> Option<Value> {
    match operand {
        Operand::Literal { value } => Some(value.clone()),
        Operand::Param { path } => {
            if let Some(rest) = path.strip_prefix("parent") {
                let (parent_key, parent_value) = ctx.parent?;
                if rest.is_id() {
                    return Some(Value::Str(SmolStr::new(parent_key)));
                }
                resolve_path(Some(parent_value), &rest).cloned()
            } else {
                resolve_path(ctx.params, path).cloned()
            }
        }
    }
}

fn field_value<'a>(key: &str, row: Option<&'a Value>, field: &Path) -> Option<Value> {
    if field.is_id() {
        return Some(Value::Str(SmolStr::new(key)));
    }
    resolve_path(row, field).cloned()
}

/// Current value of the row behind a `table:id` key.
pub fn row_value<'a>(db: &'a Database, key: &str) -> Option<&'a Value> {
    let (table, _) = key.split_once(':')?;
    db.tables.get(table)?.rows.get(key)
}

/// Check a predicate against the row behind `key`.
///
/// Comparing incompatible types is an error, not a miss: the caller drops
/// the delta and logs, leaving operator state untouched.
pub fn eval_predicate(
    predicate: &Predicate,
    key: &str,
    db: &Database,
    ctx: &EvalContext<'_>,
) -> Result<bool> {
    match predicate {
        Predicate::And { predicates } => {
            for p in predicates {
                if !eval_predicate(p, key, db, ctx)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Predicate::Or { predicates } => {
            for p in predicates {
                if eval_predicate(p, key, db, ctx)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Predicate::Prefix { field, prefix } => {
            if field.is_id() {
                return Ok(key.starts_with(prefix.as_str()));
            }
            let row = row_value(db, key);
            Ok(field_value(key, row, field)
                .and_then(|v| v.as_str().map(|s| s.starts_with(prefix.as_str())))
                .unwrap_or(false))
        }
        Predicate::IsNull { field } => {
            let row = row_value(db, key);
            Ok(match field_value(key, row, field) {
                None => true,
                Some(v) => v.is_null(),
            })
        }
        Predicate::IsNotNull { field } => {
            let row = row_value(db, key);
            Ok(match field_value(key, row, field) {
                None => false,
                Some(v) => !v.is_null(),
            })
        }
        Predicate::Eq { field, value }
        | Predicate::Neq { field, value }
        | Predicate::Gt { field, value }
        | Predicate::Gte { field, value }
        | Predicate::Lt { field, value }
        | Predicate::Lte { field, value } => {
            let Some(target) = resolve_operand(value, ctx) else {
                return Ok(false);
            };
            let row = row_value(db, key);
            let Some(actual) = field_value(key, row, field) else {
                return Ok(false);
            };
            if actual.is_null() || target.is_null() {
                return Ok(false);
            }
            if !values_compatible(&actual, &target) {
                return Err(EngineError::TypeMismatch {
                    context: format!(
                        "cannot compare {} of {} against predicate literal",
                        field.as_str(),
                        key
                    ),
                });
            }
            let ord = compare_values(Some(&actual), Some(&target));
            Ok(match predicate {
                Predicate::Eq { .. } => ord == Ordering::Equal,
                Predicate::Neq { .. } => ord != Ordering::Equal,
                Predicate::Gt { .. } => ord == Ordering::Greater,
                Predicate::Gte { .. } => ord != Ordering::Less,
                Predicate::Lt { .. } => ord == Ordering::Less,
                Predicate::Lte { .. } => ord != Ordering::Greater,
                _ => false,
            })
        }
    }
}

/// Ordering of two rows under an ORDER BY spec. NULL (and missing) sorts
/// last under ASC and first under DESC; ties always break on record id
/// ascending.
pub fn order_compare(
    db: &Database,
    orders: Option<&[OrderSpec]>,
    a_key: &str,
    b_key: &str,
) -> Ordering {
    if let Some(orders) = orders {
        let row_a = row_value(db, a_key);
        let row_b = row_value(db, b_key);
        for spec in orders {
            let va = field_value(a_key, row_a, &spec.field);
            let vb = field_value(b_key, row_b, &spec.field);
            let a_null = va.as_ref().map(|v| v.is_null()).unwrap_or(true);
            let b_null = vb.as_ref().map(|v| v.is_null()).unwrap_or(true);

            let cmp = match (a_null, b_null) {
                (true, true) => Ordering::Equal,
                (true, false) => match spec.direction {
                    Direction::Asc => Ordering::Greater,
                    Direction::Desc => Ordering::Less,
                },
                (false, true) => match spec.direction {
                    Direction::Asc => Ordering::Less,
                    Direction::Desc => Ordering::Greater,
                },
                (false, false) => {
                    let ord = compare_values(va.as_ref(), vb.as_ref());
                    match spec.direction {
                        Direction::Asc => ord,
                        Direction::Desc => ord.reverse(),
                    }
                }
            };
            if cmp != Ordering::Equal {
                return cmp;
            }
        }
    }
    a_key.cmp(b_key)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_compare_numeric_unification() {
        assert_eq!(
            compare_values(Some(&Value::Int(2)), Some(&Value::Float(2.0))),
            Ordering::Equal
        );
        assert_eq!(
            compare_values(Some(&Value::Int(3)), Some(&Value::Float(2.5))),
            Ordering::Greater
        );
    }

    #[test]
    fn test_compare_record_vs_str() {
        use crate::engine::types::RecordId;
        let rec = Value::Record(RecordId::new("thread", "1"));
        let s = Value::Str(SmolStr::new("thread:1"));
        assert_eq!(compare_values(Some(&rec), Some(&s)), Ordering::Equal);
    }

    #[test]
    fn test_compatibility() {
        assert!(values_compatible(&Value::Int(1), &Value::Float(1.5)));
        assert!(values_compatible(&Value::Null, &Value::Int(1)));
        assert!(!values_compatible(
            &Value::Str(SmolStr::new("x")),
            &Value::Int(1)
        ));
    }

    #[test]
    fn test_join_key_record_matches_string() {
        use crate::engine::types::RecordId;
        let rec = Value::Record(RecordId::new("author", "7"));
        let s = Value::Str(SmolStr::new("author:7"));
        assert_eq!(hash_join_key(&rec), hash_join_key(&s));
    }
}

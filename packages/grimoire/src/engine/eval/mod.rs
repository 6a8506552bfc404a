mod filter;

pub use filter::{
    compare_values, eval_predicate, hash_join_key, order_compare, resolve_operand, resolve_path,
    row_value, values_compatible, EvalContext,
};

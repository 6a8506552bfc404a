mod operator;
mod predicate;
mod projection;

pub use operator::Operator;
pub use predicate::{Operand, Predicate};
pub use projection::{Direction, JoinCondition, OrderSpec, Projection};

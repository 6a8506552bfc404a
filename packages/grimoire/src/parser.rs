//! Parser for the restricted SELECT dialect.
//!
//! `SELECT [*|fields|(subselect) AS alias] FROM table [WHERE expr]
//! [ORDER BY field [ASC|DESC], ...] [LIMIT n]`
//!
//! WHERE supports comparisons, AND/OR nesting (OR of AND groups), record-id
//! prefix matches (`'thread:*'`), IS (NOT) NULL, `$param` references and
//! `field = other_table.field` join candidates. Anything else is rejected
//! with a reason rather than silently dropped.

use crate::engine::operators::{
    Direction, JoinCondition, Operand, Operator, OrderSpec, Predicate, Projection,
};
use crate::engine::types::{Path, Value};
use crate::error::{EngineError, Result};
use nom::{
    branch::alt,
    bytes::complete::{is_not, tag, tag_no_case, take_while1},
    character::complete::{char, digit1, multispace0, multispace1},
    combinator::{map, opt, recognize, value},
    multi::{separated_list1, many0},
    sequence::{delimited, pair, preceded, tuple},
    IResult,
};
use smol_str::SmolStr;

// --- intermediate AST ---

#[derive(Debug, Clone)]
enum Item {
    Star,
    Field(Path),
    Subquery { alias: String, stmt: Box<SelectStmt> },
}

#[derive(Debug, Clone)]
enum CompareOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Debug, Clone)]
enum Cond {
    Compare {
        field: Path,
        op: CompareOp,
        operand: Operand,
    },
    Prefix {
        field: Path,
        prefix: String,
    },
    IsNull {
        field: Path,
    },
    IsNotNull {
        field: Path,
    },
    /// `field = table.field` compiles to a Join operator, not a predicate.
    JoinCandidate {
        left: Path,
        right: String,
    },
}

#[derive(Debug, Clone)]
struct SelectStmt {
    items: Vec<Item>,
    table: String,
    /// OR groups of AND lists.
    conditions: Option<Vec<Vec<Cond>>>,
    order_by: Option<Vec<OrderSpec>>,
    limit: Option<usize>,
}

// --- nom helpers ---

fn ws<'a, F, O, E: nom::error::ParseError<&'a str>>(
    inner: F,
) -> impl FnMut(&'a str) -> IResult<&'a str, O, E>
where
    F: FnMut(&'a str) -> IResult<&'a str, O, E>,
{
    delimited(multispace0, inner, multispace0)
}

// Identifiers: field, address.city, other_table.field
fn parse_identifier(input: &str) -> IResult<&str, String> {
    map(
        take_while1(|c: char| c.is_alphanumeric() || c == '_' || c == '.'),
        |s: &str| s.to_string(),
    )(input)
}

fn parse_string_literal(input: &str) -> IResult<&str, String> {
    let single = delimited(char('\''), recognize(many0(is_not("'"))), char('\''));
    let double = delimited(char('"'), recognize(many0(is_not("\""))), char('"'));
    map(alt((single, double)), |s: &str| s.to_string())(input)
}

fn parse_number(input: &str) -> IResult<&str, Value> {
    map(
        recognize(tuple((
            opt(char('-')),
            digit1,
            opt(pair(char('.'), digit1)),
        ))),
        |s: &str| {
            if s.contains('.') {
                Value::Float(s.parse::<f64>().unwrap_or(0.0))
            } else {
                s.parse::<i64>()
                    .map(Value::Int)
                    .unwrap_or_else(|_| Value::Float(s.parse::<f64>().unwrap_or(0.0)))
            }
        },
    )(input)
}

#[derive(Debug, Clone)]
enum Rhs {
    Literal(Value),
    Prefix(String),
    Param(Path),
    Identifier(String),
}

fn parse_rhs(input: &str) -> IResult<&str, Rhs> {
    alt((
        map(parse_string_literal, |s| {
            if let Some(stripped) = s.strip_suffix('*') {
                Rhs::Prefix(stripped.to_string())
            } else {
                Rhs::Literal(Value::Str(SmolStr::new(s)))
            }
        }),
        map(preceded(char('$'), parse_identifier), |s| {
            Rhs::Param(Path::new(&s))
        }),
        value(Rhs::Literal(Value::Bool(true)), tag_no_case("true")),
        value(Rhs::Literal(Value::Bool(false)), tag_no_case("false")),
        map(parse_number, Rhs::Literal),
        // Anything else is another field reference: a join candidate.
        map(parse_identifier, Rhs::Identifier),
    ))(input)
}

fn parse_compare_op(input: &str) -> IResult<&str, CompareOp> {
    alt((
        value(CompareOp::Neq, tag("!=")),
        value(CompareOp::Gte, tag(">=")),
        value(CompareOp::Lte, tag("<=")),
        value(CompareOp::Eq, tag("=")),
        value(CompareOp::Gt, tag(">")),
        value(CompareOp::Lt, tag("<")),
    ))(input)
}

fn parse_condition(input: &str) -> IResult<&str, Cond> {
    let is_not_null = map(
        tuple((
            ws(parse_identifier),
            tag_no_case("IS"),
            multispace1,
            tag_no_case("NOT"),
            multispace1,
            tag_no_case("NULL"),
        )),
        |(field, ..)| Cond::IsNotNull {
            field: Path::new(&field),
        },
    );
    let is_null = map(
        tuple((
            ws(parse_identifier),
            tag_no_case("IS"),
            multispace1,
            tag_no_case("NULL"),
        )),
        |(field, ..)| Cond::IsNull {
            field: Path::new(&field),
        },
    );
    let compare = map(
        tuple((ws(parse_identifier), ws(parse_compare_op), ws(parse_rhs))),
        |(field, op, rhs)| {
            let field = Path::new(&field);
            match rhs {
                Rhs::Literal(value) => Cond::Compare {
                    field,
                    op,
                    operand: Operand::Literal { value },
                },
                Rhs::Param(path) => Cond::Compare {
                    field,
                    op,
                    operand: Operand::Param { path },
                },
                Rhs::Prefix(prefix) => Cond::Prefix { field, prefix },
                Rhs::Identifier(right) => Cond::JoinCandidate { left: field, right },
            }
        },
    );
    alt((is_not_null, is_null, compare))(input)
}

fn parse_and_clause(input: &str) -> IResult<&str, Vec<Cond>> {
    separated_list1(ws(tag_no_case("AND")), parse_condition)(input)
}

fn parse_where(input: &str) -> IResult<&str, Vec<Vec<Cond>>> {
    preceded(
        pair(tag_no_case("WHERE"), multispace1),
        separated_list1(ws(tag_no_case("OR")), parse_and_clause),
    )(input)
}

fn parse_order_clause(input: &str) -> IResult<&str, Vec<OrderSpec>> {
    let single = map(
        pair(
            ws(parse_identifier),
            opt(alt((
                value(Direction::Desc, tag_no_case("DESC")),
                value(Direction::Asc, tag_no_case("ASC")),
            ))),
        ),
        |(field, direction)| OrderSpec {
            field: Path::new(&field),
            direction: direction.unwrap_or_default(),
        },
    );
    preceded(
        pair(tag_no_case("ORDER"), ws(tag_no_case("BY"))),
        separated_list1(ws(char(',')), single),
    )(input)
}

fn parse_limit_clause(input: &str) -> IResult<&str, usize> {
    preceded(
        pair(tag_no_case("LIMIT"), multispace1),
        map(digit1, |s: &str| s.parse::<usize>().unwrap_or(usize::MAX)),
    )(input)
}

fn parse_item(input: &str) -> IResult<&str, Item> {
    let subquery = map(
        tuple((
            delimited(ws(char('(')), parse_select, ws(char(')'))),
            tag_no_case("AS"),
            ws(parse_identifier),
        )),
        |(stmt, _, alias)| Item::Subquery {
            alias,
            stmt: Box::new(stmt),
        },
    );
    alt((
        subquery,
        value(Item::Star, char('*')),
        map(parse_identifier, |f| Item::Field(Path::new(&f))),
    ))(input)
}

fn parse_select(input: &str) -> IResult<&str, SelectStmt> {
    let (input, _) = ws(tag_no_case("SELECT"))(input)?;
    let (input, items) = separated_list1(ws(char(',')), parse_item)(input)?;
    let (input, _) = ws(tag_no_case("FROM"))(input)?;
    let (input, table) = parse_identifier(input)?;
    let (input, conditions) = opt(ws(parse_where))(input)?;
    let (input, order_by) = opt(ws(parse_order_clause))(input)?;
    let (input, limit) = opt(ws(parse_limit_clause))(input)?;

    Ok((
        input,
        SelectStmt {
            items,
            table,
            conditions,
            order_by,
            limit,
        },
    ))
}

// --- operator tree construction ---

fn compare_to_predicate(field: Path, op: &CompareOp, operand: Operand) -> Predicate {
    match op {
        CompareOp::Eq => Predicate::Eq {
            field,
            value: operand,
        },
        CompareOp::Neq => Predicate::Neq {
            field,
            value: operand,
        },
        CompareOp::Gt => Predicate::Gt {
            field,
            value: operand,
        },
        CompareOp::Gte => Predicate::Gte {
            field,
            value: operand,
        },
        CompareOp::Lt => Predicate::Lt {
            field,
            value: operand,
        },
        CompareOp::Lte => Predicate::Lte {
            field,
            value: operand,
        },
    }
}

fn cond_to_predicate(cond: &Cond) -> Result<Predicate> {
    match cond {
        Cond::Compare { field, op, operand } => {
            Ok(compare_to_predicate(field.clone(), op, operand.clone()))
        }
        Cond::Prefix { field, prefix } => Ok(Predicate::Prefix {
            field: field.clone(),
            prefix: prefix.clone(),
        }),
        Cond::IsNull { field } => Ok(Predicate::IsNull {
            field: field.clone(),
        }),
        Cond::IsNotNull { field } => Ok(Predicate::IsNotNull {
            field: field.clone(),
        }),
        Cond::JoinCandidate { .. } => Err(EngineError::Parse {
            offset: 0,
            message: "joins are not supported inside OR groups".to_string(),
        }),
    }
}

fn wrap_join(input_op: Operator, left: &Path, right: &str) -> Operator {
    // `table.field` on the right names the joined table; a bare name joins
    // against that table's id.
    let (r_table, r_field) = match right.split_once('.') {
        Some((t, f)) => (t, f),
        None => (right, "id"),
    };
    Operator::Join {
        left: Box::new(input_op),
        right: Box::new(Operator::Scan {
            table: r_table.to_string(),
        }),
        on: JoinCondition {
            left_field: left.clone(),
            right_field: Path::new(r_field),
        },
    }
}

fn build_operator(stmt: &SelectStmt) -> Result<Operator> {
    let mut current = Operator::Scan {
        table: stmt.table.clone(),
    };

    if let Some(or_groups) = &stmt.conditions {
        if or_groups.len() == 1 {
            // A single AND group wraps sequentially: joins become Join
            // nodes, everything else folds into one Filter.
            let mut predicates = Vec::new();
            for cond in &or_groups[0] {
                match cond {
                    Cond::JoinCandidate { left, right } => {
                        current = wrap_join(current, left, right);
                    }
                    other => predicates.push(cond_to_predicate(other)?),
                }
            }
            let predicate = match predicates.len() {
                0 => None,
                1 => predicates.pop(),
                _ => Some(Predicate::And { predicates }),
            };
            if let Some(predicate) = predicate {
                current = Operator::Filter {
                    input: Box::new(current),
                    predicate,
                };
            }
        } else {
            let mut or_predicates = Vec::new();
            for group in or_groups {
                let mut predicates = Vec::new();
                for cond in group {
                    predicates.push(cond_to_predicate(cond)?);
                }
                match predicates.len() {
                    1 => or_predicates.extend(predicates),
                    _ => or_predicates.push(Predicate::And { predicates }),
                }
            }
            current = Operator::Filter {
                input: Box::new(current),
                predicate: Predicate::Or {
                    predicates: or_predicates,
                },
            };
        }
    }

    // Projections, unless the select list is exactly `*`.
    let plain_star = stmt.items.len() == 1 && matches!(stmt.items[0], Item::Star);
    if !plain_star {
        let mut projections = Vec::new();
        for item in &stmt.items {
            match item {
                Item::Star => projections.push(Projection::All),
                Item::Field(path) => projections.push(Projection::Field { name: path.clone() }),
                Item::Subquery { alias, stmt } => projections.push(Projection::Subquery {
                    alias: alias.clone(),
                    plan: Box::new(build_operator(stmt)?),
                }),
            }
        }
        current = Operator::Project {
            input: Box::new(current),
            projections,
        };
    }

    if stmt.limit.is_some() || stmt.order_by.is_some() {
        current = Operator::Limit {
            input: Box::new(current),
            limit: stmt.limit.unwrap_or(usize::MAX),
            order_by: stmt.order_by.clone(),
        };
    }

    Ok(current)
}

/// Parse plan text into an operator tree. Parse failures carry the byte
/// offset of the unconsumed input.
pub fn parse_plan(text: &str) -> Result<Operator> {
    let clean = text.trim().trim_end_matches(';');
    match parse_select(clean) {
        Ok((rest, stmt)) => {
            if !rest.trim().is_empty() {
                return Err(EngineError::Parse {
                    offset: text.len() - rest.len(),
                    message: format!("unexpected trailing input: '{}'", rest.trim()),
                });
            }
            build_operator(&stmt)
        }
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(EngineError::Parse {
            offset: text.len() - e.input.len(),
            message: "malformed select statement".to_string(),
        }),
        Err(nom::Err::Incomplete(_)) => Err(EngineError::Parse {
            offset: text.len(),
            message: "truncated select statement".to_string(),
        }),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_select_star() {
        let op = parse_plan("SELECT * FROM items").unwrap();
        assert_eq!(
            op,
            Operator::Scan {
                table: "items".to_string()
            }
        );
    }

    #[test]
    fn test_where_equality() {
        let op = parse_plan("SELECT * FROM items WHERE val = 10").unwrap();
        let Operator::Filter { predicate, .. } = op else {
            panic!("expected filter");
        };
        assert_eq!(
            predicate,
            Predicate::Eq {
                field: Path::new("val"),
                value: Operand::Literal {
                    value: Value::Int(10)
                }
            }
        );
    }

    #[test]
    fn test_or_of_and_groups() {
        let op =
            parse_plan("SELECT * FROM items WHERE val = 10 AND flag = true OR val = 100").unwrap();
        let Operator::Filter { predicate, .. } = op else {
            panic!("expected filter");
        };
        let Predicate::Or { predicates } = predicate else {
            panic!("expected or");
        };
        assert_eq!(predicates.len(), 2);
        assert!(matches!(predicates[0], Predicate::And { .. }));
    }

    #[test]
    fn test_prefix_literal() {
        let op = parse_plan("SELECT * FROM items WHERE id = 'items:2*'").unwrap();
        let Operator::Filter { predicate, .. } = op else {
            panic!("expected filter");
        };
        assert_eq!(
            predicate,
            Predicate::Prefix {
                field: Path::new("id"),
                prefix: "items:2".to_string()
            }
        );
    }

    #[test]
    fn test_is_null_and_is_not_null() {
        let op = parse_plan("SELECT * FROM items WHERE due IS NULL").unwrap();
        let Operator::Filter { predicate, .. } = op else {
            panic!("expected filter");
        };
        assert_eq!(
            predicate,
            Predicate::IsNull {
                field: Path::new("due")
            }
        );

        let op = parse_plan("SELECT * FROM items WHERE due IS NOT NULL").unwrap();
        let Operator::Filter { predicate, .. } = op else {
            panic!("expected filter");
        };
        assert_eq!(
            predicate,
            Predicate::IsNotNull {
                field: Path::new("due")
            }
        );
    }

    #[test]
    fn test_order_by_and_limit() {
        let op = parse_plan("SELECT * FROM items ORDER BY val DESC, name LIMIT 2").unwrap();
        let Operator::Limit {
            limit, order_by, ..
        } = op
        else {
            panic!("expected limit");
        };
        assert_eq!(limit, 2);
        let orders = order_by.unwrap();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].direction, Direction::Desc);
        assert_eq!(orders[1].direction, Direction::Asc);
    }

    #[test]
    fn test_join_candidate() {
        let op = parse_plan("SELECT * FROM thread WHERE author = author.id").unwrap();
        let Operator::Join { right, on, .. } = op else {
            panic!("expected join");
        };
        assert_eq!(
            *right,
            Operator::Scan {
                table: "author".to_string()
            }
        );
        assert_eq!(on.left_field, Path::new("author"));
        assert_eq!(on.right_field, Path::new("id"));
    }

    #[test]
    fn test_related_subselect() {
        let op = parse_plan(
            "SELECT *, (SELECT * FROM comment WHERE thread = $parent.id LIMIT 2) AS comments FROM thread",
        )
        .unwrap();
        let Operator::Project { projections, .. } = op else {
            panic!("expected project");
        };
        assert_eq!(projections.len(), 2);
        let Projection::Subquery { alias, plan } = &projections[1] else {
            panic!("expected subquery projection");
        };
        assert_eq!(alias, "comments");
        let Operator::Limit { limit, input, .. } = plan.as_ref() else {
            panic!("expected limit in subquery");
        };
        assert_eq!(*limit, 2);
        let Operator::Filter { predicate, .. } = input.as_ref() else {
            panic!("expected filter in subquery");
        };
        assert_eq!(
            *predicate,
            Predicate::Eq {
                field: Path::new("thread"),
                value: Operand::Param {
                    path: Path::new("parent.id")
                }
            }
        );
    }

    #[test]
    fn test_parse_error_carries_offset() {
        let err = parse_plan("SELECT * FROM items WHERE").unwrap_err();
        let EngineError::Parse { offset, .. } = err else {
            panic!("expected parse error");
        };
        assert!(offset > 0);
    }

    #[test]
    fn test_join_inside_or_rejected() {
        let err =
            parse_plan("SELECT * FROM thread WHERE author = author.id OR title = 'x'").unwrap_err();
        assert_eq!(err.kind(), "parse");
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        let err = parse_plan("SELECT * FROM items GROUP BY val").unwrap_err();
        assert_eq!(err.kind(), "parse");
    }

    #[test]
    fn test_param_reference() {
        let op = parse_plan("SELECT * FROM items WHERE owner = $userId").unwrap();
        let Operator::Filter { predicate, .. } = op else {
            panic!("expected filter");
        };
        assert_eq!(
            predicate,
            Predicate::Eq {
                field: Path::new("owner"),
                value: Operand::Param {
                    path: Path::new("userId")
                }
            }
        );
    }
}

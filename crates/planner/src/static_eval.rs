//! Three-valued evaluation of expressions against known column values.
//!
//! Used for partition pruning: a partition's key values are known from the
//! manifest, so clauses over partition keys can be decided without reading
//! data. Anything that cannot be decided is `Unknown`, and pruning keeps the
//! partition.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::expr::{BinaryOp, Expr, LiteralValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Truth {
    True,
    False,
    Unknown,
}

impl Truth {
    fn and(self, other: Truth) -> Truth {
        match (self, other) {
            (Truth::False, _) | (_, Truth::False) => Truth::False,
            (Truth::True, Truth::True) => Truth::True,
            _ => Truth::Unknown,
        }
    }

    fn or(self, other: Truth) -> Truth {
        match (self, other) {
            (Truth::True, _) | (_, Truth::True) => Truth::True,
            (Truth::False, Truth::False) => Truth::False,
            _ => Truth::Unknown,
        }
    }

    fn not(self) -> Truth {
        match self {
            Truth::True => Truth::False,
            Truth::False => Truth::True,
            Truth::Unknown => Truth::Unknown,
        }
    }

    fn from_bool(b: bool) -> Truth {
        if b {
            Truth::True
        } else {
            Truth::False
        }
    }
}

/// True when every operator in `e` can be decided from literal values alone.
///
/// Arithmetic is deliberately excluded: such clauses are evaluated later,
/// row by row, by the columnar reader.
pub fn is_statically_evaluable(e: &Expr) -> bool {
    match e {
        Expr::Column(_) | Expr::Literal(_) => true,
        Expr::BinaryOp { left, op, right } => {
            op.is_comparison() && is_operand(left) && is_operand(right)
        }
        Expr::And(a, b) | Expr::Or(a, b) => {
            is_statically_evaluable(a) && is_statically_evaluable(b)
        }
        Expr::Not(x) => is_statically_evaluable(x),
        Expr::IsNull(x) | Expr::IsNotNull(x) => is_operand(x),
        Expr::InList { expr, .. } => is_operand(expr),
    }
}

fn is_operand(e: &Expr) -> bool {
    matches!(e, Expr::Column(_) | Expr::Literal(_))
}

/// Evaluates `e` with columns bound from `values`; unbound columns are Unknown.
pub fn evaluate(e: &Expr, values: &BTreeMap<String, LiteralValue>) -> Truth {
    match e {
        Expr::Literal(LiteralValue::Boolean(b)) => Truth::from_bool(*b),
        Expr::Literal(_) | Expr::Column(_) => match operand(e, values) {
            Some(LiteralValue::Boolean(b)) => Truth::from_bool(b),
            _ => Truth::Unknown,
        },
        Expr::BinaryOp { left, op, right } if op.is_comparison() => {
            match (operand(left, values), operand(right, values)) {
                (Some(l), Some(r)) => compare(&l, *op, &r),
                _ => Truth::Unknown,
            }
        }
        Expr::BinaryOp { .. } => Truth::Unknown,
        Expr::And(a, b) => evaluate(a, values).and(evaluate(b, values)),
        Expr::Or(a, b) => evaluate(a, values).or(evaluate(b, values)),
        Expr::Not(x) => evaluate(x, values).not(),
        Expr::IsNull(x) => match operand(x, values) {
            Some(v) => Truth::from_bool(v.is_null()),
            None => Truth::Unknown,
        },
        Expr::IsNotNull(x) => match operand(x, values) {
            Some(v) => Truth::from_bool(!v.is_null()),
            None => Truth::Unknown,
        },
        Expr::InList {
            expr,
            list,
            negated,
        } => {
            let Some(v) = operand(expr, values) else {
                return Truth::Unknown;
            };
            let hit = list
                .iter()
                .map(|item| compare(&v, BinaryOp::Eq, item))
                .fold(Truth::False, Truth::or);
            if *negated {
                hit.not()
            } else {
                hit
            }
        }
    }
}

fn operand(e: &Expr, values: &BTreeMap<String, LiteralValue>) -> Option<LiteralValue> {
    match e {
        Expr::Column(c) => values.get(c).cloned(),
        Expr::Literal(v) => Some(v.clone()),
        _ => None,
    }
}

fn compare(l: &LiteralValue, op: BinaryOp, r: &LiteralValue) -> Truth {
    let Some(ord) = l.compare(r) else {
        return Truth::Unknown;
    };
    let b = match op {
        BinaryOp::Eq => ord == Ordering::Equal,
        BinaryOp::NotEq => ord != Ordering::Equal,
        BinaryOp::Lt => ord == Ordering::Less,
        BinaryOp::LtEq => ord != Ordering::Greater,
        BinaryOp::Gt => ord == Ordering::Greater,
        BinaryOp::GtEq => ord != Ordering::Less,
        _ => return Truth::Unknown,
    };
    Truth::from_bool(b)
}

use riq_common::{Result, RiqError};
use sqlparser::ast::{
    BinaryOperator as SqlBinaryOp, Expr as SqlExpr, Ident, ObjectName, SelectItem, SetExpr,
    Statement, TableFactor, UnaryOperator, Value,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use crate::expr::{BinaryOp, Expr, LiteralValue};

/// A single-table `SELECT cols FROM t [WHERE ...]` request.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectRequest {
    pub table: String,
    /// `None` for `SELECT *`.
    pub columns: Option<Vec<String>>,
    pub filter: Option<Expr>,
}

pub fn parse_sql(sql: &str) -> Result<Vec<Statement>> {
    let dialect = GenericDialect {};
    Parser::parse_sql(&dialect, sql).map_err(|e| RiqError::Planning(e.to_string()))
}

/// Parses the small SELECT subset the warehouse facade accepts.
pub fn parse_select(sql: &str) -> Result<SelectRequest> {
    let stmts = parse_sql(sql)?;
    if stmts.len() != 1 {
        return Err(RiqError::Unsupported(
            "only single-statement SQL is supported".to_string(),
        ));
    }
    let Statement::Query(q) = &stmts[0] else {
        return Err(RiqError::Unsupported(
            "only SELECT queries are supported".to_string(),
        ));
    };
    let select = match &*q.body {
        SetExpr::Select(s) => s.as_ref(),
        _ => {
            return Err(RiqError::Unsupported(
                "only simple SELECT is supported (no UNION/EXCEPT/INTERSECT)".to_string(),
            ))
        }
    };

    if select.from.len() != 1 || !select.from[0].joins.is_empty() {
        return Err(RiqError::Unsupported(
            "exactly one table without joins is supported in FROM".to_string(),
        ));
    }
    let table = match &select.from[0].relation {
        TableFactor::Table { name, .. } => object_name_to_string(name),
        _ => {
            return Err(RiqError::Unsupported(
                "only simple table names in FROM are supported".to_string(),
            ))
        }
    };

    let mut columns = Vec::new();
    let mut wildcard = false;
    for item in &select.projection {
        match item {
            SelectItem::UnnamedExpr(SqlExpr::Identifier(id)) => columns.push(id.value.clone()),
            SelectItem::UnnamedExpr(SqlExpr::CompoundIdentifier(parts)) => {
                columns.push(last_ident(parts))
            }
            SelectItem::Wildcard(_) => wildcard = true,
            other => {
                return Err(RiqError::Unsupported(format!(
                    "only plain column references are supported in SELECT, got '{other}'"
                )))
            }
        }
    }
    if wildcard && !columns.is_empty() {
        return Err(RiqError::Planning(
            "SELECT * cannot be mixed with named columns".to_string(),
        ));
    }

    let filter = select.selection.as_ref().map(sql_expr_to_expr).transpose()?;

    Ok(SelectRequest {
        table,
        columns: (!wildcard).then_some(columns),
        filter,
    })
}

/// Parses a bare predicate such as `order_year = 2017 AND order_month = 1`.
pub fn parse_predicate(text: &str) -> Result<Expr> {
    let req = parse_select(&format!("SELECT * FROM t WHERE {text}"))?;
    req.filter
        .ok_or_else(|| RiqError::Planning(format!("empty predicate: '{text}'")))
}

fn sql_expr_to_expr(e: &SqlExpr) -> Result<Expr> {
    match e {
        SqlExpr::Identifier(id) => Ok(Expr::Column(id.value.clone())),
        SqlExpr::CompoundIdentifier(parts) => Ok(Expr::Column(last_ident(parts))),
        SqlExpr::Value(v) => sql_value_to_literal(v).map(Expr::Literal),
        SqlExpr::Nested(inner) => sql_expr_to_expr(inner),
        SqlExpr::BinaryOp { left, op, right } => {
            // AND/OR are represented as BinaryOp too
            if *op == SqlBinaryOp::And {
                return Ok(Expr::And(
                    Box::new(sql_expr_to_expr(left)?),
                    Box::new(sql_expr_to_expr(right)?),
                ));
            }
            if *op == SqlBinaryOp::Or {
                return Ok(Expr::Or(
                    Box::new(sql_expr_to_expr(left)?),
                    Box::new(sql_expr_to_expr(right)?),
                ));
            }
            Ok(Expr::BinaryOp {
                left: Box::new(sql_expr_to_expr(left)?),
                op: sql_binop_to_binop(op)?,
                right: Box::new(sql_expr_to_expr(right)?),
            })
        }
        SqlExpr::UnaryOp { op, expr } => match op {
            UnaryOperator::Not => Ok(Expr::Not(Box::new(sql_expr_to_expr(expr)?))),
            UnaryOperator::Minus => match sql_expr_to_expr(expr)? {
                Expr::Literal(LiteralValue::Int64(v)) => Ok(Expr::Literal(LiteralValue::Int64(-v))),
                Expr::Literal(LiteralValue::Float64(v)) => {
                    Ok(Expr::Literal(LiteralValue::Float64(-v)))
                }
                other => Err(RiqError::Unsupported(format!(
                    "unary minus is only supported on numeric literals, got '{other}'"
                ))),
            },
            _ => Err(RiqError::Unsupported(format!("unsupported unary op: {op}"))),
        },
        SqlExpr::IsNull(inner) => Ok(Expr::IsNull(Box::new(sql_expr_to_expr(inner)?))),
        SqlExpr::IsNotNull(inner) => Ok(Expr::IsNotNull(Box::new(sql_expr_to_expr(inner)?))),
        SqlExpr::InList {
            expr,
            list,
            negated,
        } => {
            let items = list
                .iter()
                .map(|item| match sql_expr_to_expr(item)? {
                    Expr::Literal(v) => Ok(v),
                    other => Err(RiqError::Unsupported(format!(
                        "IN lists must contain literals, got '{other}'"
                    ))),
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Expr::InList {
                expr: Box::new(sql_expr_to_expr(expr)?),
                list: items,
                negated: *negated,
            })
        }
        SqlExpr::Between {
            expr,
            negated,
            low,
            high,
        } => {
            let target = sql_expr_to_expr(expr)?;
            let range = Expr::And(
                Box::new(Expr::BinaryOp {
                    left: Box::new(target.clone()),
                    op: BinaryOp::GtEq,
                    right: Box::new(sql_expr_to_expr(low)?),
                }),
                Box::new(Expr::BinaryOp {
                    left: Box::new(target),
                    op: BinaryOp::LtEq,
                    right: Box::new(sql_expr_to_expr(high)?),
                }),
            );
            Ok(if *negated {
                Expr::Not(Box::new(range))
            } else {
                range
            })
        }
        _ => Err(RiqError::Unsupported(format!(
            "unsupported SQL expression: {e}"
        ))),
    }
}

fn sql_value_to_literal(v: &Value) -> Result<LiteralValue> {
    match v {
        Value::Number(s, _) => {
            if s.contains('.') || s.contains('e') || s.contains('E') {
                s.parse::<f64>()
                    .map(LiteralValue::Float64)
                    .map_err(|_| RiqError::Planning(format!("bad number: {s}")))
            } else {
                s.parse::<i64>()
                    .map(LiteralValue::Int64)
                    .map_err(|_| RiqError::Planning(format!("bad number: {s}")))
            }
        }
        Value::SingleQuotedString(s) | Value::DoubleQuotedString(s) => {
            Ok(LiteralValue::Utf8(s.clone()))
        }
        Value::Boolean(b) => Ok(LiteralValue::Boolean(*b)),
        Value::Null => Ok(LiteralValue::Null),
        _ => Err(RiqError::Unsupported(format!("unsupported SQL literal: {v}"))),
    }
}

fn sql_binop_to_binop(op: &SqlBinaryOp) -> Result<BinaryOp> {
    Ok(match op {
        SqlBinaryOp::Eq => BinaryOp::Eq,
        SqlBinaryOp::NotEq => BinaryOp::NotEq,
        SqlBinaryOp::Lt => BinaryOp::Lt,
        SqlBinaryOp::LtEq => BinaryOp::LtEq,
        SqlBinaryOp::Gt => BinaryOp::Gt,
        SqlBinaryOp::GtEq => BinaryOp::GtEq,
        SqlBinaryOp::Plus => BinaryOp::Plus,
        SqlBinaryOp::Minus => BinaryOp::Minus,
        SqlBinaryOp::Multiply => BinaryOp::Multiply,
        SqlBinaryOp::Divide => BinaryOp::Divide,
        _ => {
            return Err(RiqError::Unsupported(format!(
                "unsupported binary operator: {op}"
            )))
        }
    })
}

fn object_name_to_string(n: &ObjectName) -> String {
    n.0.iter()
        .map(|i| i.value.clone())
        .collect::<Vec<_>>()
        .join(".")
}

// `t.col` and `col` address the same column: there is only one table.
fn last_ident(parts: &[Ident]) -> String {
    parts.last().map(|i| i.value.clone()).unwrap_or_default()
}

//! Aggregation expressions.
//!
//! An expression is a field reference (`"$path"`), a literal, or an
//! operator document `{operator: [args…]}`. Evaluation distinguishes
//! *absent* (an undefined field reference) from a stored null: absent
//! propagates through arithmetic as `BadPipeline` and through
//! comparisons as false.

use crate::error::{EngineError, EngineResult};
use crate::path;
use mainydb_codec::{query_eq, total_cmp, Document, Value};
use std::cmp::Ordering;

/// A compiled expression.
#[derive(Debug, Clone)]
pub enum Expr {
    /// A constant value.
    Literal(Value),
    /// A reference to a field of the input document.
    FieldRef(String),
    /// An operator applied to argument expressions.
    Op(ExprOp, Vec<Expr>),
}

/// Expression operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprOp {
    /// Numeric sum of all arguments.
    Add,
    /// Two-argument difference.
    Subtract,
    /// Numeric product of all arguments.
    Multiply,
    /// Two-argument division; the result is always a float.
    Divide,
    /// Two-argument remainder.
    Mod,
    /// String concatenation; null if any argument is null or absent.
    Concat,
    /// Array length.
    Size,
    /// Three-argument conditional `[if, then, else]`.
    Cond,
    /// Equality under the query rules.
    Eq,
    /// Negated equality.
    Ne,
    /// Greater-than under the total order.
    Gt,
    /// Greater-or-equal.
    Gte,
    /// Less-than.
    Lt,
    /// Less-or-equal.
    Lte,
}

impl ExprOp {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "$add" => Self::Add,
            "$subtract" => Self::Subtract,
            "$multiply" => Self::Multiply,
            "$divide" => Self::Divide,
            "$mod" => Self::Mod,
            "$concat" => Self::Concat,
            "$size" => Self::Size,
            "$cond" => Self::Cond,
            "$eq" => Self::Eq,
            "$ne" => Self::Ne,
            "$gt" => Self::Gt,
            "$gte" => Self::Gte,
            "$lt" => Self::Lt,
            "$lte" => Self::Lte,
            _ => return None,
        })
    }

    /// Required argument count, or `None` for variadic (min 1).
    fn arity(self) -> Option<usize> {
        match self {
            Self::Add | Self::Multiply | Self::Concat => None,
            Self::Size => Some(1),
            Self::Cond => Some(3),
            _ => Some(2),
        }
    }
}

impl Expr {
    /// Compiles an expression value.
    pub fn parse(value: &Value) -> EngineResult<Self> {
        match value {
            Value::Text(s) if s.starts_with('$') => Ok(Expr::FieldRef(s[1..].to_string())),
            Value::Doc(d) if d.len() == 1 && d.keys().next().is_some_and(|k| k.starts_with('$')) => {
                let (name, operand) = d.iter().next().expect("len checked");
                let op = ExprOp::parse(name).ok_or_else(|| {
                    EngineError::bad_pipeline(format!("unknown expression operator {name:?}"))
                })?;
                let args: Vec<Expr> = match operand {
                    Value::Array(items) => {
                        items.iter().map(Expr::parse).collect::<EngineResult<_>>()?
                    }
                    single => vec![Expr::parse(single)?],
                };
                if let Some(required) = op.arity() {
                    if args.len() != required {
                        return Err(EngineError::bad_pipeline(format!(
                            "{name} expects {required} arguments, got {}",
                            args.len()
                        )));
                    }
                } else if args.is_empty() {
                    return Err(EngineError::bad_pipeline(format!(
                        "{name} expects at least one argument"
                    )));
                }
                Ok(Expr::Op(op, args))
            }
            Value::Doc(d) if d.keys().any(|k| k.starts_with('$')) => Err(
                EngineError::bad_pipeline("operator document must have exactly one operator key"),
            ),
            other => Ok(Expr::Literal(other.clone())),
        }
    }

    /// Evaluates against a document. `None` is the absent marker.
    pub fn eval(&self, doc: &Document) -> EngineResult<Option<Value>> {
        match self {
            Expr::Literal(v) => Ok(Some(v.clone())),
            Expr::FieldRef(p) => Ok(path::resolve(doc, p).cloned()),
            Expr::Op(op, args) => eval_op(*op, args, doc),
        }
    }
}

fn eval_op(op: ExprOp, args: &[Expr], doc: &Document) -> EngineResult<Option<Value>> {
    match op {
        ExprOp::Add => fold_numeric(args, doc, "$add", |a, b| a.checked_add(b), |a, b| a + b),
        ExprOp::Multiply => {
            fold_numeric(args, doc, "$multiply", |a, b| a.checked_mul(b), |a, b| a * b)
        }
        ExprOp::Subtract => {
            fold_numeric(args, doc, "$subtract", |a, b| a.checked_sub(b), |a, b| a - b)
        }
        ExprOp::Divide => {
            let (a, b) = numeric_pair(args, doc, "$divide")?;
            let (Some(a), Some(b)) = (a, b) else {
                return Ok(Some(Value::Null));
            };
            if b == 0.0 {
                return Err(EngineError::bad_pipeline("$divide by zero"));
            }
            Ok(Some(Value::Float(a / b)))
        }
        ExprOp::Mod => {
            let a = require_defined(args[0].eval(doc)?, "$mod")?;
            let b = require_defined(args[1].eval(doc)?, "$mod")?;
            match (&a, &b) {
                (Value::Null, _) | (_, Value::Null) => Ok(Some(Value::Null)),
                (Value::Int(x), Value::Int(y)) => {
                    if *y == 0 {
                        Err(EngineError::bad_pipeline("$mod by zero"))
                    } else {
                        Ok(Some(Value::Int(x % y)))
                    }
                }
                _ => {
                    let (x, y) = (numeric(&a, "$mod")?, numeric(&b, "$mod")?);
                    if y == 0.0 {
                        Err(EngineError::bad_pipeline("$mod by zero"))
                    } else {
                        Ok(Some(Value::Float(x % y)))
                    }
                }
            }
        }
        ExprOp::Concat => {
            let mut out = String::new();
            for arg in args {
                match arg.eval(doc)? {
                    None | Some(Value::Null) => return Ok(Some(Value::Null)),
                    Some(Value::Text(s)) => out.push_str(&s),
                    Some(other) => {
                        return Err(EngineError::bad_pipeline(format!(
                            "$concat expects strings, got {}",
                            other.type_name()
                        )));
                    }
                }
            }
            Ok(Some(Value::Text(out)))
        }
        ExprOp::Size => match require_defined(args[0].eval(doc)?, "$size")? {
            Value::Array(items) => Ok(Some(Value::Int(items.len() as i64))),
            other => Err(EngineError::bad_pipeline(format!(
                "$size expects an array, got {}",
                other.type_name()
            ))),
        },
        ExprOp::Cond => {
            let branch = if is_truthy(args[0].eval(doc)?.as_ref()) {
                &args[1]
            } else {
                &args[2]
            };
            branch.eval(doc)
        }
        ExprOp::Eq | ExprOp::Ne => {
            let (a, b) = (args[0].eval(doc)?, args[1].eval(doc)?);
            let eq = match (&a, &b) {
                (Some(a), Some(b)) => query_eq(a, b),
                // Comparison against absent is false (and its negation
                // true only when both sides are defined-equal).
                _ => return Ok(Some(Value::Bool(false))),
            };
            Ok(Some(Value::Bool(if op == ExprOp::Eq { eq } else { !eq })))
        }
        ExprOp::Gt | ExprOp::Gte | ExprOp::Lt | ExprOp::Lte => {
            let (a, b) = (args[0].eval(doc)?, args[1].eval(doc)?);
            let (Some(a), Some(b)) = (a, b) else {
                return Ok(Some(Value::Bool(false)));
            };
            let ord = total_cmp(&a, &b);
            let holds = match op {
                ExprOp::Gt => ord == Ordering::Greater,
                ExprOp::Gte => ord != Ordering::Less,
                ExprOp::Lt => ord == Ordering::Less,
                ExprOp::Lte => ord != Ordering::Greater,
                _ => unreachable!("filtered by outer match"),
            };
            Ok(Some(Value::Bool(holds)))
        }
    }
}

/// Folds a variadic numeric operator, preserving the Int tag while every
/// operand is an int. Null operands make the whole result null.
fn fold_numeric(
    args: &[Expr],
    doc: &Document,
    op: &str,
    int_op: impl Fn(i64, i64) -> Option<i64>,
    float_op: impl Fn(f64, f64) -> f64,
) -> EngineResult<Option<Value>> {
    let mut acc: Option<Value> = None;
    for arg in args {
        let value = require_defined(arg.eval(doc)?, op)?;
        if value.is_null() {
            return Ok(Some(Value::Null));
        }
        if !value.is_number() {
            return Err(EngineError::bad_pipeline(format!(
                "{op} expects numbers, got {}",
                value.type_name()
            )));
        }
        acc = Some(match (acc, value) {
            (None, v) => v,
            (Some(Value::Int(a)), Value::Int(b)) => match int_op(a, b) {
                Some(n) => Value::Int(n),
                None => {
                    return Err(EngineError::bad_pipeline(format!("{op} integer overflow")));
                }
            },
            (Some(prev), v) => {
                // Both sides were checked numeric above.
                let (a, b) = (
                    prev.as_f64().unwrap_or(f64::NAN),
                    v.as_f64().unwrap_or(f64::NAN),
                );
                Value::Float(float_op(a, b))
            }
        });
    }
    Ok(acc)
}

/// Evaluates a two-argument numeric operator's operands, treating null
/// as null-propagating.
fn numeric_pair(
    args: &[Expr],
    doc: &Document,
    op: &str,
) -> EngineResult<(Option<f64>, Option<f64>)> {
    let a = require_defined(args[0].eval(doc)?, op)?;
    let b = require_defined(args[1].eval(doc)?, op)?;
    let widen = |v: Value| -> EngineResult<Option<f64>> {
        if v.is_null() {
            Ok(None)
        } else {
            numeric(&v, op).map(Some)
        }
    };
    Ok((widen(a)?, widen(b)?))
}

fn numeric(v: &Value, op: &str) -> EngineResult<f64> {
    v.as_f64().ok_or_else(|| {
        EngineError::bad_pipeline(format!("{op} expects numbers, got {}", v.type_name()))
    })
}

fn require_defined(v: Option<Value>, op: &str) -> EngineResult<Value> {
    v.ok_or_else(|| EngineError::bad_pipeline(format!("{op} applied to an undefined value")))
}

/// Conditional truthiness: false, 0, null, and absent are falsy.
fn is_truthy(v: Option<&Value>) -> bool {
    match v {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(Value::Int(0)) => false,
        Some(Value::Float(f)) => *f != 0.0,
        _ => true,
    }
}

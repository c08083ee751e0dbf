//! The update engine.
//!
//! An update document is either a full replacement (no top-level `$`
//! keys) or an operator document (every top-level key is an operator);
//! mixing the two shapes is `BadUpdate`, as is any attempt to modify
//! `_id`. Operators apply copy-on-write: the input document is cloned,
//! operators mutate the clone, and the caller swaps it in only when
//! something actually changed.

use crate::error::{EngineError, EngineResult};
use crate::path;
use crate::query::filter::pull_matches;
use crate::query::FieldCond;
use mainydb_codec::{query_eq, total_cmp, Document, Value};
use std::cmp::Ordering;

/// A parsed update document.
#[derive(Debug, Clone)]
pub enum UpdateSpec {
    /// Replace the whole document (keeping `_id`).
    Replace(Document),
    /// Apply a sequence of operators.
    Ops(Vec<UpdateOp>),
}

/// One parsed update operator application on one path.
#[derive(Debug, Clone)]
pub enum UpdateOp {
    /// `$set`: assign, creating the path.
    Set {
        /// Target path.
        path: String,
        /// Value to assign.
        value: Value,
    },
    /// `$unset`: remove the field.
    Unset {
        /// Target path.
        path: String,
    },
    /// `$inc`: numeric addition.
    Inc {
        /// Target path.
        path: String,
        /// Amount to add.
        amount: Value,
    },
    /// `$mul`: numeric multiplication.
    Mul {
        /// Target path.
        path: String,
        /// Factor to multiply by.
        factor: Value,
    },
    /// `$min`: assign iff operand sorts below the current value.
    Min {
        /// Target path.
        path: String,
        /// Candidate value.
        value: Value,
    },
    /// `$max`: assign iff operand sorts above the current value.
    Max {
        /// Target path.
        path: String,
        /// Candidate value.
        value: Value,
    },
    /// `$rename`: move a value to a new path.
    Rename {
        /// Source path.
        from: String,
        /// Destination path.
        to: String,
    },
    /// `$currentDate`: set to the current UTC timestamp.
    CurrentDate {
        /// Target path.
        path: String,
    },
    /// `$push`: append to an array, with optional modifiers.
    Push {
        /// Target path.
        path: String,
        /// Values to append (singleton unless `$each` was given).
        each: Vec<Value>,
        /// Insertion position (`$position`).
        position: Option<usize>,
        /// Post-push truncation (`$slice`): positive keeps the first N,
        /// negative keeps the last N.
        slice: Option<i64>,
    },
    /// `$pop`: remove the first or last element.
    Pop {
        /// Target path.
        path: String,
        /// True removes the first element (`-1`), false the last (`1`).
        from_front: bool,
    },
    /// `$pull`: remove all elements matching a condition.
    Pull {
        /// Target path.
        path: String,
        /// The removal condition.
        cond: PullCond,
    },
    /// `$pullAll`: remove all elements equal to any listed value.
    PullAll {
        /// Target path.
        path: String,
        /// Values to remove.
        values: Vec<Value>,
    },
    /// `$addToSet`: append values not already present.
    AddToSet {
        /// Target path.
        path: String,
        /// Values to add (singleton unless `$each` was given).
        each: Vec<Value>,
    },
}

/// The operand of a `$pull`.
#[derive(Debug, Clone)]
pub enum PullCond {
    /// Remove elements equal to this value.
    Equals(Value),
    /// Remove elements matching these value operators.
    Ops(Vec<FieldCond>),
}

impl UpdateSpec {
    /// Parses an update document, validating its shape.
    pub fn parse(update: &Document) -> EngineResult<Self> {
        let operator_keys = update.keys().filter(|k| k.starts_with('$')).count();

        if operator_keys == 0 {
            // Replacement shape; _id immutability is checked at apply
            // time against the target document.
            return Ok(UpdateSpec::Replace(update.clone()));
        }
        if operator_keys != update.len() {
            return Err(EngineError::bad_update(
                "update mixes replacement fields with operators",
            ));
        }

        let mut ops = Vec::new();
        for (op, operand) in update.iter() {
            let fields = operand.as_doc().ok_or_else(|| {
                EngineError::bad_update(format!("{op} expects a document of fields"))
            })?;
            for (field_path, arg) in fields.iter() {
                if field_path == "_id" || field_path.starts_with("_id.") {
                    return Err(EngineError::bad_update("cannot modify _id"));
                }
                ops.push(parse_op(op, field_path, arg)?);
            }
        }
        Ok(UpdateSpec::Ops(ops))
    }

    /// Applies the update to a document, returning the new document and
    /// whether anything changed.
    ///
    /// The input is untouched; errors leave no partial result behind.
    pub fn apply(&self, doc: &Document, now_ms: i64) -> EngineResult<(Document, bool)> {
        match self {
            UpdateSpec::Replace(replacement) => {
                let mut next = replacement.clone();
                match (doc.get("_id"), next.get("_id")) {
                    (Some(old), Some(new)) if old != new => {
                        return Err(EngineError::bad_update("cannot replace _id"));
                    }
                    (Some(old), None) => {
                        // _id is carried over, and leads the new document.
                        let mut with_id = Document::with_capacity(next.len() + 1);
                        with_id.set("_id", old.clone());
                        for (k, v) in next.iter() {
                            with_id.set(k, v.clone());
                        }
                        next = with_id;
                    }
                    _ => {}
                }
                let modified = next != *doc;
                Ok((next, modified))
            }
            UpdateSpec::Ops(ops) => {
                let mut next = doc.clone();
                let mut modified = false;
                for op in ops {
                    modified |= apply_op(&mut next, op, now_ms)?;
                }
                Ok((next, modified))
            }
        }
    }
}

fn parse_op(op: &str, field: &str, arg: &Value) -> EngineResult<UpdateOp> {
    let path = field.to_string();
    Ok(match op {
        "$set" => UpdateOp::Set {
            path,
            value: arg.clone(),
        },
        "$unset" => UpdateOp::Unset { path },
        "$inc" => UpdateOp::Inc {
            path,
            amount: numeric_operand(op, field, arg)?,
        },
        "$mul" => UpdateOp::Mul {
            path,
            factor: numeric_operand(op, field, arg)?,
        },
        "$min" => UpdateOp::Min {
            path,
            value: arg.clone(),
        },
        "$max" => UpdateOp::Max {
            path,
            value: arg.clone(),
        },
        "$rename" => {
            let to = arg.as_str().ok_or_else(|| {
                EngineError::bad_update(format!("$rename target for {field:?} must be a string"))
            })?;
            if to == "_id" || to.starts_with("_id.") {
                return Err(EngineError::bad_update("cannot modify _id"));
            }
            UpdateOp::Rename {
                from: path,
                to: to.to_string(),
            }
        }
        "$currentDate" => UpdateOp::CurrentDate { path },
        "$push" => {
            let (each, position, slice) = parse_push_modifiers(field, arg)?;
            UpdateOp::Push {
                path,
                each,
                position,
                slice,
            }
        }
        "$pop" => {
            let from_front = match arg.as_i64() {
                Some(1) => false,
                Some(-1) => true,
                _ => {
                    return Err(EngineError::bad_update(format!(
                        "$pop on {field:?} expects 1 or -1"
                    )));
                }
            };
            UpdateOp::Pop { path, from_front }
        }
        "$pull" => {
            let cond = match arg {
                Value::Doc(d) if d.keys().any(|k| k.starts_with('$')) => {
                    PullCond::Ops(parse_pull_ops(field, d)?)
                }
                other => PullCond::Equals(other.clone()),
            };
            UpdateOp::Pull { path, cond }
        }
        "$pullAll" => {
            let values = arg.as_array().ok_or_else(|| {
                EngineError::bad_update(format!("$pullAll on {field:?} expects an array"))
            })?;
            UpdateOp::PullAll {
                path,
                values: values.to_vec(),
            }
        }
        "$addToSet" => {
            let each = match arg {
                Value::Doc(d) if d.contains_key("$each") => {
                    let each = d.get("$each").and_then(Value::as_array).ok_or_else(|| {
                        EngineError::bad_update(format!(
                            "$addToSet $each on {field:?} expects an array"
                        ))
                    })?;
                    each.to_vec()
                }
                other => vec![other.clone()],
            };
            UpdateOp::AddToSet { path, each }
        }
        _ => {
            return Err(EngineError::bad_update(format!(
                "unknown update operator {op:?}"
            )));
        }
    })
}

fn numeric_operand(op: &str, field: &str, arg: &Value) -> EngineResult<Value> {
    if arg.is_number() {
        Ok(arg.clone())
    } else {
        Err(EngineError::bad_update(format!(
            "{op} on {field:?} expects a number, got {}",
            arg.type_name()
        )))
    }
}

fn parse_push_modifiers(
    field: &str,
    arg: &Value,
) -> EngineResult<(Vec<Value>, Option<usize>, Option<i64>)> {
    if let Value::Doc(d) = arg {
        if d.contains_key("$each") {
            let each = d.get("$each").and_then(Value::as_array).ok_or_else(|| {
                EngineError::bad_update(format!("$push $each on {field:?} expects an array"))
            })?;
            let position = match d.get("$position") {
                None => None,
                Some(v) => Some(v.as_i64().filter(|n| *n >= 0).ok_or_else(|| {
                    EngineError::bad_update(format!(
                        "$push $position on {field:?} expects a non-negative integer"
                    ))
                })? as usize),
            };
            let slice = match d.get("$slice") {
                None => None,
                Some(v) => Some(v.as_i64().ok_or_else(|| {
                    EngineError::bad_update(format!(
                        "$push $slice on {field:?} expects an integer"
                    ))
                })?),
            };
            for key in d.keys() {
                if key.starts_with('$') && !matches!(key, "$each" | "$position" | "$slice") {
                    return Err(EngineError::bad_update(format!(
                        "unknown $push modifier {key:?} on {field:?}"
                    )));
                }
            }
            return Ok((each.to_vec(), position, slice));
        }
    }
    Ok((vec![arg.clone()], None, None))
}

fn parse_pull_ops(field: &str, d: &Document) -> EngineResult<Vec<FieldCond>> {
    let as_filter = Document::from_iter([(field.to_string(), Value::Doc(d.clone()))]);
    match crate::query::Filter::parse(&as_filter)? {
        crate::query::Filter::Field { conds, .. } => Ok(conds),
        _ => Err(EngineError::bad_update(format!(
            "$pull condition on {field:?} is malformed"
        ))),
    }
}

/// Applies one operator, returning whether the document changed.
fn apply_op(doc: &mut Document, op: &UpdateOp, now_ms: i64) -> EngineResult<bool> {
    match op {
        UpdateOp::Set { path, value } => {
            if path::resolve(doc, path) == Some(value) {
                return Ok(false);
            }
            path::set_path(doc, path, value.clone())?;
            Ok(true)
        }
        UpdateOp::Unset { path } => Ok(path::remove_path(doc, path).is_some()),
        UpdateOp::Inc { path, amount } => {
            let next = match path::resolve(doc, path) {
                None => amount.clone(),
                Some(current) => numeric_combine(current, amount, path, |a, b| a + b, |a, b| {
                    a.checked_add(b)
                })?,
            };
            let changed = path::resolve(doc, path) != Some(&next);
            path::set_path(doc, path, next)?;
            Ok(changed)
        }
        UpdateOp::Mul { path, factor } => {
            let next = match path::resolve(doc, path) {
                // Missing fields initialize to zero of the operand's type.
                None => match factor {
                    Value::Int(_) => Value::Int(0),
                    _ => Value::Float(0.0),
                },
                Some(current) => numeric_combine(current, factor, path, |a, b| a * b, |a, b| {
                    a.checked_mul(b)
                })?,
            };
            let changed = path::resolve(doc, path) != Some(&next);
            path::set_path(doc, path, next)?;
            Ok(changed)
        }
        UpdateOp::Min { path, value } => apply_bound(doc, path, value, Ordering::Less),
        UpdateOp::Max { path, value } => apply_bound(doc, path, value, Ordering::Greater),
        UpdateOp::Rename { from, to } => {
            match path::remove_path(doc, from) {
                None => Ok(false),
                Some(value) => {
                    path::set_path(doc, to, value)?;
                    Ok(true)
                }
            }
        }
        UpdateOp::CurrentDate { path } => {
            path::set_path(doc, path, Value::Timestamp(now_ms))?;
            Ok(true)
        }
        UpdateOp::Push {
            path,
            each,
            position,
            slice,
        } => {
            let items = array_for_write(doc, path, "$push")?;
            match position {
                Some(pos) => {
                    let at = (*pos).min(items.len());
                    for (i, v) in each.iter().enumerate() {
                        items.insert(at + i, v.clone());
                    }
                }
                None => items.extend(each.iter().cloned()),
            }
            if let Some(n) = slice {
                if *n >= 0 {
                    items.truncate(*n as usize);
                } else {
                    let keep = n.unsigned_abs() as usize;
                    if items.len() > keep {
                        items.drain(..items.len() - keep);
                    }
                }
            }
            Ok(true)
        }
        UpdateOp::Pop { path, from_front } => match path::resolve(doc, path) {
            None => Ok(false),
            Some(Value::Array(items)) if items.is_empty() => Ok(false),
            Some(Value::Array(_)) => {
                let items = array_for_write(doc, path, "$pop")?;
                if *from_front {
                    items.remove(0);
                } else {
                    items.pop();
                }
                Ok(true)
            }
            Some(other) => Err(EngineError::bad_update(format!(
                "$pop target {path:?} is {}, not an array",
                other.type_name()
            ))),
        },
        UpdateOp::Pull { path, cond } => match path::resolve(doc, path) {
            None => Ok(false),
            Some(Value::Array(_)) => {
                let items = array_for_write(doc, path, "$pull")?;
                let before = items.len();
                items.retain(|elem| match cond {
                    PullCond::Equals(q) => !query_eq(elem, q),
                    PullCond::Ops(conds) => !pull_matches(conds, elem),
                });
                Ok(items.len() != before)
            }
            Some(other) => Err(EngineError::bad_update(format!(
                "$pull target {path:?} is {}, not an array",
                other.type_name()
            ))),
        },
        UpdateOp::PullAll { path, values } => match path::resolve(doc, path) {
            None => Ok(false),
            Some(Value::Array(_)) => {
                let items = array_for_write(doc, path, "$pullAll")?;
                let before = items.len();
                items.retain(|elem| !values.iter().any(|q| query_eq(elem, q)));
                Ok(items.len() != before)
            }
            Some(other) => Err(EngineError::bad_update(format!(
                "$pullAll target {path:?} is {}, not an array",
                other.type_name()
            ))),
        },
        UpdateOp::AddToSet { path, each } => {
            let items = array_for_write(doc, path, "$addToSet")?;
            let mut changed = false;
            for v in each {
                if !items.iter().any(|m| query_eq(m, v)) {
                    items.push(v.clone());
                    changed = true;
                }
            }
            Ok(changed)
        }
    }
}

/// `$min` / `$max`: assign iff the operand sorts strictly on the given
/// side of the current value, or the path is absent.
fn apply_bound(
    doc: &mut Document,
    path: &str,
    candidate: &Value,
    wanted: Ordering,
) -> EngineResult<bool> {
    let replace = match path::resolve(doc, path) {
        None => true,
        Some(current) => total_cmp(candidate, current) == wanted,
    };
    if replace {
        path::set_path(doc, path, candidate.clone())?;
    }
    Ok(replace)
}

/// Numeric combination for `$inc` / `$mul`, preserving the Int tag when
/// both operands are ints and the result fits.
fn numeric_combine(
    current: &Value,
    operand: &Value,
    path: &str,
    float_op: impl Fn(f64, f64) -> f64,
    int_op: impl Fn(i64, i64) -> Option<i64>,
) -> EngineResult<Value> {
    match (current, operand) {
        (Value::Int(a), Value::Int(b)) => match int_op(*a, *b) {
            Some(n) => Ok(Value::Int(n)),
            None => Err(EngineError::bad_update(format!(
                "integer overflow at {path:?}"
            ))),
        },
        _ => {
            let (Some(a), Some(b)) = (current.as_f64(), operand.as_f64()) else {
                return Err(EngineError::bad_update(format!(
                    "numeric update on {path:?} hit a {} value",
                    current.type_name()
                )));
            };
            Ok(Value::Float(float_op(a, b)))
        }
    }
}

/// Resolves the target array for array operators, creating it for the
/// operators that start from empty.
fn array_for_write<'a>(
    doc: &'a mut Document,
    path: &str,
    op: &str,
) -> EngineResult<&'a mut Vec<Value>> {
    match path::resolve(doc, path) {
        None => {
            path::set_path(doc, path, Value::Array(Vec::new()))?;
        }
        Some(Value::Array(_)) => {}
        Some(other) => {
            return Err(EngineError::bad_update(format!(
                "{op} target {path:?} is {}, not an array",
                other.type_name()
            )));
        }
    }
    resolve_array_mut(doc, path).ok_or_else(|| {
        EngineError::bad_update(format!("{op} could not materialize array at {path:?}"))
    })
}

fn resolve_array_mut<'a>(doc: &'a mut Document, full: &str) -> Option<&'a mut Vec<Value>> {
    let mut segments = full.split('.');
    let first = segments.next()?;
    let mut current = doc.get_mut(first)?;
    for segment in segments {
        current = match current {
            Value::Doc(d) => d.get_mut(segment)?,
            Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                items.get_mut(index)?
            }
            _ => return None,
        };
    }
    current.as_array_mut()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mainydb_codec::doc;

    const NOW: i64 = 1_700_000_000_000;

    fn apply(update: Document, to: &Document) -> EngineResult<(Document, bool)> {
        UpdateSpec::parse(&update)?.apply(to, NOW)
    }

    #[test]
    fn combined_operators() {
        let start = doc! { "a": 1i64, "b": vec![1i64, 2, 3], "c": doc! { "x": 0i64 } };
        let update = doc! {
            "$inc": doc! { "a": 2i64 },
            "$push": doc! { "b": 4i64 },
            "$set": doc! { "c.y": 9i64 },
            "$unset": doc! { "c.x": "" },
        };
        let (next, modified) = apply(update, &start).unwrap();
        assert!(modified);
        assert_eq!(
            next,
            doc! { "a": 3i64, "b": vec![1i64, 2, 3, 4], "c": doc! { "y": 9i64 } }
        );
        // Copy-on-write left the original untouched.
        assert_eq!(start.get("a"), Some(&Value::Int(1)));
    }

    #[test]
    fn set_creates_paths() {
        let (next, modified) = apply(doc! { "$set": doc! { "a.b": 1i64 } }, &doc! {}).unwrap();
        assert!(modified);
        assert_eq!(next, doc! { "a": doc! { "b": 1i64 } });
    }

    #[test]
    fn set_same_value_is_not_modified() {
        let d = doc! { "a": 1i64 };
        let (next, modified) = apply(doc! { "$set": doc! { "a": 1i64 } }, &d).unwrap();
        assert!(!modified);
        assert_eq!(next, d);
    }

    #[test]
    fn set_same_number_different_tag_is_modified() {
        let d = doc! { "a": 1i64 };
        let (next, modified) = apply(doc! { "$set": doc! { "a": 1.0 } }, &d).unwrap();
        assert!(modified);
        assert_eq!(next.get("a"), Some(&Value::Float(1.0)));
    }

    #[test]
    fn inc_missing_initializes() {
        let (next, _) = apply(doc! { "$inc": doc! { "n": 5i64 } }, &doc! {}).unwrap();
        assert_eq!(next.get("n"), Some(&Value::Int(5)));
    }

    #[test]
    fn inc_preserves_int_tag() {
        let d = doc! { "n": 1i64 };
        let (next, _) = apply(doc! { "$inc": doc! { "n": 2i64 } }, &d).unwrap();
        assert_eq!(next.get("n"), Some(&Value::Int(3)));

        let (next, _) = apply(doc! { "$inc": doc! { "n": 0.5 } }, &d).unwrap();
        assert_eq!(next.get("n"), Some(&Value::Float(1.5)));
    }

    #[test]
    fn inc_type_mismatch_is_bad_update() {
        let d = doc! { "n": "one" };
        let err = apply(doc! { "$inc": doc! { "n": 1i64 } }, &d).unwrap_err();
        assert!(matches!(err, EngineError::BadUpdate { .. }));
    }

    #[test]
    fn mul_missing_is_zero_of_operand_type() {
        let (next, _) = apply(doc! { "$mul": doc! { "n": 3i64 } }, &doc! {}).unwrap();
        assert_eq!(next.get("n"), Some(&Value::Int(0)));
        let (next, _) = apply(doc! { "$mul": doc! { "n": 3.0 } }, &doc! {}).unwrap();
        assert_eq!(next.get("n"), Some(&Value::Float(0.0)));
    }

    #[test]
    fn min_max() {
        let d = doc! { "n": 5i64 };
        let (next, modified) = apply(doc! { "$min": doc! { "n": 3i64 } }, &d).unwrap();
        assert!(modified);
        assert_eq!(next.get("n"), Some(&Value::Int(3)));

        let (_, modified) = apply(doc! { "$min": doc! { "n": 9i64 } }, &d).unwrap();
        assert!(!modified);

        let (next, _) = apply(doc! { "$max": doc! { "n": 9i64 } }, &d).unwrap();
        assert_eq!(next.get("n"), Some(&Value::Int(9)));
    }

    #[test]
    fn rename_moves_value() {
        let d = doc! { "old": 7i64 };
        let (next, modified) = apply(doc! { "$rename": doc! { "old": "fresh" } }, &d).unwrap();
        assert!(modified);
        assert_eq!(next, doc! { "fresh": 7i64 });

        let (_, modified) = apply(doc! { "$rename": doc! { "gone": "x" } }, &d).unwrap();
        assert!(!modified);
    }

    #[test]
    fn current_date_sets_timestamp() {
        let (next, _) = apply(doc! { "$currentDate": doc! { "at": true } }, &doc! {}).unwrap();
        assert_eq!(next.get("at"), Some(&Value::Timestamp(NOW)));
    }

    #[test]
    fn push_creates_and_appends() {
        let (next, _) = apply(doc! { "$push": doc! { "xs": 1i64 } }, &doc! {}).unwrap();
        assert_eq!(next.get("xs"), Some(&Value::from(vec![1i64])));

        let d = doc! { "xs": vec![1i64] };
        let (next, _) = apply(doc! { "$push": doc! { "xs": 2i64 } }, &d).unwrap();
        assert_eq!(next.get("xs"), Some(&Value::from(vec![1i64, 2])));
    }

    #[test]
    fn push_on_non_array_fails() {
        let d = doc! { "xs": 1i64 };
        let err = apply(doc! { "$push": doc! { "xs": 2i64 } }, &d).unwrap_err();
        assert!(matches!(err, EngineError::BadUpdate { .. }));
    }

    #[test]
    fn push_each_position_slice() {
        let d = doc! { "xs": vec![1i64, 4] };
        let update = doc! { "$push": doc! { "xs": doc! {
            "$each": vec![2i64, 3],
            "$position": 1i64,
        } } };
        let (next, _) = apply(update, &d).unwrap();
        assert_eq!(next.get("xs"), Some(&Value::from(vec![1i64, 2, 3, 4])));

        let update = doc! { "$push": doc! { "xs": doc! {
            "$each": vec![2i64, 3],
            "$slice": -2i64,
        } } };
        let (next, _) = apply(update, &d).unwrap();
        assert_eq!(next.get("xs"), Some(&Value::from(vec![2i64, 3])));
    }

    #[test]
    fn pop_both_ends() {
        let d = doc! { "xs": vec![1i64, 2, 3] };
        let (next, _) = apply(doc! { "$pop": doc! { "xs": 1i64 } }, &d).unwrap();
        assert_eq!(next.get("xs"), Some(&Value::from(vec![1i64, 2])));

        let (next, _) = apply(doc! { "$pop": doc! { "xs": -1i64 } }, &d).unwrap();
        assert_eq!(next.get("xs"), Some(&Value::from(vec![2i64, 3])));

        let empty = doc! { "xs": Value::Array(vec![]) };
        let (_, modified) = apply(doc! { "$pop": doc! { "xs": 1i64 } }, &empty).unwrap();
        assert!(!modified);
    }

    #[test]
    fn pull_by_equality_and_predicate() {
        let d = doc! { "xs": vec![1i64, 5, 9, 5] };
        let (next, _) = apply(doc! { "$pull": doc! { "xs": 5i64 } }, &d).unwrap();
        assert_eq!(next.get("xs"), Some(&Value::from(vec![1i64, 9])));

        let (next, _) =
            apply(doc! { "$pull": doc! { "xs": doc! { "$gt": 4i64 } } }, &d).unwrap();
        assert_eq!(next.get("xs"), Some(&Value::from(vec![1i64])));
    }

    #[test]
    fn pull_all() {
        let d = doc! { "xs": vec![1i64, 2, 3, 2, 1] };
        let (next, _) =
            apply(doc! { "$pullAll": doc! { "xs": vec![1i64, 2] } }, &d).unwrap();
        assert_eq!(next.get("xs"), Some(&Value::from(vec![3i64])));
    }

    #[test]
    fn add_to_set() {
        let d = doc! { "xs": vec![1i64, 2] };
        let (_, modified) = apply(doc! { "$addToSet": doc! { "xs": 2i64 } }, &d).unwrap();
        assert!(!modified);

        // Query equality: 2.0 is already present as 2.
        let (_, modified) = apply(doc! { "$addToSet": doc! { "xs": 2.0 } }, &d).unwrap();
        assert!(!modified);

        let (next, modified) = apply(doc! { "$addToSet": doc! { "xs": 3i64 } }, &d).unwrap();
        assert!(modified);
        assert_eq!(next.get("xs"), Some(&Value::from(vec![1i64, 2, 3])));
    }

    #[test]
    fn replacement_keeps_id() {
        let d = doc! { "_id": "k1", "name": "alpha", "age": 30i64 };
        let (next, modified) = apply(doc! { "name": "beta", "age": 40i64 }, &d).unwrap();
        assert!(modified);
        assert_eq!(next.get("_id"), Some(&Value::Text("k1".into())));
        assert_eq!(next.get("name"), Some(&Value::Text("beta".into())));
    }

    #[test]
    fn replacement_with_conflicting_id_fails() {
        let d = doc! { "_id": "k1", "name": "alpha" };
        let err = apply(doc! { "_id": "k2", "name": "beta" }, &d).unwrap_err();
        assert!(matches!(err, EngineError::BadUpdate { .. }));
    }

    #[test]
    fn mixing_shapes_is_bad_update() {
        let err = UpdateSpec::parse(&doc! { "$set": doc! { "a": 1i64 }, "b": 2i64 }).unwrap_err();
        assert!(matches!(err, EngineError::BadUpdate { .. }));
    }

    #[test]
    fn id_mutation_is_bad_update() {
        let err = UpdateSpec::parse(&doc! { "$set": doc! { "_id": "nope" } }).unwrap_err();
        assert!(matches!(err, EngineError::BadUpdate { .. }));
        let err = UpdateSpec::parse(&doc! { "$inc": doc! { "_id.x": 1i64 } }).unwrap_err();
        assert!(matches!(err, EngineError::BadUpdate { .. }));
    }

    #[test]
    fn unknown_operator_is_bad_update() {
        let err = UpdateSpec::parse(&doc! { "$frobnicate": doc! { "a": 1i64 } }).unwrap_err();
        assert!(matches!(err, EngineError::BadUpdate { .. }));
    }

    #[test]
    fn noop_update_reports_unmodified() {
        let d = doc! { "xs": vec![1i64] };
        let (next, modified) = apply(doc! { "$pull": doc! { "xs": 9i64 } }, &d).unwrap();
        assert!(!modified);
        assert_eq!(next, d);
    }
}

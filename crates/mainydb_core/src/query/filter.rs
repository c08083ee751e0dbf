//! The predicate engine.
//!
//! A filter document compiles into a [`Filter`] tree that the planner can
//! inspect and that matches documents without ever erroring: malformed
//! shapes are rejected at compile time with `BadQuery`, and type
//! mismatches during evaluation simply fail to match.

use crate::error::{EngineError, EngineResult};
use crate::path;
use mainydb_codec::{query_eq, total_cmp, type_rank, Document, Value};
use std::cmp::Ordering;

/// A compiled filter.
#[derive(Debug, Clone)]
pub enum Filter {
    /// Conjunction of sub-filters (including the implicit top-level and).
    And(Vec<Filter>),
    /// Disjunction of sub-filters.
    Or(Vec<Filter>),
    /// Negated disjunction of sub-filters.
    Nor(Vec<Filter>),
    /// Conjunction of conditions on one field path.
    Field {
        /// Dotted path into the document.
        path: String,
        /// All conditions the field must satisfy.
        conds: Vec<FieldCond>,
    },
}

/// One condition applied to a field's value.
#[derive(Debug, Clone)]
pub enum FieldCond {
    /// Equality under the query rules (`$eq` or a bare literal).
    Eq(Value),
    /// Negated equality.
    Ne(Value),
    /// Strictly greater under the total order.
    Gt(Value),
    /// Greater or equal.
    Gte(Value),
    /// Strictly less.
    Lt(Value),
    /// Less or equal.
    Lte(Value),
    /// Membership in a set of values.
    In(Vec<Value>),
    /// Absence from a set of values.
    Nin(Vec<Value>),
    /// Array contains every listed value.
    All(Vec<Value>),
    /// Some array element satisfies a sub-predicate.
    ElemMatch(ElemPredicate),
    /// Array has exactly this length.
    Size(usize),
    /// The field is present (or absent, for `false`).
    Exists(bool),
    /// Negation of a conjunction of operator conditions.
    Not(Vec<FieldCond>),
}

/// The sub-predicate of an `$elemMatch`.
#[derive(Debug, Clone)]
pub enum ElemPredicate {
    /// Value operators applied to each element directly.
    Ops(Vec<FieldCond>),
    /// A filter applied to each element treated as a document.
    Doc(Box<Filter>),
}

impl Filter {
    /// Compiles a filter document.
    ///
    /// # Errors
    ///
    /// Returns `BadQuery` on unknown operators or malformed shapes.
    pub fn parse(filter: &Document) -> EngineResult<Self> {
        let mut clauses = Vec::with_capacity(filter.len());

        for (key, value) in filter.iter() {
            match key {
                "$and" => clauses.push(Filter::And(parse_filter_list(key, value)?)),
                "$or" => clauses.push(Filter::Or(parse_filter_list(key, value)?)),
                "$nor" => clauses.push(Filter::Nor(parse_filter_list(key, value)?)),
                _ if key.starts_with('$') => {
                    return Err(EngineError::bad_query(format!(
                        "unknown top-level operator {key:?}"
                    )));
                }
                _ => clauses.push(Filter::Field {
                    path: key.to_string(),
                    conds: parse_field_conds(key, value)?,
                }),
            }
        }

        Ok(match clauses.len() {
            1 => clauses.pop().expect("len checked"),
            _ => Filter::And(clauses),
        })
    }

    /// Tests a document against the filter.
    #[must_use]
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::And(subs) => subs.iter().all(|f| f.matches(doc)),
            Filter::Or(subs) => subs.iter().any(|f| f.matches(doc)),
            Filter::Nor(subs) => !subs.iter().any(|f| f.matches(doc)),
            Filter::Field { path, conds } => {
                let value = path::resolve(doc, path);
                conds.iter().all(|c| eval_cond(c, value))
            }
        }
    }
}

fn parse_filter_list(op: &str, value: &Value) -> EngineResult<Vec<Filter>> {
    let items = value.as_array().ok_or_else(|| {
        EngineError::bad_query(format!("{op} expects an array of filters"))
    })?;
    if items.is_empty() {
        return Err(EngineError::bad_query(format!(
            "{op} expects a non-empty array"
        )));
    }
    items
        .iter()
        .map(|item| {
            item.as_doc()
                .ok_or_else(|| EngineError::bad_query(format!("{op} elements must be documents")))
                .and_then(Filter::parse)
        })
        .collect()
}

fn parse_field_conds(field: &str, value: &Value) -> EngineResult<Vec<FieldCond>> {
    match value {
        Value::Doc(d) if is_operator_doc(d) => parse_operator_doc(field, d),
        other => Ok(vec![FieldCond::Eq(other.clone())]),
    }
}

/// A document in condition position is an operator document when any of
/// its keys starts with `$`; mixing operators and plain fields there is
/// malformed.
fn is_operator_doc(d: &Document) -> bool {
    d.keys().any(|k| k.starts_with('$'))
}

fn parse_operator_doc(field: &str, d: &Document) -> EngineResult<Vec<FieldCond>> {
    let mut conds = Vec::with_capacity(d.len());
    for (op, operand) in d.iter() {
        if !op.starts_with('$') {
            return Err(EngineError::bad_query(format!(
                "field {field:?} mixes operators with plain key {op:?}"
            )));
        }
        conds.push(parse_operator(field, op, operand)?);
    }
    Ok(conds)
}

fn parse_operator(field: &str, op: &str, operand: &Value) -> EngineResult<FieldCond> {
    Ok(match op {
        "$eq" => FieldCond::Eq(operand.clone()),
        "$ne" => FieldCond::Ne(operand.clone()),
        "$gt" => FieldCond::Gt(operand.clone()),
        "$gte" => FieldCond::Gte(operand.clone()),
        "$lt" => FieldCond::Lt(operand.clone()),
        "$lte" => FieldCond::Lte(operand.clone()),
        "$in" => FieldCond::In(operand_array(field, op, operand)?),
        "$nin" => FieldCond::Nin(operand_array(field, op, operand)?),
        "$all" => FieldCond::All(operand_array(field, op, operand)?),
        "$size" => {
            let n = operand.as_i64().filter(|n| *n >= 0).ok_or_else(|| {
                EngineError::bad_query(format!(
                    "$size on {field:?} expects a non-negative integer"
                ))
            })?;
            FieldCond::Size(n as usize)
        }
        "$exists" => {
            let b = operand.as_bool().ok_or_else(|| {
                EngineError::bad_query(format!("$exists on {field:?} expects a boolean"))
            })?;
            FieldCond::Exists(b)
        }
        "$elemMatch" => {
            let sub = operand.as_doc().ok_or_else(|| {
                EngineError::bad_query(format!("$elemMatch on {field:?} expects a document"))
            })?;
            if is_operator_doc(sub) {
                FieldCond::ElemMatch(ElemPredicate::Ops(parse_operator_doc(field, sub)?))
            } else {
                FieldCond::ElemMatch(ElemPredicate::Doc(Box::new(Filter::parse(sub)?)))
            }
        }
        "$not" => {
            let sub = operand.as_doc().filter(|d| is_operator_doc(d)).ok_or_else(|| {
                EngineError::bad_query(format!(
                    "$not on {field:?} expects an operator document"
                ))
            })?;
            FieldCond::Not(parse_operator_doc(field, sub)?)
        }
        _ => {
            return Err(EngineError::bad_query(format!(
                "unknown operator {op:?} on field {field:?}"
            )));
        }
    })
}

fn operand_array(field: &str, op: &str, operand: &Value) -> EngineResult<Vec<Value>> {
    operand
        .as_array()
        .map(<[Value]>::to_vec)
        .ok_or_else(|| EngineError::bad_query(format!("{op} on {field:?} expects an array")))
}

/// Evaluates one condition against the (possibly absent) field value.
fn eval_cond(cond: &FieldCond, value: Option<&Value>) -> bool {
    match cond {
        FieldCond::Eq(q) => eq_matches(q, value),
        FieldCond::Ne(q) => !eq_matches(q, value),
        FieldCond::Gt(q) => ordered_matches(value, q, |o| o == Ordering::Greater),
        FieldCond::Gte(q) => ordered_matches(value, q, |o| o != Ordering::Less),
        FieldCond::Lt(q) => ordered_matches(value, q, |o| o == Ordering::Less),
        FieldCond::Lte(q) => ordered_matches(value, q, |o| o != Ordering::Greater),
        FieldCond::In(set) => set.iter().any(|q| eq_matches(q, value)),
        FieldCond::Nin(set) => !set.iter().any(|q| eq_matches(q, value)),
        FieldCond::All(required) => {
            let Some(value) = value else { return false };
            let members: &[Value] = match value {
                Value::Array(items) => items,
                single => std::slice::from_ref(single),
            };
            required
                .iter()
                .all(|q| members.iter().any(|m| query_eq(m, q)))
        }
        FieldCond::ElemMatch(pred) => {
            let Some(Value::Array(items)) = value else {
                return false;
            };
            items.iter().any(|elem| elem_matches(pred, elem))
        }
        FieldCond::Size(n) => {
            matches!(value, Some(Value::Array(items)) if items.len() == *n)
        }
        FieldCond::Exists(expected) => value.is_some() == *expected,
        FieldCond::Not(conds) => !conds.iter().all(|c| eval_cond(c, value)),
    }
}

/// Equality matching: the value itself, any array element, or, for a
/// null operand, an absent field.
fn eq_matches(q: &Value, value: Option<&Value>) -> bool {
    match value {
        None => q.is_null(),
        Some(v) => {
            if query_eq(v, q) {
                return true;
            }
            match v {
                Value::Array(items) => items.iter().any(|item| query_eq(item, q)),
                _ => false,
            }
        }
    }
}

/// Range matching: same type rank required, with implicit traversal into
/// array elements.
fn ordered_matches(value: Option<&Value>, q: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    let Some(value) = value else { return false };
    let one = |v: &Value| type_rank(v) == type_rank(q) && accept(total_cmp(v, q));
    match value {
        Value::Array(items) => items.iter().any(one),
        single => one(single),
    }
}

/// Element matching for `$elemMatch`; implicit array traversal is
/// disabled inside the sub-predicate.
fn elem_matches(pred: &ElemPredicate, elem: &Value) -> bool {
    match pred {
        ElemPredicate::Ops(conds) => conds.iter().all(|c| eval_elem_cond(c, elem)),
        ElemPredicate::Doc(filter) => match elem {
            Value::Doc(d) => filter.matches(d),
            _ => false,
        },
    }
}

/// Condition evaluation against an array element itself (no traversal).
fn eval_elem_cond(cond: &FieldCond, elem: &Value) -> bool {
    match cond {
        FieldCond::Eq(q) => query_eq(elem, q),
        FieldCond::Ne(q) => !query_eq(elem, q),
        FieldCond::Gt(q) => rank_cmp(elem, q).is_some_and(|o| o == Ordering::Greater),
        FieldCond::Gte(q) => rank_cmp(elem, q).is_some_and(|o| o != Ordering::Less),
        FieldCond::Lt(q) => rank_cmp(elem, q).is_some_and(|o| o == Ordering::Less),
        FieldCond::Lte(q) => rank_cmp(elem, q).is_some_and(|o| o != Ordering::Greater),
        FieldCond::In(set) => set.iter().any(|q| query_eq(elem, q)),
        FieldCond::Nin(set) => !set.iter().any(|q| query_eq(elem, q)),
        FieldCond::Not(conds) => !conds.iter().all(|c| eval_elem_cond(c, elem)),
        // Structural conditions fall back to ordinary evaluation with the
        // element in value position.
        other => eval_cond(other, Some(elem)),
    }
}

fn rank_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    (type_rank(a) == type_rank(b)).then(|| total_cmp(a, b))
}

/// Evaluates a standalone condition the way `$pull` needs: the operand of
/// `$pull` is either a literal (equality) or an operator document applied
/// to each element.
#[must_use]
pub(crate) fn pull_matches(conds: &[FieldCond], elem: &Value) -> bool {
    conds.iter().all(|c| eval_elem_cond(c, elem))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mainydb_codec::doc;

    fn matches(filter: Document, doc: &Document) -> bool {
        Filter::parse(&filter).unwrap().matches(doc)
    }

    #[test]
    fn literal_equality() {
        let d = doc! { "name": "John", "age": 30i64 };
        assert!(matches(doc! { "name": "John" }, &d));
        assert!(!matches(doc! { "name": "Jane" }, &d));
    }

    #[test]
    fn implicit_and_over_fields() {
        let d = doc! { "a": 1i64, "b": 2i64 };
        assert!(matches(doc! { "a": 1i64, "b": 2i64 }, &d));
        assert!(!matches(doc! { "a": 1i64, "b": 3i64 }, &d));
    }

    #[test]
    fn comparison_operators() {
        let d = doc! { "age": 30i64 };
        assert!(matches(doc! { "age": doc! { "$gt": 27i64 } }, &d));
        assert!(matches(doc! { "age": doc! { "$gte": 30i64 } }, &d));
        assert!(!matches(doc! { "age": doc! { "$lt": 30i64 } }, &d));
        assert!(matches(doc! { "age": doc! { "$lte": 30i64 } }, &d));
        assert!(matches(doc! { "age": doc! { "$ne": 31i64 } }, &d));
    }

    #[test]
    fn cross_type_numeric_equality() {
        let d = doc! { "n": 1i64 };
        assert!(matches(doc! { "n": 1.0 }, &d));
    }

    #[test]
    fn type_mismatch_is_false_not_error() {
        let d = doc! { "age": "thirty" };
        assert!(!matches(doc! { "age": doc! { "$gt": 27i64 } }, &d));
    }

    #[test]
    fn in_and_nin() {
        let d = doc! { "x": 2i64 };
        assert!(matches(doc! { "x": doc! { "$in": vec![1i64, 2, 3] } }, &d));
        assert!(!matches(doc! { "x": doc! { "$nin": vec![1i64, 2] } }, &d));
    }

    #[test]
    fn null_query_matches_absent_field() {
        let d = doc! { "a": 1i64 };
        assert!(matches(doc! { "b": Value::Null }, &d));
        assert!(!matches(doc! { "a": Value::Null }, &d));
    }

    #[test]
    fn exists() {
        let d = doc! { "a": Value::Null };
        assert!(matches(doc! { "a": doc! { "$exists": true } }, &d));
        assert!(matches(doc! { "b": doc! { "$exists": false } }, &d));
        assert!(!matches(doc! { "a": doc! { "$exists": false } }, &d));
    }

    #[test]
    fn implicit_array_traversal() {
        let d = doc! { "tags": vec!["red", "green"] };
        assert!(matches(doc! { "tags": "red" }, &d));
        assert!(!matches(doc! { "tags": "blue" }, &d));

        let n = doc! { "xs": vec![1i64, 5, 9] };
        assert!(matches(doc! { "xs": doc! { "$gt": 7i64 } }, &n));
    }

    #[test]
    fn whole_array_equality() {
        let d = doc! { "xs": vec![1i64, 2] };
        assert!(matches(doc! { "xs": Value::from(vec![1i64, 2]) }, &d));
    }

    #[test]
    fn all_operator() {
        let d = doc! { "tags": vec!["a", "b", "c"] };
        assert!(matches(
            doc! { "tags": doc! { "$all": vec!["a", "c"] } },
            &d
        ));
        assert!(!matches(
            doc! { "tags": doc! { "$all": vec!["a", "z"] } },
            &d
        ));
    }

    #[test]
    fn size_operator() {
        let d = doc! { "xs": vec![1i64, 2, 3] };
        assert!(matches(doc! { "xs": doc! { "$size": 3i64 } }, &d));
        assert!(!matches(doc! { "xs": doc! { "$size": 2i64 } }, &d));
        // $size never traverses into elements.
        let nested = doc! { "xs": Value::Array(vec![Value::from(vec![1i64, 2])]) };
        assert!(matches(doc! { "xs": doc! { "$size": 1i64 } }, &nested));
    }

    #[test]
    fn elem_match_with_field_operators() {
        let d = doc! {
            "reviews": Value::Array(vec![
                Value::Doc(doc! { "rating": 4.5, "user": "a" }),
                Value::Doc(doc! { "rating": 2.0, "user": "b" }),
            ])
        };
        assert!(matches(
            doc! { "reviews": doc! { "$elemMatch": doc! { "rating": doc! { "$gte": 4.0 } } } },
            &d
        ));
        assert!(!matches(
            doc! { "reviews": doc! { "$elemMatch": doc! { "rating": doc! { "$gt": 5.0 } } } },
            &d
        ));
    }

    #[test]
    fn elem_match_with_value_operators() {
        let d = doc! { "xs": vec![3i64, 8, 12] };
        assert!(matches(
            doc! { "xs": doc! { "$elemMatch": doc! { "$gt": 5i64, "$lt": 10i64 } } },
            &d
        ));
        // No single element can satisfy both bounds at once.
        assert!(!matches(
            doc! { "xs": doc! { "$elemMatch": doc! { "$gt": 5i64, "$lt": 4i64 } } },
            &d
        ));
    }

    #[test]
    fn logical_operators() {
        let d = doc! { "a": 1i64, "b": 2i64 };
        let or = doc! { "$or": Value::Array(vec![
            Value::Doc(doc! { "a": 9i64 }),
            Value::Doc(doc! { "b": 2i64 }),
        ]) };
        assert!(matches(or, &d));

        let nor = doc! { "$nor": Value::Array(vec![
            Value::Doc(doc! { "a": 9i64 }),
            Value::Doc(doc! { "b": 9i64 }),
        ]) };
        assert!(matches(nor, &d));
    }

    #[test]
    fn not_negates_operators_only() {
        let d = doc! { "a": 5i64 };
        assert!(matches(
            doc! { "a": doc! { "$not": doc! { "$gt": 10i64 } } },
            &d
        ));
        assert!(!matches(
            doc! { "a": doc! { "$not": doc! { "$gt": 1i64 } } },
            &d
        ));
        // $not also matches absent fields (the inner operator fails).
        assert!(matches(
            doc! { "z": doc! { "$not": doc! { "$gt": 1i64 } } },
            &d
        ));
    }

    #[test]
    fn dotted_paths() {
        let d = doc! { "specs": doc! { "ram": 16i64 } };
        assert!(matches(doc! { "specs.ram": doc! { "$gte": 8i64 } }, &d));
        assert!(!matches(doc! { "specs.disk": doc! { "$gte": 8i64 } }, &d));
    }

    #[test]
    fn unknown_operator_is_bad_query() {
        let err = Filter::parse(&doc! { "a": doc! { "$near": 1i64 } }).unwrap_err();
        assert!(matches!(err, EngineError::BadQuery { .. }));

        let err = Filter::parse(&doc! { "$xor": Value::Array(vec![]) }).unwrap_err();
        assert!(matches!(err, EngineError::BadQuery { .. }));
    }

    #[test]
    fn malformed_shapes_are_bad_query() {
        assert!(Filter::parse(&doc! { "$and": 1i64 }).is_err());
        assert!(Filter::parse(&doc! { "a": doc! { "$in": 1i64 } }).is_err());
        assert!(Filter::parse(&doc! { "a": doc! { "$size": -1i64 } }).is_err());
        assert!(Filter::parse(&doc! { "a": doc! { "$not": 3i64 } }).is_err());
    }

    #[test]
    fn empty_filter_matches_everything() {
        let f = Filter::parse(&doc! {}).unwrap();
        assert!(f.matches(&doc! { "anything": 1i64 }));
        assert!(f.matches(&doc! {}));
    }
}

//! Pipeline stage parsing.

use crate::aggregate::expr::Expr;
use crate::error::{EngineError, EngineResult};
use crate::query::{Filter, Projection};
use mainydb_codec::{Document, Value};

/// One parsed pipeline stage.
#[derive(Debug, Clone)]
pub enum Stage {
    /// `$match`: filter pass-through.
    Match(Filter),
    /// `$project`: reshape each document.
    Project(Projection),
    /// `$addFields`: add or overwrite fields, never removing any.
    AddFields(Vec<(String, Expr)>),
    /// `$group`: bucket by key expression and accumulate.
    Group {
        /// The `_id` grouping expression.
        key: Expr,
        /// Accumulated output fields.
        accums: Vec<GroupAccum>,
    },
    /// `$sort`: buffer and stable-sort.
    Sort(Vec<(String, i8)>),
    /// `$limit`: pass at most N documents.
    Limit(usize),
    /// `$skip`: drop the first N documents.
    Skip(usize),
    /// `$unwind`: one output per array element.
    Unwind(String),
    /// `$count`: emit a single `{field: N}` document.
    Count(String),
    /// `$lookup`: left outer join against another collection.
    Lookup {
        /// Foreign collection name.
        from: String,
        /// Path in the input document.
        local_field: String,
        /// Path in the foreign documents.
        foreign_field: String,
        /// Output array field.
        as_field: String,
    },
}

/// One accumulator inside a `$group`.
#[derive(Debug, Clone)]
pub struct GroupAccum {
    /// Output field name.
    pub field: String,
    /// The accumulator operator.
    pub op: AccumOp,
    /// The per-document input expression.
    pub expr: Expr,
}

/// Group accumulator operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumOp {
    /// Numeric sum; non-numeric inputs are ignored.
    Sum,
    /// Numeric average.
    Avg,
    /// Smallest value under the total order.
    Min,
    /// Largest value under the total order.
    Max,
    /// First value seen.
    First,
    /// Last value seen.
    Last,
    /// Collect every value into an array.
    Push,
    /// Collect distinct values into an array.
    AddToSet,
}

impl AccumOp {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "$sum" => Self::Sum,
            "$avg" => Self::Avg,
            "$min" => Self::Min,
            "$max" => Self::Max,
            "$first" => Self::First,
            "$last" => Self::Last,
            "$push" => Self::Push,
            "$addToSet" => Self::AddToSet,
            _ => return None,
        })
    }
}

impl Stage {
    /// Parses one stage document (exactly one `$stage` key).
    pub fn parse(stage: &Document) -> EngineResult<Self> {
        if stage.len() != 1 {
            return Err(EngineError::bad_pipeline(
                "each pipeline stage must have exactly one key",
            ));
        }
        let (name, spec) = stage.iter().next().ok_or_else(|| {
            EngineError::bad_pipeline("each pipeline stage must have exactly one key")
        })?;

        match name {
            "$match" => {
                let filter = spec.as_doc().ok_or_else(|| {
                    EngineError::bad_pipeline("$match expects a filter document")
                })?;
                Ok(Stage::Match(Filter::parse(filter).map_err(reclassify)?))
            }
            "$project" => {
                let proj = spec.as_doc().ok_or_else(|| {
                    EngineError::bad_pipeline("$project expects a document")
                })?;
                Ok(Stage::Project(
                    Projection::parse(proj, true).map_err(reclassify)?,
                ))
            }
            "$addFields" => {
                let fields = spec.as_doc().ok_or_else(|| {
                    EngineError::bad_pipeline("$addFields expects a document")
                })?;
                if fields.is_empty() {
                    return Err(EngineError::bad_pipeline("$addFields must name a field"));
                }
                let mut parsed = Vec::with_capacity(fields.len());
                for (field, expr) in fields.iter() {
                    parsed.push((field.to_string(), Expr::parse(expr)?));
                }
                Ok(Stage::AddFields(parsed))
            }
            "$group" => parse_group(spec),
            "$sort" => Ok(Stage::Sort(parse_sort_spec(spec)?)),
            "$limit" => Ok(Stage::Limit(non_negative(name, spec)?)),
            "$skip" => Ok(Stage::Skip(non_negative(name, spec)?)),
            "$unwind" => {
                let field = spec.as_str().and_then(|s| s.strip_prefix('$')).ok_or_else(|| {
                    EngineError::bad_pipeline("$unwind expects a \"$field\" path")
                })?;
                Ok(Stage::Unwind(field.to_string()))
            }
            "$count" => {
                let field = spec.as_str().filter(|s| !s.is_empty()).ok_or_else(|| {
                    EngineError::bad_pipeline("$count expects a non-empty field name")
                })?;
                Ok(Stage::Count(field.to_string()))
            }
            "$lookup" => parse_lookup(spec),
            other => Err(EngineError::bad_pipeline(format!(
                "unknown pipeline stage {other:?}"
            ))),
        }
    }
}

/// A `$sort` specification: `{path: ±1, …}` in spec order.
pub fn parse_sort_spec(spec: &Value) -> EngineResult<Vec<(String, i8)>> {
    let doc = spec
        .as_doc()
        .filter(|d| !d.is_empty())
        .ok_or_else(|| EngineError::bad_pipeline("$sort expects a non-empty document"))?;
    let mut keys = Vec::with_capacity(doc.len());
    for (path, dir) in doc.iter() {
        let dir = match dir.as_i64() {
            Some(1) => 1i8,
            Some(-1) => -1i8,
            _ => {
                return Err(EngineError::bad_pipeline(format!(
                    "sort direction for {path:?} must be 1 or -1"
                )));
            }
        };
        keys.push((path.to_string(), dir));
    }
    Ok(keys)
}

fn non_negative(stage: &str, spec: &Value) -> EngineResult<usize> {
    spec.as_i64()
        .filter(|n| *n >= 0)
        .map(|n| n as usize)
        .ok_or_else(|| {
            EngineError::bad_pipeline(format!("{stage} expects a non-negative integer"))
        })
}

fn parse_group(spec: &Value) -> EngineResult<Stage> {
    let doc = spec
        .as_doc()
        .ok_or_else(|| EngineError::bad_pipeline("$group expects a document"))?;
    let key = doc
        .get("_id")
        .ok_or_else(|| EngineError::bad_pipeline("$group requires an _id expression"))?;
    let key = Expr::parse(key)?;

    let mut accums = Vec::new();
    for (field, accum) in doc.iter() {
        if field == "_id" {
            continue;
        }
        let accum = accum
            .as_doc()
            .filter(|d| d.len() == 1)
            .ok_or_else(|| {
                EngineError::bad_pipeline(format!(
                    "accumulator for {field:?} must be a single-operator document"
                ))
            })?;
        let (op_name, expr) = accum.iter().next().ok_or_else(|| {
            EngineError::bad_pipeline(format!("accumulator for {field:?} is empty"))
        })?;
        let op = AccumOp::parse(op_name).ok_or_else(|| {
            EngineError::bad_pipeline(format!("unknown accumulator {op_name:?}"))
        })?;
        accums.push(GroupAccum {
            field: field.to_string(),
            op,
            expr: Expr::parse(expr)?,
        });
    }
    Ok(Stage::Group { key, accums })
}

fn parse_lookup(spec: &Value) -> EngineResult<Stage> {
    let doc = spec
        .as_doc()
        .ok_or_else(|| EngineError::bad_pipeline("$lookup expects a document"))?;
    let text_field = |name: &str| -> EngineResult<String> {
        doc.get(name)
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| {
                EngineError::bad_pipeline(format!("$lookup requires a string {name:?}"))
            })
    };
    Ok(Stage::Lookup {
        from: text_field("from")?,
        local_field: text_field("localField")?,
        foreign_field: text_field("foreignField")?,
        as_field: text_field("as")?,
    })
}

/// Filter/projection errors inside a pipeline surface as `BadPipeline`.
fn reclassify(err: EngineError) -> EngineError {
    match err {
        EngineError::BadQuery { message } => EngineError::BadPipeline { message },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mainydb_codec::doc;

    #[test]
    fn parses_match() {
        let s = Stage::parse(&doc! { "$match": doc! { "a": 1i64 } }).unwrap();
        assert!(matches!(s, Stage::Match(_)));
    }

    #[test]
    fn bad_match_filter_is_bad_pipeline() {
        let err = Stage::parse(&doc! { "$match": doc! { "a": doc! { "$bogus": 1i64 } } })
            .unwrap_err();
        assert!(matches!(err, EngineError::BadPipeline { .. }));
    }

    #[test]
    fn parses_group_with_accumulators() {
        let s = Stage::parse(&doc! { "$group": doc! {
            "_id": "$cat",
            "s": doc! { "$sum": "$v" },
            "n": doc! { "$sum": 1i64 },
        } })
        .unwrap();
        match s {
            Stage::Group { accums, .. } => {
                assert_eq!(accums.len(), 2);
                assert_eq!(accums[0].field, "s");
                assert_eq!(accums[0].op, AccumOp::Sum);
            }
            other => panic!("expected group, got {other:?}"),
        }
    }

    #[test]
    fn group_without_id_is_rejected() {
        let err = Stage::parse(&doc! { "$group": doc! { "s": doc! { "$sum": 1i64 } } })
            .unwrap_err();
        assert!(matches!(err, EngineError::BadPipeline { .. }));
    }

    #[test]
    fn negative_limit_and_skip_are_rejected() {
        assert!(Stage::parse(&doc! { "$limit": -1i64 }).is_err());
        assert!(Stage::parse(&doc! { "$skip": -3i64 }).is_err());
        assert!(matches!(
            Stage::parse(&doc! { "$limit": 4i64 }).unwrap(),
            Stage::Limit(4)
        ));
    }

    #[test]
    fn unwind_requires_dollar_path() {
        assert!(Stage::parse(&doc! { "$unwind": "items" }).is_err());
        assert!(matches!(
            Stage::parse(&doc! { "$unwind": "$items" }).unwrap(),
            Stage::Unwind(f) if f == "items"
        ));
    }

    #[test]
    fn sort_spec_directions() {
        let keys = parse_sort_spec(&Value::Doc(doc! { "a": 1i64, "b": -1i64 })).unwrap();
        assert_eq!(keys, vec![("a".to_string(), 1), ("b".to_string(), -1)]);

        assert!(parse_sort_spec(&Value::Doc(doc! { "a": 2i64 })).is_err());
    }

    #[test]
    fn lookup_requires_all_fields() {
        let s = Stage::parse(&doc! { "$lookup": doc! {
            "from": "orders",
            "localField": "_id",
            "foreignField": "user_id",
            "as": "orders",
        } })
        .unwrap();
        assert!(matches!(s, Stage::Lookup { .. }));

        assert!(Stage::parse(&doc! { "$lookup": doc! { "from": "orders" } }).is_err());
    }

    #[test]
    fn two_keys_in_one_stage_is_rejected() {
        let err = Stage::parse(&doc! { "$limit": 1i64, "$skip": 2i64 }).unwrap_err();
        assert!(matches!(err, EngineError::BadPipeline { .. }));
    }

    #[test]
    fn unknown_stage_is_rejected() {
        let err = Stage::parse(&doc! { "$facet": doc! {} }).unwrap_err();
        assert!(matches!(err, EngineError::BadPipeline { .. }));
    }
}

//! Projection documents.
//!
//! A projection is either an inclusion (`{field: 1, …}`, keeping only
//! the listed fields) or an exclusion (`{field: 0, …}`, removing the
//! listed fields). `_id` is included by default and only dropped when
//! explicitly set to 0. Inclusion projections may also compute derived
//! fields from aggregation expressions; those are attached by the
//! `$project` stage.

use crate::aggregate::Expr;
use crate::error::{EngineError, EngineResult};
use crate::path;
use mainydb_codec::{Document, Value};

/// A compiled projection.
#[derive(Debug, Clone)]
pub enum Projection {
    /// Keep only the listed paths (plus `_id` unless suppressed).
    Include {
        /// Paths to keep.
        paths: Vec<String>,
        /// Derived fields computed from expressions, in spec order.
        computed: Vec<(String, Expr)>,
        /// Whether `_id` survives.
        keep_id: bool,
    },
    /// Remove the listed paths.
    Exclude {
        /// Paths to remove.
        paths: Vec<String>,
        /// Whether `_id` survives.
        keep_id: bool,
    },
}

impl Projection {
    /// Compiles a projection document.
    ///
    /// `allow_expressions` is true for `$project` stages; plain `find`
    /// projections accept only 0/1 markers.
    pub fn parse(spec: &Document, allow_expressions: bool) -> EngineResult<Self> {
        let mut include: Vec<String> = Vec::new();
        let mut exclude: Vec<String> = Vec::new();
        let mut computed: Vec<(String, Expr)> = Vec::new();
        let mut keep_id = true;
        let mut id_included = false;

        for (field, marker) in spec.iter() {
            let included = match marker {
                Value::Int(0) | Value::Bool(false) => false,
                Value::Int(_) | Value::Bool(true) => true,
                Value::Float(f) => *f != 0.0,
                other => {
                    if !allow_expressions {
                        return Err(EngineError::bad_query(format!(
                            "projection value for {field:?} must be 0 or 1"
                        )));
                    }
                    computed.push((field.to_string(), Expr::parse(other)?));
                    continue;
                }
            };

            if field == "_id" {
                keep_id = included;
                id_included = included;
            } else if included {
                include.push(field.to_string());
            } else {
                exclude.push(field.to_string());
            }
        }

        if !include.is_empty() && !exclude.is_empty() {
            return Err(EngineError::bad_query(
                "projection cannot mix inclusion and exclusion",
            ));
        }

        if include.is_empty() && computed.is_empty() && !exclude.is_empty() {
            Ok(Projection::Exclude {
                paths: exclude,
                keep_id,
            })
        } else {
            // A bare {_id: 0} is an exclusion; {_id: 1} is the inclusion
            // of _id alone.
            if include.is_empty() && computed.is_empty() {
                if !keep_id {
                    return Ok(Projection::Exclude {
                        paths: Vec::new(),
                        keep_id,
                    });
                }
                if !id_included {
                    return Err(EngineError::bad_query("empty projection"));
                }
            }
            Ok(Projection::Include {
                paths: include,
                computed,
                keep_id,
            })
        }
    }

    /// Applies the projection to a document, producing the output doc.
    ///
    /// Computed fields evaluate against the *input* document; expression
    /// failures propagate.
    pub fn apply(&self, doc: &Document) -> EngineResult<Document> {
        match self {
            Projection::Include {
                paths,
                computed,
                keep_id,
            } => {
                let mut out = Document::new();
                if *keep_id {
                    if let Some(id) = doc.get("_id") {
                        out.set("_id", id.clone());
                    }
                }
                for p in paths {
                    if let Some(v) = path::resolve(doc, p) {
                        path::set_path(&mut out, p, v.clone())
                            .map_err(|_| EngineError::bad_query(format!("bad projection path {p:?}")))?;
                    }
                }
                for (field, expr) in computed {
                    if let Some(v) = expr.eval(doc)? {
                        path::set_path(&mut out, field, v)
                            .map_err(|_| EngineError::bad_query(format!("bad projection path {field:?}")))?;
                    }
                }
                Ok(out)
            }
            Projection::Exclude { paths, keep_id } => {
                let mut out = doc.clone();
                for p in paths {
                    path::remove_path(&mut out, p);
                }
                if !*keep_id {
                    out.remove("_id");
                }
                Ok(out)
            }
        }
    }
}

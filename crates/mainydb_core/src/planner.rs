//! Access-path selection.
//!
//! Given a compiled filter and a collection's index set, the planner
//! picks how to enumerate candidate documents: a full scan in insertion
//! order, or an index probe/range. The full filter is always re-applied
//! to candidates as a residual predicate, so the planner never has to
//! prove an index fully satisfies the filter.
//!
//! Selection is deterministic for a given index set. Candidate scoring:
//! equality on every index key beats a range on the first key, which
//! beats equality on a leading prefix only.

use crate::index::{IndexKind, IndexSet};
use crate::query::{FieldCond, Filter};
use mainydb_codec::{Document, Value};
use std::collections::BTreeMap;
use std::ops::Bound;

/// How candidate documents will be enumerated.
#[derive(Debug, Clone)]
pub enum AccessPath {
    /// Full collection scan in insertion order.
    Scan,
    /// Equality probe on an index key prefix.
    IndexEq {
        /// Index name.
        index: String,
        /// Values for the leading key components.
        prefix: Vec<Value>,
    },
    /// `$in` probe: one equality probe per listed value.
    IndexIn {
        /// Index name.
        index: String,
        /// The values to probe.
        values: Vec<Value>,
    },
    /// Range over the first key component.
    IndexRange {
        /// Index name.
        index: String,
        /// Lower bound in value space.
        lower: Bound<Value>,
        /// Upper bound in value space.
        upper: Bound<Value>,
    },
    /// Union of branch paths (from `$or`); results are deduplicated.
    Union(Vec<AccessPath>),
}

/// A chosen plan.
#[derive(Debug, Clone)]
pub struct Plan {
    /// The access path.
    pub access: AccessPath,
    /// Whether the requested sort is satisfied by index order.
    pub sorted: bool,
}

impl Plan {
    /// Renders the plan as a document, for `explain` and tests.
    #[must_use]
    pub fn describe(&self) -> Document {
        let mut out = Document::new();
        describe_access(&self.access, &mut out);
        out.set("sorted_by_index", self.sorted);
        out
    }
}

fn describe_access(access: &AccessPath, out: &mut Document) {
    match access {
        AccessPath::Scan => out.set("access", "scan"),
        AccessPath::IndexEq { index, .. } => {
            out.set("access", "index");
            out.set("index", index.as_str());
            out.set("mode", "eq");
        }
        AccessPath::IndexIn { index, .. } => {
            out.set("access", "index");
            out.set("index", index.as_str());
            out.set("mode", "in");
        }
        AccessPath::IndexRange { index, .. } => {
            out.set("access", "index");
            out.set("index", index.as_str());
            out.set("mode", "range");
        }
        AccessPath::Union(branches) => {
            out.set("access", "union");
            out.set("branches", branches.len() as i64);
        }
    }
}

/// Per-path predicates the planner can push into an index.
#[derive(Debug, Default, Clone)]
struct PathPred {
    eq: Option<Value>,
    in_set: Option<Vec<Value>>,
    lower: Option<(Value, bool)>,
    upper: Option<(Value, bool)>,
}

/// Plans a filter against an index set.
#[must_use]
pub fn plan(filter: &Filter, indexes: &IndexSet, sort: Option<&[(String, i8)]>) -> Plan {
    let access = match filter {
        Filter::Or(branches) => plan_or(branches, indexes),
        other => plan_conjunction(other, indexes),
    };
    let sorted = sort.is_some_and(|spec| sort_satisfied(&access, indexes, spec));
    Plan { access, sorted }
}

/// Every `$or` branch must be independently index-usable.
fn plan_or(branches: &[Filter], indexes: &IndexSet) -> AccessPath {
    let mut paths = Vec::with_capacity(branches.len());
    for branch in branches {
        let access = match branch {
            Filter::Or(inner) => plan_or(inner, indexes),
            other => plan_conjunction(other, indexes),
        };
        if matches!(access, AccessPath::Scan) {
            return AccessPath::Scan;
        }
        paths.push(access);
    }
    if paths.is_empty() {
        AccessPath::Scan
    } else {
        AccessPath::Union(paths)
    }
}

fn plan_conjunction(filter: &Filter, indexes: &IndexSet) -> AccessPath {
    let mut preds: BTreeMap<String, PathPred> = BTreeMap::new();
    gather(filter, &mut preds);

    let mut best: Option<(u32, AccessPath)> = None;
    for index in indexes.iter() {
        let Some((score, access)) = score_index(index, &preds) else {
            continue;
        };
        // Strictly-greater keeps the earliest index on ties, which makes
        // planning deterministic for a given index set.
        if best.as_ref().map_or(true, |(s, _)| score > *s) {
            best = Some((score, access));
        }
    }
    best.map_or(AccessPath::Scan, |(_, access)| access)
}

/// Collects index-usable predicates from the top level of a conjunction.
fn gather(filter: &Filter, preds: &mut BTreeMap<String, PathPred>) {
    match filter {
        Filter::And(subs) => {
            for sub in subs {
                gather(sub, preds);
            }
        }
        Filter::Field { path, conds } => {
            let entry = preds.entry(path.clone()).or_default();
            for cond in conds {
                match cond {
                    FieldCond::Eq(v) => entry.eq = Some(v.clone()),
                    FieldCond::In(vs) => entry.in_set = Some(vs.clone()),
                    FieldCond::Gt(v) => entry.lower = Some((v.clone(), false)),
                    FieldCond::Gte(v) => entry.lower = Some((v.clone(), true)),
                    FieldCond::Lt(v) => entry.upper = Some((v.clone(), false)),
                    FieldCond::Lte(v) => entry.upper = Some((v.clone(), true)),
                    // Everything else stays in the residual predicate.
                    _ => {}
                }
            }
        }
        // $or handled at the top; $nor never narrows an access path.
        Filter::Or(_) | Filter::Nor(_) => {}
    }
}

fn score_index(index: &crate::index::Index, preds: &BTreeMap<String, PathPred>) -> Option<(u32, AccessPath)> {
    let def = index.def();
    let keys = &def.keys;

    // Leading keys covered by equality.
    let mut prefix = Vec::new();
    for (path, _) in keys {
        match preds.get(path).and_then(|p| p.eq.as_ref()) {
            Some(v) => prefix.push(v.clone()),
            None => break,
        }
    }

    if prefix.len() == keys.len() {
        return Some((
            100,
            AccessPath::IndexEq {
                index: def.name.clone(),
                prefix,
            },
        ));
    }

    // Hashed indexes only answer full-tuple equality.
    if def.kind == IndexKind::Hashed {
        return None;
    }

    let first = preds.get(&keys[0].0);

    if keys.len() == 1 {
        if let Some(values) = first.and_then(|p| p.in_set.clone()) {
            return Some((
                80,
                AccessPath::IndexIn {
                    index: def.name.clone(),
                    values,
                },
            ));
        }
    }

    if let Some(p) = first {
        if p.lower.is_some() || p.upper.is_some() {
            let lower = p.lower.clone().map_or(Bound::Unbounded, |(v, inclusive)| {
                if inclusive {
                    Bound::Included(v)
                } else {
                    Bound::Excluded(v)
                }
            });
            let upper = p.upper.clone().map_or(Bound::Unbounded, |(v, inclusive)| {
                if inclusive {
                    Bound::Included(v)
                } else {
                    Bound::Excluded(v)
                }
            });
            return Some((
                60,
                AccessPath::IndexRange {
                    index: def.name.clone(),
                    lower,
                    upper,
                },
            ));
        }
    }

    if !prefix.is_empty() {
        let score = 40 + prefix.len() as u32;
        return Some((
            score,
            AccessPath::IndexEq {
                index: def.name.clone(),
                prefix,
            },
        ));
    }

    None
}

/// Sort pushdown: the requested sort keys must be a prefix of the chosen
/// index's keys with matching directions.
fn sort_satisfied(access: &AccessPath, indexes: &IndexSet, sort: &[(String, i8)]) -> bool {
    let index_name = match access {
        AccessPath::IndexEq { index, .. } | AccessPath::IndexRange { index, .. } => index,
        // Unions and multi-probe $in interleave key ranges.
        _ => return false,
    };
    let Some(index) = indexes.get(index_name) else {
        return false;
    };
    if index.def().kind != IndexKind::Ordered || sort.is_empty() {
        return false;
    }
    sort.len() <= index.def().keys.len()
        && sort
            .iter()
            .zip(index.def().keys.iter())
            .all(|((sp, sd), (ip, id))| sp == ip && sd == id)
}

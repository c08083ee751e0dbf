//! The aggregation pipeline executor.
//!
//! Stages compose as lazy cursors: stage N pulls from stage N−1 and does
//! its work per-document, except for the blocking stages (`$group`,
//! `$sort`, `$count`), which materialize their input before emitting.
//! Errors flow through the stream as items and end iteration at the
//! caller.

mod expr;
mod stage;

pub use expr::{Expr, ExprOp};
pub use stage::{parse_sort_spec, AccumOp, GroupAccum, Stage};

use crate::cursor::CancelToken;
use crate::error::{EngineError, EngineResult};
use crate::path;
use mainydb_codec::{query_eq, sort_cmp, total_cmp, Document, Value};
use std::cmp::Ordering;
use std::sync::Arc;

/// How often blocking stages poll the cancel token, in rows.
const CANCEL_EVERY: usize = 1024;

/// A stream of documents flowing between stages.
pub type DocStream = Box<dyn Iterator<Item = EngineResult<Document>>>;

/// Resolves `$lookup` joins against foreign collections.
///
/// The implementation takes the foreign collection's read lock only for
/// the duration of one probe, after the source collection's lock has
/// been released, which keeps the lock hierarchy acyclic.
pub trait ForeignFetch {
    /// All documents of `from` whose value at `foreign_field` equals
    /// `local` under query equality.
    fn foreign_matches(
        &self,
        from: &str,
        foreign_field: &str,
        local: &Value,
    ) -> EngineResult<Vec<Document>>;
}

/// A parsed pipeline.
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    /// Parses a pipeline from its stage documents.
    pub fn parse(stages: &[Value]) -> EngineResult<Self> {
        let stages = stages
            .iter()
            .map(|s| {
                s.as_doc()
                    .ok_or_else(|| EngineError::bad_pipeline("pipeline stages must be documents"))
                    .and_then(Stage::parse)
            })
            .collect::<EngineResult<Vec<_>>>()?;
        Ok(Self { stages })
    }

    /// The parsed stages, in order.
    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Composes the stages over a source stream.
    pub fn execute(
        self,
        source: DocStream,
        fetch: Arc<dyn ForeignFetch>,
        cancel: CancelToken,
    ) -> DocStream {
        let mut stream = source;
        for stage in self.stages {
            stream = apply_stage(stage, stream, Arc::clone(&fetch), cancel.clone());
        }
        // One cancellation check per yielded document at the pipeline
        // boundary.
        let mut done = false;
        Box::new(std::iter::from_fn(move || {
            if done {
                return None;
            }
            if let Err(err) = cancel.check() {
                done = true;
                return Some(Err(err));
            }
            match stream.next() {
                Some(Err(err)) => {
                    done = true;
                    Some(Err(err))
                }
                other => other,
            }
        }))
    }
}

fn apply_stage(
    stage: Stage,
    input: DocStream,
    fetch: Arc<dyn ForeignFetch>,
    cancel: CancelToken,
) -> DocStream {
    match stage {
        Stage::Match(filter) => Box::new(input.filter(move |item| match item {
            Ok(doc) => filter.matches(doc),
            Err(_) => true,
        })),
        Stage::Project(projection) => {
            Box::new(input.map(move |item| item.and_then(|doc| projection.apply(&doc))))
        }
        Stage::AddFields(fields) => Box::new(input.map(move |item| {
            let mut doc = item?;
            for (field, expr) in &fields {
                if let Some(value) = expr.eval(&doc)? {
                    path::set_path(&mut doc, field, value)
                        .map_err(|_| EngineError::bad_pipeline(format!("bad field path {field:?}")))?;
                }
            }
            Ok(doc)
        })),
        Stage::Unwind(field) => Box::new(input.flat_map(move |item| -> Vec<EngineResult<Document>> {
            let doc = match item {
                Ok(doc) => doc,
                Err(err) => return vec![Err(err)],
            };
            match path::resolve(&doc, &field).cloned() {
                // Absent and empty arrays drop the document.
                None => Vec::new(),
                Some(Value::Array(items)) if items.is_empty() => Vec::new(),
                Some(Value::Array(items)) => items
                    .into_iter()
                    .map(|element| {
                        let mut out = doc.clone();
                        path::set_path(&mut out, &field, element)
                            .map_err(|_| {
                                EngineError::bad_pipeline(format!("bad unwind path {field:?}"))
                            })
                            .map(|()| out)
                    })
                    .collect(),
                // Non-array values pass through unchanged.
                Some(_) => vec![Ok(doc)],
            }
        })),
        Stage::Limit(n) => {
            let mut passed = 0usize;
            Box::new(input.take_while(move |item| {
                if item.is_err() {
                    return true;
                }
                passed += 1;
                passed <= n
            }))
        }
        Stage::Skip(n) => {
            let mut skipped = 0usize;
            Box::new(input.filter(move |item| {
                if item.is_err() {
                    return true;
                }
                if skipped < n {
                    skipped += 1;
                    false
                } else {
                    true
                }
            }))
        }
        Stage::Sort(keys) => {
            let cancel = cancel.clone();
            Box::new(once_blocking(move || {
                let mut docs = drain(input, &cancel)?;
                docs.sort_by(|a, b| {
                    for (path, dir) in &keys {
                        let va = path::resolve(a, path).unwrap_or(&Value::Null);
                        let vb = path::resolve(b, path).unwrap_or(&Value::Null);
                        let ord = sort_cmp(va, vb, *dir < 0);
                        if ord != Ordering::Equal {
                            return ord;
                        }
                    }
                    Ordering::Equal
                });
                Ok(docs)
            }))
        }
        Stage::Count(field) => {
            let cancel = cancel.clone();
            Box::new(once_blocking(move || {
                let mut count: i64 = 0;
                for (rows, item) in input.enumerate() {
                    if rows % CANCEL_EVERY == 0 {
                        cancel.check()?;
                    }
                    item?;
                    count += 1;
                }
                let mut out = Document::new();
                out.set(field.as_str(), count);
                Ok(vec![out])
            }))
        }
        Stage::Group { key, accums } => {
            let cancel = cancel.clone();
            Box::new(once_blocking(move || group(input, &key, &accums, &cancel)))
        }
        Stage::Lookup {
            from,
            local_field,
            foreign_field,
            as_field,
        } => Box::new(input.map(move |item| {
            let mut doc = item?;
            let local = path::resolve(&doc, &local_field)
                .cloned()
                .unwrap_or(Value::Null);
            let matches = fetch.foreign_matches(&from, &foreign_field, &local)?;
            let joined: Vec<Value> = matches.into_iter().map(Value::Doc).collect();
            path::set_path(&mut doc, &as_field, Value::Array(joined))
                .map_err(|_| EngineError::bad_pipeline(format!("bad lookup path {as_field:?}")))?;
            Ok(doc)
        })),
    }
}

/// Runs a blocking stage's body on first pull, then yields its output.
fn once_blocking<'a, F>(body: F) -> impl Iterator<Item = EngineResult<Document>> + 'a
where
    F: FnOnce() -> EngineResult<Vec<Document>> + 'a,
{
    let mut body = Some(body);
    let mut out: Option<std::vec::IntoIter<Document>> = None;
    std::iter::from_fn(move || {
        if let Some(body) = body.take() {
            match body() {
                Ok(docs) => out = Some(docs.into_iter()),
                Err(err) => return Some(Err(err)),
            }
        }
        out.as_mut()?.next().map(Ok)
    })
}

fn drain(input: DocStream, cancel: &CancelToken) -> EngineResult<Vec<Document>> {
    let mut docs = Vec::new();
    for (rows, item) in input.enumerate() {
        if rows % CANCEL_EVERY == 0 {
            cancel.check()?;
        }
        docs.push(item?);
    }
    Ok(docs)
}

struct GroupSlot {
    key: Value,
    states: Vec<AccumState>,
}

enum AccumState {
    Sum(Value),
    Avg { total: f64, count: u64 },
    Min(Option<Value>),
    Max(Option<Value>),
    First { taken: bool, value: Option<Value> },
    Last(Option<Value>),
    Push(Vec<Value>),
    AddToSet(Vec<Value>),
}

impl AccumState {
    fn new(op: AccumOp) -> Self {
        match op {
            AccumOp::Sum => Self::Sum(Value::Int(0)),
            AccumOp::Avg => Self::Avg {
                total: 0.0,
                count: 0,
            },
            AccumOp::Min => Self::Min(None),
            AccumOp::Max => Self::Max(None),
            AccumOp::First => Self::First {
                taken: false,
                value: None,
            },
            AccumOp::Last => Self::Last(None),
            AccumOp::Push => Self::Push(Vec::new()),
            AccumOp::AddToSet => Self::AddToSet(Vec::new()),
        }
    }

    fn feed(&mut self, value: Option<Value>) {
        match self {
            Self::Sum(acc) => {
                // Non-numeric inputs are ignored, like $sum over a
                // string field.
                if let Some(v) = value.filter(Value::is_number) {
                    *acc = add_numeric(acc, &v);
                }
            }
            Self::Avg { total, count } => {
                if let Some(f) = value.as_ref().and_then(Value::as_f64) {
                    *total += f;
                    *count += 1;
                }
            }
            Self::Min(best) => {
                if let Some(v) = value.filter(|v| !v.is_null()) {
                    let replace = best
                        .as_ref()
                        .map_or(true, |b| total_cmp(&v, b) == Ordering::Less);
                    if replace {
                        *best = Some(v);
                    }
                }
            }
            Self::Max(best) => {
                if let Some(v) = value.filter(|v| !v.is_null()) {
                    let replace = best
                        .as_ref()
                        .map_or(true, |b| total_cmp(&v, b) == Ordering::Greater);
                    if replace {
                        *best = Some(v);
                    }
                }
            }
            Self::First { taken, value: slot } => {
                if !*taken {
                    *taken = true;
                    *slot = value;
                }
            }
            Self::Last(slot) => *slot = value,
            Self::Push(items) => {
                if let Some(v) = value {
                    items.push(v);
                }
            }
            Self::AddToSet(items) => {
                if let Some(v) = value {
                    if !items.iter().any(|m| query_eq(m, &v)) {
                        items.push(v);
                    }
                }
            }
        }
    }

    fn finish(self) -> Option<Value> {
        match self {
            Self::Sum(acc) => Some(acc),
            Self::Avg { total, count } => {
                if count == 0 {
                    Some(Value::Null)
                } else {
                    #[allow(clippy::cast_precision_loss)]
                    Some(Value::Float(total / count as f64))
                }
            }
            Self::Min(best) | Self::Max(best) => Some(best.unwrap_or(Value::Null)),
            Self::First { value, .. } | Self::Last(value) => value,
            Self::Push(items) | Self::AddToSet(items) => Some(Value::Array(items)),
        }
    }
}

fn add_numeric(acc: &Value, v: &Value) -> Value {
    match (acc, v) {
        (Value::Int(a), Value::Int(b)) => match a.checked_add(*b) {
            Some(n) => Value::Int(n),
            // Widen on overflow instead of failing the whole group.
            None => Value::Float(*a as f64 + *b as f64),
        },
        _ => Value::Float(acc.as_f64().unwrap_or(0.0) + v.as_f64().unwrap_or(0.0)),
    }
}

fn group(
    input: DocStream,
    key: &Expr,
    accums: &[GroupAccum],
    cancel: &CancelToken,
) -> EngineResult<Vec<Document>> {
    // First-seen key order; keys compare under the total order so 1 and
    // 1.0 land in the same bucket.
    let mut slots: Vec<GroupSlot> = Vec::new();

    for (rows, item) in input.enumerate() {
        if rows % CANCEL_EVERY == 0 {
            cancel.check()?;
        }
        let doc = item?;
        let key_value = key.eval(&doc)?.unwrap_or(Value::Null);

        let slot = match slots
            .iter_mut()
            .find(|s| total_cmp(&s.key, &key_value) == Ordering::Equal)
        {
            Some(slot) => slot,
            None => {
                slots.push(GroupSlot {
                    key: key_value,
                    states: accums.iter().map(|a| AccumState::new(a.op)).collect(),
                });
                slots.last_mut().expect("just pushed")
            }
        };

        for (state, accum) in slot.states.iter_mut().zip(accums.iter()) {
            state.feed(accum.expr.eval(&doc)?);
        }
    }

    Ok(slots
        .into_iter()
        .map(|slot| {
            let mut out = Document::with_capacity(accums.len() + 1);
            out.set("_id", slot.key);
            for (state, accum) in slot.states.into_iter().zip(accums.iter()) {
                if let Some(value) = state.finish() {
                    out.set(accum.field.as_str(), value);
                }
            }
            out
        })
        .collect())
}

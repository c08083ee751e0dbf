//! Index key tuples and document ids.

use mainydb_codec::{total_cmp, Value};
use std::cmp::Ordering;
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;

/// A document's `_id` value, ordered by the total comparison order.
///
/// `_id` can be any value (auto-generated object ids, user-supplied
/// strings or numbers), so the wrapper provides the `Ord`/`Eq` the
/// engine's maps need.
#[derive(Debug, Clone)]
pub struct DocId(pub Value);

impl DocId {
    /// Borrows the underlying value.
    #[must_use]
    pub fn value(&self) -> &Value {
        &self.0
    }
}

impl PartialEq for DocId {
    fn eq(&self, other: &Self) -> bool {
        total_cmp(&self.0, &other.0) == Ordering::Equal
    }
}

impl Eq for DocId {}

impl PartialOrd for DocId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DocId {
    fn cmp(&self, other: &Self) -> Ordering {
        total_cmp(&self.0, &other.0)
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// One component of a stored or probe key.
///
/// `Min` and `Max` never appear in stored keys; they pad probe bounds so
/// that prefix and range scans can use `BTreeMap::range` directly.
#[derive(Debug, Clone)]
pub enum KeyPart {
    /// Below every value, regardless of direction.
    Min,
    /// An actual component value.
    Val(Value),
    /// Above every value, regardless of direction.
    Max,
}

/// An index key tuple with per-component directions applied to ordering.
#[derive(Debug, Clone)]
pub struct IndexKey {
    parts: Vec<KeyPart>,
    directions: Arc<[i8]>,
}

impl IndexKey {
    /// Builds a stored key from component values.
    #[must_use]
    pub fn new(values: Vec<Value>, directions: Arc<[i8]>) -> Self {
        Self {
            parts: values.into_iter().map(KeyPart::Val).collect(),
            directions,
        }
    }

    /// Builds the lowest probe key matching an equality prefix.
    #[must_use]
    pub fn prefix_lower(prefix: &[Value], directions: Arc<[i8]>) -> Self {
        Self::padded(prefix, directions, KeyPart::Min)
    }

    /// Builds the highest probe key matching an equality prefix.
    #[must_use]
    pub fn prefix_upper(prefix: &[Value], directions: Arc<[i8]>) -> Self {
        Self::padded(prefix, directions, KeyPart::Max)
    }

    fn padded(prefix: &[Value], directions: Arc<[i8]>, pad: KeyPart) -> Self {
        let total = directions.len();
        let mut parts: Vec<KeyPart> = prefix.iter().cloned().map(KeyPart::Val).collect();
        while parts.len() < total {
            parts.push(pad.clone());
        }
        Self { parts, directions }
    }

    /// Translates a bound on the first component into a bound on stored
    /// keys, for use with `BTreeMap::range`.
    ///
    /// `low` says which end of the stored-order interval this is. The
    /// remaining components pad so that every stored key sharing the
    /// endpoint's first component falls inside an included endpoint and
    /// outside an excluded one.
    #[must_use]
    pub fn range_bound(bound: Bound<&Value>, directions: Arc<[i8]>, low: bool) -> Bound<Self> {
        let first_then_pad = |v: &Value, pad: KeyPart| {
            let total = directions.len();
            let mut parts = Vec::with_capacity(total);
            parts.push(KeyPart::Val(v.clone()));
            while parts.len() < total {
                parts.push(pad.clone());
            }
            Self {
                parts,
                directions: Arc::clone(&directions),
            }
        };
        match bound {
            Bound::Unbounded => Bound::Unbounded,
            Bound::Included(v) => Bound::Included(first_then_pad(
                v,
                if low { KeyPart::Min } else { KeyPart::Max },
            )),
            Bound::Excluded(v) => Bound::Excluded(first_then_pad(
                v,
                if low { KeyPart::Max } else { KeyPart::Min },
            )),
        }
    }

    /// Renders the key for duplicate-key error messages.
    #[must_use]
    pub fn render(&self) -> String {
        let parts: Vec<String> = self
            .parts
            .iter()
            .map(|p| match p {
                KeyPart::Val(v) => format!("{v:?}"),
                KeyPart::Min => "<min>".to_string(),
                KeyPart::Max => "<max>".to_string(),
            })
            .collect();
        format!("({})", parts.join(", "))
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexKey {}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        for (i, (a, b)) in self.parts.iter().zip(other.parts.iter()).enumerate() {
            let ord = match (a, b) {
                (KeyPart::Min, KeyPart::Min) | (KeyPart::Max, KeyPart::Max) => Ordering::Equal,
                (KeyPart::Min, _) => Ordering::Less,
                (_, KeyPart::Min) => Ordering::Greater,
                (KeyPart::Max, _) => Ordering::Greater,
                (_, KeyPart::Max) => Ordering::Less,
                (KeyPart::Val(x), KeyPart::Val(y)) => {
                    let ord = total_cmp(x, y);
                    if self.directions.get(i).copied().unwrap_or(1) < 0 {
                        ord.reverse()
                    } else {
                        ord
                    }
                }
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        self.parts.len().cmp(&other.parts.len())
    }
}

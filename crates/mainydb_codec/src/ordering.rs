//! The total comparison order and the query-equality relation.
//!
//! Two distinct relations operate over [`Value`]:
//!
//! - **Structural equality** (`PartialEq`) preserves type tags; it is what
//!   storage round-trips guarantee.
//! - **Query equality** ([`query_eq`]) merges int and float by numeric value
//!   and ignores document field order; it is what filters and `$addToSet`
//!   use.
//!
//! [`total_cmp`] is the cross-type total order used by sorts and ordered
//! indexes: null < numeric < string < document < array < binary <
//! object-id < boolean < timestamp, with NaN above every other number.

use crate::value::Value;
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

/// Rank of a value's type in the cross-type total order.
#[must_use]
pub fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Int(_) | Value::Float(_) => 1,
        Value::Text(_) => 2,
        Value::Doc(_) => 3,
        Value::Array(_) => 4,
        Value::Bytes(_) => 5,
        Value::ObjectId(_) => 6,
        Value::Bool(_) => 7,
        Value::Timestamp(_) => 8,
    }
}

/// Compares two values under the cross-type total order.
#[must_use]
pub fn total_cmp(a: &Value, b: &Value) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }

    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            numeric_cmp(a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN))
        }
        (Value::Text(x), Value::Text(y)) => x.cmp(y),
        (Value::Doc(x), Value::Doc(y)) => {
            // Field-wise in stored order, shorter as prefix smaller.
            for ((ka, va), (kb, vb)) in x.iter().zip(y.iter()) {
                match ka.cmp(kb) {
                    Ordering::Equal => {}
                    ord => return ord,
                }
                match total_cmp(va, vb) {
                    Ordering::Equal => {}
                    ord => return ord,
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Array(x), Value::Array(y)) => {
            for (va, vb) in x.iter().zip(y.iter()) {
                match total_cmp(va, vb) {
                    Ordering::Equal => {}
                    ord => return ord,
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Bytes(x), Value::Bytes(y)) => match x.len().cmp(&y.len()) {
            Ordering::Equal => x.cmp(y),
            ord => ord,
        },
        (Value::ObjectId(x), Value::ObjectId(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Timestamp(x), Value::Timestamp(y)) => x.cmp(y),
        // Unreachable: same rank implies matching variants above.
        _ => Ordering::Equal,
    }
}

/// Numeric comparison with NaN ordered above every other number.
fn numeric_cmp(x: f64, y: f64) -> Ordering {
    match (x.is_nan(), y.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
    }
}

/// Query equality: numeric cross-type equality, order-insensitive document
/// equality, elementwise array equality, structural equality elsewhere.
#[must_use]
pub fn query_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            match (a, b) {
                (Value::Int(x), Value::Int(y)) => x == y,
                _ => {
                    let (x, y) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
                    // NaN equals NaN so `$eq: NaN` can match a stored NaN.
                    x == y || (x.is_nan() && y.is_nan())
                }
            }
        }
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(v, w)| query_eq(v, w))
        }
        (Value::Doc(x), Value::Doc(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|w| query_eq(v, w)))
        }
        _ => a == b,
    }
}

/// Feeds a value into a hasher, consistently with [`query_eq`]: values
/// that are query-equal (including int/float pairs and documents with
/// reordered fields) produce the same hash.
#[allow(clippy::cast_possible_truncation)]
pub fn hash_value<H: Hasher>(value: &Value, state: &mut H) {
    match value {
        Value::Null => 0u8.hash(state),
        Value::Bool(b) => {
            1u8.hash(state);
            b.hash(state);
        }
        Value::Int(n) => {
            2u8.hash(state);
            n.hash(state);
        }
        Value::Float(f) => {
            // Whole floats hash as their integer value so 1 and 1.0
            // agree.
            if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64 {
                2u8.hash(state);
                (*f as i64).hash(state);
            } else {
                3u8.hash(state);
                f.to_bits().hash(state);
            }
        }
        Value::Text(s) => {
            4u8.hash(state);
            s.hash(state);
        }
        Value::Timestamp(ms) => {
            5u8.hash(state);
            ms.hash(state);
        }
        Value::ObjectId(id) => {
            6u8.hash(state);
            id.as_str().hash(state);
        }
        Value::Bytes(b) => {
            7u8.hash(state);
            b.hash(state);
        }
        Value::Array(items) => {
            8u8.hash(state);
            items.len().hash(state);
            for item in items {
                hash_value(item, state);
            }
        }
        Value::Doc(d) => {
            // Field order is irrelevant for equality, so field hashes
            // combine order-independently.
            9u8.hash(state);
            d.len().hash(state);
            let mut combined: u64 = 0;
            for (k, v) in d.iter() {
                let mut field_hasher = std::collections::hash_map::DefaultHasher::new();
                k.hash(&mut field_hasher);
                hash_value(v, &mut field_hasher);
                combined ^= field_hasher.finish();
            }
            combined.hash(state);
        }
    }
}

/// The key a value contributes to an ascending or descending sort.
///
/// Arrays compared against non-arrays sort by their minimum element when
/// ascending and their maximum element when descending; an empty array
/// sorts as itself.
#[must_use]
pub fn sort_key<'a>(value: &'a Value, descending: bool) -> &'a Value {
    if let Value::Array(items) = value {
        let picked = if descending {
            items.iter().max_by(|a, b| total_cmp(a, b))
        } else {
            items.iter().min_by(|a, b| total_cmp(a, b))
        };
        if let Some(v) = picked {
            return v;
        }
    }
    value
}

/// Compares two values as sort keys for one sort component.
///
/// `descending` flips the result and switches arrays to max-element keys.
#[must_use]
pub fn sort_cmp(a: &Value, b: &Value, descending: bool) -> Ordering {
    let ord = total_cmp(sort_key(a, descending), sort_key(b, descending));
    if descending {
        ord.reverse()
    } else {
        ord
    }
}

//! Dotted-path traversal over nested documents.
//!
//! Paths like `address.coordinates.lat` walk documents by field name and
//! arrays by numeric index. The interpretation of a numeric segment
//! follows the parent's type: array index when the parent is an array,
//! field name when it is a document. Reads of missing paths yield `None`
//! (the absent marker, distinct from a stored null). Writes auto-create
//! missing intermediate documents but never intermediate arrays.

use crate::error::{EngineError, EngineResult};
use mainydb_codec::{Document, Value};

/// Resolves a dotted path to a value, if present.
#[must_use]
pub fn resolve<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = doc.get(first)?;

    for segment in segments {
        current = step(current, segment)?;
    }
    Some(current)
}

/// One traversal step from a container value.
fn step<'a>(value: &'a Value, segment: &str) -> Option<&'a Value> {
    match value {
        Value::Doc(d) => d.get(segment),
        Value::Array(items) => {
            let index: usize = segment.parse().ok()?;
            items.get(index)
        }
        _ => None,
    }
}

/// Sets the value at a dotted path, creating missing intermediate
/// documents along the way.
///
/// Numeric segments index into existing arrays; writing past the end pads
/// the array with nulls. A non-container value in the middle of the path
/// is a [`EngineError::BadUpdate`].
pub fn set_path(doc: &mut Document, path: &str, value: Value) -> EngineResult<()> {
    let segments: Vec<&str> = path.split('.').collect();
    set_in_doc(doc, &segments, value, path)
}

fn set_in_doc(doc: &mut Document, segments: &[&str], value: Value, full: &str) -> EngineResult<()> {
    let (head, rest) = split_head(segments, full)?;

    if rest.is_empty() {
        doc.set(head, value);
        return Ok(());
    }

    if !doc.contains_key(head) {
        doc.set(head, Value::Doc(Document::new()));
    }
    let slot = doc.get_mut(head).expect("just inserted");
    set_in_value(slot, rest, value, full)
}

fn set_in_value(slot: &mut Value, segments: &[&str], value: Value, full: &str) -> EngineResult<()> {
    match slot {
        Value::Doc(d) => set_in_doc(d, segments, value, full),
        Value::Array(items) => {
            let (head, rest) = split_head(segments, full)?;
            let index: usize = head.parse().map_err(|_| {
                EngineError::bad_update(format!(
                    "cannot use field {head:?} to traverse an array in path {full:?}"
                ))
            })?;
            if index >= items.len() {
                items.resize(index + 1, Value::Null);
            }
            if rest.is_empty() {
                items[index] = value;
                Ok(())
            } else {
                if items[index] == Value::Null {
                    items[index] = Value::Doc(Document::new());
                }
                set_in_value(&mut items[index], rest, value, full)
            }
        }
        other => Err(EngineError::bad_update(format!(
            "cannot traverse {} value in path {full:?}",
            other.type_name()
        ))),
    }
}

fn split_head<'a, 'b>(
    segments: &'b [&'a str],
    full: &str,
) -> EngineResult<(&'a str, &'b [&'a str])> {
    match segments.split_first() {
        Some((head, rest)) if !head.is_empty() => Ok((*head, rest)),
        _ => Err(EngineError::bad_update(format!("empty segment in path {full:?}"))),
    }
}

/// Removes the value at a dotted path, returning it if it was present.
///
/// Missing paths are a no-op. Removing an array element shifts later
/// elements down.
pub fn remove_path(doc: &mut Document, path: &str) -> Option<Value> {
    let segments: Vec<&str> = path.split('.').collect();
    remove_in_doc(doc, &segments)
}

fn remove_in_doc(doc: &mut Document, segments: &[&str]) -> Option<Value> {
    let (head, rest) = segments.split_first()?;
    if rest.is_empty() {
        return doc.remove(head);
    }
    remove_in_value(doc.get_mut(head)?, rest)
}

fn remove_in_value(slot: &mut Value, segments: &[&str]) -> Option<Value> {
    match slot {
        Value::Doc(d) => remove_in_doc(d, segments),
        Value::Array(items) => {
            let (head, rest) = segments.split_first()?;
            let index: usize = head.parse().ok()?;
            if rest.is_empty() {
                if index < items.len() {
                    Some(items.remove(index))
                } else {
                    None
                }
            } else {
                remove_in_value(items.get_mut(index)?, rest)
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mainydb_codec::doc;

    #[test]
    fn resolve_nested_doc() {
        let d = doc! { "a": doc! { "b": doc! { "c": 7i64 } } };
        assert_eq!(resolve(&d, "a.b.c"), Some(&Value::Int(7)));
        assert_eq!(resolve(&d, "a.b"), Some(&Value::Doc(doc! { "c": 7i64 })));
    }

    #[test]
    fn resolve_array_index() {
        let d = doc! { "xs": vec![10i64, 20, 30] };
        assert_eq!(resolve(&d, "xs.1"), Some(&Value::Int(20)));
        assert_eq!(resolve(&d, "xs.9"), None);
    }

    #[test]
    fn absent_is_distinct_from_null() {
        let d = doc! { "n": Value::Null };
        assert_eq!(resolve(&d, "n"), Some(&Value::Null));
        assert_eq!(resolve(&d, "m"), None);
    }

    #[test]
    fn numeric_key_on_document_is_a_field_name() {
        // The parent's type decides: "0" keys into a document.
        let d = doc! { "m": doc! { "0": "zero" } };
        assert_eq!(resolve(&d, "m.0"), Some(&Value::Text("zero".into())));
    }

    #[test]
    fn non_numeric_segment_on_array_is_absent() {
        let d = doc! { "xs": vec![1i64] };
        assert_eq!(resolve(&d, "xs.first"), None);
    }

    #[test]
    fn scalar_in_path_is_absent() {
        let d = doc! { "a": 1i64 };
        assert_eq!(resolve(&d, "a.b"), None);
    }

    #[test]
    fn set_creates_intermediate_documents() {
        let mut d = doc! {};
        set_path(&mut d, "a.b.c", Value::Int(1)).unwrap();
        assert_eq!(resolve(&d, "a.b.c"), Some(&Value::Int(1)));
    }

    #[test]
    fn set_into_existing_array_pads_with_nulls() {
        let mut d = doc! { "xs": vec![1i64] };
        set_path(&mut d, "xs.3", Value::Int(4)).unwrap();
        assert_eq!(
            d.get("xs"),
            Some(&Value::Array(vec![
                Value::Int(1),
                Value::Null,
                Value::Null,
                Value::Int(4)
            ]))
        );
    }

    #[test]
    fn set_through_scalar_fails() {
        let mut d = doc! { "a": 1i64 };
        let err = set_path(&mut d, "a.b", Value::Int(2)).unwrap_err();
        assert!(matches!(err, EngineError::BadUpdate { .. }));
        // No partial mutation.
        assert_eq!(d, doc! { "a": 1i64 });
    }

    #[test]
    fn set_does_not_create_arrays() {
        let mut d = doc! {};
        set_path(&mut d, "a.0", Value::Int(1)).unwrap();
        // "0" became a document key, not an array index.
        assert_eq!(resolve(&d, "a.0"), Some(&Value::Int(1)));
        assert!(d.get("a").unwrap().as_doc().is_some());
    }

    #[test]
    fn remove_nested_field() {
        let mut d = doc! { "a": doc! { "b": 1i64, "c": 2i64 } };
        assert_eq!(remove_path(&mut d, "a.b"), Some(Value::Int(1)));
        assert_eq!(remove_path(&mut d, "a.b"), None);
        assert_eq!(d, doc! { "a": doc! { "c": 2i64 } });
    }

    #[test]
    fn remove_array_element_shifts() {
        let mut d = doc! { "xs": vec![1i64, 2, 3] };
        assert_eq!(remove_path(&mut d, "xs.1"), Some(Value::Int(2)));
        assert_eq!(d.get("xs"), Some(&Value::from(vec![1i64, 3])));
    }
}

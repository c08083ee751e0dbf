//! Insertion-ordered documents.

use crate::value::Value;
use std::fmt;

/// An insertion-ordered mapping from field name to [`Value`].
///
/// Field order is preserved for projection and round-trip, but is
/// semantically irrelevant for equality: two documents with the same
/// fields in different orders compare equal.
#[derive(Clone, Default)]
pub struct Document {
    fields: Vec<(String, Value)>,
}

impl Document {
    /// Creates an empty document.
    #[must_use]
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Creates an empty document with room for `capacity` fields.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fields: Vec::with_capacity(capacity),
        }
    }

    /// Returns the number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if the document has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Looks up a field by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    /// Looks up a field by name, mutably.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.fields
            .iter_mut()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    /// Returns true if the field exists (even if its value is null).
    #[must_use]
    pub fn contains_key(&self, name: &str) -> bool {
        self.fields.iter().any(|(k, _)| k == name)
    }

    /// Sets a field, replacing any existing value in place or appending
    /// a new field at the end.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((name, value)),
        }
    }

    /// Removes a field, returning its value if it was present.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let pos = self.fields.iter().position(|(k, _)| k == name)?;
        Some(self.fields.remove(pos).1)
    }

    /// Iterates over `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Iterates over field names in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }

    /// Iterates over values in insertion order.
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.fields.iter().map(|(_, v)| v)
    }
}

impl PartialEq for Document {
    /// Structural equality, ignoring field order.
    fn eq(&self, other: &Self) -> bool {
        self.fields.len() == other.fields.len()
            && self
                .fields
                .iter()
                .all(|(k, v)| other.get(k).is_some_and(|w| v == w))
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.fields.iter().map(|(k, v)| (k, v)))
            .finish()
    }
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut doc = Document::new();
        for (k, v) in iter {
            doc.set(k, v);
        }
        doc
    }
}

impl IntoIterator for Document {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_replaces_in_place() {
        let mut doc = Document::new();
        doc.set("a", 1i64);
        doc.set("b", 2i64);
        doc.set("a", 3i64);

        let keys: Vec<_> = doc.keys().collect();
        assert_eq!(keys, ["a", "b"]);
        assert_eq!(doc.get("a"), Some(&Value::Int(3)));
    }

    #[test]
    fn remove_returns_value() {
        let mut doc = Document::new();
        doc.set("x", "y");
        assert_eq!(doc.remove("x"), Some(Value::Text("y".to_string())));
        assert_eq!(doc.remove("x"), None);
        assert!(doc.is_empty());
    }

    #[test]
    fn equality_ignores_field_order() {
        let mut a = Document::new();
        a.set("x", 1i64);
        a.set("y", 2i64);

        let mut b = Document::new();
        b.set("y", 2i64);
        b.set("x", 1i64);

        assert_eq!(a, b);
    }

    #[test]
    fn equality_respects_values() {
        let mut a = Document::new();
        a.set("x", 1i64);
        let mut b = Document::new();
        b.set("x", 2i64);
        assert_ne!(a, b);
    }

    #[test]
    fn contains_key_sees_null_fields() {
        let mut doc = Document::new();
        doc.set("n", Value::Null);
        assert!(doc.contains_key("n"));
        assert!(!doc.contains_key("m"));
    }
}

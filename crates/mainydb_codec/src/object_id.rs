//! Object identifiers.

use std::fmt;
use uuid::Uuid;

/// Unique identifier for a document.
///
/// Object ids are opaque printable tokens, 12 to 24 bytes long. Auto-generated
/// ids are 128-bit random values rendered as 32-character lowercase hex.
/// Equality, ordering and hashing are string-based.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(String);

impl ObjectId {
    /// Creates a fresh random object id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Wraps an existing token.
    pub fn from_token(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the token as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the id, returning the token.
    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ObjectId {
    fn from(token: String) -> Self {
        Self(token)
    }
}

impl From<&str> for ObjectId {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}

impl From<ObjectId> for String {
    fn from(id: ObjectId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_is_unique() {
        let a = ObjectId::new();
        let b = ObjectId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn generated_ids_are_32_char_hex() {
        let id = ObjectId::new();
        assert_eq!(id.as_str().len(), 32);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn equality_is_string_based() {
        let a = ObjectId::from_token("abc");
        let b = ObjectId::from("abc");
        assert_eq!(a, b);
    }

    #[test]
    fn display_is_bare_token() {
        let id = ObjectId::from_token("deadbeef");
        assert_eq!(format!("{id}"), "deadbeef");
    }
}

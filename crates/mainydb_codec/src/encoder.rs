//! Binary value encoder.
//!
//! The on-disk format is self-describing: one tag byte per value followed
//! by a fixed-width or length-prefixed payload. Scalars are little-endian;
//! strings, blobs, arrays and documents carry a u32 length prefix.

use crate::document::Document;
use crate::value::Value;

/// Tag byte for null.
pub const TAG_NULL: u8 = 0x00;
/// Tag byte for booleans.
pub const TAG_BOOL: u8 = 0x01;
/// Tag byte for 64-bit signed integers.
pub const TAG_INT: u8 = 0x02;
/// Tag byte for 64-bit floats.
pub const TAG_FLOAT: u8 = 0x03;
/// Tag byte for UTF-8 text.
pub const TAG_TEXT: u8 = 0x04;
/// Tag byte for millisecond timestamps.
pub const TAG_TIMESTAMP: u8 = 0x05;
/// Tag byte for object ids.
pub const TAG_OBJECT_ID: u8 = 0x06;
/// Tag byte for binary blobs.
pub const TAG_BYTES: u8 = 0x07;
/// Tag byte for arrays.
pub const TAG_ARRAY: u8 = 0x08;
/// Tag byte for documents.
pub const TAG_DOC: u8 = 0x09;

/// Encodes a value to bytes.
#[must_use]
pub fn encode_value(value: &Value) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.encode(value);
    encoder.into_bytes()
}

/// A buffer-owning value encoder.
pub struct Encoder {
    buffer: Vec<u8>,
}

impl Encoder {
    /// Creates a new encoder.
    #[must_use]
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Creates a new encoder with the given initial capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Appends one encoded value to the buffer.
    pub fn encode(&mut self, value: &Value) {
        match value {
            Value::Null => self.buffer.push(TAG_NULL),
            Value::Bool(b) => {
                self.buffer.push(TAG_BOOL);
                self.buffer.push(u8::from(*b));
            }
            Value::Int(n) => {
                self.buffer.push(TAG_INT);
                self.buffer.extend_from_slice(&n.to_le_bytes());
            }
            Value::Float(f) => {
                self.buffer.push(TAG_FLOAT);
                self.buffer.extend_from_slice(&f.to_bits().to_le_bytes());
            }
            Value::Text(s) => {
                self.buffer.push(TAG_TEXT);
                self.put_len_prefixed(s.as_bytes());
            }
            Value::Timestamp(ms) => {
                self.buffer.push(TAG_TIMESTAMP);
                self.buffer.extend_from_slice(&ms.to_le_bytes());
            }
            Value::ObjectId(id) => {
                self.buffer.push(TAG_OBJECT_ID);
                self.put_len_prefixed(id.as_str().as_bytes());
            }
            Value::Bytes(b) => {
                self.buffer.push(TAG_BYTES);
                self.put_len_prefixed(b);
            }
            Value::Array(items) => {
                self.buffer.push(TAG_ARRAY);
                self.put_u32(items.len() as u32);
                for item in items {
                    self.encode(item);
                }
            }
            Value::Doc(doc) => {
                self.buffer.push(TAG_DOC);
                self.encode_doc(doc);
            }
        }
    }

    /// Appends an encoded document body (count + fields) without a tag.
    pub fn encode_doc(&mut self, doc: &Document) {
        self.put_u32(doc.len() as u32);
        for (name, value) in doc.iter() {
            self.put_len_prefixed(name.as_bytes());
            self.encode(value);
        }
    }

    /// Consumes the encoder, returning the buffer.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Returns the bytes encoded so far.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    fn put_u32(&mut self, n: u32) {
        self.buffer.extend_from_slice(&n.to_le_bytes());
    }

    fn put_len_prefixed(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.buffer.extend_from_slice(bytes);
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_null() {
        assert_eq!(encode_value(&Value::Null), vec![TAG_NULL]);
    }

    #[test]
    fn encode_bool() {
        assert_eq!(encode_value(&Value::Bool(false)), vec![TAG_BOOL, 0]);
        assert_eq!(encode_value(&Value::Bool(true)), vec![TAG_BOOL, 1]);
    }

    #[test]
    fn encode_int_little_endian() {
        let bytes = encode_value(&Value::Int(1));
        assert_eq!(bytes[0], TAG_INT);
        assert_eq!(&bytes[1..], &1i64.to_le_bytes());
    }

    #[test]
    fn int_and_float_encode_differently() {
        // 1 and 1.0 are query-equal but must keep their tags on disk.
        let int = encode_value(&Value::Int(1));
        let float = encode_value(&Value::Float(1.0));
        assert_ne!(int[0], float[0]);
    }

    #[test]
    fn encode_text() {
        let bytes = encode_value(&Value::Text("ab".to_string()));
        assert_eq!(bytes, vec![TAG_TEXT, 2, 0, 0, 0, b'a', b'b']);
    }

    #[test]
    fn encode_empty_array() {
        assert_eq!(
            encode_value(&Value::Array(vec![])),
            vec![TAG_ARRAY, 0, 0, 0, 0]
        );
    }

    #[test]
    fn encode_doc_preserves_field_order() {
        let mut doc = Document::new();
        doc.set("b", 1i64);
        doc.set("a", 2i64);
        let bytes = encode_value(&Value::Doc(doc));

        // count, then "b" before "a" exactly as inserted
        assert_eq!(bytes[0], TAG_DOC);
        assert_eq!(&bytes[1..5], &2u32.to_le_bytes());
        assert_eq!(bytes[9], b'b');
    }
}

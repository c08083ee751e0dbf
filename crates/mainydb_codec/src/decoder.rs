//! Binary value decoder.

use crate::document::Document;
use crate::encoder::{
    TAG_ARRAY, TAG_BOOL, TAG_BYTES, TAG_DOC, TAG_FLOAT, TAG_INT, TAG_NULL, TAG_OBJECT_ID,
    TAG_TEXT, TAG_TIMESTAMP,
};
use crate::error::{CodecError, CodecResult};
use crate::object_id::ObjectId;
use crate::value::Value;

/// Maximum nesting depth the decoder will follow.
const MAX_DEPTH: usize = 128;

/// Decodes a single value from bytes, rejecting trailing input.
pub fn decode_value(bytes: &[u8]) -> CodecResult<Value> {
    let mut decoder = Decoder::new(bytes);
    let value = decoder.decode()?;
    let remaining = decoder.remaining();
    if remaining > 0 {
        return Err(CodecError::TrailingBytes { count: remaining });
    }
    Ok(value)
}

/// A cursor-style decoder over a byte slice.
///
/// The decoder is total over arbitrary input: malformed bytes produce a
/// [`CodecError`], never a panic.
pub struct Decoder<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    /// Creates a decoder over the given input.
    #[must_use]
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    /// Returns the number of unread bytes.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.input.len() - self.pos
    }

    /// Decodes the next value.
    pub fn decode(&mut self) -> CodecResult<Value> {
        self.decode_at_depth(0)
    }

    fn decode_at_depth(&mut self, depth: usize) -> CodecResult<Value> {
        if depth > MAX_DEPTH {
            return Err(CodecError::DepthLimit { limit: MAX_DEPTH });
        }

        let tag = self.take_u8()?;
        match tag {
            TAG_NULL => Ok(Value::Null),
            TAG_BOOL => match self.take_u8()? {
                0 => Ok(Value::Bool(false)),
                1 => Ok(Value::Bool(true)),
                other => Err(CodecError::corrupt(format!("bad bool payload {other:#04x}"))),
            },
            TAG_INT => Ok(Value::Int(self.take_i64()?)),
            TAG_FLOAT => {
                let bits = u64::from_le_bytes(self.take_array()?);
                Ok(Value::Float(f64::from_bits(bits)))
            }
            TAG_TEXT => Ok(Value::Text(self.take_string()?)),
            TAG_TIMESTAMP => Ok(Value::Timestamp(self.take_i64()?)),
            TAG_OBJECT_ID => Ok(Value::ObjectId(ObjectId::from_token(self.take_string()?))),
            TAG_BYTES => {
                let len = self.take_len()?;
                Ok(Value::Bytes(self.take_bytes(len)?.to_vec()))
            }
            TAG_ARRAY => {
                let count = self.take_len()?;
                // Each element is at least one tag byte.
                if count > self.remaining() {
                    return Err(CodecError::corrupt(format!(
                        "array count {count} exceeds remaining input"
                    )));
                }
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.decode_at_depth(depth + 1)?);
                }
                Ok(Value::Array(items))
            }
            TAG_DOC => {
                let doc = self.decode_doc_at_depth(depth)?;
                Ok(Value::Doc(doc))
            }
            other => Err(CodecError::corrupt(format!("unknown tag {other:#04x}"))),
        }
    }

    /// Decodes a document body (count + fields) without a leading tag.
    pub fn decode_doc(&mut self) -> CodecResult<Document> {
        self.decode_doc_at_depth(0)
    }

    fn decode_doc_at_depth(&mut self, depth: usize) -> CodecResult<Document> {
        let count = self.take_len()?;
        if count > self.remaining() {
            return Err(CodecError::corrupt(format!(
                "document field count {count} exceeds remaining input"
            )));
        }
        let mut doc = Document::with_capacity(count);
        for _ in 0..count {
            let name = self.take_string()?;
            if doc.contains_key(&name) {
                return Err(CodecError::corrupt(format!("duplicate field {name:?}")));
            }
            let value = self.decode_at_depth(depth + 1)?;
            doc.set(name, value);
        }
        Ok(doc)
    }

    fn take_u8(&mut self) -> CodecResult<u8> {
        let byte = *self
            .input
            .get(self.pos)
            .ok_or(CodecError::UnexpectedEnd { needed: 1 })?;
        self.pos += 1;
        Ok(byte)
    }

    fn take_array<const N: usize>(&mut self) -> CodecResult<[u8; N]> {
        let bytes = self.take_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn take_i64(&mut self) -> CodecResult<i64> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    fn take_len(&mut self) -> CodecResult<usize> {
        Ok(u32::from_le_bytes(self.take_array()?) as usize)
    }

    fn take_bytes(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(CodecError::UnexpectedEnd {
                needed: len - self.remaining(),
            });
        }
        let slice = &self.input[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn take_string(&mut self) -> CodecResult<String> {
        let len = self.take_len()?;
        let bytes = self.take_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::encode_value;

    #[test]
    fn unknown_tag_is_corrupt() {
        let err = decode_value(&[0x7f]).unwrap_err();
        assert!(matches!(err, CodecError::Corrupt { .. }));
    }

    #[test]
    fn truncated_int_is_unexpected_end() {
        let err = decode_value(&[TAG_INT, 1, 2]).unwrap_err();
        assert!(matches!(err, CodecError::UnexpectedEnd { .. }));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut bytes = encode_value(&Value::Null);
        bytes.push(0);
        let err = decode_value(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::TrailingBytes { count: 1 }));
    }

    #[test]
    fn oversized_array_count_rejected() {
        // Claims u32::MAX elements with no payload; must not try to allocate.
        let mut bytes = vec![TAG_ARRAY];
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        let err = decode_value(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::Corrupt { .. }));
    }

    #[test]
    fn duplicate_field_rejected() {
        let mut doc = Document::new();
        doc.set("a", 1i64);
        let mut bytes = encode_value(&Value::Doc(doc));
        // Patch the count to 2 and append a second "a" field.
        bytes[1..5].copy_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.push(b'a');
        bytes.push(TAG_NULL);
        let err = decode_value(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::Corrupt { .. }));
    }

    #[test]
    fn deep_nesting_hits_depth_limit() {
        let mut value = Value::Int(0);
        for _ in 0..200 {
            value = Value::Array(vec![value]);
        }
        let bytes = encode_value(&value);
        let err = decode_value(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::DepthLimit { .. }));
    }

    #[test]
    fn invalid_utf8_rejected() {
        let mut bytes = vec![TAG_TEXT];
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.push(0xff);
        let err = decode_value(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::InvalidUtf8));
    }
}

//! # MainyDB Codec
//!
//! Value model, total ordering, and binary codec for MainyDB.
//!
//! This crate defines the tagged [`Value`] universe documents are built
//! from, the cross-type total order used by sorts and indexes, and the
//! self-describing binary format the store persists. Type tags survive
//! round-trips exactly: an `Int(1)` written to disk comes back as
//! `Int(1)`, never `Float(1.0)`.
//!
//! ## Usage
//!
//! ```
//! use mainydb_codec::{decode_value, doc, encode_value, Value};
//!
//! let d = doc! { "name": "Ada", "age": 36i64 };
//! let bytes = encode_value(&Value::Doc(d.clone()));
//! let back = decode_value(&bytes).unwrap();
//! assert_eq!(back, Value::Doc(d));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod decoder;
mod document;
mod encoder;
mod error;
mod object_id;
pub mod ordering;
mod value;

pub use decoder::{decode_value, Decoder};
pub use document::Document;
pub use encoder::{encode_value, Encoder};
pub use error::{CodecError, CodecResult};
pub use object_id::ObjectId;
pub use ordering::{hash_value, query_eq, sort_cmp, total_cmp, type_rank};
pub use value::Value;

/// Builds a [`Document`] from `"name": value` pairs.
///
/// Values go through [`Value::from`], so plain literals work for the
/// common types; anything else can be passed as an explicit [`Value`].
///
/// ```
/// use mainydb_codec::{doc, Value};
///
/// let d = doc! { "x": 1i64, "nested": doc! { "y": true } };
/// assert_eq!(d.get("x"), Some(&Value::Int(1)));
/// ```
#[macro_export]
macro_rules! doc {
    () => { $crate::Document::new() };
    ($($name:literal : $value:expr),+ $(,)?) => {{
        let mut d = $crate::Document::new();
        $( d.set($name, $crate::Value::from($value)); )+
        d
    }};
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            // Finite floats only; NaN round-trips by bit pattern but fails
            // the PartialEq assertion below.
            (-1e300f64..1e300).prop_map(Value::Float),
            "[a-zA-Z0-9 ]{0,12}".prop_map(Value::Text),
            any::<i64>().prop_map(Value::Timestamp),
            proptest::collection::vec(any::<u8>(), 0..16).prop_map(Value::Bytes),
        ];
        leaf.prop_recursive(4, 32, 4, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                proptest::collection::vec(("[a-z]{1,6}", inner), 0..4).prop_map(|pairs| {
                    let mut doc = Document::new();
                    for (k, v) in pairs {
                        doc.set(k, v);
                    }
                    Value::Doc(doc)
                }),
            ]
        })
    }

    proptest! {
        #[test]
        fn roundtrip(value in arb_value()) {
            let bytes = encode_value(&value);
            let back = decode_value(&bytes).unwrap();
            prop_assert_eq!(back, value);
        }

        #[test]
        fn decoder_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = decode_value(&bytes);
        }
    }
}

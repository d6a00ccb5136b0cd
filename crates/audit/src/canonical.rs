//! Canonical JSON serialization for deterministic hashing.
//!
//! Canonical JSON has:
//! - Object keys sorted lexicographically (UTF-8 byte order)
//! - No whitespace
//! - UTF-8 output
//!
//! Numbers are emitted with `serde_json`'s own formatting. Floats are allowed:
//! the chain is only ever hashed and verified by this crate, so the formatter
//! is the same on both sides.

use std::io::Write;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Errors that can occur during canonical JSON serialization.
#[derive(Debug, Error)]
pub enum CanonicalJsonError {
    #[error("serde_json error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serialize `value` into canonical JSON bytes.
#[must_use = "canonical bytes should be used for hashing"]
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CanonicalJsonError> {
    let v = serde_json::to_value(value)?;
    let mut out = Vec::<u8>::new();
    write_value(&v, &mut out)?;
    Ok(out)
}

/// Same as [`to_canonical_bytes`], returned as a `String`.
pub fn to_canonical_string<T: Serialize>(value: &T) -> Result<String, CanonicalJsonError> {
    let bytes = to_canonical_bytes(value)?;
    // write_value only emits serde_json-escaped strings and ASCII punctuation.
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn write_value<W: Write>(v: &Value, out: &mut W) -> Result<(), CanonicalJsonError> {
    match v {
        Value::Null => out.write_all(b"null")?,
        Value::Bool(b) => out.write_all(if *b { b"true" } else { b"false" })?,
        Value::Number(n) => out.write_all(n.to_string().as_bytes())?,
        Value::String(s) => serde_json::to_writer(&mut *out, s)?,
        Value::Array(items) => {
            out.write_all(b"[")?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.write_all(b",")?;
                }
                write_value(item, out)?;
            }
            out.write_all(b"]")?;
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.write_all(b"{")?;
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.write_all(b",")?;
                }
                serde_json::to_writer(&mut *out, key)?;
                out.write_all(b":")?;
                write_value(&map[key], out)?;
            }
            out.write_all(b"}")?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn sorts_keys_and_strips_whitespace() {
        let v = json!({ "b": 1, "a": { "d": [1, 2], "c": null } });
        assert_eq!(
            to_canonical_string(&v).unwrap(),
            r#"{"a":{"c":null,"d":[1,2]},"b":1}"#
        );
    }

    #[test]
    fn escapes_strings() {
        let v = json!({ "q": "line\n\"quoted\"" });
        assert_eq!(to_canonical_string(&v).unwrap(), r#"{"q":"line\n\"quoted\""}"#);
    }

    #[test]
    fn floats_are_stable() {
        let v = json!({ "dose": 0.25, "steps": 10 });
        let a = to_canonical_bytes(&v).unwrap();
        let b = to_canonical_bytes(&v).unwrap();
        assert_eq!(a, b);
        assert_eq!(String::from_utf8(a).unwrap(), r#"{"dose":0.25,"steps":10}"#);
    }

    proptest! {
        #[test]
        fn insertion_order_does_not_matter(entries in proptest::collection::btree_map("[a-z]{1,6}", 0i64..1000, 0..12)) {
            let mut forward = serde_json::Map::new();
            for (k, v) in entries.iter() {
                forward.insert(k.clone(), json!(v));
            }
            let mut reverse = serde_json::Map::new();
            for (k, v) in entries.iter().rev() {
                reverse.insert(k.clone(), json!(v));
            }
            prop_assert_eq!(
                to_canonical_bytes(&Value::Object(forward)).unwrap(),
                to_canonical_bytes(&Value::Object(reverse)).unwrap()
            );
        }

        #[test]
        fn canonical_output_parses_back_to_same_value(entries in proptest::collection::btree_map("[a-z]{1,6}", "[ -~]{0,12}", 0..8)) {
            let v = serde_json::to_value(&entries).unwrap();
            let bytes = to_canonical_bytes(&v).unwrap();
            let back: Value = serde_json::from_slice(&bytes).unwrap();
            prop_assert_eq!(back, v);
        }
    }
}

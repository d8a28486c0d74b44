//! Strict canonical JSON writer and validating parser.

use std::fmt::Write as _;

use serde_json::{Map, Value};
use thiserror::Error;
use unicode_normalization::is_nfc;

/// Identifier for this canonicalization profile, recorded alongside hashes
/// so that a future profile revision cannot be confused with this one.
pub const CANONICAL_PROFILE_ID: &str = "procura-jcs-v1";

/// Maximum recursion depth for canonicalization.
pub const MAX_DEPTH: usize = 64;

/// Errors that can occur during canonicalization.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CanonicalJsonError {
    /// A floating-point number was encountered.
    ///
    /// Signed payloads carry integer minor units and millisecond timestamps;
    /// floats have no deterministic cross-platform rendering.
    #[error("float not allowed in canonical payload")]
    FloatNotAllowed,

    /// A number is outside the signed 64-bit integer range.
    #[error("number out of range: {value} does not fit in i64")]
    NumberOutOfRange {
        /// String rendering of the offending number.
        value: String,
    },

    /// A duplicate key was found in an object.
    #[error("duplicate key '{key}' in object")]
    DuplicateKey {
        /// The duplicated key.
        key: String,
    },

    /// A string is not NFC normalized.
    #[error("string is not NFC normalized: {preview}")]
    NonNfcString {
        /// Truncated preview of the offending string.
        preview: String,
    },

    /// The maximum nesting depth was exceeded.
    #[error("nesting deeper than {MAX_DEPTH} levels")]
    MaxDepthExceeded,

    /// The input was not valid JSON.
    #[error("JSON parse error: {message}")]
    Parse {
        /// Description of the parse failure.
        message: String,
    },
}

/// Canonicalizes a JSON value into its canonical UTF-8 string form.
///
/// # Errors
///
/// Returns an error if the value contains floats, out-of-range numbers,
/// non-NFC strings, or exceeds the depth bound.
pub fn canonicalize(value: &Value) -> Result<String, CanonicalJsonError> {
    let mut out = String::with_capacity(128);
    write_value(&mut out, value, 0)?;
    Ok(out)
}

/// Canonicalizes a JSON value into canonical bytes (the form that is hashed
/// and signed).
///
/// # Errors
///
/// Same conditions as [`canonicalize`].
pub fn canonical_bytes(value: &Value) -> Result<Vec<u8>, CanonicalJsonError> {
    canonicalize(value).map(String::into_bytes)
}

/// Parses a JSON document, rejecting duplicate object keys.
///
/// `serde_json` silently keeps the last duplicate, which would let two
/// different wire documents canonicalize identically. Wire input that will
/// be canonicalized must come through here.
///
/// # Errors
///
/// Returns `Parse` for malformed JSON and `DuplicateKey` for repeated keys.
pub fn parse_strict(input: &str) -> Result<Value, CanonicalJsonError> {
    let value: Value = serde_json::from_str(input).map_err(|e| CanonicalJsonError::Parse {
        message: e.to_string(),
    })?;
    check_no_duplicates(input)?;
    Ok(value)
}

/// Scans the raw token stream for duplicate keys per object level.
fn check_no_duplicates(input: &str) -> Result<(), CanonicalJsonError> {
    // A tiny tokenizer pass: track object nesting and the keys seen at each
    // level. Keys are the strings immediately followed by ':'.
    let mut stack: Vec<std::collections::BTreeSet<String>> = Vec::new();
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'{' => {
                if stack.len() >= MAX_DEPTH {
                    return Err(CanonicalJsonError::MaxDepthExceeded);
                }
                stack.push(std::collections::BTreeSet::new());
                i += 1;
            },
            b'}' => {
                stack.pop();
                i += 1;
            },
            b'"' => {
                let (s, end) = scan_string(input, i)?;
                let mut j = end;
                while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                    j += 1;
                }
                if j < bytes.len() && bytes[j] == b':' {
                    if let Some(keys) = stack.last_mut() {
                        if !keys.insert(s.clone()) {
                            return Err(CanonicalJsonError::DuplicateKey { key: s });
                        }
                    }
                }
                i = end;
            },
            _ => i += 1,
        }
    }
    Ok(())
}

/// Scans a JSON string literal starting at `start` (which must point at the
/// opening quote). Returns the decoded string and the index just past the
/// closing quote.
fn scan_string(input: &str, start: usize) -> Result<(String, usize), CanonicalJsonError> {
    let bytes = input.as_bytes();
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => {
                let raw = &input[start..=i];
                let decoded: String =
                    serde_json::from_str(raw).map_err(|e| CanonicalJsonError::Parse {
                        message: e.to_string(),
                    })?;
                return Ok((decoded, i + 1));
            },
            _ => i += 1,
        }
    }
    Err(CanonicalJsonError::Parse {
        message: "unterminated string".to_string(),
    })
}

fn write_value(out: &mut String, value: &Value, depth: usize) -> Result<(), CanonicalJsonError> {
    if depth > MAX_DEPTH {
        return Err(CanonicalJsonError::MaxDepthExceeded);
    }
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => write_number(out, n)?,
        Value::String(s) => write_string(out, s)?,
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_value(out, item, depth + 1)?;
            }
            out.push(']');
        },
        Value::Object(map) => write_object(out, map, depth)?,
    }
    Ok(())
}

fn write_object(
    out: &mut String,
    map: &Map<String, Value>,
    depth: usize,
) -> Result<(), CanonicalJsonError> {
    // serde_json's Map may or may not preserve order depending on features;
    // canonical form always sorts by UTF-8 byte order.
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort_unstable();
    out.push('{');
    for (idx, key) in keys.iter().enumerate() {
        if idx > 0 {
            out.push(',');
        }
        write_string(out, key)?;
        out.push(':');
        // Key presence is guaranteed by iteration over map.keys().
        if let Some(v) = map.get(*key) {
            write_value(out, v, depth + 1)?;
        }
    }
    out.push('}');
    Ok(())
}

fn write_number(out: &mut String, n: &serde_json::Number) -> Result<(), CanonicalJsonError> {
    if let Some(i) = n.as_i64() {
        // write! to String cannot fail.
        let _ = write!(out, "{i}");
        return Ok(());
    }
    if n.as_u64().is_some() {
        return Err(CanonicalJsonError::NumberOutOfRange {
            value: n.to_string(),
        });
    }
    Err(CanonicalJsonError::FloatNotAllowed)
}

fn write_string(out: &mut String, s: &str) -> Result<(), CanonicalJsonError> {
    if !is_nfc(s) {
        let preview: String = s.chars().take(32).collect();
        return Err(CanonicalJsonError::NonNfcString { preview });
    }
    // serde_json emits minimal escaping (quote, backslash, control chars)
    // and leaves non-ASCII literal, which matches the JCS string rules.
    match serde_json::to_string(s) {
        Ok(escaped) => {
            out.push_str(&escaped);
            Ok(())
        },
        Err(e) => Err(CanonicalJsonError::Parse {
            message: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn sorts_keys() {
        let value = json!({"zebra": 1, "alpha": 2, "mid": {"b": 1, "a": 2}});
        assert_eq!(
            canonicalize(&value).unwrap(),
            r#"{"alpha":2,"mid":{"a":2,"b":1},"zebra":1}"#
        );
    }

    #[test]
    fn rejects_floats() {
        let value = json!({"cost": 1.5});
        assert_eq!(
            canonicalize(&value),
            Err(CanonicalJsonError::FloatNotAllowed)
        );
    }

    #[test]
    fn rejects_u64_beyond_i64() {
        let value = json!({"big": u64::MAX});
        assert!(matches!(
            canonicalize(&value),
            Err(CanonicalJsonError::NumberOutOfRange { .. })
        ));
    }

    #[test]
    fn rejects_non_nfc() {
        // U+0065 U+0301 (e + combining acute) is NFD; NFC is U+00E9.
        let value = json!({"name": "caf\u{0065}\u{0301}"});
        assert!(matches!(
            canonicalize(&value),
            Err(CanonicalJsonError::NonNfcString { .. })
        ));
    }

    #[test]
    fn accepts_nfc() {
        let value = json!({"name": "caf\u{00e9}"});
        assert_eq!(canonicalize(&value).unwrap(), "{\"name\":\"caf\u{00e9}\"}");
    }

    #[test]
    fn parse_strict_rejects_duplicate_keys() {
        let input = r#"{"a": 1, "a": 2}"#;
        assert!(matches!(
            parse_strict(input),
            Err(CanonicalJsonError::DuplicateKey { .. })
        ));
    }

    #[test]
    fn parse_strict_allows_same_key_at_different_levels() {
        let input = r#"{"a": {"a": 1}, "b": 2}"#;
        assert!(parse_strict(input).is_ok());
    }

    #[test]
    fn duplicate_check_ignores_string_values() {
        // "a" appears as a value, not a key; must not trip the dup check.
        let input = r#"{"k1": "a", "k2": "a"}"#;
        assert!(parse_strict(input).is_ok());
    }

    #[test]
    fn canonical_is_stable_across_key_order() {
        let left: Value = parse_strict(r#"{"x": 1, "y": [1, 2], "z": null}"#).unwrap();
        let right: Value = parse_strict(r#"{"z": null, "y": [1, 2], "x": 1}"#).unwrap();
        assert_eq!(canonical_bytes(&left), canonical_bytes(&right));
    }

    #[test]
    fn depth_bound_enforced() {
        let mut value = json!(1);
        for _ in 0..(MAX_DEPTH + 2) {
            value = json!([value]);
        }
        assert_eq!(canonicalize(&value), Err(CanonicalJsonError::MaxDepthExceeded));
    }

    #[test]
    fn escapes_are_minimal() {
        let value = json!({"s": "tab\there \"quoted\""});
        assert_eq!(
            canonicalize(&value).unwrap(),
            r#"{"s":"tab\there \"quoted\""}"#
        );
    }
}

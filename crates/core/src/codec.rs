//! Type codec: declared field types to and from a flat string form.
//!
//! | type            | encoded                        | decoded            |
//! |-----------------|--------------------------------|--------------------|
//! | id, string      | as is                          | string             |
//! | number          | decimal text                   | number (coerced)   |
//! | boolean         | `true` / `false`               | boolean            |
//! | date            | ISO-8601, millisecond precision| epoch milliseconds |
//! | array, object   | JSON text                      | array / object     |
//! | undeclared      | JSON text                      | JSON, else string  |
//!
//! Null is not representable; callers skip or report null fields.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Number, Value};
use thiserror::Error;

use crate::schema::FieldType;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("expected {expected:?}, found {found}")]
    TypeMismatch { expected: FieldType, found: String },

    #[error("cannot decode {input:?} as {expected:?}")]
    Malformed { expected: FieldType, input: String },

    #[error("null cannot be encoded")]
    Null,
}

fn mismatch(expected: FieldType, found: &Value) -> CodecError {
    let found = match found {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };
    CodecError::TypeMismatch {
        expected,
        found: found.to_string(),
    }
}

fn malformed(expected: FieldType, input: &str) -> CodecError {
    CodecError::Malformed {
        expected,
        input: input.to_string(),
    }
}

/// Encode `value` declared as `field_type`.
pub fn encode(field_type: FieldType, value: &Value) -> Result<String, CodecError> {
    if value.is_null() {
        return Err(CodecError::Null);
    }

    match (field_type, value) {
        (FieldType::Id | FieldType::String, Value::String(s)) => Ok(s.clone()),
        (FieldType::Number, Value::Number(n)) => Ok(n.to_string()),
        (FieldType::Boolean, Value::Bool(b)) => Ok(b.to_string()),
        (FieldType::Date, Value::Number(n)) => {
            let millis = n.as_i64().ok_or_else(|| mismatch(FieldType::Date, value))?;
            let dt = DateTime::<Utc>::from_timestamp_millis(millis)
                .ok_or_else(|| malformed(FieldType::Date, &n.to_string()))?;
            Ok(dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        }
        (FieldType::Date, Value::String(s)) => {
            let dt = DateTime::parse_from_rfc3339(s).map_err(|_| malformed(FieldType::Date, s))?;
            Ok(dt
                .with_timezone(&Utc)
                .to_rfc3339_opts(SecondsFormat::Millis, true))
        }
        (FieldType::Array, Value::Array(_)) | (FieldType::Object, Value::Object(_)) => {
            Ok(value.to_string())
        }
        (expected, other) => Err(mismatch(expected, other)),
    }
}

/// Decode a flat string back into a value of `field_type`.
pub fn decode(field_type: FieldType, raw: &str) -> Result<Value, CodecError> {
    match field_type {
        FieldType::Id | FieldType::String => Ok(Value::String(raw.to_string())),
        FieldType::Number => decode_number(raw),
        FieldType::Boolean => match raw {
            "true" | "1" => Ok(Value::Bool(true)),
            "false" | "0" => Ok(Value::Bool(false)),
            _ => Err(malformed(FieldType::Boolean, raw)),
        },
        FieldType::Date => {
            let dt = DateTime::parse_from_rfc3339(raw)
                .map_err(|_| malformed(FieldType::Date, raw))?;
            Ok(Value::from(dt.timestamp_millis()))
        }
        FieldType::Array => match serde_json::from_str::<Value>(raw) {
            Ok(v @ Value::Array(_)) => Ok(v),
            _ => Err(malformed(FieldType::Array, raw)),
        },
        FieldType::Object => match serde_json::from_str::<Value>(raw) {
            Ok(v @ Value::Object(_)) => Ok(v),
            _ => Err(malformed(FieldType::Object, raw)),
        },
    }
}

fn decode_number(raw: &str) -> Result<Value, CodecError> {
    let trimmed = raw.trim();
    if let Ok(u) = trimmed.parse::<u64>() {
        return Ok(Value::from(u));
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Ok(Value::from(i));
    }
    trimmed
        .parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| malformed(FieldType::Number, raw))
}

/// Encode a value for a field the schema does not declare: JSON text.
pub fn encode_untyped(value: &Value) -> Result<String, CodecError> {
    if value.is_null() {
        return Err(CodecError::Null);
    }
    Ok(value.to_string())
}

/// Reverse of [`encode_untyped`]. Text that is not JSON was written by
/// someone else and comes back as a plain string.
pub fn decode_untyped(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn undeclared_values_keep_their_json_type() {
        for value in [json!(5), json!(true), json!("5"), json!("abc"), json!({"a": [1]})] {
            let encoded = encode_untyped(&value).unwrap();
            assert_eq!(decode_untyped(&encoded), value);
        }
        assert_eq!(encode_untyped(&Value::Null), Err(CodecError::Null));
        assert_eq!(decode_untyped("zed"), json!("zed"));
    }

    #[test]
    fn dates_encode_iso_and_decode_epoch_millis() {
        let encoded = encode(FieldType::Date, &json!(1_700_000_000_123i64)).unwrap();
        assert_eq!(encoded, "2023-11-14T22:13:20.123Z");
        assert_eq!(
            decode(FieldType::Date, &encoded).unwrap(),
            json!(1_700_000_000_123i64)
        );
    }

    #[test]
    fn iso_date_strings_are_normalised_to_utc_millis() {
        let encoded = encode(FieldType::Date, &json!("2024-01-01T01:00:00+01:00")).unwrap();
        assert_eq!(encoded, "2024-01-01T00:00:00.000Z");
    }

    #[test]
    fn numbers_are_coerced_on_read() {
        assert_eq!(decode(FieldType::Number, "42").unwrap(), json!(42));
        assert_eq!(decode(FieldType::Number, "-7").unwrap(), json!(-7));
        assert_eq!(decode(FieldType::Number, "2.5").unwrap(), json!(2.5));
        assert!(decode(FieldType::Number, "forty").is_err());
    }

    #[test]
    fn mismatched_values_are_rejected() {
        assert_eq!(
            encode(FieldType::Number, &json!("12")).unwrap_err(),
            CodecError::TypeMismatch {
                expected: FieldType::Number,
                found: "string".to_string()
            }
        );
        assert_eq!(encode(FieldType::String, &Value::Null).unwrap_err(), CodecError::Null);
        assert!(decode(FieldType::Array, "{\"a\":1}").is_err());
        assert!(decode(FieldType::Boolean, "yes").is_err());
    }

    fn scalar_json() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::from),
            "[a-z0-9 ]{0,12}".prop_map(Value::from),
        ]
    }

    fn nested_json() -> impl Strategy<Value = Value> {
        scalar_json().prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    fn typed_value() -> impl Strategy<Value = (FieldType, Value)> {
        prop_oneof![
            "[A-Za-z0-9-]{1,36}".prop_map(|s| (FieldType::Id, Value::from(s))),
            ".{0,24}".prop_map(|s| (FieldType::String, Value::from(s))),
            any::<i64>().prop_map(|n| (FieldType::Number, Value::from(n))),
            any::<u64>().prop_map(|n| (FieldType::Number, Value::from(n))),
            (-1.0e12f64..1.0e12f64).prop_map(|f| (FieldType::Number, json!(f))),
            any::<bool>().prop_map(|b| (FieldType::Boolean, Value::Bool(b))),
            (-2_208_988_800_000i64..4_102_444_800_000i64)
                .prop_map(|ms| (FieldType::Date, Value::from(ms))),
            prop::collection::vec(nested_json(), 0..5)
                .prop_map(|v| (FieldType::Array, Value::Array(v))),
            prop::collection::btree_map("[a-z]{1,6}", nested_json(), 0..5)
                .prop_map(|m| (FieldType::Object, Value::Object(m.into_iter().collect()))),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: decode(encode(v)) == v for every declared type.
        #[test]
        fn decode_inverts_encode((field_type, value) in typed_value()) {
            let encoded = encode(field_type, &value).unwrap();
            let decoded = decode(field_type, &encoded).unwrap();
            prop_assert_eq!(decoded, value);
        }
    }
}

//! Deserializers for config fields that flow documents write either as
//! JSON scalars or as strings (`"repeat": 0.2` and `"repeat": "0.2"`).

use flowcore::value::parse_number;
use serde::de::{self, Deserializer};
use serde::Deserialize;

/// Number, numeric string, empty string or null. Empty and null are `None`.
pub fn opt_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => Ok(n.as_f64()),
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(serde_json::Value::String(s)) => parse_number(&s)
            .map(Some)
            .ok_or_else(|| de::Error::custom(format!("'{s}' is not a number"))),
        Some(other) => Err(de::Error::custom(format!("expected a number, found {other}"))),
    }
}

/// Boolean or `"true"`/`"false"`
pub fn flex_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Bool(b) => Ok(b),
        serde_json::Value::String(s) => match s.trim() {
            "true" => Ok(true),
            "false" | "" => Ok(false),
            other => Err(de::Error::custom(format!("expected true or false, found '{other}'"))),
        },
        serde_json::Value::Null => Ok(false),
        other => Err(de::Error::custom(format!("expected a boolean, found {other}"))),
    }
}

/// String, or any other scalar rendered as text
pub fn opt_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

pub fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Fields {
        #[serde(default, deserialize_with = "opt_f64")]
        n: Option<f64>,
        #[serde(default = "default_true", deserialize_with = "flex_bool")]
        b: bool,
        #[serde(default, deserialize_with = "opt_text")]
        t: Option<String>,
    }

    fn fields(v: serde_json::Value) -> Result<Fields, serde_json::Error> {
        serde_json::from_value(v)
    }

    #[test]
    fn numbers_accept_strings_and_blanks() {
        assert_eq!(fields(json!({"n": 0.2})).unwrap().n, Some(0.2));
        assert_eq!(fields(json!({"n": "1.5"})).unwrap().n, Some(1.5));
        assert_eq!(fields(json!({"n": ""})).unwrap().n, None);
        assert_eq!(fields(json!({})).unwrap().n, None);
        assert!(fields(json!({"n": "soon"})).is_err());
    }

    #[test]
    fn booleans_accept_strings() {
        assert!(fields(json!({})).unwrap().b);
        assert!(!fields(json!({"b": "false"})).unwrap().b);
        assert!(fields(json!({"b": true})).unwrap().b);
        assert!(fields(json!({"b": "maybe"})).is_err());
    }

    #[test]
    fn text_accepts_scalars() {
        assert_eq!(fields(json!({"t": 5})).unwrap().t.as_deref(), Some("5"));
        assert_eq!(fields(json!({"t": "x"})).unwrap().t.as_deref(), Some("x"));
    }
}

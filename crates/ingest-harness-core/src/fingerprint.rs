//! Canonical collection fingerprints.
//!
//! A fingerprint is the canonical JSON serialization of the parameters that
//! scope a collection (connection id, scope id, organization, ...). Object
//! keys are sorted recursively, so two parameter values that are logically
//! equal always produce the same fingerprint, whatever order their fields
//! were declared or inserted in. The collector stamps every raw record with
//! it and the extractor uses it to find "its" records again.

use std::fmt;

use anyhow::{bail, Result};
use serde::Serialize;
use serde_json::Value;

/// Canonical serialization of a collection's scoping parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint any serializable parameter value.
    ///
    /// # Errors
    ///
    /// Fails when the value does not serialize, or serializes to `null` or
    /// an empty object: an unscoped collection would collide with every
    /// other unscoped collection in the same table.
    pub fn of<P: Serialize + ?Sized>(params: &P) -> Result<Self> {
        let value = serde_json::to_value(params)?;
        match &value {
            Value::Null => bail!("collection params must not be null"),
            Value::Object(map) if map.is_empty() => bail!("collection params must not be empty"),
            _ => {}
        }
        Ok(Self(canonical_json(&value)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parameters that scope one collection.
///
/// Each connector declares a plain serializable struct and implements this
/// trait for it; the default method is all most connectors need.
pub trait CollectionParams: Serialize + Send + Sync {
    fn fingerprint(&self) -> Result<Fingerprint> {
        Fingerprint::of(self)
    }
}

/// Serialize a JSON value with recursively sorted object keys and no
/// insignificant whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Serialize)]
    struct BoardParams {
        connection_id: u64,
        board_id: u64,
    }

    #[derive(Serialize)]
    struct BoardParamsReordered {
        board_id: u64,
        connection_id: u64,
    }

    impl CollectionParams for BoardParams {}

    #[test]
    fn test_field_order_does_not_matter() {
        let a = Fingerprint::of(&BoardParams {
            connection_id: 1,
            board_id: 10,
        })
        .unwrap();
        let b = Fingerprint::of(&BoardParamsReordered {
            board_id: 10,
            connection_id: 1,
        })
        .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), r#"{"board_id":10,"connection_id":1}"#);
    }

    #[test]
    fn test_insertion_order_does_not_matter() {
        let mut first = HashMap::new();
        first.insert("scope_id", "octo-org");
        first.insert("organization", "octo-org");
        first.insert("endpoint", "https://api.github.com/");

        let mut second = HashMap::new();
        second.insert("endpoint", "https://api.github.com/");
        second.insert("organization", "octo-org");
        second.insert("scope_id", "octo-org");

        assert_eq!(
            Fingerprint::of(&first).unwrap(),
            Fingerprint::of(&second).unwrap()
        );
    }

    #[test]
    fn test_nested_objects_sorted() {
        let v = serde_json::json!({"b": {"y": 1, "x": [ {"d": 1, "c": 2} ]}, "a": null});
        assert_eq!(canonical_json(&v), r#"{"a":null,"b":{"x":[{"c":2,"d":1}],"y":1}}"#);
    }

    #[test]
    fn test_trait_default() {
        let p = BoardParams {
            connection_id: 2,
            board_id: 3,
        };
        assert_eq!(p.fingerprint().unwrap(), Fingerprint::of(&p).unwrap());
    }

    #[test]
    fn test_empty_params_rejected() {
        assert!(Fingerprint::of(&serde_json::json!({})).is_err());
        assert!(Fingerprint::of(&()).is_err());
    }
}

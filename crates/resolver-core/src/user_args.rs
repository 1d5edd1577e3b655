//! Typed coercion of raw user arguments
//!
//! Arguments arrive as strings (usually from `--user-args=key:value` pairs) and
//! are coerced against the types declared in the resolver schema. Validation is
//! pure and fails on the first problem, iterating declared keys in order.

use serde_json::{Number, Value};
use std::collections::{BTreeMap, HashMap};

use crate::errors::SchemaError;
use crate::schema::UserArgsSchema;
use crate::types::UserArgs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UserArgType {
    Boolean,
    BooleanArray,
    String,
    StringArray,
    Number,
    NumberArray,
}

impl UserArgType {
    fn parse(declared: &str) -> Option<Self> {
        match declared {
            "boolean" => Some(Self::Boolean),
            "boolean[]" => Some(Self::BooleanArray),
            "string" => Some(Self::String),
            "string[]" => Some(Self::StringArray),
            "number" => Some(Self::Number),
            "number[]" => Some(Self::NumberArray),
            _ => None,
        }
    }
}

pub fn validate_user_args(
    schema: &UserArgsSchema,
    raw_args: &HashMap<String, String>,
) -> Result<UserArgs, SchemaError> {
    let mut typed = BTreeMap::new();
    for (key, declared) in schema {
        let value = raw_args
            .get(key)
            .ok_or_else(|| SchemaError::MissingArgument { key: key.clone() })?;
        let arg_type = UserArgType::parse(declared).ok_or_else(|| SchemaError::UnrecognizedType {
            key: key.clone(),
            declared: declared.clone(),
        })?;
        typed.insert(key.clone(), coerce(key, value, arg_type)?);
    }
    Ok(typed)
}

fn coerce(key: &str, value: &str, arg_type: UserArgType) -> Result<Value, SchemaError> {
    match arg_type {
        UserArgType::Boolean => Ok(Value::Bool(!(value == "false" || value == "0"))),
        UserArgType::BooleanArray => {
            let items = parse_array(value, "boolean[]")?;
            Ok(Value::Array(
                items.into_iter().map(|v| Value::Bool(!is_falsy(&v))).collect(),
            ))
        }
        UserArgType::String => Ok(Value::String(value.to_string())),
        UserArgType::StringArray => {
            let items = parse_array(value, "string[]")?;
            if let Some(bad) = items.iter().find(|v| !v.is_string()) {
                return Err(element_error(value, "string[]", bad));
            }
            Ok(Value::Array(items))
        }
        UserArgType::Number => parse_number(value)
            .map(Value::Number)
            .ok_or_else(|| SchemaError::InvalidNumber {
                key: key.to_string(),
                value: value.to_string(),
            }),
        UserArgType::NumberArray => {
            let items = parse_array(value, "number[]")?;
            if let Some(bad) = items.iter().find(|v| !v.is_number()) {
                return Err(element_error(value, "number[]", bad));
            }
            Ok(Value::Array(items))
        }
    }
}

fn parse_array(value: &str, target: &str) -> Result<Vec<Value>, SchemaError> {
    match serde_json::from_str::<Value>(value) {
        Ok(Value::Array(items)) => Ok(items),
        Ok(other) => Err(SchemaError::Parse {
            value: value.to_string(),
            target: target.to_string(),
            reason: format!("expected a JSON array, found {}", other),
        }),
        Err(e) => Err(SchemaError::Parse {
            value: value.to_string(),
            target: target.to_string(),
            reason: e.to_string(),
        }),
    }
}

fn element_error(value: &str, target: &str, element: &Value) -> SchemaError {
    SchemaError::Parse {
        value: value.to_string(),
        target: target.to_string(),
        reason: format!("unexpected element {}", element),
    }
}

fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        _ => false,
    }
}

// A '.' selects floating point, anything else must be a whole integer.
fn parse_number(value: &str) -> Option<Number> {
    let trimmed = value.trim();
    if trimmed.contains('.') {
        trimmed
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .and_then(Number::from_f64)
    } else if let Ok(n) = trimmed.parse::<i64>() {
        Some(Number::from(n))
    } else if let Ok(n) = trimmed.parse::<u64>() {
        Some(Number::from(n))
    } else if trimmed
        .trim_start_matches(['-', '+'])
        .bytes()
        .all(|b| b.is_ascii_digit())
    {
        // Integers beyond 64 bits (wei amounts) degrade to floating point
        trimmed
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .and_then(Number::from_f64)
    } else {
        None
    }
}

/// Splits `key:value` pairs on the first `:`; values may contain further colons.
pub fn parse_user_arg_pairs<I, S>(pairs: I) -> Result<HashMap<String, String>, SchemaError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut args = HashMap::new();
    for pair in pairs {
        let pair = pair.as_ref();
        match pair.split_once(':') {
            Some((key, value)) if !key.is_empty() => {
                args.insert(key.to_string(), value.to_string());
            }
            _ => return Err(SchemaError::InvalidPair(pair.to_string())),
        }
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema(entries: &[(&str, &str)]) -> UserArgsSchema {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn raw(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_all_types_coerced() {
        let schema = schema(&[
            ("enabled", "boolean"),
            ("flags", "boolean[]"),
            ("currency", "string"),
            ("tokens", "string[]"),
            ("count", "number"),
            ("ratio", "number"),
            ("prices", "number[]"),
        ]);
        let raw = raw(&[
            ("enabled", "true"),
            ("flags", "[true, false, 0, 1, \"x\"]"),
            ("currency", "ethereum"),
            ("tokens", "[\"eth\", \"usdc\"]"),
            ("count", "3"),
            ("ratio", "3.5"),
            ("prices", "[1, 2.5]"),
        ]);

        let typed = validate_user_args(&schema, &raw).unwrap();
        assert_eq!(typed.len(), schema.len());
        assert_eq!(typed["enabled"], json!(true));
        assert_eq!(typed["flags"], json!([true, false, false, true, true]));
        assert_eq!(typed["currency"], json!("ethereum"));
        assert_eq!(typed["tokens"], json!(["eth", "usdc"]));
        assert_eq!(typed["count"], json!(3));
        assert!(typed["count"].is_i64());
        assert_eq!(typed["ratio"], json!(3.5));
        assert_eq!(typed["prices"], json!([1, 2.5]));
    }

    #[test]
    fn test_boolean_coercion() {
        let schema = schema(&[("b", "boolean")]);
        for (input, expected) in [("false", false), ("0", false), ("anything-else", true), ("", true)] {
            let typed = validate_user_args(&schema, &raw(&[("b", input)])).unwrap();
            assert_eq!(typed["b"], json!(expected), "input {:?}", input);
        }
    }

    #[test]
    fn test_missing_argument_names_key() {
        let schema = schema(&[("oracle", "string")]);
        let err = validate_user_args(&schema, &HashMap::new()).unwrap_err();
        assert_eq!(err, SchemaError::MissingArgument { key: "oracle".to_string() });
        assert!(err.to_string().contains("'oracle'"));
    }

    #[test]
    fn test_invalid_number() {
        let schema = schema(&[("count", "number")]);
        let err = validate_user_args(&schema, &raw(&[("count", "abc")])).unwrap_err();
        assert!(matches!(err, SchemaError::InvalidNumber { ref value, .. } if value == "abc"));

        let err = validate_user_args(&schema, &raw(&[("count", "1.2.3")])).unwrap_err();
        assert!(matches!(err, SchemaError::InvalidNumber { .. }));
    }

    #[test]
    fn test_integers_beyond_i64() {
        let schema = schema(&[("amount", "number")]);
        let typed = validate_user_args(&schema, &raw(&[("amount", "10000000000000000000")])).unwrap();
        assert_eq!(typed["amount"], json!(10000000000000000000u64));
        assert!(typed["amount"].is_u64());

        let wei = "1000000000000000000000000";
        let typed = validate_user_args(&schema, &raw(&[("amount", wei)])).unwrap();
        assert_eq!(typed["amount"].as_f64(), Some(1e24));

        let typed = validate_user_args(&schema, &raw(&[("amount", "-9223372036854775809")])).unwrap();
        assert!(typed["amount"].is_f64());

        assert!(validate_user_args(&schema, &raw(&[("amount", "12ab")])).is_err());
        assert!(validate_user_args(&schema, &raw(&[("amount", "-")])).is_err());
    }

    #[test]
    fn test_unrecognized_type() {
        let schema = schema(&[("when", "date")]);
        let err = validate_user_args(&schema, &raw(&[("when", "today")])).unwrap_err();
        assert_eq!(
            err,
            SchemaError::UnrecognizedType {
                key: "when".to_string(),
                declared: "date".to_string()
            }
        );
    }

    #[test]
    fn test_malformed_arrays_name_value_and_type() {
        let tokens = schema(&[("tokens", "string[]")]);
        let err = validate_user_args(&tokens, &raw(&[("tokens", "[eth")])).unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("Parsing [eth to string[] failed."));

        let err = validate_user_args(&tokens, &raw(&[("tokens", "[1, 2]")])).unwrap_err();
        assert!(matches!(err, SchemaError::Parse { ref target, .. } if target == "string[]"));

        let prices = schema(&[("prices", "number[]")]);
        let err = validate_user_args(&prices, &raw(&[("prices", "{\"a\": 1}")])).unwrap_err();
        assert!(matches!(err, SchemaError::Parse { ref target, .. } if target == "number[]"));
    }

    #[test]
    fn test_extra_raw_args_are_ignored() {
        let schema = schema(&[("a", "string")]);
        let typed = validate_user_args(&schema, &raw(&[("a", "x"), ("b", "y")])).unwrap();
        assert_eq!(typed.len(), 1);
    }

    #[test]
    fn test_parse_user_arg_pairs() {
        let args = parse_user_arg_pairs(["currency:ethereum", "url:https://example.com:8080"]).unwrap();
        assert_eq!(args["currency"], "ethereum");
        assert_eq!(args["url"], "https://example.com:8080");

        let err = parse_user_arg_pairs(["novalue"]).unwrap_err();
        assert_eq!(err, SchemaError::InvalidPair("novalue".to_string()));
        assert!(parse_user_arg_pairs([":value"]).is_err());
    }
}

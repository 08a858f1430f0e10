//! JSON value matching shared by mock response rules and expectations.
//!
//! Comparison is deep equality with two relaxations: numbers compare by
//! value regardless of integer/float representation, and booleans match
//! their canonical string spelling (`"true"` / `"false"`). Everything else
//! is strict: strings compare verbatim, arrays element-wise, objects
//! key-wise.

use serde_json::Value;

/// Compares two JSON values for deep equality modulo numeric widening and
/// bool↔string coercion by canonical spelling.
#[must_use]
pub fn values_match(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Number(a), Value::Number(b)) => numbers_match(a, b),
        (Value::Bool(b), Value::String(s)) | (Value::String(s), Value::Bool(b)) => {
            s == if *b { "true" } else { "false" }
        }
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_match(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(k, v)| b.get(k).is_some_and(|bv| values_match(v, bv)))
        }
        _ => expected == actual,
    }
}

/// Checks that every key/value pair in `condition` deep-matches the
/// corresponding entry in `args`. Extra keys in `args` are ignored.
#[must_use]
pub fn condition_matches(condition: &serde_json::Map<String, Value>, args: &Value) -> bool {
    condition.iter().all(|(key, expected)| {
        args.get(key)
            .is_some_and(|actual| values_match(expected, actual))
    })
}

fn numbers_match(a: &serde_json::Number, b: &serde_json::Number) -> bool {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return x == y;
    }
    match (a.as_f64(), b.as_f64()) {
        // Exact comparison is intended: 1 widens to 1.0 and compares equal,
        // while genuinely different floats stay different.
        #[allow(clippy::float_cmp)]
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn integers_widen_to_floats() {
        assert!(values_match(&json!(1), &json!(1.0)));
        assert!(values_match(&json!(1.0), &json!(1)));
        assert!(!values_match(&json!(1), &json!(1.5)));
    }

    #[test]
    fn bool_matches_canonical_spelling() {
        assert!(values_match(&json!(true), &json!("true")));
        assert!(values_match(&json!("false"), &json!(false)));
        assert!(!values_match(&json!(true), &json!("True")));
    }

    #[test]
    fn strings_compare_verbatim() {
        assert!(values_match(&json!("hi"), &json!("hi")));
        assert!(!values_match(&json!("hi"), &json!("HI")));
    }

    #[test]
    fn objects_compare_keywise() {
        assert!(values_match(
            &json!({"a": 1, "b": [true]}),
            &json!({"b": [true], "a": 1.0})
        ));
        assert!(!values_match(&json!({"a": 1}), &json!({"a": 1, "b": 2})));
    }

    #[test]
    fn condition_ignores_extra_args() {
        let cond = json!({"lang": "fr"});
        let cond = cond.as_object().unwrap();
        assert!(condition_matches(cond, &json!({"lang": "fr", "x": 1})));
        assert!(!condition_matches(cond, &json!({"lang": "en"})));
        assert!(!condition_matches(cond, &json!({})));
    }
}

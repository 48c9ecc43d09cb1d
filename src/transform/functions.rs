//! Process-wide transform function registry
//!
//! Named functions referenced by transforms (`abs($)`, `round`) resolve
//! here at parse time. The registry is populated during startup (builtin
//! functions on first touch, collaborator extensions via
//! [`register_function`]) and is treated as read-only afterwards.

use crate::core::{Error, Result};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde_json::{Number, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// A pure named function callable from transform sources
pub trait TransformFunction: Send + Sync {
    /// Apply the function to the carried value and evaluated arguments
    fn call(&self, current: &Value, args: &[Value]) -> Result<Value>;
}

impl std::fmt::Debug for dyn TransformFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn TransformFunction")
    }
}

impl<F> TransformFunction for F
where
    F: Fn(&Value, &[Value]) -> Result<Value> + Send + Sync,
{
    fn call(&self, current: &Value, args: &[Value]) -> Result<Value> {
        self(current, args)
    }
}

static REGISTRY: Lazy<RwLock<HashMap<String, Arc<dyn TransformFunction>>>> = Lazy::new(|| {
    let mut map: HashMap<String, Arc<dyn TransformFunction>> = HashMap::new();
    map.insert("abs".to_string(), Arc::new(unary_numeric("abs", f64::abs)));
    map.insert(
        "floor".to_string(),
        Arc::new(unary_numeric("floor", f64::floor)),
    );
    map.insert(
        "ceil".to_string(),
        Arc::new(unary_numeric("ceil", f64::ceil)),
    );
    map.insert(
        "round".to_string(),
        Arc::new(unary_numeric("round", f64::round)),
    );
    map.insert("length".to_string(), Arc::new(length_function));
    RwLock::new(map)
});

/// Register a named function. Intended for startup only; transforms parsed
/// before the registration cannot see it.
pub fn register_function(name: impl Into<String>, func: Arc<dyn TransformFunction>) {
    REGISTRY.write().insert(name.into(), func);
}

/// Resolve a function by name
pub fn lookup(name: &str) -> Option<Arc<dyn TransformFunction>> {
    REGISTRY.read().get(name).cloned()
}

fn eval_error(msg: impl Into<String>) -> Error {
    Error::TransformEval(msg.into())
}

/// A numeric function of one value: its argument when given, otherwise the
/// carried value
fn unary_numeric(
    name: &'static str,
    f: fn(f64) -> f64,
) -> impl Fn(&Value, &[Value]) -> Result<Value> {
    move |current: &Value, args: &[Value]| {
        let v = match args {
            [] => current,
            [one] => one,
            _ => return Err(eval_error(format!("{name}() takes at most one argument"))),
        };
        let n = match v {
            Value::Number(n) => n
                .as_f64()
                .ok_or_else(|| eval_error(format!("{name}() on a non-finite number")))?,
            other => return Err(eval_error(format!("{name}() on a non-number: {other}"))),
        };
        Number::from_f64(f(n))
            .map(Value::Number)
            .ok_or_else(|| eval_error(format!("{name}() produced a non-finite number")))
    }
}

fn length_function(current: &Value, args: &[Value]) -> Result<Value> {
    let v = match args {
        [] => current,
        [one] => one,
        _ => return Err(eval_error("length() takes at most one argument")),
    };
    let len = match v {
        Value::String(s) => s.chars().count(),
        Value::Array(a) => a.len(),
        Value::Object(m) => m.len(),
        other => return Err(eval_error(format!("length() on {other}"))),
    };
    Ok(Value::Number(Number::from(len)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtins_present() {
        for name in ["abs", "floor", "ceil", "round", "length"] {
            assert!(lookup(name).is_some(), "{name} missing");
        }
        assert!(lookup("nope").is_none());
    }

    #[test]
    fn test_unary_numeric_uses_current_without_args() {
        let abs = lookup("abs").unwrap();
        assert_eq!(abs.call(&json!(-2.5), &[]).unwrap(), json!(2.5));
        assert_eq!(abs.call(&json!(0), &[json!(-7)]).unwrap(), json!(7.0));
        assert!(abs.call(&json!("x"), &[]).is_err());
    }

    #[test]
    fn test_length() {
        let length = lookup("length").unwrap();
        assert_eq!(length.call(&json!("abc"), &[]).unwrap(), json!(3));
        assert_eq!(length.call(&json!([1, 2]), &[]).unwrap(), json!(2));
        assert_eq!(length.call(&json!({"a": 1}), &[]).unwrap(), json!(1));
        assert!(length.call(&json!(5), &[]).is_err());
    }

    #[test]
    fn test_registration() {
        register_function(
            "always_one",
            Arc::new(|_: &Value, _: &[Value]| Ok(json!(1))),
        );
        assert!(lookup("always_one").is_some());
    }
}

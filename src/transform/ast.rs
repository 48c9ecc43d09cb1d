//! Transform AST and evaluator
//!
//! Evaluation is pure: an expression maps the carried JSON value to a new
//! JSON value or fails with [`Error::TransformEval`]. Arithmetic follows
//! number promotion and rejects booleans; ordering comparisons are
//! numeric-to-numeric or string-to-string only; equality additionally
//! covers booleans and nulls of matching type.

use crate::core::{Error, Result};
use crate::transform::functions;
use crate::transform::lexer::CompOp;
use serde_json::{Map, Number, Value};
use std::sync::Arc;

/// A transform expression
#[derive(Debug, Clone)]
pub enum Expr {
    /// Numeric literal
    Number(f64),
    /// Boolean literal
    Bool(bool),
    /// String literal
    Str(String),
    /// `$` or `get()`: the carried value
    This,
    /// `get(a, b, ...)`: nested map projection
    Get(Vec<String>),
    /// `set(path, expr)`: copy with the path replaced
    Set(Vec<String>, Box<Expr>),
    /// `has("key")`
    Has(String),
    /// Registered named function with evaluated arguments
    Call(String, Arc<dyn functions::TransformFunction>, Vec<Expr>),
    /// Unary negation
    Neg(Box<Expr>),
    /// Logical `not`
    Not(Box<Expr>),
    /// Logical `and` / `or` (short-circuiting)
    Logic(bool, Box<Expr>, Box<Expr>),
    /// Comparison
    Comp(CompOp, Box<Expr>, Box<Expr>),
    /// Arithmetic
    Arith(ArithOp, Box<Expr>, Box<Expr>),
}

/// Arithmetic operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
}

/// One pipeline stage
#[derive(Debug, Clone)]
pub enum Stage {
    /// `if expr`: drop the datapoint when the expression is falsey
    Filter(Expr),
    /// `expr`: replace the carried value
    Map(Expr),
}

/// A parsed transform pipeline
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub(crate) fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    /// The stages, in application order
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }
}

fn eval_error(msg: impl Into<String>) -> Error {
    Error::TransformEval(msg.into())
}

/// Boolean interpretation of an evaluated value. Only booleans and null
/// carry truthiness; anything else in filter position is an error.
pub fn truthy(v: &Value) -> Result<bool> {
    match v {
        Value::Bool(b) => Ok(*b),
        Value::Null => Ok(false),
        other => Err(eval_error(format!("expected a boolean, got {other}"))),
    }
}

fn as_number(v: &Value, what: &str) -> Result<f64> {
    match v {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| eval_error(format!("{what} is not a finite number"))),
        other => Err(eval_error(format!("{what} must be a number, got {other}"))),
    }
}

fn number_value(n: f64) -> Result<Value> {
    Number::from_f64(n)
        .map(Value::Number)
        .ok_or_else(|| eval_error("arithmetic produced a non-finite number"))
}

fn project<'a>(mut v: &'a Value, path: &[String]) -> Result<&'a Value> {
    for segment in path {
        match v {
            Value::Object(map) => {
                v = map
                    .get(segment)
                    .ok_or_else(|| eval_error(format!("no such key: {segment}")))?;
            }
            other => {
                return Err(eval_error(format!(
                    "cannot descend into {other} at {segment}"
                )));
            }
        }
    }
    Ok(v)
}

fn set_path(current: &Value, path: &[String], replacement: Value) -> Result<Value> {
    let Some((head, rest)) = path.split_first() else {
        return Ok(replacement);
    };
    let mut map = match current {
        Value::Object(map) => map.clone(),
        other => {
            return Err(eval_error(format!("cannot set {head} inside {other}")));
        }
    };
    let inner = map.get(head).cloned().unwrap_or(Value::Object(Map::new()));
    map.insert(head.clone(), set_path(&inner, rest, replacement)?);
    Ok(Value::Object(map))
}

fn compare(op: CompOp, left: &Value, right: &Value) -> Result<bool> {
    use std::cmp::Ordering;

    let ord = match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            let a = a.as_f64().ok_or_else(|| eval_error("non-finite number"))?;
            let b = b.as_f64().ok_or_else(|| eval_error("non-finite number"))?;
            a.partial_cmp(&b)
                .ok_or_else(|| eval_error("incomparable numbers"))?
        }
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Bool(a), Value::Bool(b)) if matches!(op, CompOp::Eq | CompOp::Ne) => {
            return Ok(match op {
                CompOp::Eq => a == b,
                _ => a != b,
            });
        }
        (Value::Null, Value::Null) if matches!(op, CompOp::Eq | CompOp::Ne) => {
            return Ok(matches!(op, CompOp::Eq));
        }
        (a, b) => {
            return Err(eval_error(format!("cannot compare {a} with {b}")));
        }
    };

    Ok(match op {
        CompOp::Lt => ord == Ordering::Less,
        CompOp::Le => ord != Ordering::Greater,
        CompOp::Gt => ord == Ordering::Greater,
        CompOp::Ge => ord != Ordering::Less,
        CompOp::Eq => ord == Ordering::Equal,
        CompOp::Ne => ord != Ordering::Equal,
    })
}

impl Expr {
    /// Evaluate against the carried value
    pub fn eval(&self, current: &Value) -> Result<Value> {
        match self {
            Expr::Number(n) => number_value(*n),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Str(s) => Ok(Value::String(s.clone())),
            Expr::This => Ok(current.clone()),
            Expr::Get(path) => Ok(project(current, path)?.clone()),
            Expr::Set(path, expr) => {
                let replacement = expr.eval(current)?;
                set_path(current, path, replacement)
            }
            Expr::Has(key) => match current {
                Value::Object(map) => Ok(Value::Bool(map.contains_key(key))),
                other => Err(eval_error(format!("has() on a non-map value: {other}"))),
            },
            Expr::Call(_, func, args) => {
                let args: Vec<Value> = args
                    .iter()
                    .map(|a| a.eval(current))
                    .collect::<Result<_>>()?;
                func.call(current, &args)
            }
            Expr::Neg(inner) => {
                let n = as_number(&inner.eval(current)?, "negation operand")?;
                number_value(-n)
            }
            Expr::Not(inner) => Ok(Value::Bool(!truthy(&inner.eval(current)?)?)),
            Expr::Logic(is_and, left, right) => {
                let l = truthy(&left.eval(current)?)?;
                // Short-circuit
                if *is_and && !l {
                    return Ok(Value::Bool(false));
                }
                if !*is_and && l {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(truthy(&right.eval(current)?)?))
            }
            Expr::Comp(op, left, right) => {
                let l = left.eval(current)?;
                let r = right.eval(current)?;
                Ok(Value::Bool(compare(*op, &l, &r)?))
            }
            Expr::Arith(op, left, right) => {
                let l = as_number(&left.eval(current)?, "left operand")?;
                let r = as_number(&right.eval(current)?, "right operand")?;
                let out = match op {
                    ArithOp::Add => l + r,
                    ArithOp::Sub => l - r,
                    ArithOp::Mul => l * r,
                    ArithOp::Div => {
                        if r == 0.0 {
                            return Err(eval_error("division by zero"));
                        }
                        l / r
                    }
                };
                number_value(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_project_nested() {
        let v = json!({"a": {"b": {"c": 7}}});
        let path = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(project(&v, &path).unwrap(), &json!(7));

        let bad = vec!["a".to_string(), "x".to_string()];
        assert!(project(&v, &bad).is_err());
    }

    #[test]
    fn test_set_path_does_not_mutate() {
        let v = json!({"a": 1});
        let out = set_path(&v, &["a".to_string()], json!(2)).unwrap();
        assert_eq!(v, json!({"a": 1}));
        assert_eq!(out, json!({"a": 2}));
    }

    #[test]
    fn test_set_path_creates_intermediates() {
        let v = json!({});
        let path = vec!["a".to_string(), "b".to_string()];
        assert_eq!(
            set_path(&v, &path, json!(1)).unwrap(),
            json!({"a": {"b": 1}})
        );
    }

    #[test]
    fn test_compare_rules() {
        assert!(compare(CompOp::Lt, &json!(1), &json!(2)).unwrap());
        assert!(compare(CompOp::Le, &json!(2), &json!(2.0)).unwrap());
        assert!(compare(CompOp::Gt, &json!("b"), &json!("a")).unwrap());
        assert!(compare(CompOp::Eq, &json!(true), &json!(true)).unwrap());
        assert!(compare(CompOp::Lt, &json!(true), &json!(false)).is_err());
        assert!(compare(CompOp::Eq, &json!(1), &json!("1")).is_err());
    }

    #[test]
    fn test_truthiness() {
        assert!(truthy(&json!(true)).unwrap());
        assert!(!truthy(&json!(false)).unwrap());
        assert!(!truthy(&Value::Null).unwrap());
        assert!(truthy(&json!(1)).is_err());
    }
}
